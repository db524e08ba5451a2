//! Stage-type registry.
//!
//! Maps stage-type names to constructors. A [`RegistryBuilder`] collects
//! registrations at startup and freezes them into an immutable [`Registry`].
//! A process-wide registry can be installed once with [`init`]; builders
//! also accept an explicit `&Registry` so tests stay isolated.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use lubrikit_sdk::{StageDescriptor, StageFactory, StageInstance};
use lubrikit_types::StageError;

use crate::errors::{ConfigurationError, PipelineError};

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// A registered stage type: its declared facts and its constructor.
#[derive(Clone)]
pub struct Registration {
    descriptor: StageDescriptor,
    factory: StageFactory,
}

impl Registration {
    #[must_use]
    pub fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn factory(&self) -> &StageFactory {
        &self.factory
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Collects registrations before freezing them.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: HashMap<String, Registration>,
    duplicates: Vec<String>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage type under `type_name`.
    ///
    /// The constructor runs once per worker with the stage's `config` block.
    /// Registering the same name twice is reported by [`build`](Self::build).
    #[must_use]
    pub fn register<F>(mut self, type_name: impl Into<String>, descriptor: StageDescriptor, factory: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<StageInstance, StageError> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        if self.entries.contains_key(&type_name) {
            self.duplicates.push(type_name);
            return self;
        }
        self.entries.insert(
            type_name,
            Registration {
                descriptor,
                factory: Arc::new(factory),
            },
        );
        self
    }

    /// Freeze into an immutable registry.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if any stage type was registered twice.
    pub fn build(self) -> Result<Registry, PipelineError> {
        if !self.duplicates.is_empty() {
            let problems = self
                .duplicates
                .iter()
                .map(|name| format!("stage type '{name}' registered more than once"))
                .collect();
            return Err(ConfigurationError::new(problems).into());
        }
        Ok(Registry {
            entries: self.entries,
        })
    }
}

/// Immutable mapping from stage-type name to registration.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    entries: HashMap<String, Registration>,
}

impl Registry {
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    #[must_use]
    pub fn get(&self, type_name: &str) -> Option<&Registration> {
        self.entries.get(type_name)
    }

    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    /// Registered type names, sorted.
    #[must_use]
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Install the process-wide registry. Call once at startup.
///
/// # Errors
///
/// Returns a configuration error if a registry was already installed.
pub fn init(registry: Registry) -> Result<(), PipelineError> {
    GLOBAL.set(registry).map_err(|_| {
        PipelineError::configuration("stage registry is already initialized")
    })?;
    tracing::debug!(
        stage_types = GLOBAL.get().map_or(0, Registry::len),
        "Stage registry initialized"
    );
    Ok(())
}

/// The process-wide registry, if [`init`] has been called.
#[must_use]
pub fn global() -> Option<&'static Registry> {
    GLOBAL.get()
}
