//! Pipeline builder.
//!
//! Turns a [`PipelineConfig`] (built in code or parsed from YAML) into a
//! validated [`Pipeline`]. Value-level checks run first, then stage types are
//! resolved against a registry and the graph is validated. Every problem is
//! reported at once as a [`PipelineError::Configuration`].

use std::path::Path;

use crate::config::parser::{parse_pipeline, parse_pipeline_str};
use crate::config::types::{DeadLetterConfig, EdgeConfig, PipelineConfig, StageConfig, StateConfig};
use crate::errors::PipelineError;
use crate::pipeline::Pipeline;
use crate::registry::{self, Registry};

/// Builds a [`Pipeline`] from stages and edges.
///
/// Uses the registry passed to [`registry`](Self::registry), or the
/// process-wide one installed with [`registry::init`].
#[derive(Debug, Clone)]
pub struct PipelineBuilder<'r> {
    config: PipelineConfig,
    registry: Option<&'r Registry>,
}

impl<'r> PipelineBuilder<'r> {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(PipelineConfig::new(name))
    }

    #[must_use]
    pub fn from_config(config: PipelineConfig) -> Self {
        Self {
            config,
            registry: None,
        }
    }

    /// Start from a YAML pipeline definition (`${VAR}` references are
    /// substituted from the environment).
    ///
    /// # Errors
    ///
    /// Returns a configuration error if substitution or parsing fails.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, PipelineError> {
        let config = parse_pipeline_str(yaml).map_err(|e| PipelineError::configuration(format!("{e:#}")))?;
        Ok(Self::from_config(config))
    }

    /// Start from a YAML pipeline file.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read or parsed.
    pub fn from_yaml_file(path: &Path) -> Result<Self, PipelineError> {
        let config = parse_pipeline(path).map_err(|e| PipelineError::configuration(format!("{e:#}")))?;
        Ok(Self::from_config(config))
    }

    /// Resolve stage types against `registry` instead of the global one.
    #[must_use]
    pub fn registry(mut self, registry: &'r Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Preserve each collector's emission order end-to-end.
    #[must_use]
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.config.ordered = ordered;
        self
    }

    /// Route failed records to the dead-letter store instead of halting.
    #[must_use]
    pub fn dead_letter(mut self, enabled: bool) -> Self {
        self.config.dead_letter = DeadLetterConfig { enabled };
        self
    }

    #[must_use]
    pub fn checkpoint_interval(mut self, interval: u64) -> Self {
        self.config.checkpoint_interval = interval;
        self
    }

    #[must_use]
    pub fn state(mut self, state: StateConfig) -> Self {
        self.config.state = state;
        self
    }

    #[must_use]
    pub fn stage(mut self, stage: StageConfig) -> Self {
        self.config.stages.push(stage);
        self
    }

    #[must_use]
    pub fn edge(mut self, edge: EdgeConfig) -> Self {
        self.config.edges.push(edge);
        self
    }

    /// Add a default edge from `from` to `to`.
    #[must_use]
    pub fn connect(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edge(EdgeConfig::new(from, to))
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validate and assemble the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] listing every problem, or
    /// naming the missing registry when none was given or installed.
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let registry = self.registry.or_else(|| registry::global()).ok_or_else(|| {
            PipelineError::configuration(
                "no stage registry: pass one to the builder or call registry::init",
            )
        })?;
        build_pipeline(&self.config, registry)
    }
}

/// Validate `config` and assemble it against `registry`.
///
/// # Errors
///
/// Returns [`PipelineError::Configuration`] listing every problem found.
pub fn build_pipeline(config: &PipelineConfig, registry: &Registry) -> Result<Pipeline, PipelineError> {
    let pipeline = Pipeline::assemble(config, registry)?;
    tracing::debug!(
        pipeline = pipeline.name(),
        stages = pipeline.stages().len(),
        edges = pipeline.edges().len(),
        "Pipeline assembled"
    );
    Ok(pipeline)
}
