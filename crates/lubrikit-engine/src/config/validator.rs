//! Semantic validation for parsed pipeline configuration values.
//!
//! Graph-level rules (edge endpoints, cycles, roles, schema compatibility)
//! need the registry and are checked when the pipeline is assembled.

use anyhow::{bail, Result};

use crate::config::types::{PipelineConfig, RetryConfig, StageConfig, StateBackendKind};

fn validate_retry(retry: &RetryConfig, context: &str, errors: &mut Vec<String>) {
    if retry.max_attempts == 0 {
        errors.push(format!("{context}: retry.max_attempts must be at least 1"));
    }
    if !retry.backoff_factor.is_finite() || retry.backoff_factor < 1.0 {
        errors.push(format!("{context}: retry.backoff_factor must be >= 1.0"));
    }
    if retry.base_delay_ms > retry.max_delay_ms {
        errors.push(format!(
            "{context}: retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
            retry.base_delay_ms, retry.max_delay_ms
        ));
    }
}

fn validate_stage(stage: &StageConfig, index: usize, errors: &mut Vec<String>) {
    if stage.name.trim().is_empty() {
        errors.push(format!("Stage {index} has an empty name"));
    }
    let context = format!("stage '{}'", stage.name);

    if stage.stage_type.trim().is_empty() {
        errors.push(format!("{context}: type must not be empty"));
    }
    if stage.concurrency == 0 {
        errors.push(format!("{context}: concurrency must be at least 1"));
    }
    if stage.buffer_size == Some(0) {
        errors.push(format!("{context}: buffer_size must be at least 1"));
    }
    if stage.batch_size == Some(0) {
        errors.push(format!("{context}: batch_size must be at least 1"));
    }
    if stage.batch_linger_ms.is_some() && stage.batch_size.is_none() {
        errors.push(format!("{context}: batch_linger_ms requires batch_size"));
    }
    if stage.timeout_ms == Some(0) {
        errors.push(format!("{context}: timeout_ms must be > 0"));
    }
    validate_retry(&stage.retry, &context, errors);
}

/// Validate a parsed pipeline configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipeline config.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    let errors = pipeline_problems(config);
    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}

/// Every value-level problem in `config`, in declaration order.
pub(crate) fn pipeline_problems(config: &PipelineConfig) -> Vec<String> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    if config.stages.is_empty() {
        errors.push("Pipeline must define at least one stage".to_string());
    }

    if config.checkpoint_interval == 0 {
        errors.push("checkpoint_interval must be at least 1".to_string());
    }

    if config.state.backend == StateBackendKind::Sqlite
        && config
            .state
            .connection
            .as_deref()
            .is_some_and(|c| c.trim().is_empty())
    {
        errors.push("state.connection must not be empty".to_string());
    }

    for (i, stage) in config.stages.iter().enumerate() {
        validate_stage(stage, i, &mut errors);
    }

    for edge in &config.edges {
        if edge.capacity == Some(0) {
            errors.push(format!(
                "edge '{}' -> '{}': capacity must be at least 1",
                edge.from, edge.to
            ));
        }
    }

    errors
}
