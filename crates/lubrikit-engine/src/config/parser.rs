//! Pipeline YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::PipelineConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced environment variable that is
/// not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        let var_name = &cap[1];
        std::env::var(var_name).unwrap_or_else(|_| {
            if !missing.iter().any(|m| m == var_name) {
                missing.push(var_name.to_string());
            }
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(result.into_owned())
}

/// Parse a pipeline YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_pipeline_str(yaml_str: &str) -> Result<PipelineConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    let config: PipelineConfig =
        serde_yaml::from_str(&substituted).context("Failed to parse pipeline YAML")?;
    Ok(config)
}

/// Parse a pipeline YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_pipeline(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    parse_pipeline_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::StateBackendKind;
    use lubrikit_types::{OverflowPolicy, StageRole};

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("LK_TEST_HOST", "myhost.example.com");
        let input = "host: ${LK_TEST_HOST}\nport: 5432";
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains("myhost.example.com"));
        assert!(!result.contains("${LK_TEST_HOST}"));
        std::env::remove_var("LK_TEST_HOST");
    }

    #[test]
    fn test_multiple_env_vars() {
        std::env::set_var("LK_TEST_A", "alpha");
        std::env::set_var("LK_TEST_B", "beta");
        let input = "${LK_TEST_A} and ${LK_TEST_B}";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "alpha and beta");
        std::env::remove_var("LK_TEST_A");
        std::env::remove_var("LK_TEST_B");
    }

    #[test]
    fn test_no_env_vars_passthrough() {
        let input = "host: localhost\nport: 5432";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, input);
    }

    #[test]
    fn test_multiple_missing_env_vars_all_reported() {
        let input = "${LK_MISSING_X} and ${LK_MISSING_Y} and ${LK_MISSING_X}";
        let err_msg = substitute_env_vars(input).unwrap_err().to_string();
        assert!(err_msg.contains("LK_MISSING_X"));
        assert!(err_msg.contains("LK_MISSING_Y"));
        assert_eq!(err_msg.matches("LK_MISSING_X").count(), 1);
    }

    #[test]
    fn test_parse_pipeline_from_string() {
        std::env::set_var("LK_TEST_DB_PATH", "/tmp/lubrikit-test/state.db");
        let yaml = r#"
version: "1.0"
pipeline: test
ordered: true
state:
  backend: sqlite
  connection: ${LK_TEST_DB_PATH}
dead_letter:
  enabled: true
stages:
  - name: reader
    type: numbers
    role: collector
    config:
      count: 5
  - name: writer
    type: collect
    buffer_size: 1
    overflow: drop_newest
    retry:
      max_attempts: 5
      base_delay_ms: 10
edges:
  - from: reader
    to: writer
"#;
        let config = parse_pipeline_str(yaml).unwrap();
        assert_eq!(config.pipeline, "test");
        assert!(config.ordered);
        assert!(config.dead_letter.enabled);
        assert_eq!(config.state.backend, StateBackendKind::Sqlite);
        assert_eq!(
            config.state.connection.as_deref(),
            Some("/tmp/lubrikit-test/state.db")
        );
        assert_eq!(config.stages[0].role, Some(StageRole::Collector));
        assert_eq!(config.stages[0].config["count"], 5);
        assert_eq!(config.stages[1].overflow, OverflowPolicy::DropNewest);
        assert_eq!(config.stages[1].retry.max_attempts, 5);
        assert_eq!(config.stages[1].retry.max_delay_ms, 60_000);
        assert_eq!(config.edges.len(), 1);
        std::env::remove_var("LK_TEST_DB_PATH");
    }

    #[test]
    fn test_parse_invalid_yaml_errors() {
        let yaml = "this is not: [valid: yaml: {{{}}}";
        assert!(parse_pipeline_str(yaml).is_err());
    }

    #[test]
    fn test_parse_pipeline_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(
            &path,
            "version: \"1.0\"\npipeline: from_file\nstages:\n  - name: a\n    type: numbers\n",
        )
        .unwrap();
        let config = parse_pipeline(&path).unwrap();
        assert_eq!(config.pipeline, "from_file");
        assert_eq!(config.stages.len(), 1);
    }

    #[test]
    fn test_parse_pipeline_file_not_found() {
        let result = parse_pipeline(Path::new("/nonexistent/pipeline.yaml"));
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("Failed to read pipeline file"));
    }
}
