//! Configuration types for the `aslrun` CLI.
//!
//! `AslrunConfig` represents the optional `config.toml` holding validation
//! defaults and per-state overrides. The engine itself reads no
//! configuration; these values are turned into run options by the CLI.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level CLI configuration. All fields have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AslrunConfig {
    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub overrides: OverridesConfig,
}

/// Validator switches applied when a definition is loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Parse every path and template expression up front.
    #[serde(default = "default_true")]
    pub check_paths: bool,

    /// Require Task `Resource` values to be ARNs.
    #[serde(default = "default_true")]
    pub check_arn: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            check_paths: true,
            check_arn: true,
        }
    }
}

/// Per-state overrides applied to every run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverridesConfig {
    /// Wait state name -> delay in milliseconds.
    #[serde(default)]
    pub wait: HashMap<String, u64>,

    /// Task state name (or resource) -> executable invoked with the task input.
    #[serde(default)]
    pub task: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_values() {
        let config = AslrunConfig::default();
        assert!(config.validation.check_paths);
        assert!(config.validation.check_arn);
        assert!(config.overrides.wait.is_empty());
        assert!(config.overrides.task.is_empty());
    }

    #[test]
    fn test_config_deserialize_empty_uses_defaults() {
        let config: AslrunConfig = toml::from_str("").unwrap();
        assert!(config.validation.check_paths);
        assert!(config.overrides.task.is_empty());
    }

    #[test]
    fn test_config_deserialize_with_values() {
        let toml_str = r#"
[validation]
check_arn = false

[overrides.wait]
WaitForApproval = 50

[overrides.task]
SendEmail = "./scripts/send-email.sh"
"#;
        let config: AslrunConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validation.check_paths);
        assert!(!config.validation.check_arn);
        assert_eq!(config.overrides.wait.get("WaitForApproval"), Some(&50));
        assert_eq!(
            config.overrides.task.get("SendEmail").map(String::as_str),
            Some("./scripts/send-email.sh")
        );
    }
}
