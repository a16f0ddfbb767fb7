//! Loading definitions and inputs from disk.
//!
//! Definitions may be JSON or YAML; the format is chosen by file extension
//! (`.yaml` / `.yml` is YAML, anything else JSON).

use std::path::{Path, PathBuf};

use aslrun_types::definition::StateMachineDefinition;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {origin}: {source}")]
    Json {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid YAML in {origin}: {source}")]
    Yaml {
        origin: String,
        #[source]
        source: serde_yaml_ng::Error,
    },
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
}

/// Parse a definition document. `origin` labels errors.
pub fn parse_definition(content: &str, yaml: bool, origin: &str) -> Result<StateMachineDefinition, LoadError> {
    if yaml {
        serde_yaml_ng::from_str(content).map_err(|source| LoadError::Yaml {
            origin: origin.to_string(),
            source,
        })
    } else {
        serde_json::from_str(content).map_err(|source| LoadError::Json {
            origin: origin.to_string(),
            source,
        })
    }
}

/// Read and parse a definition file.
pub async fn load_definition(path: &Path) -> Result<StateMachineDefinition, LoadError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    parse_definition(&content, is_yaml(path), &path.display().to_string())
}

/// Parse one execution input given inline on the command line.
pub fn parse_input(raw: &str) -> Result<Value, LoadError> {
    serde_json::from_str(raw).map_err(|source| LoadError::Json {
        origin: "input".to_string(),
        source,
    })
}

/// Read an input file. A top-level JSON array is one input per element;
/// any other value is a single input.
pub async fn load_inputs(path: &Path) -> Result<Vec<Value>, LoadError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let value: Value = serde_json::from_str(&content).map_err(|source| LoadError::Json {
        origin: path.display().to_string(),
        source,
    })?;
    Ok(match value {
        Value::Array(items) => items,
        other => vec![other],
    })
}
