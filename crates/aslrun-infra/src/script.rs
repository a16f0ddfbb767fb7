//! Task handler backed by an external executable.
//!
//! The executable receives the task input as a single JSON argument and must
//! print its result as JSON on stdout. Empty stdout is a `null` result. The
//! child is spawned with `kill_on_drop`, so cancelling the run (which drops
//! the handler future) kills it.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use aslrun_core::task::{TaskError, TaskHandler};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct ScriptTaskHandler {
    program: PathBuf,
}

impl ScriptTaskHandler {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl TaskHandler for ScriptTaskHandler {
    async fn invoke(&self, input: Value) -> Result<Value, TaskError> {
        let output = tokio::process::Command::new(&self.program)
            .arg(input.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TaskError::failed(format!("failed to spawn {}: {e}", self.program.display())))?
            .wait_with_output()
            .await
            .map_err(|e| TaskError::failed(format!("failed to wait for {}: {e}", self.program.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!(
                program = %self.program.display(),
                status = %output.status,
                "task script failed"
            );
            return Err(TaskError::failed(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(stdout).map_err(|e| {
            TaskError::failed(format!(
                "{} printed invalid JSON: {e}",
                self.program.display()
            ))
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use aslrun_types::error::error_kind;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn script_echoes_json_argument() {
        let tmp = TempDir::new().unwrap();
        let handler = ScriptTaskHandler::new(script(&tmp, "echo.sh", r#"printf '%s' "$1""#));
        let out = handler.invoke(json!({ "n": 3 })).await.unwrap();
        assert_eq!(out, json!({ "n": 3 }));
    }

    #[tokio::test]
    async fn script_empty_output_is_null() {
        let tmp = TempDir::new().unwrap();
        let handler = ScriptTaskHandler::new(script(&tmp, "quiet.sh", "exit 0"));
        assert_eq!(handler.invoke(json!({})).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn script_nonzero_exit_is_task_failed_with_stderr() {
        let tmp = TempDir::new().unwrap();
        let handler = ScriptTaskHandler::new(script(&tmp, "fail.sh", "echo 'disk full' >&2\nexit 3"));
        let err = handler.invoke(json!({})).await.unwrap_err();
        assert_eq!(err.error, error_kind::TASK_FAILED);
        assert_eq!(err.cause, "disk full");
    }

    #[tokio::test]
    async fn missing_program_is_task_failed() {
        let handler = ScriptTaskHandler::new("/nonexistent/aslrun-task");
        let err = handler.invoke(json!({})).await.unwrap_err();
        assert_eq!(err.error, error_kind::TASK_FAILED);
        assert!(err.cause.contains("failed to spawn"));
    }
}
