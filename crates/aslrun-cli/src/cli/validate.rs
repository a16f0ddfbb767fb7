//! `aslrun validate`: report structural problems in a definition.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use console::style;

use aslrun_core::validator;
use aslrun_infra::definition::load_definition;
use aslrun_types::config::AslrunConfig;

use super::ValidationFlags;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Definition file (JSON, or YAML by extension).
    #[arg(short, long)]
    pub definition: PathBuf,

    #[command(flatten)]
    pub validation: ValidationFlags,
}

/// Handle `aslrun validate`. Returns whether the definition is valid.
pub async fn handle_validate(args: ValidateArgs, config: &AslrunConfig, json: bool) -> Result<bool> {
    let definition = load_definition(&args.definition)
        .await
        .with_context(|| format!("Failed to load {}", args.definition.display()))?;

    let report = validator::validate(&definition, args.validation.options(config));

    if json {
        let out = serde_json::json!({
            "definition": args.definition.display().to_string(),
            "valid": report.is_valid,
            "errors": report.errors,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if report.is_valid {
        println!();
        println!(
            "  {} {} is valid ({} top-level states)",
            style("✓").green().bold(),
            style(args.definition.display()).cyan(),
            definition.graph.states.len()
        );
        println!();
    } else {
        println!();
        println!(
            "  {} {} has {} problem(s):",
            style("✗").red().bold(),
            style(args.definition.display()).cyan(),
            report.errors.len()
        );
        for error in &report.errors {
            println!("    - {error}");
        }
        println!();
    }

    Ok(report.is_valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, body).await.unwrap();
        path
    }

    #[tokio::test]
    async fn valid_definition_reports_true() {
        let tmp = TempDir::new().unwrap();
        let definition = write(
            &tmp,
            "ok.json",
            r#"{"StartAt": "Done", "States": {"Done": {"Type": "Succeed"}}}"#,
        )
        .await;
        let args = ValidateArgs {
            definition,
            validation: ValidationFlags::default(),
        };
        assert!(handle_validate(args, &AslrunConfig::default(), true).await.unwrap());
    }

    #[tokio::test]
    async fn invalid_definition_reports_false() {
        let tmp = TempDir::new().unwrap();
        let definition = write(
            &tmp,
            "bad.yaml",
            "StartAt: Nowhere\nStates:\n  Done:\n    Type: Succeed\n",
        )
        .await;
        let args = ValidateArgs {
            definition,
            validation: ValidationFlags::default(),
        };
        assert!(!handle_validate(args, &AslrunConfig::default(), false).await.unwrap());
    }

    #[tokio::test]
    async fn unreadable_definition_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let args = ValidateArgs {
            definition: tmp.path().join("missing.json"),
            validation: ValidationFlags::default(),
        };
        assert!(handle_validate(args, &AslrunConfig::default(), false).await.is_err());
    }
}
