//! CLI command definitions for the `aslrun` binary.

pub mod run;
pub mod validate;

use std::path::PathBuf;

use aslrun_core::validator::ValidationOptions;
use aslrun_types::config::AslrunConfig;
use clap::{Args, Parser, Subcommand};

/// Run state-language workflows locally.
#[derive(Parser)]
#[command(name = "aslrun", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except results and errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed logs (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans to stdout via OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    /// Config file (default: <config dir>/aslrun/config.toml).
    #[arg(long, global = true, env = "ASLRUN_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a definition once per input.
    Run(run::RunArgs),

    /// Check a definition without running it.
    Validate(validate::ValidateArgs),
}

/// Validation switches shared by `run` and `validate`.
#[derive(Args, Debug, Clone, Default)]
pub struct ValidationFlags {
    /// Skip reference path and template checks.
    #[arg(long)]
    pub no_path_validation: bool,

    /// Allow Task resources that are not ARNs.
    #[arg(long)]
    pub no_arn_validation: bool,
}

impl ValidationFlags {
    /// Config defaults with CLI flags applied on top.
    pub fn options(&self, config: &AslrunConfig) -> ValidationOptions {
        ValidationOptions {
            check_paths: config.validation.check_paths && !self.no_path_validation,
            check_arn: config.validation.check_arn && !self.no_arn_validation,
            no_validate: false,
        }
    }
}

/// Parse a `STATE=VALUE` pair.
pub fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected STATE=VALUE, got '{raw}'")),
    }
}

/// Parse a `STATE=MILLISECONDS` pair.
pub fn parse_wait_override(raw: &str) -> Result<(String, u64), String> {
    let (state, millis) = parse_key_value(raw)?;
    let millis = millis
        .parse::<u64>()
        .map_err(|e| format!("invalid milliseconds for '{state}': {e}"))?;
    Ok((state, millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_key_value_splits_on_first_equals() {
        assert_eq!(
            parse_key_value("Send=./send.sh --flag=x").unwrap(),
            ("Send".to_string(), "./send.sh --flag=x".to_string())
        );
        assert!(parse_key_value("=x").is_err());
        assert!(parse_key_value("nothing").is_err());
    }

    #[test]
    fn parse_wait_override_requires_integer() {
        assert_eq!(parse_wait_override("Pause=25").unwrap(), ("Pause".to_string(), 25));
        assert!(parse_wait_override("Pause=soon").is_err());
    }

    #[test]
    fn validation_flags_override_config() {
        let mut config = AslrunConfig::default();
        let flags = ValidationFlags {
            no_path_validation: true,
            no_arn_validation: false,
        };
        let options = flags.options(&config);
        assert!(!options.check_paths);
        assert!(options.check_arn);

        config.validation.check_arn = false;
        assert!(!ValidationFlags::default().options(&config).check_arn);
    }

    #[test]
    fn run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "aslrun",
            "run",
            "-d",
            "machine.json",
            r#"{"a":1}"#,
            "-t",
            "Send=./send.sh",
            "-w",
            "Pause=10",
            "--no-arn-validation",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.inputs.len(), 1);
        assert_eq!(args.task, vec![("Send".to_string(), "./send.sh".to_string())]);
        assert_eq!(args.wait, vec![("Pause".to_string(), 10)]);
        assert!(args.validation.no_arn_validation);
    }
}
