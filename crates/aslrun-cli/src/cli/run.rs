//! `aslrun run`: execute a definition against one or more inputs.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use futures_util::future::join_all;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use aslrun_core::execution::{ExecutionError, RunOptions};
use aslrun_core::task::TaskHandlerRegistry;
use aslrun_core::validator::ValidationError;
use aslrun_core::{ExecutionHandle, StateMachine};
use aslrun_infra::definition::{load_definition, load_inputs, parse_input};
use aslrun_infra::script::ScriptTaskHandler;
use aslrun_types::config::AslrunConfig;
use aslrun_types::event::ExecutionEvent;
use aslrun_types::execution::ExecutionId;

use super::{ValidationFlags, parse_key_value, parse_wait_override};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Definition file (JSON, or YAML by extension).
    #[arg(short, long)]
    pub definition: PathBuf,

    /// Inline JSON inputs; one execution per input.
    pub inputs: Vec<String>,

    /// JSON file of inputs; a top-level array is one execution per element.
    #[arg(long)]
    pub input_file: Option<PathBuf>,

    /// Run a Task state (or resource) with an executable: STATE=SCRIPT.
    #[arg(short, long, value_name = "STATE=SCRIPT", value_parser = parse_key_value)]
    pub task: Vec<(String, String)>,

    /// Replace a Wait state's delay: STATE=MILLISECONDS.
    #[arg(short, long, value_name = "STATE=MS", value_parser = parse_wait_override)]
    pub wait: Vec<(String, u64)>,

    /// JSON merged into the context object.
    #[arg(long)]
    pub context: Option<String>,

    /// Name reported as `$$.StateMachine.Name`.
    #[arg(long)]
    pub name: Option<String>,

    #[command(flatten)]
    pub validation: ValidationFlags,

    /// Skip definition validation entirely.
    #[arg(long)]
    pub no_validation: bool,

    /// Print execution events to stderr as JSON lines.
    #[arg(long)]
    pub events: bool,

    /// Report aborted executions as a null result instead of an error.
    #[arg(long)]
    pub no_throw_on_abort: bool,
}

/// Handle `aslrun run`. Returns whether every execution succeeded.
pub async fn handle_run(args: RunArgs, config: &AslrunConfig, json: bool, quiet: bool) -> Result<bool> {
    let definition = load_definition(&args.definition)
        .await
        .with_context(|| format!("Failed to load {}", args.definition.display()))?;

    let mut validation = args.validation.options(config);
    validation.no_validate = args.no_validation;
    let mut machine = StateMachine::with_options(definition, validation).map_err(invalid_definition)?;
    if let Some(name) = &args.name {
        machine = machine.with_name(name.clone());
    }

    let inputs = collect_inputs(&args).await?;
    let options = run_options(&args, config)?;

    let mut handles: Vec<ExecutionHandle> = Vec::with_capacity(inputs.len());
    let mut printers = Vec::new();
    for input in inputs {
        let mut handle = machine.run(input, options.clone());
        if args.events {
            printers.push(tokio::spawn(print_events(handle.events())));
        }
        handles.push(handle);
    }

    let abort_tokens: Vec<CancellationToken> = handles.iter().map(ExecutionHandle::abort_token).collect();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, aborting {} execution(s)", abort_tokens.len());
            for token in abort_tokens {
                token.cancel();
            }
        }
    });

    let ids: Vec<ExecutionId> = handles.iter().map(ExecutionHandle::execution_id).collect();
    let results = join_all(handles.into_iter().map(ExecutionHandle::result)).await;
    ctrl_c.abort();
    for printer in join_all(printers).await {
        if let Err(e) = printer {
            tracing::warn!(error = %e, "event printer task failed");
        }
    }

    let mut all_succeeded = true;
    for (id, result) in ids.into_iter().zip(results) {
        all_succeeded &= result.is_ok();
        report(id, &result, json, quiet)?;
    }
    Ok(all_succeeded)
}

fn invalid_definition(err: ValidationError) -> anyhow::Error {
    let list = err
        .errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n");
    anyhow::anyhow!("Definition validation failed:\n{list}")
}

async fn collect_inputs(args: &RunArgs) -> Result<Vec<Value>> {
    let mut inputs = Vec::new();
    for raw in &args.inputs {
        inputs.push(parse_input(raw).with_context(|| format!("Invalid input '{raw}'"))?);
    }
    if let Some(path) = &args.input_file {
        inputs.extend(
            load_inputs(path)
                .await
                .with_context(|| format!("Failed to load inputs from {}", path.display()))?,
        );
    }
    if inputs.is_empty() {
        inputs.push(json!({}));
    }
    Ok(inputs)
}

/// Config overrides first, CLI flags on top.
fn run_options(args: &RunArgs, config: &AslrunConfig) -> Result<RunOptions> {
    let mut tasks = TaskHandlerRegistry::new();
    let scripts = config
        .overrides
        .task
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .chain(args.task.iter().cloned());
    for (state, script) in scripts {
        tracing::debug!(state = state.as_str(), script = script.as_str(), "registering task script");
        tasks.register(state, ScriptTaskHandler::new(script));
    }

    let mut options = RunOptions::new()
        .with_task_handlers(tasks)
        .no_throw_on_abort(args.no_throw_on_abort);

    for (state, millis) in &config.overrides.wait {
        options = options.with_wait_override(state.clone(), *millis);
    }
    for (state, millis) in &args.wait {
        options = options.with_wait_override(state.clone(), *millis);
    }

    if let Some(raw) = &args.context {
        let context: Value = serde_json::from_str(raw).context("--context must be valid JSON")?;
        options = options.with_context(context);
    }

    Ok(options)
}

async fn print_events(mut rx: broadcast::Receiver<ExecutionEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Ok(line) = serde_json::to_string(&event) {
                    eprintln!("{line}");
                }
                if event.is_terminal() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn report(id: ExecutionId, result: &Result<Value, ExecutionError>, json: bool, quiet: bool) -> Result<()> {
    if json {
        let line = match result {
            Ok(output) => json!({
                "execution_id": id.to_string(),
                "status": "SUCCEEDED",
                "output": output,
            }),
            Err(err) => json!({
                "execution_id": id.to_string(),
                "status": err.status().to_string(),
                "error": err.record(),
            }),
        };
        println!("{}", serde_json::to_string(&line)?);
        return Ok(());
    }

    match result {
        Ok(output) => {
            if !quiet {
                eprintln!("  {} {}", style("✓").green(), style(id).dim());
            }
            println!("{}", serde_json::to_string_pretty(output)?);
        }
        Err(err) => {
            eprintln!(
                "  {} {} {}",
                style("✗").red(),
                style(id).dim(),
                style(err.status()).red().bold()
            );
            if let Some(record) = err.record() {
                eprintln!("    {}: {}", style(&record.error).yellow(), record.cause);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["aslrun", "run", "-d", "m.json"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Run(args) => args,
            _ => panic!("expected run"),
        }
    }

    #[tokio::test]
    async fn collect_inputs_defaults_to_empty_object() {
        let inputs = collect_inputs(&run_args(&[])).await.unwrap();
        assert_eq!(inputs, vec![json!({})]);
    }

    #[tokio::test]
    async fn collect_inputs_merges_inline_and_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("inputs.json");
        tokio::fs::write(&file, "[1, 2]").await.unwrap();
        let file = file.to_string_lossy().to_string();

        let inputs = collect_inputs(&run_args(&["0", "--input-file", &file])).await.unwrap();
        assert_eq!(inputs, vec![json!(0), json!(1), json!(2)]);
    }

    #[test]
    fn run_options_cli_wins_over_config() {
        let mut config = AslrunConfig::default();
        config.overrides.wait.insert("Pause".into(), 1000);
        config.overrides.task.insert("Send".into(), "/bin/true".into());

        let options = run_options(
            &run_args(&["-w", "Pause=5", "--context", r#"{"Execution":{"Name":"x"}}"#]),
            &config,
        )
        .unwrap();
        assert_eq!(options.overrides.wait_time_overrides.get("Pause"), Some(&5));
        assert!(options.overrides.task_resource_local_handlers.get("Send").is_some());
        assert!(options.context.is_some());
    }

    #[tokio::test]
    async fn event_printer_finishes_on_terminal_event() {
        let machine = StateMachine::from_json(
            r#"{"StartAt": "P", "States": {"P": {"Type": "Pass", "End": true}}}"#,
            Default::default(),
        )
        .unwrap();
        let mut handle = machine.run(json!({}), RunOptions::new());
        let printer = tokio::spawn(print_events(handle.events()));

        assert_eq!(handle.result().await.unwrap(), json!({}));
        tokio::time::timeout(std::time::Duration::from_secs(5), printer)
            .await
            .expect("printer should stop after the terminal event")
            .unwrap();
    }

    #[tokio::test]
    async fn handle_run_with_events_succeeds() {
        let tmp = tempfile::TempDir::new().unwrap();
        let definition = tmp.path().join("m.json");
        tokio::fs::write(
            &definition,
            r#"{"StartAt": "P", "States": {"P": {"Type": "Pass", "Result": 1, "End": true}}}"#,
        )
        .await
        .unwrap();
        let mut args = run_args(&["--events", "{}", "[]"]);
        args.definition = definition;

        assert!(handle_run(args, &AslrunConfig::default(), true, true).await.unwrap());
    }

    #[test]
    fn run_options_rejects_bad_context() {
        let err = run_options(&run_args(&["--context", "{"]), &AslrunConfig::default()).unwrap_err();
        assert!(err.to_string().contains("--context"));
    }
}
