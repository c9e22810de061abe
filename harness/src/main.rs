//! Experiment step harness.
//!
//! Executes the steps of `experiments.yaml` with timeouts, retries and artifact
//! checks, leaving JSON state under the output directory for the agent that
//! iterates on the experiment code.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::warn;

use harness::exit_codes;
use harness::io::artifacts::{ArtifactStore, new_run_id};
use harness::io::backoff::ThreadSleeper;
use harness::io::command::ShellCommandRunner;
use harness::io::config::{CONFIG_FILE_NAME, HarnessConfig, load_config};
use harness::io::events::{EventSink, JsonlEventSink, NullEventSink};
use harness::io::plan_store::{PLAN_FILE_NAME, load_plan};
use harness::logging;
use harness::plan::run_plan;
use harness::step::{RunContext, run_step};
use harness::validate::{step_summaries, validate_plan};

#[derive(Parser)]
#[command(
    name = "harness",
    version,
    about = "Run experiment steps with timeouts, retries and artifact checks"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one step, or every step of the plan in order.
    Run(RunArgs),
    /// Check the plan against the schema and plan invariants.
    Validate(PlanArgs),
    /// List steps in execution order with their attempt budget and timeout.
    Steps(PlanArgs),
}

#[derive(Args)]
struct PlanArgs {
    /// Plan document.
    #[arg(long, default_value = PLAN_FILE_NAME)]
    plan: PathBuf,
    /// Harness settings (TOML); defaults apply when the file is missing.
    #[arg(long, default_value = CONFIG_FILE_NAME)]
    settings: PathBuf,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    plan: PlanArgs,
    /// Run only this step; the exit code reflects its result.
    #[arg(long)]
    step: Option<String>,
    /// Output directory (overrides `output_dir` from the settings).
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run(args) => cmd_run(&args),
        Command::Validate(args) => report(cmd_validate(&args)),
        Command::Steps(args) => report(cmd_steps(&args)),
    };
    std::process::exit(code);
}

fn report(result: Result<()>) -> i32 {
    match result {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::FAILURE
        }
    }
}

fn cmd_run(args: &RunArgs) -> i32 {
    match run(args) {
        Ok(true) => exit_codes::OK,
        Ok(false) => exit_codes::FAILURE,
        Err(err) => {
            eprintln!("{:#}", err);
            let output_dir = fallback_output_dir(args);
            if let Err(log_err) = write_error_log(&output_dir, &err) {
                eprintln!("{:#}", log_err);
            }
            exit_codes::FAILURE
        }
    }
}

fn run(args: &RunArgs) -> Result<bool> {
    let workdir = env::current_dir().context("resolve working directory")?;
    let config = load_config(&args.plan.settings)
        .with_context(|| format!("load settings {}", args.plan.settings.display()))?;
    let store = ArtifactStore::new(workdir.join(output_dir(args, &config)));
    let plan = load_plan(&args.plan.plan)?;

    store.ensure_layout()?;
    let events: Box<dyn EventSink> = match JsonlEventSink::open(&store.events_path()) {
        Ok(sink) => Box::new(sink),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "event log unavailable, events are discarded");
            Box::new(NullEventSink)
        }
    };
    let runner = ShellCommandRunner::new(config.shell.clone());
    let run_id = new_run_id(Utc::now());
    let ctx = RunContext {
        run_id: &run_id,
        workdir: &workdir,
        store: &store,
        config: &config,
        runner: &runner,
        sleeper: &ThreadSleeper,
        events: events.as_ref(),
    };

    match &args.step {
        Some(step_id) => {
            let outcome = run_step(&ctx, &plan, step_id)?;
            println!(
                "{}: {} after {} attempt(s)",
                step_id,
                if outcome.success { "succeeded" } else { "failed" },
                outcome.attempts
            );
            Ok(outcome.success)
        }
        None => {
            let result = run_plan(&ctx, &plan, &args.plan.plan.display().to_string())?;
            println!(
                "plan {}: {} of {} step(s) run, results in {}",
                if result.all_success { "succeeded" } else { "failed" },
                result.steps.len(),
                plan.steps.len(),
                store.plan_result_path().display()
            );
            Ok(result.all_success)
        }
    }
}

fn output_dir(args: &RunArgs, config: &HarnessConfig) -> PathBuf {
    args.output
        .clone()
        .unwrap_or_else(|| config.output_dir.clone())
}

/// Output directory for the error log when the run could not get far enough to resolve it.
fn fallback_output_dir(args: &RunArgs) -> PathBuf {
    let config = load_config(&args.plan.settings).unwrap_or_default();
    output_dir(args, &config)
}

fn write_error_log(output_dir: &Path, err: &anyhow::Error) -> Result<()> {
    let store = ArtifactStore::new(output_dir);
    let path = store.error_log_path();
    fs::create_dir_all(output_dir)
        .with_context(|| format!("create {}", output_dir.display()))?;
    fs::write(&path, format!("harness error: {err:#}\n"))
        .with_context(|| format!("write {}", path.display()))
}

fn cmd_validate(args: &PlanArgs) -> Result<()> {
    let outcome = validate_plan(&args.plan, &args.settings)?;
    for warning in &outcome.warnings {
        eprintln!("warning: {warning}");
    }
    println!(
        "{}: {} step(s), {} post-process command(s)",
        args.plan.display(),
        outcome.plan.steps.len(),
        outcome.plan.post_process.len()
    );
    Ok(())
}

fn cmd_steps(args: &PlanArgs) -> Result<()> {
    let outcome = validate_plan(&args.plan, &args.settings)?;
    for summary in step_summaries(&outcome.plan, &outcome.config) {
        println!(
            "{}\tattempts={}\ttimeout={}s\tchecks={}",
            summary.id,
            summary.max_attempts,
            summary.timeout.as_secs(),
            summary.checks
        );
    }
    Ok(())
}
