//! Orchestration for a single step: execute, check, persist, decide.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::retry::{StepState, Transition, classify_attempt, decide, replan_suggestion};
use crate::core::types::{AttemptResult, CheckReport, ExperimentPlan, Step};
use crate::io::artifacts::{ArtifactStore, CurrentState};
use crate::io::backoff::Sleeper;
use crate::io::checks;
use crate::io::command::{CommandRequest, CommandRunner};
use crate::io::config::HarnessConfig;
use crate::io::events::{EventKind, EventSink, emit};

pub const ENV_STEP: &str = "EXPERIMENT_STEP";
pub const ENV_ATTEMPT: &str = "EXPERIMENT_ATTEMPT";
pub const ENV_OUTPUT_DIR: &str = "EXPERIMENT_OUTPUT_DIR";
pub const ENV_PYTHONPATH: &str = "PYTHONPATH";

/// Collaborators shared by every step of one harness invocation.
pub struct RunContext<'a> {
    pub run_id: &'a str,
    /// Experiment checkout; commands run here and relative check paths resolve here.
    pub workdir: &'a Path,
    pub store: &'a ArtifactStore,
    pub config: &'a HarnessConfig,
    pub runner: &'a dyn CommandRunner,
    pub sleeper: &'a dyn Sleeper,
    pub events: &'a dyn EventSink,
}

/// Result of running one step to a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub success: bool,
    /// Final attempt, also persisted as `step_results/<step>_attempt_<n>.json`.
    pub last_attempt: AttemptResult,
    pub attempts: u32,
    /// `Succeeded` or `Exhausted`.
    pub state: StepState,
}

/// Run `step_id` until it succeeds or its attempts are exhausted.
///
/// Failed commands, failed checks and attempts that could not start are all
/// recorded as failed attempts and retried. Only an unknown step id or an
/// artifact write failure returns `Err`.
#[instrument(skip(ctx, plan), fields(run_id = ctx.run_id))]
pub fn run_step(ctx: &RunContext<'_>, plan: &ExperimentPlan, step_id: &str) -> Result<StepOutcome> {
    let step = plan.require_step(step_id)?;
    let max_attempts = step.max_attempts();
    let timeout = step.resolve_timeout(ctx.config.default_timeout());

    ctx.store.ensure_layout()?;
    ctx.store.archive_previous_attempts(&step.id, ctx.run_id)?;

    info!(
        step = %step.id,
        max_attempts,
        timeout_secs = timeout.as_secs(),
        "step started"
    );
    emit(
        ctx.events,
        ctx.run_id,
        EventKind::StepStarted {
            step: step.id.clone(),
            max_attempts,
            timeout_ms: duration_ms(timeout),
        },
    );

    let mut attempt = 1;
    loop {
        debug!(step = %step.id, attempt, state = ?StepState::Attempting, "attempt started");
        let result = run_attempt(ctx, step, attempt, timeout)?;

        // Persist before deciding so a reader sees attempt N before attempt N+1 starts.
        ctx.store.write_attempt(&result)?;
        let transition = decide(attempt, max_attempts, result.success, ctx.config.backoff_base());
        write_current_state(ctx, &result, max_attempts, transition.state())?;
        emit(
            ctx.events,
            ctx.run_id,
            EventKind::AttemptFinished {
                step: step.id.clone(),
                attempt,
                status: result.status,
                exit_code: result.exit_code,
                sanity_passed: result.sanity_passed,
                duration_ms: result.duration_ms,
            },
        );

        match transition {
            Transition::Retry {
                next_attempt,
                delay,
            } => {
                warn!(
                    step = %step.id,
                    attempt,
                    status = ?result.status,
                    delay_secs = delay.as_secs(),
                    "attempt failed, retrying"
                );
                emit(
                    ctx.events,
                    ctx.run_id,
                    EventKind::RetryScheduled {
                        step: step.id.clone(),
                        next_attempt,
                        delay_ms: duration_ms(delay),
                    },
                );
                ctx.sleeper.sleep(delay);
                attempt = next_attempt;
            }
            Transition::Succeeded | Transition::Exhausted => {
                let state = transition.state();
                if result.success {
                    info!(step = %step.id, attempt, "step succeeded");
                } else {
                    warn!(step = %step.id, attempts = attempt, status = ?result.status, "step exhausted its attempts");
                }
                emit(
                    ctx.events,
                    ctx.run_id,
                    EventKind::StepFinished {
                        step: step.id.clone(),
                        success: result.success,
                        attempts: attempt,
                        state,
                    },
                );
                return Ok(StepOutcome {
                    success: result.success,
                    last_attempt: result,
                    attempts: attempt,
                    state,
                });
            }
        }
    }
}

fn run_attempt(
    ctx: &RunContext<'_>,
    step: &Step,
    attempt: u32,
    timeout: Duration,
) -> Result<AttemptResult> {
    let started = Instant::now();
    let log_path = match ctx.store.new_log_path(&step.id, Utc::now()) {
        Ok(path) => path,
        Err(err) => {
            let message = format!("{err:#}");
            warn!(step = %step.id, attempt, err = %message, "could not reserve a transcript path");
            return Ok(errored_attempt(step, attempt, started, message, None));
        }
    };
    let request = CommandRequest {
        label: step.id.clone(),
        command: step.command.clone(),
        workdir: ctx.workdir.to_path_buf(),
        env: step_env(ctx, step, attempt),
        timeout,
        output_limit_bytes: ctx.config.output_limit_bytes,
        log_path,
    };

    let outcome = match ctx.runner.run(&request) {
        Ok(outcome) => outcome,
        Err(err) => {
            let message = format!("{err:#}");
            warn!(step = %step.id, attempt, err = %message, "attempt could not run");
            let log_path = request.log_path.is_file().then(|| request.log_path.clone());
            return Ok(errored_attempt(step, attempt, started, message, log_path));
        }
    };

    debug!(step = %step.id, attempt, state = ?StepState::SanityChecking, "evaluating checks");
    let (sanity_passed, sanity_results) = if outcome.timed_out && !ctx.config.checks_after_timeout
    {
        (false, Vec::new())
    } else {
        let (passed, results) = checks::evaluate(ctx.workdir, &step.checks);
        ctx.store
            .write_check_report(&CheckReport::new(&step.id, results.clone(), Utc::now()))?;
        (passed, results)
    };

    let status = classify_attempt(false, outcome.timed_out, outcome.success, sanity_passed);
    Ok(AttemptResult {
        step: step.id.clone(),
        attempt,
        success: outcome.success && sanity_passed,
        command_success: outcome.success,
        exit_code: Some(outcome.exit_code),
        timed_out: outcome.timed_out,
        sanity_passed,
        sanity_results,
        output: outcome.output,
        status,
        error: None,
        log_path: outcome.log_path,
        duration_ms: duration_ms(outcome.duration),
        timestamp: Utc::now(),
    })
}

/// Attempt that never produced a command outcome.
fn errored_attempt(
    step: &Step,
    attempt: u32,
    started: Instant,
    message: String,
    log_path: Option<PathBuf>,
) -> AttemptResult {
    AttemptResult {
        step: step.id.clone(),
        attempt,
        success: false,
        command_success: false,
        exit_code: None,
        timed_out: false,
        sanity_passed: false,
        sanity_results: Vec::new(),
        output: String::new(),
        status: classify_attempt(true, false, false, false),
        error: Some(message),
        log_path,
        duration_ms: duration_ms(started.elapsed()),
        timestamp: Utc::now(),
    }
}

/// Layered command environment: config, harness variables, then the step's own map.
fn step_env(ctx: &RunContext<'_>, step: &Step, attempt: u32) -> BTreeMap<String, String> {
    let mut vars = base_env(ctx, &step.id);
    vars.insert(ENV_ATTEMPT.to_string(), attempt.to_string());
    vars.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    vars
}

/// Config `[env]` plus the harness variables every command receives.
pub(crate) fn base_env(ctx: &RunContext<'_>, label: &str) -> BTreeMap<String, String> {
    let mut vars = ctx.config.env.clone();
    vars.insert(ENV_STEP.to_string(), label.to_string());
    vars.insert(
        ENV_OUTPUT_DIR.to_string(),
        ctx.store.root().display().to_string(),
    );
    let existing = vars
        .get(ENV_PYTHONPATH)
        .cloned()
        .or_else(|| env::var(ENV_PYTHONPATH).ok());
    vars.insert(
        ENV_PYTHONPATH.to_string(),
        prepend_path(ctx.workdir, existing.as_deref()),
    );
    vars
}

fn prepend_path(dir: &Path, existing: Option<&str>) -> String {
    let Some(existing) = existing.filter(|value| !value.is_empty()) else {
        return dir.display().to_string();
    };
    let mut paths = vec![dir.to_path_buf()];
    paths.extend(env::split_paths(existing));
    match env::join_paths(paths) {
        Ok(joined) => joined.to_string_lossy().into_owned(),
        Err(_) => dir.display().to_string(),
    }
}

fn write_current_state(
    ctx: &RunContext<'_>,
    result: &AttemptResult,
    max_attempts: u32,
    state: StepState,
) -> Result<()> {
    let status = result.status;
    ctx.store.write_state(&CurrentState {
        run_id: ctx.run_id.to_string(),
        step: result.step.clone(),
        attempt: result.attempt,
        max_attempts,
        status,
        state,
        exit_code: result.exit_code,
        sanity_passed: result.sanity_passed,
        output_summary: output_tail(&result.output, ctx.config.output_summary_chars),
        error: result.error.clone(),
        replan_suggestion: replan_suggestion(status).map(str::to_string),
        updated_at: Utc::now(),
    })
}

/// Last `max_chars` characters of the output, where failures usually show up.
fn output_tail(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_string();
    }
    output.chars().skip(total - max_chars).collect()
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
