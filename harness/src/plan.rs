//! Orchestration for a whole plan: steps in order, then post-processing.

use anyhow::Result;
use chrono::Utc;
use indexmap::IndexMap;
use tracing::{error, info, instrument, warn};

use crate::core::types::{ExperimentPlan, PlanResult, PostProcessResult, PostProcessStep};
use crate::io::command::CommandRequest;
use crate::io::events::{EventKind, emit};
use crate::io::report::write_summary;
use crate::step::{RunContext, base_env, run_step};

/// Run every step in declared order and persist `experiment_results.json`.
///
/// With `stop_on_fail` the first failed step ends the run and later steps are
/// absent from the result. Post-processing runs only when every attempted step
/// succeeded; its failures are recorded but do not change `all_success`.
/// When a step aborts with an error, the results gathered so far are still
/// written (with `error` set) before the error is returned.
#[instrument(skip_all, fields(run_id = ctx.run_id, plan = plan_label))]
pub fn run_plan(ctx: &RunContext<'_>, plan: &ExperimentPlan, plan_label: &str) -> Result<PlanResult> {
    info!(steps = plan.steps.len(), stop_on_fail = plan.stop_on_fail, "plan started");
    emit(
        ctx.events,
        ctx.run_id,
        EventKind::PlanStarted {
            plan: plan_label.to_string(),
            steps: plan.step_ids().into_iter().map(str::to_string).collect(),
        },
    );

    let mut steps = IndexMap::new();
    for step in &plan.steps {
        let outcome = match run_step(ctx, plan, &step.id) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(step = %step.id, err = %format!("{err:#}"), "step aborted, saving partial results");
                let partial = PlanResult {
                    experiment_config: plan_label.to_string(),
                    run_id: ctx.run_id.to_string(),
                    steps,
                    post_process: Vec::new(),
                    completed_at: Utc::now(),
                    all_success: false,
                    error: Some(format!("step '{}': {err:#}", step.id)),
                };
                persist(ctx, plan, &partial);
                return Err(err);
            }
        };
        let success = outcome.success;
        steps.insert(step.id.clone(), outcome.last_attempt);
        if !success && plan.stop_on_fail {
            warn!(step = %step.id, "step failed, stopping plan");
            break;
        }
    }

    let all_success = PlanResult::all_steps_succeeded(&steps);
    let post_process = if all_success {
        plan.post_process
            .iter()
            .map(|post| run_post_process(ctx, post))
            .collect()
    } else {
        Vec::new()
    };

    let result = PlanResult {
        experiment_config: plan_label.to_string(),
        run_id: ctx.run_id.to_string(),
        steps,
        post_process,
        completed_at: Utc::now(),
        all_success,
        error: None,
    };
    ctx.store.write_plan_result(&result)?;
    if let Err(err) = write_summary(ctx.store, plan, &result) {
        warn!(err = %format!("{err:#}"), "failed to write summary");
    }

    info!(all_success, steps_run = result.steps.len(), "plan finished");
    emit(
        ctx.events,
        ctx.run_id,
        EventKind::PlanFinished {
            all_success,
            steps_run: result.steps.len(),
        },
    );
    Ok(result)
}

/// Best-effort write of a result the caller is about to abandon.
fn persist(ctx: &RunContext<'_>, plan: &ExperimentPlan, result: &PlanResult) {
    if let Err(err) = ctx.store.write_plan_result(result) {
        warn!(err = %format!("{err:#}"), "failed to write partial plan result");
    }
    if let Err(err) = write_summary(ctx.store, plan, result) {
        warn!(err = %format!("{err:#}"), "failed to write summary");
    }
}

/// One best-effort command: no retry, no checks.
fn run_post_process(ctx: &RunContext<'_>, post: &PostProcessStep) -> PostProcessResult {
    let label = format!("post_{}", post.name);
    let log_path = match ctx.store.new_log_path(&label, Utc::now()) {
        Ok(path) => path,
        Err(err) => {
            let message = format!("{err:#}");
            warn!(name = %post.name, err = %message, "could not reserve a transcript path");
            let result = PostProcessResult {
                name: post.name.clone(),
                success: false,
                exit_code: None,
                timed_out: false,
                error: Some(message),
                log_path: None,
                timestamp: Utc::now(),
            };
            emit_post_process(ctx, &result);
            return result;
        }
    };
    let request = CommandRequest {
        label: post.name.clone(),
        command: post.command.clone(),
        workdir: ctx.workdir.to_path_buf(),
        env: base_env(ctx, &post.name),
        timeout: post.timeout.unwrap_or(ctx.config.post_process_timeout()),
        output_limit_bytes: ctx.config.output_limit_bytes,
        log_path,
    };

    let result = match ctx.runner.run(&request) {
        Ok(outcome) => {
            if !outcome.success {
                warn!(name = %post.name, exit_code = outcome.exit_code, "post-process command failed");
            }
            PostProcessResult {
                name: post.name.clone(),
                success: outcome.success,
                exit_code: Some(outcome.exit_code),
                timed_out: outcome.timed_out,
                error: None,
                log_path: outcome.log_path,
                timestamp: Utc::now(),
            }
        }
        Err(err) => {
            let message = format!("{err:#}");
            warn!(name = %post.name, err = %message, "post-process command could not run");
            PostProcessResult {
                name: post.name.clone(),
                success: false,
                exit_code: None,
                timed_out: false,
                error: Some(message),
                log_path: request.log_path.is_file().then(|| request.log_path.clone()),
                timestamp: Utc::now(),
            }
        }
    };
    emit_post_process(ctx, &result);
    result
}

fn emit_post_process(ctx: &RunContext<'_>, result: &PostProcessResult) {
    emit(
        ctx.events,
        ctx.run_id,
        EventKind::PostProcessFinished {
            name: result.name.clone(),
            success: result.success,
            exit_code: result.exit_code,
        },
    );
}
