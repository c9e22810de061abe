//! Markdown run summary (`SUMMARY.md`).

use std::path::Path;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{AttemptStatus, ExperimentPlan, PlanResult};
use crate::io::artifacts::ArtifactStore;

const SUMMARY_TEMPLATE: &str = include_str!("templates/summary.md");

#[derive(Debug, Clone, Serialize)]
struct StepRow {
    id: String,
    attempts: u32,
    status: AttemptStatus,
    exit_code: Option<i32>,
    checks_passed: usize,
    checks_total: usize,
    failures: Vec<String>,
    error: Option<String>,
    log_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct PostProcessRow {
    name: String,
    success: bool,
    log_path: Option<String>,
}

/// Render the summary for a finished plan run.
pub fn render_summary(plan: &ExperimentPlan, result: &PlanResult) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("summary", SUMMARY_TEMPLATE)
        .expect("summary template should be valid");

    let steps: Vec<StepRow> = result
        .steps
        .iter()
        .map(|(id, attempt)| StepRow {
            id: id.clone(),
            attempts: attempt.attempt,
            status: attempt.status,
            exit_code: attempt.exit_code,
            checks_passed: attempt.sanity_results.iter().filter(|c| c.passed).count(),
            checks_total: attempt.sanity_results.len(),
            failures: attempt
                .sanity_results
                .iter()
                .filter(|check| !check.passed)
                .map(|check| check.message.clone())
                .collect(),
            error: attempt.error.clone(),
            log_path: attempt.log_path.as_deref().map(display_path),
        })
        .collect();
    let skipped: Vec<&str> = plan
        .step_ids()
        .into_iter()
        .filter(|id| !result.steps.contains_key(*id))
        .collect();
    let post_process: Vec<PostProcessRow> = result
        .post_process
        .iter()
        .map(|post| PostProcessRow {
            name: post.name.clone(),
            success: post.success,
            log_path: post.log_path.as_deref().map(display_path),
        })
        .collect();

    let template = env.get_template("summary")?;
    let rendered = template.render(context! {
        run_id => &result.run_id,
        plan => &result.experiment_config,
        completed_at => result.completed_at.to_rfc3339(),
        all_success => result.all_success,
        error => &result.error,
        steps => steps,
        skipped => skipped,
        post_process => post_process,
    })?;
    Ok(rendered)
}

/// Render and write `SUMMARY.md` into the output directory.
pub fn write_summary(
    store: &ArtifactStore,
    plan: &ExperimentPlan,
    result: &PlanResult,
) -> Result<()> {
    let rendered = render_summary(plan, result)?;
    let path = store.summary_path();
    store.write_text(&path, &rendered)?;
    debug!(path = %path.display(), "summary written");
    Ok(())
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{CheckResult, PostProcessResult};
    use crate::test_support::{attempt_result, plan, step};
    use chrono::Utc;
    use indexmap::IndexMap;
    use std::path::PathBuf;

    #[test]
    fn summary_lists_steps_failures_and_skips() {
        let plan = plan(vec![
            step("prepare", "true"),
            step("train", "false"),
            step("evaluate", "true"),
        ]);
        let mut train = attempt_result("train", 2, false);
        train.status = AttemptStatus::SanityFailed;
        train.exit_code = Some(0);
        train.log_path = Some(PathBuf::from("artifacts/logs/train_1.log"));
        train.sanity_results = vec![CheckResult {
            kind: "file_exists".to_string(),
            config: serde_json::json!({"type": "file_exists", "path": "model.pt"}),
            passed: false,
            message: "File model.pt does not exist".to_string(),
            timestamp: Utc::now(),
        }];
        let mut steps = IndexMap::new();
        steps.insert("prepare".to_string(), attempt_result("prepare", 1, true));
        steps.insert("train".to_string(), train);
        let result = PlanResult {
            experiment_config: "experiments.yaml".to_string(),
            run_id: "20260101T000000.000Z".to_string(),
            steps,
            post_process: Vec::new(),
            completed_at: Utc::now(),
            all_success: false,
            error: None,
        };

        let rendered = render_summary(&plan, &result).expect("render");
        assert!(rendered.contains("# Experiment run 20260101T000000.000Z"));
        assert!(rendered.contains("**FAILURE**"));
        assert!(rendered.contains("| train | 2 | sanity_failed | 0 | 0/1 |"));
        assert!(rendered.contains("- File model.pt does not exist"));
        assert!(rendered.contains("artifacts/logs/train_1.log"));
        assert!(rendered.contains("Not attempted: evaluate"));
        assert!(!rendered.contains("Post-processing"));
    }

    #[test]
    fn summary_reports_post_processing() {
        let plan = plan(vec![step("prepare", "true")]);
        let mut steps = IndexMap::new();
        steps.insert("prepare".to_string(), attempt_result("prepare", 1, true));
        let result = PlanResult {
            experiment_config: "experiments.yaml".to_string(),
            run_id: "run".to_string(),
            steps,
            post_process: vec![PostProcessResult {
                name: "plots".to_string(),
                success: false,
                exit_code: Some(1),
                timed_out: false,
                error: None,
                log_path: None,
                timestamp: Utc::now(),
            }],
            completed_at: Utc::now(),
            all_success: true,
            error: None,
        };

        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(temp.path());
        write_summary(&store, &plan, &result).expect("write");
        let rendered = std::fs::read_to_string(store.summary_path()).expect("read");
        assert!(rendered.contains("**SUCCESS**"));
        assert!(rendered.contains("- plots: failed"));
        assert!(!rendered.contains("Not attempted"));
    }
}
