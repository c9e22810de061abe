//! Validation of the plan document and harness config without running anything.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::core::types::{Check, ExperimentPlan};
use crate::io::config::{HarnessConfig, load_config};
use crate::io::plan_store::load_plan;

/// Result of validating a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidateOutcome {
    pub plan: ExperimentPlan,
    pub config: HarnessConfig,
    /// Checks of a kind this harness does not know; they fail every attempt.
    pub warnings: Vec<String>,
}

/// Load config and plan, applying schema and invariant validation.
pub fn validate_plan(plan_path: &Path, settings_path: &Path) -> Result<ValidateOutcome> {
    let config = load_config(settings_path)
        .with_context(|| format!("load settings {}", settings_path.display()))?;
    let plan = load_plan(plan_path)?;
    let warnings = unknown_check_warnings(&plan);
    Ok(ValidateOutcome {
        plan,
        config,
        warnings,
    })
}

fn unknown_check_warnings(plan: &ExperimentPlan) -> Vec<String> {
    plan.steps
        .iter()
        .flat_map(|step| {
            step.checks.iter().filter_map(move |spec| match &spec.check {
                Check::Unknown { kind, .. } => Some(format!(
                    "step '{}': check type '{kind}' is not supported and will always fail",
                    step.id
                )),
                _ => None,
            })
        })
        .collect()
}

/// Execution order with the attempt budget and effective timeout of each step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSummary {
    pub id: String,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub checks: usize,
}

pub fn step_summaries(plan: &ExperimentPlan, config: &HarnessConfig) -> Vec<StepSummary> {
    plan.steps
        .iter()
        .map(|step| StepSummary {
            id: step.id.clone(),
            max_attempts: step.max_attempts(),
            timeout: step.resolve_timeout(config.default_timeout()),
            checks: step.checks.len(),
        })
        .collect()
}
