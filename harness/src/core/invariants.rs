//! Semantic plan invariants not expressible via JSON Schema.

use std::collections::HashSet;
use std::time::Duration;

use crate::core::types::{ExperimentPlan, Step};

/// Check semantic invariants of a decoded plan:
/// - At least one step
/// - Step ids are non-empty, unique and use `[A-Za-z0-9._-]`
/// - Commands are non-empty
/// - Timeouts are positive
/// - `depends_on` only references steps declared earlier
/// - Post-process names are unique and their commands non-empty
pub fn validate_invariants(plan: &ExperimentPlan) -> Vec<String> {
    let mut errors = Vec::new();
    if plan.steps.is_empty() {
        errors.push("plan must declare at least one step".to_string());
    }

    let mut seen = HashSet::new();
    for (index, step) in plan.steps.iter().enumerate() {
        let label = format!("steps[{index}] '{}'", step.id);
        validate_step(step, &label, &seen, &mut errors);
        if !seen.insert(step.id.as_str()) {
            errors.push(format!("{label}: duplicate step id"));
        }
    }

    let mut post_names = HashSet::new();
    for (index, post) in plan.post_process.iter().enumerate() {
        let label = format!("post_process[{index}] '{}'", post.name);
        if post.name.trim().is_empty() {
            errors.push(format!("{label}: name must be non-empty"));
        }
        if !post_names.insert(post.name.as_str()) {
            errors.push(format!("{label}: duplicate post-process name"));
        }
        if post.command.is_empty() {
            errors.push(format!("{label}: command must be non-empty"));
        }
        if post.timeout == Some(Duration::ZERO) {
            errors.push(format!("{label}: timeout must be > 0"));
        }
    }

    errors
}

fn validate_step(step: &Step, label: &str, earlier: &HashSet<&str>, errors: &mut Vec<String>) {
    if step.id.is_empty() {
        errors.push(format!("{label}: id must be non-empty"));
    } else if !is_valid_id(&step.id) {
        errors.push(format!(
            "{label}: id may only contain letters, digits, '.', '_' and '-'"
        ));
    }

    if step.command.is_empty() {
        errors.push(format!("{label}: command must be non-empty"));
    }

    if step.timeout == Some(Duration::ZERO) {
        errors.push(format!("{label}: timeout must be > 0"));
    }
    if step.expected_duration == Some(Duration::ZERO) {
        errors.push(format!("{label}: expected duration must be > 0"));
    }

    for dependency in &step.depends_on {
        if dependency == &step.id {
            errors.push(format!("{label}: step cannot depend on itself"));
        } else if !earlier.contains(dependency.as_str()) {
            errors.push(format!(
                "{label}: depends_on '{dependency}' must name a step declared earlier"
            ));
        }
    }
}

/// Ids end up in file names, so keep them to a portable character set.
fn is_valid_id(id: &str) -> bool {
    id.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        && id != "."
        && id != ".."
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Cmd, PostProcessStep};
    use crate::test_support::{plan, step};

    #[test]
    fn valid_plan_has_no_errors() {
        let mut train = step("train", "python train.py");
        train.depends_on = vec!["prepare".to_string()];
        let plan = plan(vec![step("prepare", "python prep.py"), train]);
        assert!(validate_invariants(&plan).is_empty());
    }

    #[test]
    fn reports_all_violations_together() {
        let mut bad_dep = step("evaluate", "python eval.py");
        bad_dep.depends_on = vec!["report".to_string()];
        let mut zero_timeout = step("report", "");
        zero_timeout.timeout = Some(Duration::ZERO);
        let mut plan = plan(vec![
            step("train", "true"),
            step("train", "true"),
            step("bad/id", "true"),
            bad_dep,
            zero_timeout,
        ]);
        plan.post_process = vec![
            PostProcessStep {
                name: "plots".to_string(),
                command: Cmd::Shell("python plot.py".to_string()),
                timeout: None,
            },
            PostProcessStep {
                name: "plots".to_string(),
                command: Cmd::Argv(Vec::new()),
                timeout: None,
            },
        ];

        let errors = validate_invariants(&plan);
        assert!(errors.iter().any(|e| e.contains("duplicate step id")));
        assert!(errors.iter().any(|e| e.contains("may only contain")));
        assert!(errors.iter().any(|e| e.contains("depends_on 'report'")));
        assert!(errors.iter().any(|e| e.contains("command must be non-empty")));
        assert!(errors.iter().any(|e| e.contains("timeout must be > 0")));
        assert!(errors.iter().any(|e| e.contains("duplicate post-process name")));
    }

    #[test]
    fn empty_plan_is_rejected() {
        let errors = validate_invariants(&plan(Vec::new()));
        assert_eq!(errors, vec!["plan must declare at least one step"]);
    }
}
