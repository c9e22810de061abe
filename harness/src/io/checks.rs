//! Check evaluation against on-disk artifacts.
//!
//! Every check is evaluated, in order, even after an earlier one failed. Problems
//! reading artifacts (missing file, invalid JSON, missing key) become failed
//! checks with a descriptive message; evaluation itself never errors.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::core::compare::{compare, lookup};
use crate::core::types::{Check, CheckResult, CheckSpec, Operator};

/// Evaluate `checks` with relative paths resolved against `workdir`.
///
/// Returns `(all_passed, results)`; an empty check list passes.
pub fn evaluate(workdir: &Path, checks: &[CheckSpec]) -> (bool, Vec<CheckResult>) {
    let results: Vec<CheckResult> = checks
        .iter()
        .map(|check| evaluate_one(workdir, check))
        .collect();
    let all_passed = results.iter().all(|result| result.passed);
    debug!(count = results.len(), all_passed, "checks evaluated");
    (all_passed, results)
}

fn evaluate_one(workdir: &Path, spec: &CheckSpec) -> CheckResult {
    let (passed, message) = match &spec.check {
        Check::FileExists { path } => file_exists(workdir, path),
        Check::JsonThreshold {
            path,
            key,
            operator,
            value,
        } => json_threshold(workdir, path, key, *operator, value),
        Check::Unknown { kind, .. } => (false, format!("Unknown check type: {kind}")),
    };
    CheckResult {
        kind: spec.kind.clone(),
        config: spec.config.clone(),
        passed,
        message,
        timestamp: Utc::now(),
    }
}

fn resolve(workdir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    }
}

fn file_exists(workdir: &Path, path: &Path) -> (bool, String) {
    if resolve(workdir, path).exists() {
        (true, format!("File {} exists", path.display()))
    } else {
        (false, format!("File {} does not exist", path.display()))
    }
}

fn json_threshold(
    workdir: &Path,
    path: &Path,
    key: &str,
    operator: Operator,
    expected: &Value,
) -> (bool, String) {
    let full = resolve(workdir, path);
    if !full.exists() {
        return (false, format!("JSON file {} does not exist", path.display()));
    }
    let contents = match fs::read_to_string(&full) {
        Ok(contents) => contents,
        Err(err) => return (false, format!("Failed to read {}: {err}", path.display())),
    };
    let document: Value = match serde_json::from_str(&contents) {
        Ok(document) => document,
        Err(err) => {
            return (false, format!("Failed to parse JSON {}: {err}", path.display()));
        }
    };
    let Some(actual) = lookup(&document, key) else {
        return (false, format!("Key '{key}' not found in {}", path.display()));
    };
    match compare(actual, operator, expected) {
        Ok(passed) => (
            passed,
            format!("{key} = {actual} {operator} {expected}: {passed}"),
        ),
        Err(reason) => (false, format!("Cannot compare {key}: {reason}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn threshold(key: &str, operator: Operator, value: Value) -> CheckSpec {
        Check::JsonThreshold {
            path: PathBuf::from("results/metrics.json"),
            key: key.to_string(),
            operator,
            value,
        }
        .into()
    }

    fn write_metrics(root: &Path, contents: &str) {
        let dir = root.join("results");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("metrics.json"), contents).expect("write metrics");
    }

    #[test]
    fn threshold_passes_and_fails_on_the_same_document() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_metrics(temp.path(), r#"{"accuracy": 0.92}"#);

        let (passed, results) = evaluate(
            temp.path(),
            &[threshold("accuracy", Operator::Ge, json!(0.9))],
        );
        assert!(passed);
        assert_eq!(results[0].kind, "json_threshold");

        let (passed, results) = evaluate(
            temp.path(),
            &[threshold("accuracy", Operator::Ge, json!("0.95"))],
        );
        assert!(!passed);
        assert!(results[0].message.contains("false"));
    }

    #[test]
    fn missing_key_names_the_key() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_metrics(temp.path(), r#"{"accuracy": 0.92}"#);

        let (passed, results) =
            evaluate(temp.path(), &[threshold("f1_score", Operator::Ge, json!(0.5))]);
        assert!(!passed);
        assert!(results[0].message.contains("f1_score"));
    }

    #[test]
    fn unreadable_artifacts_fail_closed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let check = threshold("accuracy", Operator::Ge, json!(0.9));

        let (_, results) = evaluate(temp.path(), std::slice::from_ref(&check));
        assert!(results[0].message.contains("does not exist"));

        write_metrics(temp.path(), "{not json");
        let (_, results) = evaluate(temp.path(), std::slice::from_ref(&check));
        assert!(!results[0].passed);
        assert!(results[0].message.contains("Failed to parse JSON"));

        write_metrics(temp.path(), r#"{"accuracy": "n/a"}"#);
        let (_, results) = evaluate(temp.path(), &[check]);
        assert!(!results[0].passed);
        assert!(results[0].message.contains("not numeric"));
    }

    #[test]
    fn file_exists_tracks_the_filesystem() {
        let temp = tempfile::tempdir().expect("tempdir");
        let model = temp.path().join("model.pt");
        let checks = [CheckSpec::from(Check::FileExists {
            path: PathBuf::from("model.pt"),
        })];

        fs::write(&model, b"weights").expect("write");
        assert!(evaluate(temp.path(), &checks).0);

        fs::remove_file(&model).expect("remove");
        let (passed, results) = evaluate(temp.path(), &checks);
        assert!(!passed);
        assert_eq!(results[0].message, "File model.pt does not exist");
    }

    #[test]
    fn all_checks_are_reported_after_a_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_metrics(temp.path(), r#"{"metrics": {"loss": 0.1}}"#);
        let checks = [
            CheckSpec::from(Check::FileExists {
                path: PathBuf::from("missing.txt"),
            }),
            CheckSpec::from(Check::Unknown {
                kind: "gpu_memory".to_string(),
                config: json!({"type": "gpu_memory", "max_gb": 8}),
            }),
            threshold("metrics.loss", Operator::Lt, json!(0.2)),
        ];

        let (passed, results) = evaluate(temp.path(), &checks);
        assert!(!passed);
        assert_eq!(results.len(), 3);
        assert!(!results[0].passed);
        assert_eq!(results[1].message, "Unknown check type: gpu_memory");
        assert_eq!(results[1].config, json!({"type": "gpu_memory", "max_gb": 8}));
        assert!(results[2].passed);
    }

    #[test]
    fn results_keep_the_authored_kind_and_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_metrics(temp.path(), r#"{"loss": 0.1}"#);
        let authored = json!({
            "type": "metric",
            "path": "results/metrics.json",
            "key": "loss",
            "condition": "< 0.5",
        });
        let spec = CheckSpec {
            kind: "metric".to_string(),
            config: authored.clone(),
            check: Check::JsonThreshold {
                path: PathBuf::from("results/metrics.json"),
                key: "loss".to_string(),
                operator: Operator::Lt,
                value: json!("0.5"),
            },
        };

        let (passed, results) = evaluate(temp.path(), &[spec]);
        assert!(passed);
        assert_eq!(results[0].kind, "metric");
        assert_eq!(results[0].config, authored);

        let saved = serde_json::to_value(&results[0]).expect("serialize");
        assert_eq!(saved["type"], "metric");
        assert_eq!(saved["config"]["condition"], "< 0.5");
    }

    #[test]
    fn repeated_evaluation_is_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_metrics(temp.path(), r#"{"accuracy": 0.92}"#);
        let checks = [
            threshold("accuracy", Operator::Ge, json!(0.9)),
            threshold("loss", Operator::Le, json!(1)),
        ];

        let (first_passed, first) = evaluate(temp.path(), &checks);
        let (second_passed, second) = evaluate(temp.path(), &checks);
        assert_eq!(first_passed, second_passed);
        let summarize = |results: &[CheckResult]| {
            results
                .iter()
                .map(|r| (r.passed, r.message.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(summarize(&first), summarize(&second));
    }

    #[test]
    fn empty_check_list_passes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (passed, results) = evaluate(temp.path(), &[]);
        assert!(passed);
        assert!(results.is_empty());
    }
}
