//! Plan loading with schema + invariant validation.
//!
//! The plan document is YAML (JSON parses too). Loading goes document → JSON
//! value → schema → typed plan → invariants, so a malformed step or check is
//! rejected before any command runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::validator_for;
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::core::compare::numeric_threshold;
use crate::core::invariants::validate_invariants;
use crate::core::types::{
    Check, CheckSpec, Cmd, ExperimentPlan, Operator, PostProcessStep, Step, UnknownStepError,
};

/// Default plan document name, resolved against the working directory.
pub const PLAN_FILE_NAME: &str = "experiments.yaml";

/// JSON schema every plan document must satisfy.
pub const PLAN_SCHEMA: &str = include_str!("../../schemas/experiment_plan.schema.json");

static METRIC_CONDITION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(>=|<=|==|!=|>|<)\s*(\S.*?)\s*$").unwrap());

#[derive(Debug, Deserialize)]
struct RawPlan {
    steps: Vec<RawStep>,
    #[serde(default = "default_stop_on_fail")]
    stop_on_fail: bool,
    #[serde(default)]
    post_process: Vec<RawPostProcess>,
    #[serde(default)]
    validation: Vec<RawValidation>,
}

fn default_stop_on_fail() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawStep {
    id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    description: String,
    command: Option<Cmd>,
    cmd: Option<Cmd>,
    timeout_minutes: Option<f64>,
    timeout_secs: Option<f64>,
    retry: Option<u32>,
    retry_count: Option<u32>,
    #[serde(default)]
    env: BTreeMap<String, Value>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    sanity: Vec<Value>,
    #[serde(default)]
    checks: Vec<Value>,
    resources: Option<RawResources>,
}

#[derive(Debug, Deserialize)]
struct RawResources {
    expected_duration_minutes: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawPostProcess {
    name: String,
    command: Option<Cmd>,
    cmd: Option<Cmd>,
    timeout_minutes: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawValidation {
    step: String,
    checks: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct FileExistsFields {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ThresholdFields {
    path: PathBuf,
    key: String,
    operator: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct MetricFields {
    path: PathBuf,
    key: String,
    condition: String,
}

/// Load and validate a plan document from disk.
pub fn load_plan(path: &Path) -> Result<ExperimentPlan> {
    debug!(path = %path.display(), "loading plan");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    parse_plan(&contents).with_context(|| format!("invalid plan {}", path.display()))
}

/// Parse and validate a plan document.
pub fn parse_plan(contents: &str) -> Result<ExperimentPlan> {
    let value: Value = serde_yaml::from_str(contents).context("parse plan document")?;
    validate_schema(&value)?;
    let raw: RawPlan = serde_json::from_value(value).context("decode plan document")?;
    let plan = build_plan(raw)?;

    let errors = validate_invariants(&plan);
    if !errors.is_empty() {
        bail!("plan invariants failed: {}", errors.join("; "));
    }
    debug!(steps = plan.steps.len(), "plan loaded");
    Ok(plan)
}

fn validate_schema(document: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(document) {
        let messages = compiled
            .iter_errors(document)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "plan schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

fn build_plan(raw: RawPlan) -> Result<ExperimentPlan> {
    let mut steps = raw
        .steps
        .into_iter()
        .enumerate()
        .map(|(index, step)| build_step(index, step))
        .collect::<Result<Vec<_>>>()?;

    for (index, validation) in raw.validation.into_iter().enumerate() {
        let label = format!("validation[{index}]");
        let known: Vec<String> = steps.iter().map(|step| step.id.clone()).collect();
        let step = steps
            .iter_mut()
            .find(|step| step.id == validation.step)
            .ok_or_else(|| {
                anyhow::Error::new(UnknownStepError {
                    step: validation.step.clone(),
                    known,
                })
                .context(label.clone())
            })?;
        for (check_index, check) in validation.checks.iter().enumerate() {
            let check = decode_check(check)
                .with_context(|| format!("{label}.checks[{check_index}]"))?;
            step.checks.push(check);
        }
    }

    let post_process = raw
        .post_process
        .into_iter()
        .enumerate()
        .map(|(index, post)| -> Result<PostProcessStep> {
            let label = format!("post_process[{index}] '{}'", post.name);
            Ok(PostProcessStep {
                command: pick(post.command, post.cmd, "command", "cmd")
                    .with_context(|| label.clone())?
                    .ok_or_else(|| anyhow!("{label}: command is required"))?,
                timeout: post
                    .timeout_minutes
                    .map(minutes)
                    .transpose()
                    .with_context(|| label.clone())?,
                name: post.name,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ExperimentPlan {
        steps,
        stop_on_fail: raw.stop_on_fail,
        post_process,
    })
}

fn build_step(index: usize, raw: RawStep) -> Result<Step> {
    let (id, name) = match (raw.id, raw.name) {
        (Some(id), name) => (id, name),
        (None, Some(name)) => (name, None),
        (None, None) => bail!("steps[{index}]: id or name is required"),
    };
    let label = format!("steps[{index}] '{id}'");

    let command = pick(raw.command, raw.cmd, "command", "cmd")
        .with_context(|| label.clone())?
        .ok_or_else(|| anyhow!("{label}: command is required"))?;
    let timeout = match (raw.timeout_minutes, raw.timeout_secs) {
        (Some(_), Some(_)) => bail!("{label}: set only one of 'timeout_minutes' and 'timeout_secs'"),
        (Some(value), None) => Some(minutes(value)),
        (None, Some(value)) => Some(seconds(value)),
        (None, None) => None,
    }
    .transpose()
    .with_context(|| label.clone())?;
    let expected_duration = raw
        .resources
        .and_then(|resources| resources.expected_duration_minutes)
        .map(minutes)
        .transpose()
        .with_context(|| label.clone())?;
    let retry_count = pick(raw.retry, raw.retry_count, "retry", "retry_count")
        .with_context(|| label.clone())?
        .unwrap_or(0);

    let env = raw
        .env
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(text) => text,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect();

    let checks = raw
        .sanity
        .iter()
        .chain(raw.checks.iter())
        .enumerate()
        .map(|(check_index, check)| {
            decode_check(check).with_context(|| format!("{label}: checks[{check_index}]"))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Step {
        id,
        name,
        description: raw.description,
        command,
        timeout,
        expected_duration,
        retry_count,
        env,
        checks,
        depends_on: raw.depends_on,
    })
}

/// Accept either spelling of a field, but not both.
fn pick<T>(
    primary: Option<T>,
    alias: Option<T>,
    primary_name: &str,
    alias_name: &str,
) -> Result<Option<T>> {
    match (primary, alias) {
        (Some(_), Some(_)) => bail!("set only one of '{primary_name}' and '{alias_name}'"),
        (primary, alias) => Ok(primary.or(alias)),
    }
}

fn minutes(value: f64) -> Result<Duration> {
    seconds(value * 60.0)
}

fn seconds(value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|err| anyhow!("invalid duration {value}: {err}"))
}

/// Decode one check, keeping the authored kind and mapping alongside it.
fn decode_check(value: &Value) -> Result<CheckSpec> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("check requires a string 'type'"))?;
    Ok(CheckSpec {
        kind: kind.to_string(),
        config: value.clone(),
        check: decode_check_kind(kind, value)?,
    })
}

/// Unknown kinds are kept and fail at evaluation time.
fn decode_check_kind(kind: &str, value: &Value) -> Result<Check> {
    match kind {
        "file_exists" => {
            let fields: FileExistsFields = fields(value, kind)?;
            Ok(Check::FileExists { path: fields.path })
        }
        "json_threshold" | "json_value" => {
            let fields: ThresholdFields = fields(value, kind)?;
            let operator = fields.operator.parse::<Operator>().map_err(|err| anyhow!(err))?;
            if !operator.is_equality() && numeric_threshold(&fields.value).is_none() {
                bail!(
                    "{kind} check: threshold {} needs to be numeric for operator {operator}",
                    fields.value
                );
            }
            Ok(Check::JsonThreshold {
                path: fields.path,
                key: fields.key,
                operator,
                value: fields.value,
            })
        }
        "metric" => {
            let fields: MetricFields = fields(value, kind)?;
            let (operator, threshold) = parse_condition(&fields.condition)?;
            Ok(Check::JsonThreshold {
                path: fields.path,
                key: fields.key,
                operator,
                value: threshold,
            })
        }
        other => Ok(Check::Unknown {
            kind: other.to_string(),
            config: value.clone(),
        }),
    }
}

fn fields<T: DeserializeOwned>(value: &Value, kind: &str) -> Result<T> {
    serde_json::from_value(value.clone()).with_context(|| format!("invalid {kind} check"))
}

/// Split a metric condition such as `">= 0.9"` into operator and threshold.
fn parse_condition(condition: &str) -> Result<(Operator, Value)> {
    let captures = METRIC_CONDITION
        .captures(condition)
        .ok_or_else(|| anyhow!("invalid metric condition '{condition}'"))?;
    let operator = captures[1].parse::<Operator>().map_err(|err| anyhow!(err))?;
    let threshold = Value::String(captures[2].to_string());
    if !operator.is_equality() && numeric_threshold(&threshold).is_none() {
        bail!("metric condition '{condition}' needs a numeric threshold");
    }
    Ok((operator, threshold))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PLAN: &str = r#"
stop_on_fail: false
steps:
  - id: prepare
    description: Download the dataset
    command: python prepare.py
    timeout_minutes: 0.5
    sanity:
      - type: file_exists
        path: data/train.csv
  - name: train
    cmd: ["python", "train.py", "--epochs", "3"]
    retry: 2
    depends_on: [prepare]
    env:
      SEED: 42
    resources:
      expected_duration_minutes: 90
      gpu: true
    checks:
      - type: json_threshold
        path: results/metrics.json
        key: accuracy
        operator: ">="
        value: 0.9
      - type: metric
        path: results/metrics.json
        key: metrics.loss
        condition: "< 0.5"
      - type: gpu_memory
        max_gb: 8
post_process:
  - name: plots
    cmd: python plot.py
    timeout_minutes: 5
"#;

    #[test]
    fn parses_full_plan() {
        let plan = parse_plan(PLAN).expect("parse");
        assert!(!plan.stop_on_fail);
        assert_eq!(plan.step_ids(), vec!["prepare", "train"]);

        let prepare = &plan.steps[0];
        assert_eq!(prepare.timeout, Some(Duration::from_secs(30)));
        assert_eq!(prepare.retry_count, 0);
        assert_eq!(prepare.checks.len(), 1);
        assert_eq!(
            prepare.checks[0].check,
            Check::FileExists {
                path: PathBuf::from("data/train.csv")
            }
        );
        assert_eq!(prepare.checks[0].kind, "file_exists");

        let train = &plan.steps[1];
        assert_eq!(train.max_attempts(), 3);
        assert_eq!(train.timeout, None);
        assert_eq!(train.expected_duration, Some(Duration::from_secs(90 * 60)));
        assert_eq!(train.env.get("SEED").map(String::as_str), Some("42"));
        assert_eq!(
            train.command,
            Cmd::Argv(vec![
                "python".to_string(),
                "train.py".to_string(),
                "--epochs".to_string(),
                "3".to_string()
            ])
        );
        assert_eq!(train.checks.len(), 3);
        assert_eq!(train.checks[1].kind, "metric");
        assert_eq!(train.checks[1].config["condition"], "< 0.5");
        assert_eq!(
            train.checks[1].check,
            Check::JsonThreshold {
                path: PathBuf::from("results/metrics.json"),
                key: "metrics.loss".to_string(),
                operator: Operator::Lt,
                value: json!("0.5"),
            }
        );
        assert_eq!(train.checks[2].kind, "gpu_memory");
        assert_eq!(train.checks[2].config["max_gb"], 8);

        assert_eq!(plan.post_process.len(), 1);
        assert_eq!(plan.post_process[0].timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn stop_on_fail_defaults_to_true() {
        let plan = parse_plan("steps:\n  - id: a\n    command: 'true'\n").expect("parse");
        assert!(plan.stop_on_fail);
        assert!(plan.post_process.is_empty());
    }

    #[test]
    fn validation_section_merges_into_steps() {
        let doc = r#"
steps:
  - id: train
    command: python train.py
    checks:
      - type: file_exists
        path: model.pt
validation:
  - step: train
    checks:
      - type: json_value
        path: metrics.json
        key: status
        operator: "=="
        value: done
"#;
        let plan = parse_plan(doc).expect("parse");
        assert_eq!(plan.steps[0].checks.len(), 2);
        let merged = &plan.steps[0].checks[1];
        assert_eq!(merged.kind, "json_value");
        assert_eq!(merged.check.kind(), "json_threshold");
    }

    #[test]
    fn validation_for_unknown_step_is_an_error() {
        let doc = r#"
steps:
  - id: train
    command: python train.py
validation:
  - step: evaluate
    checks: []
"#;
        let err = parse_plan(doc).unwrap_err();
        let unknown = err.downcast_ref::<UnknownStepError>().expect("unknown step");
        assert_eq!(unknown.step, "evaluate");
        assert_eq!(unknown.known, vec!["train"]);
    }

    #[test]
    fn unknown_operator_is_rejected_at_load() {
        let doc = r#"
steps:
  - id: train
    command: python train.py
    checks:
      - type: json_threshold
        path: metrics.json
        key: accuracy
        operator: "=>"
        value: 0.9
"#;
        let err = parse_plan(doc).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("unknown operator '=>'"), "{message}");
        assert!(message.contains("steps[0] 'train'"), "{message}");
    }

    #[test]
    fn ordering_against_a_word_is_rejected_at_load() {
        let doc = r#"
steps:
  - id: train
    command: python train.py
    checks:
      - type: json_threshold
        path: metrics.json
        key: speed
        operator: ">"
        value: fast
"#;
        let err = parse_plan(doc).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("needs to be numeric for operator >"), "{message}");
        assert!(message.contains("checks[0]"), "{message}");

        let equality = doc.replace(r#"operator: ">""#, r#"operator: "==""#);
        parse_plan(&equality).expect("equality against a word is fine");
    }

    #[test]
    fn known_check_with_missing_fields_is_rejected() {
        let doc = r#"
steps:
  - id: train
    command: python train.py
    checks:
      - type: json_threshold
        path: metrics.json
"#;
        let err = parse_plan(doc).unwrap_err();
        assert!(format!("{err:#}").contains("invalid json_threshold check"));
    }

    #[test]
    fn schema_rejects_missing_command() {
        let err = parse_plan("steps:\n  - id: train\n").unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn invariants_are_checked_after_decoding() {
        let doc = r#"
steps:
  - id: train
    command: python train.py
    depends_on: [evaluate]
  - id: train
    command: python train.py
"#;
        let err = parse_plan(doc).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("plan invariants failed"));
        assert!(message.contains("duplicate step id"));
        assert!(message.contains("depends_on 'evaluate'"));
    }

    #[test]
    fn conflicting_aliases_are_rejected() {
        let doc = "steps:\n  - id: a\n    command: 'true'\n    cmd: 'false'\n";
        let err = parse_plan(doc).unwrap_err();
        assert!(format!("{err:#}").contains("set only one of 'command' and 'cmd'"));
    }

    #[test]
    fn metric_conditions() {
        assert_eq!(
            parse_condition(">= 100").expect("parse"),
            (Operator::Ge, json!("100"))
        );
        assert_eq!(
            parse_condition("==done").expect("parse"),
            (Operator::Eq, json!("done"))
        );
        assert!(parse_condition("> fast").is_err());
        assert!(parse_condition("about 3").is_err());
    }

    #[test]
    fn load_plan_names_the_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(PLAN_FILE_NAME);
        fs::write(&path, "steps: []\n").expect("write");
        let err = load_plan(&path).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains(PLAN_FILE_NAME));
        assert!(message.contains("at least one step"));
    }
}
