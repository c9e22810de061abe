//! Plan and result types shared by the harness core.
//!
//! The plan side (`ExperimentPlan`, `Step`, `CheckSpec`) is decoded once from the
//! plan document and stays immutable for the duration of a run. The result side
//! (`CheckResult`, `AttemptResult`, `PlanResult`) is what gets persisted for the
//! external agent to read. These types perform no I/O; callers supply timestamps.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Executable form of a step command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cmd {
    /// Run through the configured shell (`sh -c` by default).
    Shell(String),
    /// Program plus arguments, executed without a shell.
    Argv(Vec<String>),
}

impl Cmd {
    pub fn is_empty(&self) -> bool {
        match self {
            Cmd::Shell(line) => line.trim().is_empty(),
            Cmd::Argv(argv) => argv.first().is_none_or(|program| program.trim().is_empty()),
        }
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cmd::Shell(line) => f.write_str(line),
            Cmd::Argv(argv) => f.write_str(&argv.join(" ")),
        }
    }
}

/// Ordered experiment plan loaded from the plan document.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentPlan {
    pub steps: Vec<Step>,
    /// Halt at the first failed step (default `true`).
    pub stop_on_fail: bool,
    /// Commands run once, only when every step succeeded.
    pub post_process: Vec<PostProcessStep>,
}

impl ExperimentPlan {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == id)
    }

    /// Look up a step, failing with [`UnknownStepError`] for undeclared ids.
    pub fn require_step(&self, id: &str) -> Result<&Step, UnknownStepError> {
        self.step(id).ok_or_else(|| UnknownStepError {
            step: id.to_string(),
            known: self.step_ids().iter().map(|id| id.to_string()).collect(),
        })
    }

    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.id.as_str()).collect()
    }
}

/// One executable unit of an experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Unique within the plan.
    pub id: String,
    /// Display name when the document carried both `id` and `name`.
    pub name: Option<String>,
    pub description: String,
    pub command: Cmd,
    /// Explicit timeout (`timeout_minutes` / `timeout_secs`).
    pub timeout: Option<Duration>,
    /// Resource hint (`resources.expected_duration_minutes`), used as timeout fallback.
    pub expected_duration: Option<Duration>,
    /// Extra attempts after the first; `0` means exactly one attempt.
    pub retry_count: u32,
    pub env: BTreeMap<String, String>,
    pub checks: Vec<CheckSpec>,
    /// Steps that must be declared earlier in the plan.
    pub depends_on: Vec<String>,
}

impl Step {
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    pub fn resolve_timeout(&self, default: Duration) -> Duration {
        self.timeout.or(self.expected_duration).unwrap_or(default)
    }
}

/// Best-effort command run after a fully successful plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostProcessStep {
    pub name: String,
    pub command: Cmd,
    pub timeout: Option<Duration>,
}

/// Comparison operator of a `json_threshold` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Operator {
    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Ge => ">=",
            Operator::Gt => ">",
            Operator::Le => "<=",
            Operator::Lt => "<",
            Operator::Eq => "==",
            Operator::Ne => "!=",
        }
    }

    /// `==` and `!=` also apply to non-numeric values.
    pub fn is_equality(self) -> bool {
        matches!(self, Operator::Eq | Operator::Ne)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            ">=" => Ok(Operator::Ge),
            ">" => Ok(Operator::Gt),
            "<=" => Ok(Operator::Le),
            "<" => Ok(Operator::Lt),
            "==" => Ok(Operator::Eq),
            "!=" => Ok(Operator::Ne),
            other => Err(format!(
                "unknown operator '{other}' (expected one of >=, >, <=, <, ==, !=)"
            )),
        }
    }
}

/// Declarative predicate evaluated against on-disk artifacts after an attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Check {
    FileExists {
        path: PathBuf,
    },
    JsonThreshold {
        path: PathBuf,
        key: String,
        operator: Operator,
        value: Value,
    },
    /// A check kind this harness does not know. Always fails.
    Unknown {
        kind: String,
        config: Value,
    },
}

impl Check {
    pub fn kind(&self) -> &str {
        match self {
            Check::FileExists { .. } => "file_exists",
            Check::JsonThreshold { .. } => "json_threshold",
            Check::Unknown { kind, .. } => kind,
        }
    }
}

/// A check as written in the plan together with its decoded form.
///
/// Aliases such as `json_value` and `metric` decode to the same [`Check`], but
/// results report the kind and mapping the author actually wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckSpec {
    pub kind: String,
    pub config: Value,
    pub check: Check,
}

impl From<Check> for CheckSpec {
    fn from(check: Check) -> Self {
        let config = match &check {
            Check::Unknown { config, .. } => config.clone(),
            other => serde_json::to_value(other).unwrap_or(Value::Null),
        };
        Self {
            kind: check.kind().to_string(),
            config,
            check,
        }
    }
}

/// Outcome of evaluating one [`CheckSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub config: Value,
    pub passed: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Latest check results for a step (`sanity_<step>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckReport {
    pub step: String,
    pub checks: Vec<CheckResult>,
    pub all_passed: bool,
    pub timestamp: DateTime<Utc>,
}

impl CheckReport {
    pub fn new(step: &str, checks: Vec<CheckResult>, timestamp: DateTime<Utc>) -> Self {
        let all_passed = checks.iter().all(|check| check.passed);
        Self {
            step: step.to_string(),
            checks,
            all_passed,
            timestamp,
        }
    }
}

/// Classification of a single attempt, readable by the external agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Command exited 0 and every check passed.
    Ok,
    /// Command exited non-zero.
    Failed,
    /// Command exceeded its timeout and was killed.
    Timeout,
    /// Command exited 0 but at least one check failed.
    SanityFailed,
    /// The attempt could not be carried out (spawn or I/O failure).
    Error,
}

/// One execution attempt of one step (`step_results/<step>_attempt_<n>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptResult {
    pub step: String,
    /// 1-based attempt index.
    pub attempt: u32,
    /// Command succeeded and every check passed.
    pub success: bool,
    /// Command exited with status 0.
    pub command_success: bool,
    /// `-1` on timeout, `None` when the command never completed.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub sanity_passed: bool,
    pub sanity_results: Vec<CheckResult>,
    pub output: String,
    pub status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one post-process command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostProcessResult {
    pub name: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
}

/// Plan-level summary (`experiment_results.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    /// Path of the plan document this run executed.
    pub experiment_config: String,
    pub run_id: String,
    /// Final attempt per attempted step, in execution order.
    pub steps: IndexMap<String, AttemptResult>,
    #[serde(default)]
    pub post_process: Vec<PostProcessResult>,
    pub completed_at: DateTime<Utc>,
    pub all_success: bool,
    /// Harness failure that ended the run before every step was decided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PlanResult {
    /// AND over the final attempts of all included steps (vacuously true).
    pub fn all_steps_succeeded(steps: &IndexMap<String, AttemptResult>) -> bool {
        steps.values().all(|attempt| attempt.success)
    }

    pub fn step_success(&self, id: &str) -> Option<bool> {
        self.steps.get(id).map(|attempt| attempt.success)
    }
}

/// Lookup of a step id that the plan does not declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStepError {
    pub step: String,
    pub known: Vec<String>,
}

impl fmt::Display for UnknownStepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step '{}' not found in plan (known steps: {})",
            self.step,
            self.known.join(", ")
        )
    }
}

impl std::error::Error for UnknownStepError {}
