//! Persisted state under the output directory.
//!
//! Layout:
//! - `logs/<label>_<timestamp>.log` command transcripts
//! - `step_results/<step>_attempt_<n>.json` attempts of the latest run
//! - `step_results/history/<run_id>/` attempts archived from earlier runs
//! - `sanity_<step>.json` latest check report per step
//! - `state.json` current step state
//! - `experiment_results.json` plan summary
//! - `events.jsonl`, `SUMMARY.md`, `runner_error.log`

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::retry::StepState;
use crate::core::types::{AttemptResult, AttemptStatus, CheckReport, PlanResult};

pub const LOGS_DIR: &str = "logs";
pub const STEP_RESULTS_DIR: &str = "step_results";
pub const HISTORY_DIR: &str = "history";
pub const STATE_FILE: &str = "state.json";
pub const PLAN_RESULT_FILE: &str = "experiment_results.json";
pub const EVENTS_FILE: &str = "events.jsonl";
pub const SUMMARY_FILE: &str = "SUMMARY.md";
pub const ERROR_LOG_FILE: &str = "runner_error.log";

const ATTEMPT_MARKER: &str = "_attempt_";

/// Current-state document (`state.json`), overwritten after every attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentState {
    pub run_id: String,
    pub step: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub status: AttemptStatus,
    pub state: StepState,
    pub exit_code: Option<i32>,
    pub sanity_passed: bool,
    pub output_summary: String,
    pub error: Option<String>,
    pub replan_suggestion: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Run id for one harness invocation: UTC time with millisecond precision.
pub fn new_run_id(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

/// File-system view of one output directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    pub fn step_results_dir(&self) -> PathBuf {
        self.root.join(STEP_RESULTS_DIR)
    }

    pub fn history_dir(&self, run_id: &str) -> PathBuf {
        self.step_results_dir().join(HISTORY_DIR).join(run_id)
    }

    pub fn attempt_path(&self, step: &str, attempt: u32) -> PathBuf {
        self.step_results_dir()
            .join(format!("{step}{ATTEMPT_MARKER}{attempt}.json"))
    }

    pub fn check_report_path(&self, step: &str) -> PathBuf {
        self.root.join(format!("sanity_{step}.json"))
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn plan_result_path(&self) -> PathBuf {
        self.root.join(PLAN_RESULT_FILE)
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join(EVENTS_FILE)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.root.join(SUMMARY_FILE)
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.root.join(ERROR_LOG_FILE)
    }

    /// Create the output directory tree.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [self.root.clone(), self.logs_dir(), self.step_results_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Reserve a fresh transcript path for `label`; never reuses an existing file.
    pub fn new_log_path(&self, label: &str, now: DateTime<Utc>) -> Result<PathBuf> {
        let dir = self.logs_dir();
        fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;
        let stamp = now.format("%Y%m%dT%H%M%S%3fZ");
        let mut path = dir.join(format!("{label}_{stamp}.log"));
        let mut suffix = 2;
        while path.exists() {
            path = dir.join(format!("{label}_{stamp}_{suffix}.log"));
            suffix += 1;
        }
        Ok(path)
    }

    /// Move attempt files of `step` left by earlier runs into the history of `run_id`.
    ///
    /// Returns the number of files moved.
    pub fn archive_previous_attempts(&self, step: &str, run_id: &str) -> Result<usize> {
        let previous = self.attempt_files(step)?;
        if previous.is_empty() {
            return Ok(0);
        }
        let history = self.history_dir(run_id);
        fs::create_dir_all(&history)
            .with_context(|| format!("create directory {}", history.display()))?;
        for (_, path) in &previous {
            let Some(name) = path.file_name() else {
                continue;
            };
            let target = history.join(name);
            fs::rename(path, &target).with_context(|| {
                format!("archive {} to {}", path.display(), target.display())
            })?;
        }
        info!(step, moved = previous.len(), history = %history.display(), "archived previous attempts");
        Ok(previous.len())
    }

    /// Attempt files of `step` in the current run, ordered by attempt number.
    pub fn list_attempts(&self, step: &str) -> Result<Vec<PathBuf>> {
        Ok(self
            .attempt_files(step)?
            .into_iter()
            .map(|(_, path)| path)
            .collect())
    }

    fn attempt_files(&self, step: &str) -> Result<Vec<(u32, PathBuf)>> {
        let dir = self.step_results_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read dir {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(attempt) = parse_attempt_file_name(&path, step) {
                found.push((attempt, path));
            }
        }
        found.sort();
        Ok(found)
    }

    pub fn write_attempt(&self, attempt: &AttemptResult) -> Result<PathBuf> {
        let path = self.attempt_path(&attempt.step, attempt.attempt);
        write_json_atomic(&path, attempt)?;
        Ok(path)
    }

    pub fn load_attempt(&self, step: &str, attempt: u32) -> Result<AttemptResult> {
        read_json(&self.attempt_path(step, attempt))
    }

    pub fn write_check_report(&self, report: &CheckReport) -> Result<PathBuf> {
        let path = self.check_report_path(&report.step);
        write_json_atomic(&path, report)?;
        Ok(path)
    }

    pub fn load_check_report(&self, step: &str) -> Result<CheckReport> {
        read_json(&self.check_report_path(step))
    }

    pub fn write_state(&self, state: &CurrentState) -> Result<()> {
        write_json_atomic(&self.state_path(), state)
    }

    pub fn load_state(&self) -> Result<CurrentState> {
        read_json(&self.state_path())
    }

    pub fn write_plan_result(&self, result: &PlanResult) -> Result<PathBuf> {
        let path = self.plan_result_path();
        write_json_atomic(&path, result)?;
        Ok(path)
    }

    pub fn load_plan_result(&self) -> Result<PlanResult> {
        read_json(&self.plan_result_path())
    }

    pub fn write_text(&self, path: &Path, contents: &str) -> Result<()> {
        write_atomic(path, contents)
    }
}

/// `<step>_attempt_<n>.json` → `n`, only for an exact step match.
fn parse_attempt_file_name(path: &Path, step: &str) -> Option<u32> {
    let stem = path.file_name()?.to_str()?.strip_suffix(".json")?;
    let (name, attempt) = stem.rsplit_once(ATTEMPT_MARKER)?;
    if name != step {
        return None;
    }
    attempt.parse().ok()
}

/// Serialize `value` as pretty JSON and write it atomically (temp file + rename).
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("artifact path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("artifact path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    debug!(path = %path.display(), "artifact written");
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}
