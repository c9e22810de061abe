//! Harness configuration stored in `harness.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Default config file name, resolved against the working directory.
pub const CONFIG_FILE_NAME: &str = "harness.toml";

/// Harness configuration (TOML).
///
/// Edited by humans next to the plan document. Missing fields fall back to the
/// defaults below, so an absent file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Artifact root used when `--output` is not given.
    pub output_dir: PathBuf,

    /// Step timeout when neither the step nor its resource hint sets one.
    pub default_timeout_minutes: f64,

    /// Timeout for post-process commands that do not set their own.
    pub post_process_timeout_minutes: f64,

    /// Linear backoff base; the wait after attempt `n` is `n * backoff_base_secs`.
    pub backoff_base_secs: u64,

    /// Captured stdout/stderr beyond this many bytes (each) is discarded.
    pub output_limit_bytes: usize,

    /// Characters of output copied into `state.json`.
    pub output_summary_chars: usize,

    /// Evaluate checks after a timed-out attempt.
    pub checks_after_timeout: bool,

    /// Interpreter for string commands; the command line is appended as the last argument.
    pub shell: Vec<String>,

    /// Variables added to every command's environment.
    pub env: BTreeMap<String, String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("artifacts"),
            default_timeout_minutes: 60.0,
            post_process_timeout_minutes: 30.0,
            backoff_base_secs: 10,
            output_limit_bytes: 1_000_000,
            output_summary_chars: 500,
            checks_after_timeout: true,
            shell: vec!["sh".to_string(), "-c".to_string()],
            env: BTreeMap::new(),
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if minutes_duration(self.default_timeout_minutes).is_none() {
            return Err(anyhow!(
                "default_timeout_minutes must be > 0 and fit in a duration, got {}",
                self.default_timeout_minutes
            ));
        }
        if minutes_duration(self.post_process_timeout_minutes).is_none() {
            return Err(anyhow!(
                "post_process_timeout_minutes must be > 0 and fit in a duration, got {}",
                self.post_process_timeout_minutes
            ));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.shell.is_empty() || self.shell[0].trim().is_empty() {
            return Err(anyhow!("shell must be a non-empty array"));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(anyhow!("output_dir must be non-empty"));
        }
        Ok(())
    }

    /// Saturates for values `validate` would reject.
    pub fn default_timeout(&self) -> Duration {
        minutes_duration(self.default_timeout_minutes).unwrap_or(Duration::MAX)
    }

    pub fn post_process_timeout(&self) -> Duration {
        minutes_duration(self.post_process_timeout_minutes).unwrap_or(Duration::MAX)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }
}

/// Positive minutes as a `Duration`; `None` when non-positive or too large.
fn minutes_duration(minutes: f64) -> Option<Duration> {
    if minutes.is_nan() || minutes <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(minutes * 60.0).ok()
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HarnessConfig::default()`.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    if !path.exists() {
        let cfg = HarnessConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HarnessConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &HarnessConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
