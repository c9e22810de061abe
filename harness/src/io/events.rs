//! Progress events for the external agent (`events.jsonl`).
//!
//! The sink is passed explicitly to the step and plan runners. A failing sink
//! is logged and otherwise ignored; it never changes a step's outcome.

use std::cell::RefCell;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::retry::StepState;
use crate::core::types::AttemptStatus;

/// One event line, stamped with the run id and time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessEvent {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    PlanStarted {
        plan: String,
        steps: Vec<String>,
    },
    StepStarted {
        step: String,
        max_attempts: u32,
        timeout_ms: u64,
    },
    AttemptFinished {
        step: String,
        attempt: u32,
        status: AttemptStatus,
        exit_code: Option<i32>,
        sanity_passed: bool,
        duration_ms: u64,
    },
    RetryScheduled {
        step: String,
        next_attempt: u32,
        delay_ms: u64,
    },
    StepFinished {
        step: String,
        success: bool,
        attempts: u32,
        state: StepState,
    },
    PostProcessFinished {
        name: String,
        success: bool,
        exit_code: Option<i32>,
    },
    PlanFinished {
        all_success: bool,
        steps_run: usize,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::PlanStarted { .. } => "plan_started",
            EventKind::StepStarted { .. } => "step_started",
            EventKind::AttemptFinished { .. } => "attempt_finished",
            EventKind::RetryScheduled { .. } => "retry_scheduled",
            EventKind::StepFinished { .. } => "step_finished",
            EventKind::PostProcessFinished { .. } => "post_process_finished",
            EventKind::PlanFinished { .. } => "plan_finished",
        }
    }
}

pub trait EventSink {
    fn record(&self, event: &HarnessEvent) -> Result<()>;
}

/// Stamp `kind` and hand it to `sink`, logging failures.
pub fn emit(sink: &dyn EventSink, run_id: &str, kind: EventKind) {
    let event = HarnessEvent {
        run_id: run_id.to_string(),
        timestamp: Utc::now(),
        kind,
    };
    if let Err(err) = sink.record(&event) {
        warn!(event = event.kind.name(), err = %format!("{err:#}"), "failed to record event");
    }
}

/// Appends one JSON object per line; the file accumulates across runs.
pub struct JsonlEventSink {
    writer: RefCell<BufWriter<File>>,
}

impl JsonlEventSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open event log {}", path.display()))?;
        Ok(Self {
            writer: RefCell::new(BufWriter::new(file)),
        })
    }
}

impl EventSink for JsonlEventSink {
    fn record(&self, event: &HarnessEvent) -> Result<()> {
        let mut writer = self.writer.borrow_mut();
        serde_json::to_writer(&mut *writer, event).context("serialize event")?;
        writer.write_all(b"\n").context("write event")?;
        // Flush per line so a polling reader sees progress mid-run.
        writer.flush().context("flush event log")?;
        Ok(())
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn record(&self, _event: &HarnessEvent) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct FailingSink;

    impl EventSink for FailingSink {
        fn record(&self, _event: &HarnessEvent) -> Result<()> {
            Err(anyhow!("disk full"))
        }
    }

    #[test]
    fn jsonl_sink_appends_tagged_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out/events.jsonl");

        let sink = JsonlEventSink::open(&path).expect("open");
        emit(
            &sink,
            "run-1",
            EventKind::StepStarted {
                step: "train".to_string(),
                max_attempts: 3,
                timeout_ms: 60_000,
            },
        );
        drop(sink);

        let sink = JsonlEventSink::open(&path).expect("reopen");
        emit(
            &sink,
            "run-2",
            EventKind::PlanFinished {
                all_success: true,
                steps_run: 1,
            },
        );

        let contents = fs::read_to_string(&path).expect("read");
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "step_started");
        assert_eq!(lines[0]["run_id"], "run-1");
        assert_eq!(lines[0]["max_attempts"], 3);
        assert_eq!(lines[1]["event"], "plan_finished");

        let decoded: HarnessEvent = serde_json::from_value(lines[1].clone()).expect("decode");
        assert_eq!(decoded.kind.name(), "plan_finished");
    }

    #[test]
    fn failing_sink_does_not_panic() {
        emit(
            &FailingSink,
            "run-1",
            EventKind::PlanStarted {
                plan: "experiments.yaml".to_string(),
                steps: Vec::new(),
            },
        );
    }
}
