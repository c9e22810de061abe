//! Step retry state machine.
//!
//! A step moves `Pending -> Attempting -> SanityChecking` for every attempt and
//! then resolves to `Succeeded`, `RetryWait` (another attempt follows after a
//! linear backoff) or `Exhausted`. Decisions here are pure; the step runner
//! performs the side effects.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::types::AttemptStatus;

/// State of a step within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Attempting,
    SanityChecking,
    Succeeded,
    RetryWait,
    Exhausted,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepState::Succeeded | StepState::Exhausted)
    }
}

/// Decision taken after an attempt has been persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Succeeded,
    /// Wait `delay`, then run attempt `next_attempt`.
    Retry { next_attempt: u32, delay: Duration },
    Exhausted,
}

impl Transition {
    pub fn state(self) -> StepState {
        match self {
            Transition::Succeeded => StepState::Succeeded,
            Transition::Retry { .. } => StepState::RetryWait,
            Transition::Exhausted => StepState::Exhausted,
        }
    }
}

/// Decide what follows attempt `attempt` (1-based) out of `max_attempts`.
pub fn decide(attempt: u32, max_attempts: u32, success: bool, backoff_base: Duration) -> Transition {
    if success {
        return Transition::Succeeded;
    }
    if attempt >= max_attempts {
        return Transition::Exhausted;
    }
    Transition::Retry {
        next_attempt: attempt + 1,
        delay: backoff_delay(backoff_base, attempt),
    }
}

/// Linear backoff: the wait after attempt `attempt` (1-based) is `base * attempt`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt.max(1))
}

/// Classify an attempt for the current-state document.
pub fn classify_attempt(
    errored: bool,
    timed_out: bool,
    command_success: bool,
    sanity_passed: bool,
) -> AttemptStatus {
    if errored {
        AttemptStatus::Error
    } else if timed_out {
        AttemptStatus::Timeout
    } else if !command_success {
        AttemptStatus::Failed
    } else if !sanity_passed {
        AttemptStatus::SanityFailed
    } else {
        AttemptStatus::Ok
    }
}

/// Short hint telling the external agent where to look next.
pub fn replan_suggestion(status: AttemptStatus) -> Option<&'static str> {
    match status {
        AttemptStatus::Ok => None,
        AttemptStatus::Failed => {
            Some("Inspect the step log for the failing command and fix the implementation")
        }
        AttemptStatus::Timeout => Some("Increase timeout or optimize computation"),
        AttemptStatus::SanityFailed => Some(
            "Command succeeded but produced unexpected artifacts; review the failing checks",
        ),
        AttemptStatus::Error => Some("Ensure the step command exists and is executable"),
    }
}
