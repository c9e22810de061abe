//! Test-only helpers: plan builders and scripted collaborators.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tempfile::TempDir;

use crate::core::types::{AttemptResult, AttemptStatus, Cmd, ExperimentPlan, Step};
use crate::io::artifacts::ArtifactStore;
use crate::io::backoff::Sleeper;
use crate::io::command::{CommandOutcome, CommandRequest, CommandRunner, TIMEOUT_EXIT_CODE};
use crate::io::config::HarnessConfig;
use crate::io::events::{EventSink, HarnessEvent};
use crate::step::RunContext;

/// Step with a shell command, one attempt, no checks and no explicit timeout.
pub fn step(id: &str, command: &str) -> Step {
    Step {
        id: id.to_string(),
        name: None,
        description: String::new(),
        command: Cmd::Shell(command.to_string()),
        timeout: None,
        expected_duration: None,
        retry_count: 0,
        env: BTreeMap::new(),
        checks: Vec::new(),
        depends_on: Vec::new(),
    }
}

/// Plan that stops on the first failure and has no post-processing.
pub fn plan(steps: Vec<Step>) -> ExperimentPlan {
    ExperimentPlan {
        steps,
        stop_on_fail: true,
        post_process: Vec::new(),
    }
}

/// Attempt record with consistent flags for `success`.
pub fn attempt_result(step: &str, attempt: u32, success: bool) -> AttemptResult {
    AttemptResult {
        step: step.to_string(),
        attempt,
        success,
        command_success: success,
        exit_code: Some(if success { 0 } else { 1 }),
        timed_out: false,
        sanity_passed: true,
        sanity_results: Vec::new(),
        output: String::new(),
        status: if success {
            AttemptStatus::Ok
        } else {
            AttemptStatus::Failed
        },
        error: None,
        log_path: None,
        duration_ms: 5,
        timestamp: Utc::now(),
    }
}

/// Command runner that replays scripted outcomes and records requests.
///
/// Each call writes a short transcript to the request's log path, like the
/// real runner does.
pub struct ScriptedCommandRunner {
    script: RefCell<VecDeque<Result<CommandOutcome>>>,
    repeat: Option<CommandOutcome>,
    requests: RefCell<Vec<CommandRequest>>,
}

impl ScriptedCommandRunner {
    pub fn new(script: Vec<Result<CommandOutcome>>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            repeat: None,
            requests: RefCell::new(Vec::new()),
        }
    }

    /// One outcome per call, in order.
    pub fn from_exit_codes(codes: &[i32]) -> Self {
        Self::new(codes.iter().map(|code| Ok(Self::exit(*code))).collect())
    }

    /// Every call exits with `code`.
    pub fn always_fail(code: i32) -> Self {
        Self {
            repeat: Some(Self::exit(code)),
            ..Self::new(Vec::new())
        }
    }

    pub fn exit(code: i32) -> CommandOutcome {
        CommandOutcome {
            success: code == 0,
            output: format!("exit {code}\n"),
            exit_code: code,
            timed_out: false,
            duration: Duration::from_millis(5),
            log_path: None,
        }
    }

    pub fn timeout() -> CommandOutcome {
        CommandOutcome {
            success: false,
            output: "command timed out after 1.0s and was killed\n".to_string(),
            exit_code: TIMEOUT_EXIT_CODE,
            timed_out: true,
            duration: Duration::from_secs(1),
            log_path: None,
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.borrow().len()
    }

    pub fn requests(&self) -> Vec<CommandRequest> {
        self.requests.borrow().clone()
    }
}

impl CommandRunner for ScriptedCommandRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutcome> {
        self.requests.borrow_mut().push(request.clone());
        let next = match self.script.borrow_mut().pop_front() {
            Some(next) => next,
            None => self
                .repeat
                .clone()
                .ok_or_else(|| anyhow!("scripted runner has no outcome for '{}'", request.label)),
        };
        let mut outcome = next?;
        if let Some(parent) = request.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(
            &request.log_path,
            format!(
                "Command: {}\nExit code: {}\nOutput:\n{}\n",
                request.command, outcome.exit_code, outcome.output
            ),
        )?;
        outcome.log_path = Some(request.log_path.clone());
        Ok(outcome)
    }
}

/// Records requested delays instead of sleeping.
#[derive(Default)]
pub struct RecordingSleeper {
    delays: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, delay: Duration) {
        self.delays.borrow_mut().push(delay);
    }
}

/// Keeps events in memory.
#[derive(Default)]
pub struct RecordingEventSink {
    events: RefCell<Vec<HarnessEvent>>,
}

impl RecordingEventSink {
    pub fn events(&self) -> Vec<HarnessEvent> {
        self.events.borrow().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .borrow()
            .iter()
            .map(|event| event.kind.name())
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn record(&self, event: &HarnessEvent) -> Result<()> {
        self.events.borrow_mut().push(event.clone());
        Ok(())
    }
}

/// Temporary experiment checkout with an `artifacts/` output directory.
pub struct TestWorkspace {
    dir: TempDir,
    pub store: ArtifactStore,
    pub config: HarnessConfig,
    pub run_id: String,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path().join("artifacts"));
        Self {
            dir,
            store,
            config: HarnessConfig::default(),
            run_id: "test-run".to_string(),
        }
    }

    pub fn workdir(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub fn context<'a>(
        &'a self,
        runner: &'a dyn CommandRunner,
        sleeper: &'a dyn Sleeper,
        events: &'a dyn EventSink,
    ) -> RunContext<'a> {
        RunContext {
            run_id: &self.run_id,
            workdir: self.dir.path(),
            store: &self.store,
            config: &self.config,
            runner,
            sleeper,
            events,
        }
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
