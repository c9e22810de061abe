//! Command execution wrapper for step and post-process commands.
//!
//! The [`CommandRunner`] trait decouples the step runner from real process
//! spawning. [`ShellCommandRunner`] runs commands in the experiment checkout under
//! a bounded timeout and always leaves a transcript at `request.log_path`; tests
//! use scripted runners that return predetermined outcomes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::Cmd;
use crate::io::process::run_command_with_timeout;

/// Exit code recorded when a command is killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Parameters for one command execution.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Step id or post-process name; used in logs.
    pub label: String,
    pub command: Cmd,
    /// Working directory (the experiment checkout).
    pub workdir: PathBuf,
    /// Variables layered over the inherited environment.
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    /// Cap for captured stdout and stderr (each).
    pub output_limit_bytes: usize,
    /// Transcript destination (`<output_dir>/logs/<label>_<timestamp>.log`).
    pub log_path: PathBuf,
}

/// Result of one command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Exit status was zero.
    pub success: bool,
    /// Stdout followed by stderr. Explains the timeout when `timed_out`.
    pub output: String,
    /// [`TIMEOUT_EXIT_CODE`] when the command timed out.
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration: Duration,
    pub log_path: Option<PathBuf>,
}

/// Abstraction over command execution backends.
pub trait CommandRunner {
    /// Run the command. `Err` means the command could not be run at all.
    fn run(&self, request: &CommandRequest) -> Result<CommandOutcome>;
}

/// Runner that spawns real processes.
///
/// String commands go through the configured shell (`sh -c` by default);
/// argument vectors are executed directly.
#[derive(Debug, Clone)]
pub struct ShellCommandRunner {
    shell: Vec<String>,
}

impl ShellCommandRunner {
    pub fn new(shell: Vec<String>) -> Self {
        Self { shell }
    }

    fn build(&self, request: &CommandRequest) -> Result<Command> {
        let mut cmd = match &request.command {
            Cmd::Shell(line) => {
                let (program, args) = self
                    .shell
                    .split_first()
                    .ok_or_else(|| anyhow!("shell must be a non-empty array"))?;
                let mut cmd = Command::new(program);
                cmd.args(args).arg(line);
                cmd
            }
            Cmd::Argv(argv) => {
                let (program, args) = argv
                    .split_first()
                    .ok_or_else(|| anyhow!("empty command array"))?;
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };
        cmd.current_dir(&request.workdir).envs(&request.env);
        Ok(cmd)
    }
}

impl Default for ShellCommandRunner {
    fn default() -> Self {
        Self::new(vec!["sh".to_string(), "-c".to_string()])
    }
}

impl CommandRunner for ShellCommandRunner {
    #[instrument(skip_all, fields(label = %request.label, timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &CommandRequest) -> Result<CommandOutcome> {
        info!(command = %request.command, "running command");
        let command_text = request.command.to_string();

        let result = self.build(request).and_then(|cmd| {
            run_command_with_timeout(cmd, request.timeout, request.output_limit_bytes)
        });
        let output = match result {
            Ok(output) => output,
            Err(err) => {
                let message = format!("{err:#}");
                write_command_log(&request.log_path, &command_text, None, &message)?;
                return Err(err).with_context(|| format!("run command for '{}'", request.label));
            }
        };

        let (exit_code, text) = if output.timed_out {
            let mut text = format!(
                "command timed out after {:.1}s and was killed\n",
                request.timeout.as_secs_f64()
            );
            text.push_str(&output.merged_output());
            (TIMEOUT_EXIT_CODE, text)
        } else {
            (output.exit_code(), output.merged_output())
        };

        write_command_log(&request.log_path, &command_text, Some(exit_code), &text)?;

        let outcome = CommandOutcome {
            success: !output.timed_out && exit_code == 0,
            output: text,
            exit_code,
            timed_out: output.timed_out,
            duration: output.elapsed,
            log_path: Some(request.log_path.clone()),
        };
        if outcome.timed_out {
            warn!(label = %request.label, "command timed out");
        } else if !outcome.success {
            warn!(label = %request.label, exit_code, "command failed");
        } else {
            debug!(label = %request.label, "command succeeded");
        }
        Ok(outcome)
    }
}

/// Write the command transcript. Every execution gets its own file.
fn write_command_log(
    path: &Path,
    command: &str,
    exit_code: Option<i32>,
    output: &str,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let exit = exit_code.map_or_else(|| "none (command did not run)".to_string(), |c| c.to_string());
    let buf = format!("Command: {command}\nExit code: {exit}\nOutput:\n{output}\n");
    fs::write(path, buf).with_context(|| format!("write command log {}", path.display()))
}
