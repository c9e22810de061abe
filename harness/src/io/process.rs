//! Helpers for running child processes with timeouts and bounded output.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long readers may keep draining after the process group is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    /// Exit code, mapping death-by-signal to `128 + signal` on unix.
    pub fn exit_code(&self) -> i32 {
        if let Some(code) = self.status.code() {
            return code;
        }
        signal_exit_code(&self.status)
    }

    /// Stdout followed by stderr, lossily decoded, with truncation notices.
    pub fn merged_output(&self) -> String {
        let mut buf = String::from_utf8_lossy(&self.stdout).into_owned();
        buf.push_str(&truncated_notice("stdout", self.stdout_truncated));
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        buf.push_str(&truncated_notice("stderr", self.stderr_truncated));
        buf
    }
}

fn truncated_notice(label: &str, truncated: usize) -> String {
    if truncated > 0 {
        format!("\n[{label} truncated {truncated} bytes]\n")
    } else {
        String::new()
    }
}

#[cfg(unix)]
fn signal_exit_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|signal| 128 + signal).unwrap_or(-1)
}

#[cfg(not(unix))]
fn signal_exit_code(_status: &ExitStatus) -> i32 {
    -1
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// On unix the child leads its own process group, and the whole group is killed on timeout so
/// that grandchildren spawned through a shell do not outlive the attempt.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::channel();
    let stdout_tx = tx.clone();
    thread::spawn(move || {
        let _ = stdout_tx.send((Stream::Stdout, read_stream_limited(stdout, output_limit_bytes)));
    });
    thread::spawn(move || {
        let _ = tx.send((Stream::Stderr, read_stream_limited(stderr, output_limit_bytes)));
    });

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_group(child.id());
            // The group kill normally reaps the child already; ignore "no such process".
            let _ = child.kill();
            child.wait().context("wait command after kill")?
        }
    };
    let elapsed = started.elapsed();

    // Background processes left by the command keep the pipes open; they end with it.
    if !timed_out {
        kill_process_group(child.id());
    }
    let ((stdout, stdout_truncated), (stderr, stderr_truncated)) =
        collect_output(&rx, Instant::now() + DRAIN_GRACE)?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        elapsed,
    })
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let group = format!("-{pid}");
    match Command::new("kill")
        .args(["-KILL", "--", &group])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => debug!(pid, "killed process group"),
        // Nothing left in the group once the leader has exited cleanly.
        Ok(status) => debug!(pid, exit_code = ?status.code(), "process group already gone"),
        Err(err) => warn!(pid, err = %err, "spawn kill for process group failed"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

type StreamOutput = (Vec<u8>, usize);

/// Receive both streams, giving up on a pipe that is still open at `deadline`.
fn collect_output(
    rx: &mpsc::Receiver<(Stream, Result<StreamOutput>)>,
    deadline: Instant,
) -> Result<(StreamOutput, StreamOutput)> {
    let mut stdout = None;
    let mut stderr = None;
    while stdout.is_none() || stderr.is_none() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok((Stream::Stdout, result)) => stdout = Some(result.context("read stdout")?),
            Ok((Stream::Stderr, result)) => stderr = Some(result.context("read stderr")?),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    stdout_open = stdout.is_none(),
                    stderr_open = stderr.is_none(),
                    "output pipe still open after the command ended, dropping its output"
                );
                break;
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("output reader thread panicked"));
            }
        }
    }
    Ok((stdout.unwrap_or_default(), stderr.unwrap_or_default()))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_stderr_and_exit_code() {
        let output = run_command_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            Duration::from_secs(10),
            1000,
        )
        .expect("run");
        assert!(!output.timed_out);
        assert_eq!(output.exit_code(), 3);
        assert_eq!(output.merged_output(), "out\nerr\n");
    }

    #[test]
    fn truncates_output_beyond_limit() {
        let output = run_command_with_timeout(
            sh("printf 'abcdefghij'"),
            Duration::from_secs(10),
            4,
        )
        .expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.merged_output().contains("[stdout truncated 6 bytes]"));
    }

    #[test]
    fn kills_process_group_on_timeout() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 30 & sleep 30; echo never"),
            Duration::from_millis(300),
            1000,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.merged_output().contains("never"));
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn leftover_background_process_is_killed_after_exit() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 30 & echo started"),
            Duration::from_secs(10),
            1000,
        )
        .expect("run");
        assert!(!output.timed_out);
        assert_eq!(output.exit_code(), 0);
        assert_eq!(output.stdout, b"started\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = run_command_with_timeout(
            Command::new("definitely-not-a-real-binary-4242"),
            Duration::from_secs(1),
            100,
        )
        .unwrap_err();
        assert!(err.to_string().contains("spawn command"));
    }
}
