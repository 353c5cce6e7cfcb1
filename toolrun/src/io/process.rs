//! Helpers for running child processes with timeouts, bounded output, and
//! signal escalation.

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::error::ProcessSpawnError;
use crate::io::lock;

/// How long to wait for output to close after the child exits.
const DRAIN_WINDOW: Duration = Duration::from_millis(500);

/// Check that `program` names something we can execute.
///
/// Bare names are looked up on `PATH`; names containing a path separator are
/// resolved against `cwd` when relative.
pub fn resolve_executable(program: &str, cwd: Option<&Path>) -> Result<PathBuf, ProcessSpawnError> {
    let program = program.trim();
    if program.is_empty() {
        return Err(ProcessSpawnError::EmptyCommand);
    }
    if program.contains(std::path::MAIN_SEPARATOR) {
        let path = Path::new(program);
        let full = match cwd {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        };
        if full.is_file() {
            return Ok(full);
        }
        return Err(ProcessSpawnError::NotFound {
            program: program.to_string(),
        });
    }
    which::which(program).map_err(|_| ProcessSpawnError::NotFound {
        program: program.to_string(),
    })
}

/// Where to deliver a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTarget {
    Process(u32),
    /// The process group led by this pid.
    Group(u32),
}

impl SignalTarget {
    /// Send `signal`; a target that is already gone is not an error.
    pub fn send(self, signal: Signal) {
        let (raw, group) = match self {
            Self::Process(pid) => (pid, false),
            Self::Group(pid) => (pid, true),
        };
        let Ok(raw) = i32::try_from(raw) else {
            warn!(pid = raw, "pid out of range, not signalling");
            return;
        };
        let pid = Pid::from_raw(raw);
        let result = if group {
            killpg(pid, signal)
        } else {
            kill(pid, signal)
        };
        match result {
            Ok(()) => debug!(pid = raw, group, ?signal, "signal sent"),
            Err(nix::errno::Errno::ESRCH) => debug!(pid = raw, group, "signal target already gone"),
            Err(err) => warn!(pid = raw, group, ?signal, %err, "failed to send signal"),
        }
    }
}

/// SIGTERM the target, wait up to `grace` for `exited`, then SIGKILL and keep
/// waiting.
///
/// `exited` must resolve once the process is gone.
pub async fn terminate_with_grace<F>(target: SignalTarget, grace: Duration, exited: F) -> F::Output
where
    F: Future,
{
    tokio::pin!(exited);
    target.send(Signal::SIGTERM);
    match tokio::time::timeout(grace, &mut exited).await {
        Ok(output) => output,
        Err(_) => {
            warn!(?target, grace_ms = grace.as_millis(), "process ignored SIGTERM, killing");
            target.send(Signal::SIGKILL);
            exited.await
        }
    }
}

/// Keeps the last `capacity` bytes written to it.
#[derive(Debug, Clone)]
pub struct OutputTail {
    capacity: usize,
    buf: VecDeque<u8>,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        let bytes = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(bytes);
    }

    /// Buffered text, skipping a leading partial UTF-8 sequence.
    pub fn text(&self) -> String {
        let bytes: Vec<u8> = self.buf.iter().copied().collect();
        let start = bytes
            .iter()
            .position(|b| (b & 0b1100_0000) != 0b1000_0000)
            .unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[start..]).into_owned()
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// The child runs in its own process group. Output is read concurrently while it runs;
/// `output_limit_bytes` bounds what is kept in memory (the rest is drained and counted).
/// On timeout the group gets SIGTERM, then SIGKILL after `kill_grace`.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub async fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    kill_grace: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    debug!(%program, "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, %program, "failed to spawn command");
            let err = if e.kind() == std::io::ErrorKind::NotFound {
                ProcessSpawnError::NotFound { program }
            } else {
                ProcessSpawnError::Failed {
                    program,
                    reason: e.to_string(),
                }
            };
            return Err(err.into());
        }
    };
    let pid = child.id();

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).await.context("write stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_capture = Arc::new(Mutex::new(Captured::default()));
    let stderr_capture = Arc::new(Mutex::new(Captured::default()));
    let mut readers = [
        tokio::spawn(read_stream_limited(
            stdout,
            output_limit_bytes,
            Arc::clone(&stdout_capture),
        )),
        tokio::spawn(read_stream_limited(
            stderr,
            output_limit_bytes,
            Arc::clone(&stderr_capture),
        )),
    ];

    let mut timed_out = false;
    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status.context("wait for command")?,
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, terminating");
            timed_out = true;
            match pid {
                Some(pid) => {
                    terminate_with_grace(SignalTarget::Group(pid), kill_grace, child.wait())
                        .await
                        .context("wait command after kill")?
                }
                None => child.wait().await.context("wait command after exit")?,
            }
        }
    };

    // Background descendants may still hold the pipes open.
    if !drain_readers(&mut readers, DRAIN_WINDOW).await {
        debug!("output still open after exit, killing process group");
        if let Some(pid) = pid {
            SignalTarget::Group(pid).send(Signal::SIGKILL);
        }
        if !drain_readers(&mut readers, DRAIN_WINDOW).await {
            warn!("output still open after killing process group, abandoning readers");
            for reader in &readers {
                reader.abort();
            }
        }
    }

    let (stdout, stdout_truncated) = take_captured(&stdout_capture);
    let (stderr, stderr_truncated) = take_captured(&stderr_capture);

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
    })
}

#[derive(Debug, Default)]
struct Captured {
    buf: Vec<u8>,
    truncated: usize,
}

fn take_captured(capture: &Mutex<Captured>) -> (Vec<u8>, usize) {
    let mut captured = lock(capture);
    (std::mem::take(&mut captured.buf), captured.truncated)
}

/// Wait up to `window` for every reader to reach EOF.
async fn drain_readers(readers: &mut [JoinHandle<()>], window: Duration) -> bool {
    let all = async {
        for reader in readers.iter_mut() {
            if reader.is_finished() {
                continue;
            }
            if let Err(err) = reader.await {
                debug!(%err, "output reader ended abnormally");
            }
        }
    };
    tokio::time::timeout(window, all).await.is_ok()
}

async fn read_stream_limited<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
    capture: Arc<Mutex<Captured>>,
) {
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!(%err, "read output");
                break;
            }
        };
        let mut captured = lock(&capture);
        let keep = n.min(limit.saturating_sub(captured.buf.len()));
        captured.buf.extend_from_slice(&chunk[..keep]);
        captured.truncated += n - keep;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn resolve_finds_sh_and_rejects_missing() {
        assert!(resolve_executable("sh", None).is_ok());
        assert!(matches!(
            resolve_executable("definitely-not-a-real-binary-xyz", None),
            Err(ProcessSpawnError::NotFound { .. })
        ));
        assert!(matches!(
            resolve_executable("  ", None),
            Err(ProcessSpawnError::EmptyCommand)
        ));
    }

    #[test]
    fn output_tail_keeps_last_bytes() {
        let mut tail = OutputTail::new(4);
        tail.push(b"abc");
        tail.push(b"defg");
        assert_eq!(tail.text(), "defg");
        tail.push(b"0123456789");
        assert_eq!(tail.text(), "6789");
    }

    #[test]
    fn output_tail_skips_split_char() {
        let mut tail = OutputTail::new(3);
        tail.push("aé€".as_bytes());
        assert_eq!(tail.text(), "€");
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let out = run_command_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(10),
            Duration::from_millis(200),
            1024,
        )
        .await
        .expect("run");
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&out.stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&out.stderr), "err\n");
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn truncates_beyond_limit() {
        let out = run_command_with_timeout(
            sh("printf 0123456789"),
            None,
            Duration::from_secs(10),
            Duration::from_millis(200),
            4,
        )
        .await
        .expect("run");
        assert_eq!(out.stdout, b"0123");
        assert_eq!(out.stdout_truncated, 6);
        assert!(out.stdout_truncated_notice("shell").contains("truncated 6 bytes"));
    }

    #[tokio::test]
    async fn timeout_terminates_process_group() {
        let out = run_command_with_timeout(
            sh("trap '' TERM; sleep 30"),
            None,
            Duration::from_millis(200),
            Duration::from_millis(200),
            1024,
        )
        .await
        .expect("run");
        assert!(out.timed_out);
        assert!(!out.status.success());
    }

    #[tokio::test]
    async fn background_child_holding_pipes_does_not_outlive_timeout() {
        let started = std::time::Instant::now();
        let out = run_command_with_timeout(
            sh("sleep 5 & echo hi"),
            None,
            Duration::from_secs(1),
            Duration::from_millis(200),
            1024,
        )
        .await
        .expect("run");
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "took {:?}",
            started.elapsed()
        );
        assert!(out.status.success());
        assert!(!out.timed_out);
        assert_eq!(String::from_utf8_lossy(&out.stdout), "hi\n");
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let err = run_command_with_timeout(
            Command::new("definitely-not-a-real-binary-xyz"),
            None,
            Duration::from_secs(1),
            Duration::from_millis(100),
            1024,
        )
        .await
        .expect_err("spawn should fail");
        assert!(matches!(
            err.downcast_ref::<ProcessSpawnError>(),
            Some(ProcessSpawnError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn stdin_is_forwarded() {
        let out = run_command_with_timeout(
            Command::new("cat"),
            Some(b"piped"),
            Duration::from_secs(10),
            Duration::from_millis(100),
            1024,
        )
        .await
        .expect("run");
        assert_eq!(out.stdout, b"piped");
    }
}
