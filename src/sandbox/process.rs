//! Host-side process plumbing: prerequisite checks, captured runs, and the
//! long-lived harness subprocesses.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, warn};

use super::error::{ChannelKind, Result, SandboxError};
use super::harness::HarnessChannel;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_LENGTH: usize = 13;

/// Random lowercase alphanumeric identifier used to name containers.
pub fn random_id() -> String {
    let mut id = String::with_capacity(ID_LENGTH);
    while id.len() < ID_LENGTH {
        for byte in uuid::Uuid::new_v4().into_bytes() {
            // Reject the biased tail so every symbol is equally likely.
            if usize::from(byte) < 252 && id.len() < ID_LENGTH {
                id.push(char::from(ID_ALPHABET[usize::from(byte) % ID_ALPHABET.len()]));
            }
        }
    }
    id
}

/// Asks the OS for a currently free TCP port on the loopback interface.
pub fn choose_free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .map_err(|e| SandboxError::io("allocating host port", e))?;
    let port = listener
        .local_addr()
        .map_err(|e| SandboxError::io("allocating host port", e))?
        .port();
    Ok(port)
}

/// Fails with `PrerequisiteMissing` for the first tool not found in `PATH`.
pub fn check_tools<'a>(tools: impl IntoIterator<Item = &'a str>) -> Result<()> {
    for tool in tools {
        which::which(tool).map_err(|e| {
            SandboxError::prerequisite_missing(tool, format!("not found in PATH ({e})"))
        })?;
    }
    Ok(())
}

/// Output of a finished external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    /// Decoded standard output.
    pub stdout: String,
    /// Decoded standard error.
    pub stderr: String,
    /// Exit code, `None` when terminated by a signal.
    pub exit_code: Option<i32>,
}

impl CapturedOutput {
    /// True when the command exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs `cmd` to completion capturing both output streams.
///
/// Returns `Ok(None)` when `budget` ran out; the child is killed on drop.
pub(crate) async fn run_captured(
    cmd: &mut Command,
    budget: Option<Duration>,
) -> std::io::Result<Option<CapturedOutput>> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn()?;
    let wait = child.wait_with_output();
    let output = match budget {
        Some(budget) => match tokio::time::timeout(budget, wait).await {
            Ok(output) => output?,
            Err(_) => return Ok(None),
        },
        None => wait.await?,
    };

    Ok(Some(CapturedOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
    }))
}

/// Bounded capture of a subprocess's stderr, oldest bytes dropped first.
#[derive(Debug, Clone)]
pub(crate) struct CapturedStderr {
    buf: Arc<Mutex<VecDeque<u8>>>,
    capacity: usize,
}

impl CapturedStderr {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(64 * 1024)))),
            capacity,
        }
    }

    fn append(&self, bytes: &[u8]) {
        let mut buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        buf.extend(bytes);
        let excess = buf.len().saturating_sub(self.capacity);
        buf.drain(..excess);
    }

    /// Current contents, lossily decoded.
    pub(crate) fn snapshot(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        let (front, back) = buf.as_slices();
        let mut bytes = Vec::with_capacity(buf.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub(crate) fn clear(&self) {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Drains `stderr` into this buffer until the stream ends.
    pub(crate) fn attach(&self, mut stderr: ChildStderr) {
        let sink = self.clone();
        tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match stderr.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink.append(&chunk[..n]),
                }
            }
        });
    }
}

/// A running harness subprocess together with its captured stderr.
pub(crate) struct HarnessProcess {
    child: Child,
    stderr: CapturedStderr,
}

impl HarnessProcess {
    /// Spawns `cmd` with piped stdio and wires its pipes into a channel.
    pub(crate) fn spawn(
        mut cmd: Command,
        kind: ChannelKind,
        stderr_capacity: usize,
    ) -> Result<(Self, HarnessChannel)> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::io(format!("spawning {kind} shell-harness"), e))?;

        let stdin = child.stdin.take().ok_or_else(|| missing_pipe(kind, "stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| missing_pipe(kind, "stdout"))?;
        let stderr = CapturedStderr::new(stderr_capacity);
        if let Some(pipe) = child.stderr.take() {
            stderr.attach(pipe);
        }

        debug!(channel = %kind, pid = ?child.id(), "shell-harness process started");
        let channel = HarnessChannel::new(kind, stdin, stdout);
        Ok((Self { child, stderr }, channel))
    }

    /// Stderr captured so far.
    pub(crate) fn stderr(&self) -> String {
        self.stderr.snapshot()
    }

    /// Kills the process, reaps it, and discards captured diagnostics.
    pub(crate) async fn terminate(mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "shell-harness already exited");
        }
        match tokio::time::timeout(Duration::from_secs(10), self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "shell-harness process reaped"),
            Ok(Err(e)) => warn!(error = %e, "failed waiting on shell-harness process"),
            Err(_) => warn!("shell-harness process did not exit after kill"),
        }
        self.stderr.clear();
    }
}

fn missing_pipe(kind: ChannelKind, pipe: &str) -> SandboxError {
    SandboxError::io(
        format!("opening {kind} shell-harness {pipe}"),
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe not captured"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::deadline::Deadline;
    use crate::sandbox::harness::HarnessRequest;

    #[test]
    fn test_random_id_shape() {
        let id = random_id();
        assert_eq!(id.len(), 13);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_ne!(random_id(), random_id());
    }

    #[test]
    fn test_choose_free_port_is_bindable() {
        let port = choose_free_port().unwrap();
        assert_ne!(port, 0);
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[test]
    fn test_check_tools_reports_missing() {
        let err = check_tools(["definitely-not-a-real-tool-benchbox"]).unwrap_err();
        assert!(err.is_prerequisite_missing());
        assert!(err
            .to_string()
            .starts_with("definitely-not-a-real-tool-benchbox is not available"));
    }

    #[test]
    fn test_captured_stderr_is_bounded() {
        let capture = CapturedStderr::new(8);
        capture.append(b"0123456789");
        assert_eq!(capture.snapshot(), "23456789");
        capture.append(b"ab");
        assert_eq!(capture.snapshot(), "456789ab");
        capture.clear();
        assert_eq!(capture.snapshot(), "");
    }

    #[tokio::test]
    async fn test_run_captured_collects_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        let output = run_captured(&mut cmd, Some(Duration::from_secs(10)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_run_captured_times_out() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30"]);
        let output = run_captured(&mut cmd, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(output.is_none());
    }

    #[tokio::test]
    async fn test_harness_process_round_trip_through_cat() {
        // `cat` echoes request frames back, which parse as desync, proving the
        // pipes are wired end to end.
        let mut cmd = Command::new("cat");
        cmd.arg("-");
        let (process, mut channel) =
            HarnessProcess::spawn(cmd, ChannelKind::Validation, 1024).unwrap();
        let request = HarnessRequest::new("echo hi", Duration::from_secs(5));
        let err = channel
            .exchange(&request, Deadline::none(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_desync());
        process.terminate().await;
    }
}
