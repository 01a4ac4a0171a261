//! Line-framed JSON exchange with the in-container shell harness.
//!
//! Each request is one JSON object followed by `\n` on the harness stdin;
//! each response is one JSON object followed by `\n` on its stdout. There is
//! no multiplexing, so a channel is only ever driven by one caller at a time.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, warn};

use super::deadline::Deadline;
use super::error::{ChannelKind, Result, SandboxError};

/// A command sent to the harness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessRequest {
    /// Shell command line to evaluate.
    pub command: String,
    /// Per-command timeout enforced by the harness itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
}

impl HarnessRequest {
    /// Creates a request with a harness-side timeout.
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout_seconds: Some(timeout.as_secs_f64()),
        }
    }
}

/// The harness reply to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessResponse {
    /// Captured terminal output of the command.
    pub output: String,
    /// Wall-clock time the command took inside the container.
    pub execution_time_seconds: f64,
    /// The command as received.
    pub command: String,
    /// The timeout the harness applied.
    pub timeout_seconds: f64,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// One direction-paired byte stream to a harness process.
pub(crate) struct HarnessChannel {
    kind: ChannelKind,
    writer: BoxedWriter,
    reader: BufReader<BoxedReader>,
}

impl HarnessChannel {
    pub(crate) fn new(
        kind: ChannelKind,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            kind,
            writer: Box::new(writer),
            reader: BufReader::new(Box::new(reader)),
        }
    }

    /// Sends `request` and waits for exactly one response line.
    ///
    /// The wait is bounded by `deadline` and, when the request carries a
    /// harness timeout, by that timeout plus `grace`.
    pub(crate) async fn exchange(
        &mut self,
        request: &HarnessRequest,
        deadline: Deadline,
        grace: Duration,
    ) -> Result<HarnessResponse> {
        let kind = self.kind;
        let mut frame = serde_json::to_vec(request)
            .map_err(|e| SandboxError::usage(format!("unencodable harness request: {e}")))?;
        frame.push(b'\n');

        let write = async {
            self.writer.write_all(&frame).await?;
            self.writer.flush().await
        };
        match deadline.bound(None, write).await {
            None => {
                return Err(SandboxError::channel_timeout(
                    kind,
                    "deadline expired writing request",
                ))
            }
            Some(Err(e)) => return Err(SandboxError::io("writing request to shell-harness", e)),
            Some(Ok(())) => {}
        }

        let limit = response_limit(request.timeout_seconds, grace);

        let mut line = Vec::new();
        let read = deadline
            .bound(limit, self.reader.read_until(b'\n', &mut line))
            .await;

        // Deadline first, so a real timeout is never reported as a parse error.
        if deadline.is_expired() {
            return Err(SandboxError::channel_timeout(
                kind,
                "deadline expired awaiting harness response",
            ));
        }
        match read {
            None => {
                return Err(SandboxError::channel_timeout(
                    kind,
                    "no harness response within the command timeout",
                ))
            }
            Some(Err(e)) => {
                error!(channel = %kind, error = %e, "failed reading shell-harness response");
                return Err(SandboxError::io("reading shell-harness response", e));
            }
            Some(Ok(0)) => {
                warn!(channel = %kind, "shell-harness closed its output stream");
                return Err(SandboxError::channel_timeout(
                    kind,
                    "shell-harness closed its output stream",
                ));
            }
            Some(Ok(_)) => {}
        }

        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            return Err(SandboxError::protocol_desync(kind, "empty response line", &line));
        }

        let response: HarnessResponse = serde_json::from_slice(trimmed).map_err(|e| {
            error!(
                channel = %kind,
                error = %e,
                raw = %String::from_utf8_lossy(trimmed),
                "failed to parse shell-harness response"
            );
            SandboxError::protocol_desync(kind, e.to_string(), trimmed)
        })?;

        debug!(
            channel = %kind,
            elapsed_secs = response.execution_time_seconds,
            "shell-harness command finished"
        );
        Ok(response)
    }

    /// Closes the request stream so the harness sees end of input.
    pub(crate) async fn close(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!(channel = %self.kind, error = %e, "closing shell-harness stdin");
        }
    }
}

/// Host-side wait for a reply: the harness timeout plus `grace`.
///
/// Unbounded when the request carries no usable timeout or the sum overflows.
fn response_limit(timeout_seconds: Option<f64>, grace: Duration) -> Option<Duration> {
    let secs = timeout_seconds.filter(|secs| *secs > 0.0)?;
    Duration::try_from_secs_f64(secs).ok()?.checked_add(grace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Spawns a fake harness that answers every request by echoing it.
    fn echo_harness(kind: ChannelKind) -> HarnessChannel {
        let (client_write, server_read) = duplex(64 * 1024);
        let (server_write, client_read) = duplex(64 * 1024);
        tokio::spawn(serve_echo(server_read, server_write));
        HarnessChannel::new(kind, client_write, client_read)
    }

    async fn serve_echo(read: DuplexStream, mut write: DuplexStream) {
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let request: HarnessRequest = serde_json::from_str(&line).unwrap();
            let output = request
                .command
                .strip_prefix("echo ")
                .map(|rest| format!("{rest}\n"))
                .unwrap_or_default();
            let response = HarnessResponse {
                output,
                execution_time_seconds: 0.01,
                command: request.command,
                timeout_seconds: request.timeout_seconds.unwrap_or(30.0),
            };
            let mut frame = serde_json::to_vec(&response).unwrap();
            frame.push(b'\n');
            if write.write_all(&frame).await.is_err() {
                break;
            }
        }
    }

    /// A channel whose peer answers every request with `reply` verbatim.
    fn scripted_harness(reply: &'static [u8]) -> HarnessChannel {
        let (client_write, server_read) = duplex(64 * 1024);
        let (mut server_write, client_read) = duplex(64 * 1024);
        tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            while let Ok(Some(_)) = lines.next_line().await {
                if server_write.write_all(reply).await.is_err() {
                    break;
                }
            }
        });
        HarnessChannel::new(ChannelKind::Primary, client_write, client_read)
    }

    #[test]
    fn test_request_wire_shape() {
        let request = HarnessRequest::new("ls -la", Duration::from_secs(60));
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"command":"ls -la","timeout_seconds":60.0}"#
        );

        let bare = HarnessRequest {
            command: "pwd".to_string(),
            timeout_seconds: None,
        };
        assert_eq!(serde_json::to_string(&bare).unwrap(), r#"{"command":"pwd"}"#);
    }

    #[test]
    fn test_response_parses_harness_output() {
        let raw = r#"{"output":"hello\r\n","execution_time_seconds":0.12,"command":"echo hello","timeout_seconds":60.0}"#;
        let response: HarnessResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.output, "hello\r\n");
        assert_eq!(response.command, "echo hello");
    }

    #[test]
    fn test_response_limit_adds_grace() {
        assert_eq!(
            response_limit(Some(30.0), Duration::from_secs(5)),
            Some(Duration::from_secs(35))
        );
        assert_eq!(response_limit(None, Duration::from_secs(5)), None);
        assert_eq!(response_limit(Some(0.0), Duration::from_secs(5)), None);
        assert_eq!(response_limit(Some(f64::NAN), Duration::from_secs(5)), None);
    }

    #[test]
    fn test_response_limit_drops_bound_on_overflow() {
        let huge = HarnessRequest::new("true", Duration::from_secs(u64::MAX));
        assert_eq!(response_limit(huge.timeout_seconds, Duration::from_secs(5)), None);
        assert_eq!(response_limit(Some(f64::INFINITY), Duration::from_secs(5)), None);
        assert_eq!(response_limit(Some(1.0), Duration::MAX), None);
    }

    #[tokio::test]
    async fn test_exchange_recovers_sent_command() {
        let mut channel = echo_harness(ChannelKind::Primary);
        let request = HarnessRequest::new("echo hello", Duration::from_secs(5));
        let response = channel
            .exchange(&request, Deadline::none(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.command, "echo hello");
        assert_eq!(response.output, "hello\n");
        assert!((response.timeout_seconds - 5.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_exchange_is_sequential() {
        let mut channel = echo_harness(ChannelKind::Primary);
        for i in 0..5 {
            let request = HarnessRequest::new(format!("echo {i}"), Duration::from_secs(5));
            let response = channel
                .exchange(&request, Deadline::none(), Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(response.output, format!("{i}\n"));
        }
    }

    #[tokio::test]
    async fn test_malformed_line_is_desync() {
        let mut channel = scripted_harness(b"this is not json\n");
        let request = HarnessRequest::new("echo hi", Duration::from_secs(5));
        let err = channel
            .exchange(&request, Deadline::none(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_desync(), "unexpected error: {err}");
        assert!(err.to_string().contains("this is not json"));
    }

    #[tokio::test]
    async fn test_closed_stream_is_timeout() {
        let (client_write, _server_read) = duplex(1024);
        let (server_write, client_read) = duplex(1024);
        drop(server_write);
        let mut channel = HarnessChannel::new(ChannelKind::Validation, client_write, client_read);

        let request = HarnessRequest::new("echo hi", Duration::from_secs(5));
        let err = channel
            .exchange(&request, Deadline::none(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");
        assert!(err.to_string().contains("validation"));
    }

    #[tokio::test]
    async fn test_silent_peer_hits_deadline() {
        let (client_write, _server_read) = duplex(1024);
        let (_server_write, client_read) = duplex(1024);
        let mut channel = HarnessChannel::new(ChannelKind::Primary, client_write, client_read);

        let request = HarnessRequest::new("sleep 100", Duration::from_secs(100));
        let err = channel
            .exchange(
                &request,
                Deadline::after(Duration::from_millis(50)),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");
    }
}
