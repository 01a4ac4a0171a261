//! Lazily established secondary harness used for validation scripts.

use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::deadline::Deadline;
use super::error::{Result, SandboxError};
use super::harness::{HarnessChannel, HarnessRequest, HarnessResponse};
use super::process::HarnessProcess;

/// Lifecycle of the validation channel.
///
/// `Failed` behaves like `Uninitialized` on the next call, except that the
/// previous failure is logged when the channel is re-established.
enum ValidationState {
    Uninitialized,
    Ready {
        process: HarnessProcess,
        channel: HarnessChannel,
    },
    Failed {
        reason: String,
    },
}

/// Serialized access to the validation harness of one sandbox.
pub(crate) struct ValidationChannel {
    state: Mutex<ValidationState>,
}

impl ValidationChannel {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ValidationState::Uninitialized),
        }
    }

    /// Sends one request, launching the harness first if none is live.
    ///
    /// Any failure kills the harness; the next call starts a fresh one.
    pub(crate) async fn execute<F>(
        &self,
        launch: F,
        request: &HarnessRequest,
        deadline: Deadline,
        grace: Duration,
    ) -> Result<HarnessResponse>
    where
        F: FnOnce() -> Result<(HarnessProcess, HarnessChannel)> + Send,
    {
        let mut state = self.state.lock().await;

        if !matches!(*state, ValidationState::Ready { .. }) {
            if let ValidationState::Failed { reason } = &*state {
                info!(previous_failure = %reason, "re-establishing validation channel");
            }
            match launch() {
                Ok((process, channel)) => *state = ValidationState::Ready { process, channel },
                Err(e) => {
                    *state = ValidationState::Failed {
                        reason: e.to_string(),
                    };
                    return Err(e);
                }
            }
        }

        let result = match &mut *state {
            ValidationState::Ready { channel, .. } => {
                channel.exchange(request, deadline, grace).await
            }
            ValidationState::Uninitialized | ValidationState::Failed { .. } => {
                return Err(SandboxError::usage("validation channel failed to initialize"));
            }
        };

        if let Err(e) = &result {
            let previous = std::mem::replace(
                &mut *state,
                ValidationState::Failed {
                    reason: e.to_string(),
                },
            );
            if let ValidationState::Ready {
                process,
                mut channel,
            } = previous
            {
                let stderr = process.stderr();
                if !stderr.is_empty() {
                    warn!(stderr = %stderr, "validation shell-harness stderr");
                }
                channel.close().await;
                process.terminate().await;
            }
        }
        result
    }

    /// Tears down any live harness and returns to the uninitialized state.
    pub(crate) async fn reset(&self) {
        let mut state = self.state.lock().await;
        if let ValidationState::Ready {
            process,
            mut channel,
        } = std::mem::replace(&mut *state, ValidationState::Uninitialized)
        {
            channel.close().await;
            process.terminate().await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn is_ready(&self) -> bool {
        matches!(*self.state.lock().await, ValidationState::Ready { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::error::ChannelKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::process::Command;

    const OK_LINE: &str = r#"{"output":"ok","execution_time_seconds":0.0,"command":"x","timeout_seconds":5.0}"#;

    fn responder() -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!(
            "while IFS= read -r line; do printf '%s\\n' '{OK_LINE}'; done"
        ));
        cmd
    }

    fn garbler() -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("read line; echo not-json");
        cmd
    }

    fn request() -> HarnessRequest {
        HarnessRequest::new("true", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_launches_once_and_reuses() {
        let channel = ValidationChannel::new();
        let launches = AtomicUsize::new(0);
        for _ in 0..3 {
            let response = channel
                .execute(
                    || {
                        launches.fetch_add(1, Ordering::SeqCst);
                        HarnessProcess::spawn(responder(), ChannelKind::Validation, 1024)
                    },
                    &request(),
                    Deadline::after(Duration::from_secs(10)),
                    Duration::from_secs(1),
                )
                .await
                .unwrap();
            assert_eq!(response.output, "ok");
        }
        assert_eq!(launches.load(Ordering::SeqCst), 1);
        assert!(channel.is_ready().await);

        channel.reset().await;
        assert!(!channel.is_ready().await);
    }

    #[tokio::test]
    async fn test_failure_resets_and_next_call_relaunches() {
        let channel = ValidationChannel::new();
        let err = channel
            .execute(
                || HarnessProcess::spawn(garbler(), ChannelKind::Validation, 1024),
                &request(),
                Deadline::after(Duration::from_secs(10)),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(err.is_desync());
        assert!(!channel.is_ready().await);

        let response = channel
            .execute(
                || HarnessProcess::spawn(responder(), ChannelKind::Validation, 1024),
                &request(),
                Deadline::after(Duration::from_secs(10)),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(response.output, "ok");
        assert!(channel.is_ready().await);
    }

    #[tokio::test]
    async fn test_launch_error_is_reported() {
        let channel = ValidationChannel::new();
        let err = channel
            .execute(
                || {
                    HarnessProcess::spawn(
                        Command::new("/nonexistent/shell-harness"),
                        ChannelKind::Validation,
                        1024,
                    )
                },
                &request(),
                Deadline::none(),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("validation"));
        assert!(!channel.is_ready().await);
    }
}
