//! Backend whose container main process is the shell harness itself.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::backend::{BackendKind, ExecutionBackend, Session};
use super::deadline::Deadline;
use super::engine::AttachedSpec;
use super::error::{ChannelKind, Result, SandboxError};
use super::harness::{HarnessChannel, HarnessRequest};
use super::output::normalize;
use super::process::HarnessProcess;

const READINESS_PROBE: &str = "echo hello";

#[derive(Default)]
struct PrimaryState {
    process: Option<HarnessProcess>,
    channel: Option<HarnessChannel>,
    /// Set once an exchange fails; a late reply could otherwise be read as
    /// the answer to the next request.
    failure: Option<String>,
}

/// The harness a pipe-backed sandbox was started with.
///
/// Exchanges are serialized. After the first failure every call fails fast.
pub(crate) struct PrimaryChannel {
    state: Mutex<PrimaryState>,
}

impl PrimaryChannel {
    pub(crate) fn new(process: HarnessProcess, channel: HarnessChannel) -> Self {
        Self {
            state: Mutex::new(PrimaryState {
                process: Some(process),
                channel: Some(channel),
                failure: None,
            }),
        }
    }

    /// Sends one request and returns the normalized output.
    pub(crate) async fn run(
        &self,
        request: &HarnessRequest,
        deadline: Deadline,
        grace: Duration,
    ) -> Result<String> {
        let mut state = self.state.lock().await;
        if let Some(reason) = &state.failure {
            return Err(SandboxError::protocol_desync(
                ChannelKind::Primary,
                format!("channel unusable after earlier failure: {reason}"),
                b"",
            ));
        }
        let Some(channel) = state.channel.as_mut() else {
            return Err(SandboxError::usage("shell-harness has been shut down"));
        };

        match channel.exchange(request, deadline, grace).await {
            Ok(response) => Ok(normalize(&response.output)),
            Err(e) => {
                state.failure = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Captured harness stderr, empty once shut down.
    pub(crate) async fn stderr(&self) -> String {
        self.state
            .lock()
            .await
            .process
            .as_ref()
            .map(HarnessProcess::stderr)
            .unwrap_or_default()
    }

    /// Closes stdin, then kills and reaps the harness. Later calls are no-ops.
    pub(crate) async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut channel) = state.channel.take() {
            channel.close().await;
        }
        if let Some(process) = state.process.take() {
            process.terminate().await;
        }
    }
}

/// Drives one `run --rm -i` container over its stdio. Validation requests
/// share the primary channel.
pub(crate) struct PipeBackend {
    session: Arc<Session>,
    primary: PrimaryChannel,
}

impl PipeBackend {
    /// Launches the container and waits for the harness to answer a probe.
    pub(crate) async fn start(session: Arc<Session>, deadline: Deadline) -> Result<Self> {
        let name = session
            .container_name()
            .ok_or_else(|| SandboxError::usage("sandbox has no container name"))?;

        let cmd = session.engine.attached_run_command(&AttachedSpec {
            name: &name,
            image: &session.image,
            user: &session.container.user,
            workdir: &session.container.workdir,
            network: session.network,
            entrypoint: &session.container.harness_path,
        });
        info!(container = %name, network = %session.network, "starting harness container");

        let (process, channel) = HarnessProcess::spawn(
            cmd,
            ChannelKind::Primary,
            session.limits.stderr_capture_bytes,
        )
        .map_err(|e| {
            SandboxError::start_failed(&name, e.to_string(), &session.image, None, "", "")
        })?;

        let backend = Self::attach(Arc::clone(&session), process, channel);

        if let Err(e) = backend.exchange(READINESS_PROBE, deadline).await {
            let stderr = backend.primary.stderr().await;
            warn!(container = %name, error = %e, "harness readiness probe failed");
            if let Err(teardown) = backend.dispose().await {
                warn!(container = %name, error = %teardown, "cleanup after failed start");
            }
            return Err(SandboxError::start_failed(
                &name,
                format!("readiness probe failed: {e}"),
                &session.image,
                None,
                "",
                &stderr,
            ));
        }

        debug!(container = %name, "harness container ready");
        Ok(backend)
    }

    fn attach(session: Arc<Session>, process: HarnessProcess, channel: HarnessChannel) -> Self {
        Self {
            session,
            primary: PrimaryChannel::new(process, channel),
        }
    }

    async fn exchange(&self, command: &str, deadline: Deadline) -> Result<String> {
        let request = HarnessRequest::new(command, self.session.command_timeout);
        self.primary
            .run(&request, deadline, self.session.response_grace())
            .await
    }
}

#[async_trait]
impl ExecutionBackend for PipeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::PipeHarness
    }

    async fn run(&self, command: &str, deadline: Deadline) -> Result<String> {
        self.exchange(command, deadline).await
    }

    async fn run_validation(&self, command: &str, deadline: Deadline) -> Result<String> {
        self.exchange(command, deadline).await
    }

    async fn dispose(&self) -> Result<()> {
        self.primary.shutdown().await;

        if let Some(name) = self.session.take_container() {
            info!(container = %name, "removing harness container");
            self.session.engine.remove(&name).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sandbox::output::EMPTY_OUTPUT_PLACEHOLDER;
    use tokio::process::Command;

    fn reply(output: &str) -> String {
        format!(
            r#"{{"output":"{output}","execution_time_seconds":0.0,"command":"x","timeout_seconds":5.0}}"#
        )
    }

    /// A fake harness running `script` under `sh`.
    fn fake_harness(script: &str) -> (HarnessProcess, HarnessChannel) {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        HarnessProcess::spawn(cmd, ChannelKind::Primary, 1024).unwrap()
    }

    /// Answers every request line with `output`.
    fn responder(output: &str) -> PrimaryChannel {
        let (process, channel) = fake_harness(&format!(
            "while IFS= read -r line; do printf '%s\\n' '{}'; done",
            reply(output)
        ));
        PrimaryChannel::new(process, channel)
    }

    fn backend(primary: PrimaryChannel) -> PipeBackend {
        PipeBackend {
            session: Arc::new(Session::for_tests(&Config::default())),
            primary,
        }
    }

    #[tokio::test]
    async fn test_output_is_normalized() {
        let backend = backend(responder(""));
        let output = backend.run("true", Deadline::none()).await.unwrap();
        assert_eq!(output, EMPTY_OUTPUT_PLACEHOLDER);

        let output = backend.run_validation("true", Deadline::none()).await.unwrap();
        assert_eq!(output, EMPTY_OUTPUT_PLACEHOLDER);
        backend.primary.shutdown().await;
    }

    #[tokio::test]
    async fn test_first_failure_poisons_channel() {
        // Garbles the first reply, then answers correctly forever.
        let (process, channel) = fake_harness(&format!(
            "read line; echo not-json; while IFS= read -r line; do printf '%s\\n' '{}'; done",
            reply("ok")
        ));
        let backend = backend(PrimaryChannel::new(process, channel));

        let err = backend.run("echo a", Deadline::none()).await.unwrap_err();
        assert!(err.is_desync(), "unexpected error: {err}");

        for _ in 0..2 {
            let err = backend.run("echo b", Deadline::none()).await.unwrap_err();
            assert!(err.is_desync(), "unexpected error: {err}");
            assert!(err.to_string().contains("earlier failure"));
        }
        let err = backend
            .run_validation("echo c", Deadline::none())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("earlier failure"));
        backend.primary.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_harness_poisons_channel() {
        let (process, channel) = fake_harness("exit 0");
        let primary = PrimaryChannel::new(process, channel);
        let request = HarnessRequest::new("echo a", Duration::from_secs(5));

        // Broken pipe or end of stream, depending on when the harness exits.
        let err = primary
            .run(&request, Deadline::none(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(!err.to_string().contains("earlier failure"));

        let err = primary
            .run(&request, Deadline::none(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("earlier failure"));
        primary.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispose_twice_tears_down_once() {
        let backend = backend(responder("ok"));
        assert_eq!(backend.run("echo ok", Deadline::none()).await.unwrap(), "ok");

        // Nothing answers for the engine, so only the container removal fails.
        let first = backend.dispose().await;
        assert!(first.is_err());
        assert!(backend.session.container_name().is_none());
        assert!(backend.primary.stderr().await.is_empty());

        backend.dispose().await.unwrap();

        let err = backend.run("echo ok", Deadline::none()).await.unwrap_err();
        assert!(err.is_usage(), "unexpected error: {err}");
    }
}
