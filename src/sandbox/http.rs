//! Backend for images that run an HTTP command service.
//!
//! Interactive commands are relayed by a host-side bridge program pointed at
//! the published port. Validation scripts bypass the service and talk to a
//! harness attached with `exec -i`.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::backend::{BackendKind, ExecutionBackend, Session};
use super::deadline::Deadline;
use super::engine::DetachedSpec;
use super::error::{ChannelKind, Result, SandboxError};
use super::eval_channel::ValidationChannel;
use super::harness::HarnessRequest;
use super::output::normalize;
use super::process::{check_tools, choose_free_port, run_captured, HarnessProcess};
use crate::shell;

const SMOKE_COMMAND: &str = "echo hello";
const SMOKE_RETRY_DELAY: Duration = Duration::from_secs(1);
const ALIVE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const ALIVE_LOG_EVERY: u32 = 5;

pub(crate) struct HttpBridgeBackend {
    session: Arc<Session>,
    port: u16,
    /// Held for the whole of a primary command; one bridge process at a time.
    primary: Mutex<()>,
    validation: ValidationChannel,
}

impl HttpBridgeBackend {
    /// Starts the service container and waits until it executes commands.
    pub(crate) async fn start(session: Arc<Session>, deadline: Deadline) -> Result<Self> {
        let name = session
            .container_name()
            .ok_or_else(|| SandboxError::usage("sandbox has no container name"))?;
        let port = choose_free_port()?;

        info!(container = %name, port, "starting bridge container");
        let spec = DetachedSpec {
            name: &name,
            image: &session.image,
            user: &session.container.user,
            workdir: &session.container.workdir,
            host_port: port,
            service_port: session.container.service_port,
        };
        match deadline.bound(None, session.engine.run_detached(&spec)).await {
            None => {
                if let Err(e) = session.engine.remove(&name).await {
                    warn!(container = %name, error = %e, "cleanup after start timeout");
                }
                return Err(SandboxError::deadline_exceeded(format!(
                    "starting container {name}"
                )));
            }
            Some(Err(e)) => {
                let text = e.to_string();
                return Err(SandboxError::start_failed(
                    &name,
                    text.clone(),
                    &session.image,
                    Some(port),
                    "",
                    &text,
                ));
            }
            Some(Ok(())) => {}
        }

        let backend = Self {
            session: Arc::clone(&session),
            port,
            primary: Mutex::new(()),
            validation: ValidationChannel::new(),
        };

        if let Err(e) = backend.become_ready(deadline).await {
            if let Err(teardown) = backend.dispose().await {
                warn!(container = %name, error = %teardown, "cleanup after failed start");
            }
            return Err(e);
        }
        Ok(backend)
    }

    fn api_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Bridge invocation pointed at this sandbox's service.
    ///
    /// `OH_API_KEY` is only present when `api_key` is set and non-empty.
    fn bridge_command(&self, args: &[String], api_key: Option<String>) -> Command {
        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..]).env("OH_API_URL", self.api_url());
        match api_key.filter(|key| !key.is_empty()) {
            Some(key) => cmd.env("OH_API_KEY", key),
            None => cmd.env_remove("OH_API_KEY"),
        };
        cmd
    }

    async fn become_ready(&self, deadline: Deadline) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(ALIVE_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SandboxError::io("building HTTP client", std::io::Error::other(e)))?;
        let bridge = &self.session.bridge;
        wait_for_alive(
            &client,
            &self.api_url(),
            bridge.readiness_attempts,
            bridge.readiness_interval(),
            deadline,
        )
        .await?;
        self.smoke_test(deadline).await
    }

    /// The service can report alive before it executes commands reliably.
    async fn smoke_test(&self, deadline: Deadline) -> Result<()> {
        let attempts = self.session.bridge.smoke_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.run(SMOKE_COMMAND, deadline).await {
                Ok(_) => {
                    debug!(attempt, "bridge smoke test passed");
                    return Ok(());
                }
                Err(e) => {
                    debug!(attempt, error = %e, "bridge smoke test failed");
                    last_error = Some(e);
                }
            }
            if deadline.is_expired() {
                break;
            }
            tokio::time::sleep(SMOKE_RETRY_DELAY).await;
        }

        let name = self.session.container_name().unwrap_or_default();
        let message = last_error.map_or_else(String::new, |e| e.to_string());
        Err(SandboxError::start_failed(
            name,
            format!("test command failed after {attempts} attempts: {message}"),
            &self.session.image,
            Some(self.port),
            "",
            "",
        ))
    }
}

/// Polls `<base>/alive` until it answers 200.
///
/// Sleeps before every request, so the first poll happens one interval in.
pub(crate) async fn wait_for_alive(
    client: &reqwest::Client,
    base_url: &str,
    attempts: u32,
    interval: Duration,
    deadline: Deadline,
) -> Result<()> {
    let url = format!("{base_url}/alive");
    info!(url = %url, "waiting for HTTP API service");

    for attempt in 1..=attempts {
        if deadline.is_expired() {
            return Err(SandboxError::deadline_exceeded("waiting for HTTP API service"));
        }
        tokio::time::sleep(interval).await;

        match client.get(&url).send().await {
            Ok(resp) if resp.status() == StatusCode::OK => {
                info!(attempt, "HTTP API service is ready");
                return Ok(());
            }
            Ok(resp) => debug!(attempt, status = %resp.status(), "service not ready"),
            Err(e) => debug!(attempt, error = %e, "service not reachable"),
        }

        if attempt % ALIVE_LOG_EVERY == 0 {
            info!("Still waiting for service... ({attempt}/{attempts} attempts)");
        }
    }

    let waited_ms = u128::from(attempts) * interval.as_millis();
    Err(SandboxError::readiness_timeout(
        "HTTP API service",
        u64::try_from(waited_ms / 1000).unwrap_or(u64::MAX),
    ))
}

/// Argument vector for the bridge program.
///
/// A command already addressed to the bridge is tokenized and passed through;
/// anything else becomes the bridge's single payload argument.
pub fn bridge_args(program: &str, command: &str) -> Result<Vec<String>> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(SandboxError::usage("empty command"));
    }

    let addressed = trimmed == program
        || trimmed
            .strip_prefix(program)
            .is_some_and(|rest| rest.starts_with(char::is_whitespace));
    if !addressed {
        return Ok(vec![program.to_string(), trimmed.to_string()]);
    }

    let args = shell::split(trimmed)
        .map_err(|e| SandboxError::usage(format!("failed to parse {program} command: {e}")))?;
    if args.first().map(String::as_str) != Some(program) {
        return Err(SandboxError::usage(format!(
            "command must start with '{program}'"
        )));
    }
    if args.len() < 2 {
        return Err(SandboxError::usage(format!(
            "{program} invocation missing command payload: {trimmed}"
        )));
    }
    Ok(args)
}

#[async_trait]
impl ExecutionBackend for HttpBridgeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::HttpBridge
    }

    fn host_port(&self) -> Option<u16> {
        Some(self.port)
    }

    async fn run(&self, command: &str, deadline: Deadline) -> Result<String> {
        let bridge = &self.session.bridge;
        let args = bridge_args(&bridge.program, command)?;
        check_tools([bridge.program.as_str()])?;

        let _turn = self.primary.lock().await;
        let mut cmd = self.bridge_command(&args, std::env::var(&bridge.api_key_env).ok());

        let rendered = args.join(" ");
        info!(command = %rendered, api_url = %self.api_url(), "executing bridge command");

        let timeout = self.session.command_timeout;
        let output = run_captured(&mut cmd, deadline.budget(Some(timeout)))
            .await
            .map_err(|e| SandboxError::io(format!("running {}", bridge.program), e))?
            .ok_or_else(|| {
                SandboxError::channel_timeout(
                    ChannelKind::Primary,
                    format!("{} did not finish within {}s", bridge.program, timeout.as_secs()),
                )
            })?;

        if !output.success() {
            return Err(SandboxError::command_failed(
                rendered,
                output.exit_code,
                &output.stdout,
                &output.stderr,
            ));
        }
        Ok(normalize(&output.stdout))
    }

    async fn run_validation(&self, command: &str, deadline: Deadline) -> Result<String> {
        let session = &self.session;
        let request = HarnessRequest::new(command, session.command_timeout);
        let launch = || {
            let name = session
                .container_name()
                .ok_or_else(|| SandboxError::usage("container is not running"))?;
            info!(container = %name, "attaching validation shell-harness");
            let cmd = session.engine.attached_exec_command(
                &name,
                &session.container.user,
                &session.container.harness_path,
            );
            HarnessProcess::spawn(
                cmd,
                ChannelKind::Validation,
                session.limits.stderr_capture_bytes,
            )
        };

        let response = self
            .validation
            .execute(launch, &request, deadline, session.response_grace())
            .await?;
        Ok(normalize(&response.output))
    }

    async fn dispose(&self) -> Result<()> {
        self.validation.reset().await;
        if let Some(name) = self.session.take_container() {
            info!(container = %name, "stopping bridge container");
            self.session.engine.stop(&name).await?;
        }
        Ok(())
    }
}
