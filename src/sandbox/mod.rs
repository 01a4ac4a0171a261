//! Disposable container sandboxes for running shell commands.
//!
//! A [`Sandbox`] owns one container built from a provisioned image and
//! exposes two independently serialized channels: a primary channel for
//! interactive commands and a validation channel for post-episode checks.
//! How commands reach the container depends on the [`BackendKind`].

mod backend;
mod deadline;
mod engine;
mod error;
mod eval_channel;
mod harness;
mod http;
mod network;
mod output;
mod pipe;
mod process;
mod provision;

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::ArtifactCache;
use crate::config::Config;
use crate::shell;
use backend::{ExecutionBackend, Session};
use engine::ContainerEngine;
use http::HttpBridgeBackend;
use pipe::PipeBackend;

pub use backend::BackendKind;
pub use deadline::Deadline;
pub use error::{classify_start_failure, ChannelKind, Result, SandboxError, StartHint};
pub use harness::{HarnessRequest, HarnessResponse};
pub use http::bridge_args;
pub use network::NetworkPolicy;
pub use output::{
    normalize, truncate, wrap_for_agent, AGENT_WRAPPER_PREFIX, EMPTY_OUTPUT_PLACEHOLDER,
    TRUNCATION_MARKER,
};
pub use process::{check_tools, choose_free_port, random_id, CapturedOutput};
pub use provision::ImageProvisioner;

const VCS_TOOL: &str = "git";

/// Everything needed to start one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    /// Build target naming the image, e.g. `ubuntu-22.04-amd64`.
    pub image_target: String,
    /// How commands reach the container.
    pub backend: BackendKind,
    /// Network access for the container.
    pub network: NetworkPolicy,
    /// Per-command timeout handed to the harness.
    pub command_timeout: Duration,
    /// Bounds construction and every later blocking call.
    pub deadline: Deadline,
}

impl SandboxOptions {
    /// Options for `image_target` with defaults taken from `config`.
    pub fn new(image_target: impl Into<String>, config: &Config) -> Self {
        Self {
            image_target: image_target.into(),
            backend: BackendKind::default(),
            network: NetworkPolicy::default(),
            command_timeout: config.limits.command_timeout(),
            deadline: Deadline::none(),
        }
    }
}

/// Observable lifecycle of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Commands may be issued.
    Ready,
    /// Torn down; every operation except `dispose` fails.
    Disposed,
}

/// A running, exclusively owned container.
pub struct Sandbox {
    id: String,
    options: SandboxOptions,
    session: Arc<Session>,
    backend: Box<dyn ExecutionBackend>,
    cache: ArtifactCache,
    state: Mutex<LifecycleState>,
}

impl Sandbox {
    /// Checks host prerequisites, builds the image and starts the container.
    ///
    /// Either returns a ready sandbox or fails with nothing left running.
    pub async fn start(options: SandboxOptions, config: &Config) -> Result<Self> {
        let provisioner = ImageProvisioner::new(&config.images);

        let mut tools = vec![
            config.container.engine.as_str(),
            provisioner.build_tool(),
            VCS_TOOL,
        ];
        if options.backend == BackendKind::HttpBridge {
            tools.push(config.bridge.program.as_str());
        }
        check_tools(tools)?;
        provisioner.check_makefile()?;
        let engine = ContainerEngine::connect(&config.container.engine).await?;

        let id = random_id();
        let name = format!("{}-{id}", config.container.name_prefix);
        info!(
            image_target = %options.image_target,
            container = %name,
            backend = %options.backend,
            network = %options.network,
            engine = engine.program(),
            "creating sandbox"
        );

        let image = provisioner
            .ensure_built(&options.image_target, options.deadline)
            .await?;

        let session = Arc::new(Session::new(
            engine,
            name,
            image,
            options.network,
            options.command_timeout,
            config.container.clone(),
            config.bridge.clone(),
            config.limits.clone(),
        ));
        let cache = ArtifactCache::new(config.cache_dir())?;

        let backend: Box<dyn ExecutionBackend> = match options.backend {
            BackendKind::PipeHarness => {
                Box::new(PipeBackend::start(Arc::clone(&session), options.deadline).await?)
            }
            BackendKind::HttpBridge => {
                Box::new(HttpBridgeBackend::start(Arc::clone(&session), options.deadline).await?)
            }
        };

        Ok(Self {
            id,
            options,
            session,
            backend,
            cache,
            state: Mutex::new(LifecycleState::Ready),
        })
    }

    /// Random identifier shared with the container name.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Container name; `None` once disposed.
    pub fn container_name(&self) -> Option<String> {
        self.session.container_name()
    }

    /// Image tag the container runs.
    pub fn image(&self) -> &str {
        &self.session.image
    }

    /// Backend chosen at construction.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Published host port, for HTTP-bridge sandboxes.
    pub fn host_port(&self) -> Option<u16> {
        self.backend.host_port()
    }

    /// Options the sandbox was started with.
    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Ready => Ok(()),
            LifecycleState::Disposed => Err(SandboxError::usage("sandbox has been disposed")),
        }
    }

    /// Runs one interactive command and returns its normalized output.
    pub async fn run(&self, command: &str) -> Result<String> {
        self.ensure_ready()?;
        self.backend.run(command, self.options.deadline).await
    }

    /// Runs a multi-line bash script on the primary channel.
    pub async fn run_bash_script(&self, script: &str) -> Result<String> {
        self.run(&shell::script_command(script)).await
    }

    /// Runs a bash script on the validation channel.
    ///
    /// Serialized independently of [`Sandbox::run`].
    pub async fn run_validation_bash_script(&self, script: &str) -> Result<String> {
        self.ensure_ready()?;
        self.backend
            .run_validation(&shell::script_command(script), self.options.deadline)
            .await
    }

    /// Fetches `url` through the host cache and places it at `destination`
    /// inside the container, replacing any existing file.
    pub async fn download(&self, destination: &str, url: &str) -> Result<()> {
        let parent = validate_destination(destination)?;
        self.ensure_ready()?;
        let deadline = self.options.deadline;

        let cached = self.cache.fetch(url, deadline).await?;
        let name = self
            .session
            .container_name()
            .ok_or_else(|| SandboxError::usage("container is not running"))?;

        let prep = format!(
            "mkdir -p {} && rm -f {}",
            shell::quote(parent),
            shell::quote(destination)
        );
        let exec = self.session.engine.exec(
            &name,
            &self.session.container.user,
            vec!["bash".to_string(), "-lc".to_string(), prep.clone()],
        );
        let output = deadline
            .bound(None, exec)
            .await
            .ok_or_else(|| SandboxError::deadline_exceeded("preparing download destination"))??;
        if !output.success() {
            return Err(SandboxError::command_failed(
                prep,
                output.exit_code,
                &output.stdout,
                &output.stderr,
            ));
        }

        deadline
            .bound(
                None,
                self.session.engine.copy_file_in(&name, &cached, destination),
            )
            .await
            .ok_or_else(|| SandboxError::deadline_exceeded("copying download into container"))??;
        info!(url, destination, container = %name, "download placed in container");
        Ok(())
    }

    /// Tears the sandbox down. Idempotent; teardown failures are logged.
    pub async fn dispose(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == LifecycleState::Disposed {
                return Ok(());
            }
            *state = LifecycleState::Disposed;
        }

        let name = self.session.container_name().unwrap_or_default();
        if let Err(e) = self.backend.dispose().await {
            warn!(container = %name, error = %e, "sandbox teardown failed");
        } else {
            info!(container = %name, "sandbox disposed");
        }
        Ok(())
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.state() == LifecycleState::Disposed {
            return;
        }
        if let Some(name) = self.session.take_container() {
            warn!(container = %name, "sandbox dropped without dispose, force-removing");
            self.session.engine.remove_blocking(&name);
        }
    }
}

/// Checks that `destination` is an absolute path naming a file, returning its
/// parent directory.
pub fn validate_destination(destination: &str) -> Result<&str> {
    if !destination.starts_with('/') {
        return Err(SandboxError::usage(format!(
            "destination must be an absolute path inside the container: {destination}"
        )));
    }
    let path = Path::new(destination);
    if path.file_name().is_none() {
        return Err(SandboxError::usage(format!(
            "destination does not name a file: {destination}"
        )));
    }
    Ok(path
        .parent()
        .and_then(Path::to_str)
        .filter(|parent| !parent.is_empty())
        .unwrap_or("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_destination_requires_absolute_path() {
        let err = validate_destination("tmp/jq.tar.gz").unwrap_err();
        assert!(err.is_usage());
        assert!(err.to_string().contains("absolute path"));
    }

    #[test]
    fn test_validate_destination_returns_parent() {
        assert_eq!(
            validate_destination("/home/peter/jq-1.8.1.tar.gz").unwrap(),
            "/home/peter"
        );
        assert_eq!(validate_destination("/file").unwrap(), "/");
    }

    #[test]
    fn test_validate_destination_rejects_directory_like_paths() {
        assert!(validate_destination("/").unwrap_err().is_usage());
        assert!(validate_destination("/home/..").unwrap_err().is_usage());
    }

    #[test]
    fn test_options_take_config_timeout() {
        let mut config = Config::default();
        config.limits.command_timeout_secs = 600;
        let options = SandboxOptions::new("alpine-3.22.1-amd64", &config);
        assert_eq!(options.command_timeout, Duration::from_secs(600));
        assert_eq!(options.backend, BackendKind::PipeHarness);
        assert_eq!(options.network, NetworkPolicy::Online);
        assert_eq!(options.deadline, Deadline::none());
    }
}
