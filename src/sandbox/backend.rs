//! Execution strategies behind the sandbox façade.
//!
//! Two backends exist:
//! - pipe harness: the harness is the container's main process, driven over
//!   the stdio of `docker run -i`
//! - HTTP bridge: the container runs an HTTP service and commands are relayed
//!   by a host-side bridge program
//!
//! The backend is picked once, at construction.

use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::deadline::Deadline;
use super::engine::ContainerEngine;
use super::error::Result;
use super::network::NetworkPolicy;
use crate::config::{BridgeConfig, ContainerSettings, LimitsConfig};

/// Trait for sandbox execution strategies.
#[async_trait]
pub(crate) trait ExecutionBackend: Send + Sync {
    /// Which strategy this is.
    fn kind(&self) -> BackendKind;

    /// Host port of the in-container service, when one is published.
    fn host_port(&self) -> Option<u16> {
        None
    }

    /// Runs an interactive command on the primary channel.
    async fn run(&self, command: &str, deadline: Deadline) -> Result<String>;

    /// Runs a command on the validation channel.
    async fn run_validation(&self, command: &str, deadline: Deadline) -> Result<String>;

    /// Releases subprocesses and the container. Safe to call repeatedly.
    async fn dispose(&self) -> Result<()>;
}

/// Supported execution strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// Line-JSON harness over the container's stdio.
    #[default]
    PipeHarness,
    /// In-container HTTP service driven through the bridge program.
    HttpBridge,
}

impl BackendKind {
    /// Maps the `use_bridge` flag of an environment onto a backend.
    pub fn from_use_bridge(use_bridge: bool) -> Self {
        if use_bridge {
            Self::HttpBridge
        } else {
            Self::PipeHarness
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PipeHarness => write!(f, "pipe-harness"),
            Self::HttpBridge => write!(f, "http-bridge"),
        }
    }
}

/// Per-instance facts shared by the façade and its backend.
pub(crate) struct Session {
    pub engine: ContainerEngine,
    pub image: String,
    pub network: NetworkPolicy,
    pub command_timeout: Duration,
    pub container: ContainerSettings,
    pub bridge: BridgeConfig,
    pub limits: LimitsConfig,
    name: Mutex<Option<String>>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        engine: ContainerEngine,
        name: String,
        image: String,
        network: NetworkPolicy,
        command_timeout: Duration,
        container: ContainerSettings,
        bridge: BridgeConfig,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            engine,
            image,
            network,
            command_timeout,
            container,
            bridge,
            limits,
            name: Mutex::new(Some(name)),
        }
    }

    /// Name of the live container; `None` once torn down.
    pub(crate) fn container_name(&self) -> Option<String> {
        self.name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Clears the stored name, handing it to the one caller that tears down.
    pub(crate) fn take_container(&self) -> Option<String> {
        self.name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Host-side wait beyond the command timeout before a reply is overdue.
    pub(crate) fn response_grace(&self) -> Duration {
        self.limits.response_grace()
    }
}

#[cfg(test)]
impl Session {
    /// A session for a container that does not exist, on an engine nothing
    /// answers for.
    pub(crate) fn for_tests(config: &crate::config::Config) -> Self {
        Self::new(
            ContainerEngine::unreachable(&config.container.engine),
            format!("{}-test", config.container.name_prefix),
            "benchbox/test:latest".to_string(),
            NetworkPolicy::default(),
            config.limits.command_timeout(),
            config.container.clone(),
            config.bridge.clone(),
            config.limits.clone(),
        )
    }
}
