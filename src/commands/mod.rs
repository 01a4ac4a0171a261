//! CLI command implementations.
//!
//! Each submodule implements one benchbox command. Output formatting is kept
//! in pure functions so it can be tested without a container engine.

pub mod cache;
pub mod download;
pub mod envs;
pub mod run;
pub mod script;
pub mod validate;

use anyhow::{Context, Result};
use clap::Args;
use std::time::Duration;

use benchbox::environment::{self, EnvironmentDescriptor};
use benchbox::{Config, Deadline, Sandbox};

/// Options shared by every command that starts a sandbox.
#[derive(Args, Debug, Clone)]
pub struct SandboxArgs {
    /// Environment name (see `benchbox envs`)
    #[arg(short, long, env = "BENCHBOX_ENV")]
    pub env: String,

    /// Per-command timeout in seconds (default: from config)
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Overall time budget in seconds for the whole invocation
    #[arg(long)]
    pub deadline: Option<u64>,
}

impl SandboxArgs {
    /// Resolves the environment without touching the container engine.
    pub fn environment(&self, config: &Config) -> Result<EnvironmentDescriptor> {
        environment::find(&self.env, &config.bridge.program).with_context(|| {
            format!(
                "Unknown environment: '{}'. Run `benchbox envs` to list them.",
                self.env
            )
        })
    }

    /// Starts a sandbox for the selected environment.
    pub async fn open(&self, config: &Config) -> Result<Sandbox> {
        let env = self.environment(config)?;
        let timeout = self
            .timeout
            .map_or_else(|| config.limits.command_timeout(), Duration::from_secs);

        let mut options = env.options(timeout, config);
        if let Some(secs) = self.deadline {
            options.deadline = Deadline::after(Duration::from_secs(secs));
        }
        Sandbox::start(options, config)
            .await
            .with_context(|| format!("Failed to start sandbox for {}", env.name))
    }
}
