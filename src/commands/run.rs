//! Run commands in a fresh sandbox.

use anyhow::Result;
use colored::Colorize;

use benchbox::sandbox::wrap_for_agent;
use benchbox::{Config, Sandbox};

use super::SandboxArgs;

/// Runs each command in order on one sandbox, stopping at the first failure.
pub async fn run(args: &SandboxArgs, commands: &[String], config: &Config) -> Result<()> {
    let sandbox = args.open(config).await?;
    let outcome = run_all(&sandbox, commands).await;
    sandbox.dispose().await?;
    outcome
}

async fn run_all(sandbox: &Sandbox, commands: &[String]) -> Result<()> {
    for command in commands {
        eprintln!("{} {}", "$".dimmed(), command.bold());
        let output = sandbox.run(command).await?;
        println!("{}", wrap_for_agent(&output));
    }
    Ok(())
}
