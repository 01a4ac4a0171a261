//! List built-in environments.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;

use benchbox::environment::{self, EnvironmentDescriptor};
use benchbox::Config;

/// Prints the environment catalog, as a table or as JSON.
pub fn run(json: bool, config: &Config) -> Result<()> {
    let envs = environment::catalog(&config.bridge.program);
    if json {
        let text =
            serde_json::to_string_pretty(&envs).context("Failed to serialize environments")?;
        println!("{text}");
    } else {
        print!("{}", format_envs(&envs));
    }
    Ok(())
}

fn format_envs(envs: &[EnvironmentDescriptor]) -> String {
    let width = envs.iter().map(|e| e.name.len()).max().unwrap_or(0);
    let mut out = String::new();
    for env in envs {
        let network = if env.is_online {
            "online".green()
        } else {
            "offline".yellow()
        };
        let backend = env.backend().to_string();
        let _ = writeln!(
            out,
            "{:<width$}  {:<7}  {:<12}  image {}",
            env.name.bold(),
            network,
            backend.cyan(),
            env.container_name
        );
    }
    out
}
