//! Run a bash script in a fresh sandbox.

use anyhow::{Context, Result};
use std::path::Path;

use benchbox::Config;

use super::SandboxArgs;

/// Runs the script on the primary channel and prints its normalized output.
pub async fn run(args: &SandboxArgs, file: &Path, config: &Config) -> Result<()> {
    let script = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read script: {}", file.display()))?;
    args.environment(config)?;

    let sandbox = args.open(config).await?;
    let outcome = sandbox.run_bash_script(&script).await;
    sandbox.dispose().await?;

    println!("{}", outcome?);
    Ok(())
}
