//! Fetch a URL into a fresh sandbox.

use anyhow::Result;
use colored::Colorize;

use benchbox::sandbox::validate_destination;
use benchbox::shell;
use benchbox::Config;

use super::SandboxArgs;

/// Downloads `url` to `destination` and lists the placed file.
pub async fn run(args: &SandboxArgs, destination: &str, url: &str, config: &Config) -> Result<()> {
    validate_destination(destination)?;
    args.environment(config)?;

    let sandbox = args.open(config).await?;
    let outcome = async {
        sandbox.download(destination, url).await?;
        sandbox
            .run(&format!("ls -l {}", shell::quote(destination)))
            .await
    }
    .await;
    sandbox.dispose().await?;

    let listing = outcome?;
    eprintln!("{} {url} -> {destination}", "downloaded".green());
    println!("{listing}");
    Ok(())
}
