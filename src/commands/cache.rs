//! Download cache maintenance.

use anyhow::Result;
use clap::Subcommand;

use benchbox::Config;

/// Cache actions.
#[derive(Subcommand, Debug, Clone, Copy)]
pub enum CacheAction {
    /// Print the cache directory
    Path,
}

/// Runs a cache action.
pub fn run(action: CacheAction, config: &Config) -> Result<()> {
    match action {
        CacheAction::Path => println!("{}", config.cache_dir().display()),
    }
    Ok(())
}
