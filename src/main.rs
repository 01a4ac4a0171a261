use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use benchbox::Config;

mod commands;

#[derive(Parser)]
#[command(name = "benchbox")]
#[command(
    author,
    version,
    about = "Disposable container sandboxes for agent shell commands"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Also write logs to this file
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Config file (default: ./benchbox.toml, then the user config dir)
    #[arg(short, long, global = true, env = "BENCHBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the image build Makefile
    #[arg(long, global = true, env = "BENCHBOX_CONTAINERS_DIR")]
    containers_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List built-in environments
    Envs {
        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start a sandbox and run commands in it, one per argument
    Run {
        #[command(flatten)]
        sandbox: commands::SandboxArgs,

        /// Commands to run in order
        #[arg(required = true)]
        commands: Vec<String>,
    },

    /// Run a bash script file on the primary channel
    Script {
        #[command(flatten)]
        sandbox: commands::SandboxArgs,

        /// Script file on the host
        file: PathBuf,
    },

    /// Run a validation script and report its outcome markers
    Validate {
        #[command(flatten)]
        sandbox: commands::SandboxArgs,

        /// Script file on the host
        file: PathBuf,
    },

    /// Fetch a URL through the host cache into a sandbox
    Download {
        #[command(flatten)]
        sandbox: commands::SandboxArgs,

        /// Absolute destination path inside the container
        destination: String,

        /// URL to fetch
        url: String,
    },

    /// Download cache maintenance
    Cache {
        #[command(subcommand)]
        action: commands::cache::CacheAction,
    },
}

fn init_logging(cli: &Cli) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let default_filter = if cli.verbose {
        "benchbox=debug"
    } else {
        "benchbox=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let stderr_layer = if cli.log_json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let (file_layer, guard) = match &cli.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), PathBuf::from);
            let file_name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

fn load_config(cli: &Cli) -> Result<Config> {
    let project_dir = std::env::current_dir().context("Failed to get current directory")?;
    let mut config = Config::discover(cli.config.as_deref(), &project_dir)?;
    if let Some(dir) = &cli.containers_dir {
        config.images.containers_dir = if dir.is_relative() {
            project_dir.join(dir)
        } else {
            dir.clone()
        };
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli)?;
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Envs { json } => {
            commands::envs::run(json, &config)?;
        }
        Commands::Run {
            sandbox,
            commands: to_run,
        } => {
            commands::run::run(&sandbox, &to_run, &config).await?;
        }
        Commands::Script { sandbox, file } => {
            commands::script::run(&sandbox, &file, &config).await?;
        }
        Commands::Validate { sandbox, file } => {
            commands::validate::run(&sandbox, &file, &config).await?;
        }
        Commands::Download {
            sandbox,
            destination,
            url,
        } => {
            commands::download::run(&sandbox, &destination, &url, &config).await?;
        }
        Commands::Cache { action } => {
            commands::cache::run(action, &config)?;
        }
    }

    Ok(())
}
