//! debug-mcp wrapper - restarts the debug-mcp worker behind an uninterrupted stdio stream.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use debug_mcp_wrapper::config::{ConfigError, ConfigLoader, ConfigOverrides, WrapperConfig};
use debug_mcp_wrapper::proxy::Supervisor;

#[derive(Parser)]
#[command(
    name = "debug-mcp-wrapper",
    about = "Periodically restart the debug-mcp worker without dropping client messages",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Working directory where debug-mcp is installed.
    #[arg(long, env = "DEBUG_MCP_DIR", global = true)]
    cwd: Option<PathBuf>,

    /// PHP executable used to launch the worker.
    #[arg(long, env = "PHP_BINARY", global = true)]
    php_binary: Option<String>,

    /// Seconds between worker restarts (0 disables scheduled restarts).
    #[arg(long, global = true)]
    restart_interval: Option<u64>,

    /// Maximum number of input chunks buffered during a restart.
    #[arg(long, global = true)]
    buffer_size: Option<usize>,

    /// Path to a TOML config file (skips the default search).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved configuration as JSON and exit.
    Config,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            working_dir: self.cwd.clone(),
            executable: self.php_binary.clone(),
            restart_interval_secs: self.restart_interval,
            buffer_size: self.buffer_size,
        }
    }

    fn resolve_config(&self) -> Result<WrapperConfig, ConfigError> {
        let loader = match &self.config {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::ReadError {
                        path: path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "config file not found",
                        ),
                    });
                }
                ConfigLoader::with_path(path.clone())
            }
            None => ConfigLoader::new(),
        };

        match loader.find_config_file() {
            Some(path) => tracing::info!(path = %path.display(), "Using config file"),
            None => tracing::info!(
                searched = ?loader.search_paths(),
                "No config file found, using flags and environment"
            ),
        }

        let config = loader.load()?.with_overrides(self.overrides());
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // stdout carries the worker protocol.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Cancel `token` on the first SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
                        _ = term.recv() => tracing::info!("Received SIGTERM"),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("Received SIGINT");
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl-C");
            }
        }

        token.cancel();
    });
}

/// Run the supervisor until a signal arrives and return the process exit code.
async fn run(config: WrapperConfig) -> i32 {
    let supervisor = Supervisor::from_config(&config);
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    tracing::info!(
        working_dir = ?config.working_dir(),
        executable = %config.executable,
        restart_interval_secs = config.restart_interval_secs,
        buffer_size = config.buffer_size,
        "Starting debug-mcp wrapper"
    );

    match supervisor
        .run(tokio::io::stdin(), tokio::io::stdout(), cancel)
        .await
    {
        Ok(stats) => {
            tracing::info!(
                spawns = stats.spawns,
                restarts = stats.restarts,
                recoveries = stats.recoveries,
                "Wrapper shut down"
            );
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "Supervisor failed");
            eprintln!("Error: {e}");
            1
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Commands::Config) => match serde_json::to_string_pretty(&config) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: failed to serialize config: {e}");
                ExitCode::FAILURE
            }
        },
        None => {
            let code = run(config).await;
            // Tokio's stdin reader can keep the runtime from shutting down.
            std::process::exit(code);
        }
    }
}
