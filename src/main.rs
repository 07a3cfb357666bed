use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use speedchecker::api::ConfigPatch;
use speedchecker::client::{ApiClient, HistoryParams, DEFAULT_URL};
use speedchecker::config::{AppConfig, LogFormat};
use speedchecker::storage::ExportFormat;

#[derive(Parser)]
#[command(
    name = "speedchecker",
    about = "Scheduled internet speed tests with durable history",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduler)
    Serve {
        /// Bind address (overrides [server] bind)
        #[arg(long)]
        bind: Option<String>,

        /// Path to a TOML config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory (overrides [storage] data_dir)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Start a manual measurement cycle on a running daemon
    Trigger {
        #[command(flatten)]
        remote: Remote,
    },

    /// Show recorded measurements
    History {
        #[command(flatten)]
        remote: Remote,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Download the history as json, csv or columnar
    Export {
        #[command(flatten)]
        remote: Remote,

        #[command(flatten)]
        filter: FilterArgs,

        /// Export format
        #[arg(long, default_value = "json")]
        format: String,

        /// Output file (stdout if omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Delete every recorded measurement
    ClearHistory {
        #[command(flatten)]
        remote: Remote,
    },

    /// Read or change the automatic testing schedule
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show scheduler state
    Status {
        #[command(flatten)]
        remote: Remote,
    },
}

#[derive(clap::Args)]
struct Remote {
    /// Base URL of the daemon
    #[arg(long, env = "SPEEDCHECKER_URL", default_value = DEFAULT_URL)]
    url: String,
}

#[derive(clap::Args)]
struct FilterArgs {
    /// Only this provider (openspeedtest or speedsmart)
    #[arg(long)]
    provider: Option<String>,

    /// Inclusive lower bound, RFC 3339
    #[arg(long)]
    from: Option<String>,

    /// Inclusive upper bound, RFC 3339
    #[arg(long)]
    to: Option<String>,
}

impl From<FilterArgs> for HistoryParams {
    fn from(f: FilterArgs) -> Self {
        HistoryParams {
            provider: f.provider,
            from: f.from,
            to: f.to,
        }
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the current schedule
    Get {
        #[command(flatten)]
        remote: Remote,
    },

    /// Change one or more schedule fields
    Set {
        #[command(flatten)]
        remote: Remote,

        /// Enable or disable automatic testing
        #[arg(long)]
        enabled: Option<bool>,

        /// Seconds between automatic cycles
        #[arg(long)]
        interval: Option<u64>,

        /// openspeedtest, speedsmart or both
        #[arg(long)]
        provider: Option<String>,

        /// Seconds between providers within a cycle
        #[arg(long)]
        delay: Option<u64>,
    },
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            config,
            data_dir,
        } => {
            // The real subscriber depends on the config being resolved, so
            // resolution logs through a scoped provisional one.
            let provisional = tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
                )
                .finish();
            let mut cfg = tracing::subscriber::with_default(provisional, || {
                AppConfig::resolve(config.as_deref())
            })?;
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            if let Some(dir) = data_dir {
                cfg.storage.data_dir = dir;
            }
            init_tracing(&cfg.logging.level, cfg.logging.format);
            tracing::info!(bind = %cfg.server.bind, "starting speedchecker daemon");
            speedchecker::serve(cfg).await?;
        }
        Commands::Trigger { remote } => {
            init_tracing("warn", LogFormat::Pretty);
            let data = ApiClient::new(&remote.url)?.trigger().await?;
            print_json(&data)?;
        }
        Commands::History { remote, filter } => {
            init_tracing("warn", LogFormat::Pretty);
            let data = ApiClient::new(&remote.url)?.history(&filter.into()).await?;
            print_json(&data)?;
        }
        Commands::Export {
            remote,
            filter,
            format,
            output,
        } => {
            init_tracing("warn", LogFormat::Pretty);
            let format: ExportFormat = format.parse()?;
            let body = ApiClient::new(&remote.url)?
                .export(format, &filter.into())
                .await?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, &body)
                        .await
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    eprintln!("wrote {} bytes to {}", body.len(), path.display());
                }
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&body)?;
                }
            }
        }
        Commands::ClearHistory { remote } => {
            init_tracing("warn", LogFormat::Pretty);
            let data = ApiClient::new(&remote.url)?.clear_history().await?;
            print_json(&data)?;
        }
        Commands::Config { action } => {
            init_tracing("warn", LogFormat::Pretty);
            match action {
                ConfigAction::Get { remote } => {
                    let data = ApiClient::new(&remote.url)?.get_config().await?;
                    print_json(&data)?;
                }
                ConfigAction::Set {
                    remote,
                    enabled,
                    interval,
                    provider,
                    delay,
                } => {
                    let patch = ConfigPatch {
                        enabled,
                        interval_secs: interval,
                        provider,
                        delay_secs: delay,
                    };
                    let data = ApiClient::new(&remote.url)?.set_config(&patch).await?;
                    print_json(&data)?;
                }
            }
        }
        Commands::Status { remote } => {
            init_tracing("warn", LogFormat::Pretty);
            let data = ApiClient::new(&remote.url)?.status().await?;
            print_json(&data)?;
        }
    }

    Ok(())
}
