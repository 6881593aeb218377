//! snatchd: OCI instance-snatching daemon
//!
//! Usage:
//!   snatchd [--config /etc/snatchd/config.toml]

mod daemon;
mod http;
mod instances;
mod metrics;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "snatchd", version, about = "OCI instance-snatching daemon")]
struct Cli {
    /// Path to snatchd config.toml
    #[arg(long, short = 'c', env = "SNATCHD_CONFIG", default_value = "/etc/snatchd/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SNATCHD_LOG", default_value = "info")]
    log: String,

    /// Log format (json, text)
    #[arg(long, env = "SNATCHD_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log, &cli.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "snatchd starting"
    );

    let config = snatch_core::config::SnatchConfig::load(&cli.config)?;

    daemon::run(config).await
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
