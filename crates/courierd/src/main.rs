//! courierd: store-and-forward relay for encrypted courier transfers
//!
//! Usage:
//!   courierd [--config /etc/courier/courier.toml] [--log debug] [--log-format json]
//!
//! The relay accepts transfer records over gRPC, keeps them in a mailbox keyed
//! by recipient, and hands them out on request. It never holds a key that can
//! decrypt what it stores.

mod daemon;
mod grpc;
mod metrics;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::Path;
use std::path::PathBuf;
use tracing::info;

use courier_core::config::CourierConfig;

#[derive(Parser, Debug)]
#[command(name = "courierd", version, about = "courier transfer relay")]
struct Cli {
    /// Path to courier.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "COURIER_CONFIG",
        default_value = "/etc/courier/courier.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides logging.level
    #[arg(long, env = "COURIER_LOG")]
    log: Option<String>,

    /// Log format; overrides logging.format
    #[arg(long, env = "COURIER_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration (before logging: it carries the default level and format)
    let (config, found) = load_config(&cli.config).await?;

    let level = cli.log.as_deref().unwrap_or(&config.logging.level);
    let format = match cli.log_format {
        Some(format) => format,
        None => LogFormat::from_str(&config.logging.format, true)
            .map_err(|e| anyhow::anyhow!("logging.format: {e}"))?,
    };
    init_logging(level, &format);

    if !found {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        listen = %config.relay.listen,
        "courierd starting"
    );

    daemon::run(config).await
}

async fn load_config(path: &Path) -> Result<(CourierConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = CourierConfig::from_toml(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((CourierConfig::default(), false))
    }
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
