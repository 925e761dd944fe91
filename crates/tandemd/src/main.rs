//! tandemd: tandem sync daemon
//!
//! Usage:
//!   tandemd [--config /etc/tandem/config.toml] [--peer host:port]...
//!
//! Runs one replica: dials configured peers, accepts inbound sessions, and
//! serves /metrics, /healthz, /readyz and a small JSON status API.

mod api;
mod daemon;
mod metrics;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use tandem_core::config::TandemConfig;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tandemd", version, about = "tandem sync daemon")]
struct Cli {
    /// Path to tandem.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "TANDEM_CONFIG",
        default_value = "/etc/tandem/config.toml"
    )]
    config: PathBuf,

    /// Extra peer to dial (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Override the replica data directory
    #[arg(long, env = "TANDEM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TANDEM_LOG")]
    log: Option<String>,

    /// Log format (json, text)
    #[arg(long, env = "TANDEM_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config).await?;
    config.sync.peers.extend(cli.peers.iter().cloned());
    if let Some(dir) = &cli.data_dir {
        config.replica.data_dir = dir.clone();
    }

    let level = cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone());
    let format = match cli.log_format.clone() {
        Some(format) => format,
        None => LogFormat::from_str(&config.daemon.log_format, true)
            .map_err(|e| anyhow::anyhow!("daemon.log_format: {e}"))?,
    };
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "tandemd starting"
    );

    daemon::run(config).await
}

async fn load_config(path: &Path) -> Result<TandemConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        TandemConfig::from_toml(&content)
            .with_context(|| format!("parsing config {}", path.display()))
    } else {
        // Logging is not up yet.
        eprintln!(
            "tandemd: config file not found: {}  (using defaults)",
            path.display()
        );
        Ok(TandemConfig::default())
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

/// Expand a leading `~/` to the user's home directory.
pub(crate) fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_parse() {
        let cli = Cli::try_parse_from([
            "tandemd",
            "-c",
            "/tmp/tandem.toml",
            "--peer",
            "10.0.0.2:7461",
            "--peer",
            "10.0.0.3:7461",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/tandem.toml"));
        assert_eq!(cli.peers.len(), 2);
        assert_eq!(cli.log_format, Some(LogFormat::Json));
    }

    #[test]
    fn tilde_expands_to_home() {
        std::env::set_var("HOME", "/home/ada");
        assert_eq!(
            expand_tilde(Path::new("~/.local/share/tandem")),
            PathBuf::from("/home/ada/.local/share/tandem")
        );
        assert_eq!(expand_tilde(Path::new("/var/lib/tandem")), PathBuf::from("/var/lib/tandem"));
    }

    #[tokio::test]
    async fn missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.daemon.log_level, "info");
    }
}
