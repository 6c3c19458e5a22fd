//! TideMQ - clusterable MQTT broker core
//!
//! Usage:
//!   tidemq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -n, --node-id <ID>     Broker id within the cluster
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tidemq::config::Config;
use tidemq::persistence::{open_store, DurableStore};
use tidemq::Broker;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// TideMQ - clusterable MQTT broker core
#[derive(Parser, Debug)]
#[command(name = "tidemq")]
#[command(author = "TideMQ Contributors")]
#[command(version)]
#[command(about = "Clusterable MQTT v3.1.1 broker core")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker id within the cluster (overrides [cluster] node_id)
    #[arg(short, long)]
    node_id: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise defaults and env
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(node_id) = args.node_id {
        config.cluster.node_id = Some(node_id);
    }

    // CLI overrides config; RUST_LOG overrides both
    let level = args
        .log_level
        .map(LogLevel::as_str)
        .unwrap_or(config.log.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .init();

    if let Some(path) = &args.config {
        info!("Loaded configuration from {}", path.display());
    }

    let store = open_store(&config.store)?;
    let broker = Broker::start(&config, store.clone()).await?;

    info!("TideMQ broker {}", broker.node_id());
    info!("  Store: {:?}", config.store.backend);
    info!("  Shared subscriptions: {:?}", config.shared.strategy);
    info!(
        "  Retained messages: {}",
        if config.retain.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    if config.cluster.enabled {
        info!("  Cluster: enabled (channel={})", config.cluster.channel);
    } else {
        info!("  Cluster: disabled");
    }
    if config.auth.enabled {
        info!("  Auth: enabled ({} users)", config.auth.users.len());
    }
    if config.acl.enabled {
        info!("  ACL: enabled ({} roles)", config.acl.roles.len());
    }

    let flusher = spawn_flusher(store, config.store.flush_interval);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    flusher.abort();
    broker.shutdown().await;

    Ok(())
}

/// Periodically sync the store's journal
fn spawn_flusher(
    store: Arc<dyn DurableStore>,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if interval.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = store.flush().await {
                warn!("Store flush failed: {}", e);
            }
        }
    })
}
