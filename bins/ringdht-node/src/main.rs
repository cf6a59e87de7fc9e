//! ringdht Node
//!
//! Runs a DHT node: loads or creates its identity, restores saved nodes and
//! values, joins the network through the bootstrap nodes and optionally
//! announces a service port under its id. State is saved on Ctrl-C.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ringdht_crypto::IdentityPaths;
use ringdht_dht::{persist, DhtRunner, ServiceAnnouncement, Value, ValueType};

mod config;

use config::NodeConfig;

/// ringdht DHT node
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bootstrap nodes (comma-separated host:port)
    #[arg(short, long)]
    bootstrap: Option<String>,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Service port to announce
    #[arg(short, long)]
    announce: Option<u16>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => NodeConfig::default_path()?,
    };
    let mut config = NodeConfig::load_or_create(&config_path).await?;
    if let Some(port) = args.port {
        config.network.port = port;
    }
    if let Some(bootstrap) = &args.bootstrap {
        config.bootstrap.nodes = bootstrap.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = Some(dir.clone());
    }
    if let Some(port) = args.announce {
        config.network.announce_port = Some(port);
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    config.validate()?;

    // Setup logging
    let level = match config.logging.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::default().add_directive(LevelFilter::from_level(level).into()),
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting ringdht node...");
    info!("Config: {}", config_path.display());

    let data_dir = config.data_dir()?;
    let identity = IdentityPaths::in_dir(config.identity_dir()?)
        .load_or_generate(&config.identity.name)
        .context("Failed to load identity")?;
    info!("Node ID: {}", identity.id());

    let mut runner = DhtRunner::new();
    runner
        .run_with_config(
            config.runner_config(),
            &identity,
            Some(Box::new(|v4, v6| info!("Connectivity: IPv4 {}, IPv6 {}", v4, v6))),
            true,
        )
        .context("Failed to start DHT")?;

    let nodes_path = data_dir.join("nodes.txt");
    let values_dir = data_dir.join("values");
    if config.storage.persist {
        let nodes = persist::load_nodes(&nodes_path).context("Failed to load saved nodes")?;
        info!("Restoring {} saved nodes", nodes.len());
        runner.bootstrap_nodes(nodes);

        let values = persist::load_values(&values_dir).context("Failed to load saved values")?;
        runner.import_values(&values)?;
    }

    let bootstrap = resolve_bootstrap(&config.bootstrap.nodes);
    info!("Bootstrap nodes: {:?}", bootstrap);
    runner.bootstrap(bootstrap);

    if let Some(port) = config.network.announce_port {
        let announcement = Value::new(
            ValueType::SERVICE_ANNOUNCEMENT,
            ServiceAnnouncement { port }.to_bytes(),
        );
        runner.put(
            identity.id(),
            announcement,
            Some(Box::new(move |ok| {
                if ok {
                    info!("Announced service port {}", port);
                } else {
                    warn!("Failed to announce service port {}", port);
                }
            })),
        );
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut stats = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("Failed to listen for shutdown signal")?;
                break;
            }
            _ = stats.tick() => {
                let (v4, v6) = runner.status();
                info!("Stats: {} good nodes, IPv4 {}, IPv6 {}", runner.get_nodes().len(), v4, v6);
            }
        }
    }

    info!("Shutting down...");
    if config.storage.persist {
        if let Err(e) = persist::save_nodes(&nodes_path, &runner.get_nodes()) {
            warn!("Failed to save nodes: {}", e);
        }
        if let Err(e) = persist::save_values(&values_dir, &runner.export_values()) {
            warn!("Failed to save values: {}", e);
        }
    }
    runner.join();

    Ok(())
}

/// Resolve `host:port` entries, skipping those that fail
fn resolve_bootstrap(entries: &[String]) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();
    for entry in entries {
        match entry.to_socket_addrs() {
            Ok(resolved) => addrs.extend(resolved),
            Err(e) => warn!("Cannot resolve bootstrap node {}: {}", entry, e),
        }
    }
    addrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_bootstrap_skips_bad_entries() {
        let entries = vec![
            "127.0.0.1:4222".to_string(),
            "not an address".to_string(),
            "[::1]:4223".to_string(),
        ];
        let addrs = resolve_bootstrap(&entries);
        assert_eq!(
            addrs,
            vec![
                "127.0.0.1:4222".parse::<SocketAddr>().unwrap(),
                "[::1]:4223".parse::<SocketAddr>().unwrap(),
            ]
        );
    }
}
