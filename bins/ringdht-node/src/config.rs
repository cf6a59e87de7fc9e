//! Node configuration

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ringdht_dht::config::{DhtConfig, RunnerConfig};
use serde::{Deserialize, Serialize};

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network configuration
    pub network: NetworkConfig,
    /// Identity configuration
    pub identity: IdentityConfig,
    /// Bootstrap nodes
    pub bootstrap: BootstrapConfig,
    /// Persistence and storage limits
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// UDP port
    pub port: u16,
    /// IPv4 bind address
    pub bind4: Ipv4Addr,
    /// IPv6 bind address
    pub bind6: Ipv6Addr,
    /// Enable IPv4
    pub enable_ipv4: bool,
    /// Enable IPv6
    pub enable_ipv6: bool,
    /// Service port to announce under our id
    pub announce_port: Option<u16>,
}

/// Identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Certificate common name for a new identity
    pub name: String,
    /// Identity directory, defaults to `<data_dir>/identity`
    pub dir: Option<PathBuf>,
}

/// Bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Bootstrap node addresses (`host:port`)
    pub nodes: Vec<String>,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory, defaults to the platform data directory
    pub data_dir: Option<PathBuf>,
    /// Save nodes and values on shutdown, load them on startup
    pub persist: bool,
    /// Maximum keys stored
    pub max_hashes: usize,
    /// Maximum values per key
    pub max_values: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let limits = DhtConfig::default();
        Self {
            network: NetworkConfig {
                port: 4222,
                bind4: Ipv4Addr::UNSPECIFIED,
                bind6: Ipv6Addr::UNSPECIFIED,
                enable_ipv4: true,
                enable_ipv6: true,
                announce_port: None,
            },
            identity: IdentityConfig {
                name: "ringdht node".to_string(),
                dir: None,
            },
            bootstrap: BootstrapConfig {
                nodes: vec!["bootstrap.ring.cx:4222".to_string()],
            },
            storage: StorageConfig {
                data_dir: None,
                persist: true,
                max_hashes: limits.max_hashes,
                max_values: limits.max_values,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl NodeConfig {
    /// Platform default config file
    pub fn default_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join("config.toml"))
    }

    /// Load configuration from file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Load or create default configuration
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path).await
        } else {
            let config = Self::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.network.enable_ipv4 && !self.network.enable_ipv6 {
            anyhow::bail!("at least one of IPv4 and IPv6 must be enabled");
        }
        if self.network.announce_port == Some(0) {
            anyhow::bail!("announce_port must not be 0");
        }
        if self.identity.name.trim().is_empty() {
            anyhow::bail!("identity name must not be empty");
        }
        self.runner_config()
            .validate()
            .context("Invalid DHT settings")?;
        Ok(())
    }

    /// Data directory
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.storage.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.data_dir().to_path_buf()),
        }
    }

    /// Identity directory
    pub fn identity_dir(&self) -> Result<PathBuf> {
        match &self.identity.dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.data_dir()?.join("identity")),
        }
    }

    /// Runner settings
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            port: self.network.port,
            bind4: self.network.bind4,
            bind6: self.network.bind6,
            enable_ipv4: self.network.enable_ipv4,
            enable_ipv6: self.network.enable_ipv6,
            dht: DhtConfig {
                max_hashes: self.storage.max_hashes,
                max_values: self.storage.max_values,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("net", "ringdht", "ringdht-node")
        .context("Failed to determine home directory")
}
