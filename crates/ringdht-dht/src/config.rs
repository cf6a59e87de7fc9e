//! DHT configuration

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DhtError, DhtResult};

/// Engine limits
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DhtConfig {
    /// Maximum distinct keys in local storage
    pub max_hashes: usize,

    /// Maximum values stored under one key
    pub max_values: usize,

    /// Maximum concurrent searches
    pub max_searches: usize,

    /// Incoming requests served per second
    pub max_requests_per_sec: u32,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            max_hashes: crate::MAX_HASHES,
            max_values: crate::MAX_VALUES,
            max_searches: crate::MAX_SEARCHES,
            max_requests_per_sec: crate::MAX_REQUESTS_PER_SEC,
        }
    }
}

impl DhtConfig {
    /// Validate configuration
    pub fn validate(&self) -> DhtResult<()> {
        if self.max_hashes == 0 || self.max_values == 0 {
            return Err(DhtError::InvalidConfig("storage limits must be > 0".into()));
        }
        if self.max_searches == 0 {
            return Err(DhtError::InvalidConfig("max_searches must be > 0".into()));
        }
        if self.max_requests_per_sec == 0 {
            return Err(DhtError::InvalidConfig("max_requests_per_sec must be > 0".into()));
        }
        Ok(())
    }
}

/// Socket and loop settings for [`DhtRunner`](crate::DhtRunner)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// UDP port for both families, 0 picks an ephemeral port
    pub port: u16,

    /// IPv4 bind address
    pub bind4: Ipv4Addr,

    /// IPv6 bind address
    pub bind6: Ipv6Addr,

    /// Bind the IPv4 socket
    pub enable_ipv4: bool,

    /// Bind the IPv6 socket
    pub enable_ipv6: bool,

    /// Read timeout of the receive threads
    pub recv_poll_interval: Duration,

    /// Longest the loop sleeps without work
    pub max_sleep: Duration,

    /// Engine limits
    pub dht: DhtConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            port: 4222,
            bind4: Ipv4Addr::UNSPECIFIED,
            bind6: Ipv6Addr::UNSPECIFIED,
            enable_ipv4: true,
            enable_ipv6: true,
            recv_poll_interval: Duration::from_millis(100),
            max_sleep: Duration::from_secs(10),
            dht: DhtConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Loopback-only configuration on an ephemeral port
    pub fn local() -> Self {
        Self {
            port: 0,
            bind4: Ipv4Addr::LOCALHOST,
            enable_ipv6: false,
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> DhtResult<()> {
        if !self.enable_ipv4 && !self.enable_ipv6 {
            return Err(DhtError::InvalidConfig("no address family enabled".into()));
        }
        if self.recv_poll_interval.is_zero() {
            return Err(DhtError::InvalidConfig("recv_poll_interval must be > 0".into()));
        }
        if self.max_sleep.is_zero() {
            return Err(DhtError::InvalidConfig("max_sleep must be > 0".into()));
        }
        self.dht.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(DhtConfig::default().validate().is_ok());
        assert!(RunnerConfig::default().validate().is_ok());
        assert!(RunnerConfig::local().validate().is_ok());
    }

    #[test]
    fn test_rejects_no_family() {
        let config = RunnerConfig {
            enable_ipv4: false,
            enable_ipv6: false,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DhtError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_limits() {
        let config = RunnerConfig {
            dht: DhtConfig {
                max_values: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
