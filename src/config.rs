//! Configuration for the server

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

const DEFAULT_METRICS_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9117);

/// Server configuration
///
/// The config is usually loaded from a file with [`Self::load`].
///
/// The struct also implements [`Default`] which creates a config suitable for local development
/// and testing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Config for the client-facing server, websockets and health checks.
    pub public: ListenConfig,
    /// Config for the peer-facing server carrying internal notifications.
    pub internal: ListenConfig,
    /// Base urls of the other server instances to notify on commits.
    #[serde(default)]
    pub peers: Vec<Url>,
    /// Sync engine tunables.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Per-connection rate limits.
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    /// Config for the metrics server.
    ///
    /// The metrics server is started by default. To disable the metrics server, set to
    /// `Some(MetricsConfig::disabled())`.
    pub metrics: Option<MetricsConfig>,
}

/// One listening socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Port to listen on.
    pub port: u16,
    /// Optionally set a custom address to bind to, defaults to all interfaces.
    pub bind_addr: Option<IpAddr>,
}

impl ListenConfig {
    /// The address to bind.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(
            self.bind_addr
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            self.port,
        )
    }
}

/// Tunables of the push and catch-up engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How long a log gap may stay open before it is plugged with
    /// rollback markers.
    #[serde(with = "humantime_serde")]
    pub gap_grace: Duration,
    /// Interval of the liveness pings, which double as a resync trigger.
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    /// Accumulated log bytes per cursor after which the receiving client
    /// is asked to upload a compacted bundle.
    pub bundle_trigger_bytes: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            gap_grace: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            bundle_trigger_bytes: 50 * 1024,
        }
    }
}

/// Token bucket sizes, per connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Burst capacity for data operations.
    pub data_ops_capacity: u32,
    /// Refill rate for data operations.
    pub data_ops_per_sec: u32,
    /// Burst capacity for bundle chunk uploads.
    pub file_ops_capacity: u32,
    /// Refill rate for bundle chunk uploads.
    pub file_ops_per_sec: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            data_ops_capacity: 100,
            data_ops_per_sec: 20,
            file_ops_capacity: 50,
            file_ops_per_sec: 10,
        }
    }
}

/// The config for the metrics server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Set to true to disable the metrics server.
    pub disabled: bool,
    /// Optionally set a custom address to bind to.
    pub bind_addr: Option<SocketAddr>,
}

impl MetricsConfig {
    /// Disable the metrics server.
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            bind_addr: None,
        }
    }
}

impl Config {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config> {
        let s = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("failed to read {}", path.as_ref().to_string_lossy()))?;
        let config: Config = toml::from_str(&s)?;
        Ok(config)
    }

    /// Get the data directory.
    pub fn data_dir() -> Result<PathBuf> {
        let dir = if let Some(val) = env::var_os("LOCKSTEP_DATA_DIR") {
            PathBuf::from(val)
        } else {
            let path = dirs_next::data_dir().ok_or_else(|| {
                anyhow!("operating environment provides no directory for application data")
            })?;
            path.join("lockstep")
        };
        Ok(dir)
    }

    /// Get the path to the store database file.
    pub fn store_db_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("transaction-log-1.db"))
    }

    /// Get the directory bundle blobs are stored under.
    pub fn bundle_dir() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("bundles"))
    }

    /// Get the address where the metrics server should be bound, if set.
    pub(crate) fn metrics_addr(&self) -> Option<SocketAddr> {
        match &self.metrics {
            None => Some(DEFAULT_METRICS_ADDR),
            Some(conf) => match conf.disabled {
                true => None,
                false => Some(conf.bind_addr.unwrap_or(DEFAULT_METRICS_ADDR)),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            public: ListenConfig {
                port: 8080,
                bind_addr: None,
            },
            internal: ListenConfig {
                port: 9000,
                bind_addr: None,
            },
            peers: Vec::new(),
            sync: SyncConfig::default(),
            rate_limits: RateLimitConfig::default(),
            metrics: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_parses_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            peers = ["http://10.0.0.7:9000/", "http://10.0.0.8:9000/"]

            [public]
            port = 8080

            [internal]
            port = 9000
            bind_addr = "127.0.0.1"

            [sync]
            gap_grace = "10s"
            ping_interval = "30s"
            bundle_trigger_bytes = 51200
            "#,
        )
        .unwrap();

        assert_eq!(config.public.socket_addr().to_string(), "0.0.0.0:8080");
        assert_eq!(config.internal.socket_addr().to_string(), "127.0.0.1:9000");
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.sync.gap_grace, Duration::from_secs(10));
        // omitted sections fall back to their defaults
        assert_eq!(config.rate_limits.data_ops_capacity, 100);
        assert_eq!(
            config.metrics_addr().map(|a| a.to_string()),
            Some("127.0.0.1:9117".into())
        );
    }
}
