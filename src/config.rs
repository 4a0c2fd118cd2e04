// src/config.rs

//! Manages proxy configuration: loading, resolving dynamic values, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// Degraded-mode settings used when the shared store is unreachable.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FallbackConfig {
    /// If false, the proxy refuses to start when the shared store cannot be reached.
    #[serde(default = "default_fallback_enabled")]
    pub enabled: bool,
    /// Estimate of the fleet size, used to derive each replica's conservative
    /// local slice of a bucket's cap while the store is unreachable.
    #[serde(default = "default_local_limit_divisor")]
    pub local_limit_divisor: u32,
}

fn default_fallback_enabled() -> bool {
    true
}
fn default_local_limit_divisor() -> u32 {
    3
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: default_fallback_enabled(),
            local_limit_divisor: default_local_limit_divisor(),
        }
    }
}

/// Connection settings for the shared key-value store backing the coordinator.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoreConfig {
    /// A `redis://` connection URL for the shared store.
    pub url: String,
}

/// Top-level proxy settings, independent of any single bucket.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Stable identifier for this replica in the shared registry. Defaults to
    /// the machine hostname if left unset.
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(with = "humantime_serde", default = "default_session_timeout")]
    pub session_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_queue_timeout")]
    pub queue_timeout: Duration,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_heartbeat_ttl")]
    pub heartbeat_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,
    #[serde(with = "humantime_serde", default = "default_dial_timeout")]
    pub dial_timeout: Duration,
    #[serde(default)]
    pub fallback: FallbackConfig,
    pub store: StoreConfig,
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}
fn default_listen_port() -> u16 {
    1433
}
fn default_session_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_queue_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_max_queue_size() -> usize {
    100
}
fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_heartbeat_ttl() -> Duration {
    Duration::from_secs(30)
}
fn default_shutdown_grace() -> Duration {
    Duration::from_secs(15)
}
fn default_dial_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Configuration record for one backend ("bucket"). Immutable after startup.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BucketConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Global, fleet-wide cap on concurrent connections to this backend.
    pub max: u32,
    /// Per-bucket override of `proxy.queue_timeout`.
    #[serde(with = "humantime_serde", default)]
    pub queue_timeout: Option<Duration>,
    /// Per-bucket override of `proxy.dial_timeout`.
    #[serde(with = "humantime_serde", default)]
    pub connection_timeout: Option<Duration>,
    /// Warm-pool sizing hints, not consulted on the admission path (see DESIGN.md).
    #[serde(default)]
    pub min_idle: u32,
    #[serde(with = "humantime_serde", default)]
    pub max_idle_time: Option<Duration>,
}

impl BucketConfig {
    pub fn effective_queue_timeout(&self, proxy: &ProxyConfig) -> Duration {
        self.queue_timeout.unwrap_or(proxy.queue_timeout)
    }

    pub fn effective_dial_timeout(&self, proxy: &ProxyConfig) -> Duration {
        self.connection_timeout.unwrap_or(proxy.dial_timeout)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The fully loaded, validated configuration for one replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub buckets: Vec<BucketConfig>,
}

impl Config {
    /// Reads and parses a TOML configuration file, applying the `--port`
    /// override pattern used for the minimal CLI surface.
    pub fn from_file(path: &str, port_override: Option<u16>) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        if let Some(port) = port_override {
            config.proxy.listen_port = port;
        }
        if config.proxy.instance_id.is_none() {
            config.proxy.instance_id = Some(
                hostname_fallback().unwrap_or_else(|| format!("replica-{}", uuid::Uuid::new_v4())),
            );
        }

        config.validate()?;
        Ok(config)
    }

    pub fn instance_id(&self) -> &str {
        self.proxy
            .instance_id
            .as_deref()
            .expect("instance_id is always resolved by from_file")
    }

    pub fn bucket(&self, id: &str) -> Option<&BucketConfig> {
        self.buckets.iter().find(|b| b.id == id)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        if self.proxy.listen_port == 0 {
            return Err(anyhow!("proxy.listen_port cannot be 0"));
        }
        if self.buckets.is_empty() {
            return Err(anyhow!("at least one bucket must be configured"));
        }
        if self.proxy.heartbeat_ttl < self.proxy.heartbeat_interval * 3 {
            return Err(anyhow!(
                "proxy.heartbeat_ttl ({:?}) must be at least 3x proxy.heartbeat_interval ({:?})",
                self.proxy.heartbeat_ttl,
                self.proxy.heartbeat_interval
            ));
        }
        if self.proxy.fallback.local_limit_divisor == 0 {
            return Err(anyhow!("proxy.fallback.local_limit_divisor cannot be 0"));
        }
        if self.proxy.store.url.trim().is_empty() {
            return Err(anyhow!("proxy.store.url cannot be empty"));
        }

        let mut seen = std::collections::HashSet::new();
        for bucket in &self.buckets {
            if bucket.id.trim().is_empty() {
                return Err(anyhow!("bucket id cannot be empty"));
            }
            if !seen.insert(bucket.id.clone()) {
                return Err(anyhow!("duplicate bucket id '{}'", bucket.id));
            }
            if bucket.max == 0 {
                warn!(
                    bucket = %bucket.id,
                    "bucket has max=0; it will be treated as unconfigured and reject all admission"
                );
            }
            if bucket.port == 0 {
                return Err(anyhow!("bucket '{}' has port 0", bucket.id));
            }
        }

        Ok(())
    }
}

#[cfg(unix)]
fn hostname_fallback() -> Option<String> {
    std::env::var("HOSTNAME").ok().or_else(|| {
        let output = std::process::Command::new("hostname").output().ok()?;
        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            None
        }
    })
}

#[cfg(not(unix))]
fn hostname_fallback() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let file = write_config(
            r#"
            [proxy]
            store = { url = "redis://localhost:6379" }

            [[buckets]]
            id = "primary"
            host = "sql1.internal"
            port = 1433
            max = 50
            "#,
        );
        let cfg = Config::from_file(file.path().to_str().unwrap(), None).unwrap();
        assert_eq!(cfg.proxy.listen_port, 1433);
        assert_eq!(cfg.proxy.max_queue_size, 100);
        assert_eq!(cfg.buckets.len(), 1);
        assert_eq!(
            cfg.buckets[0].effective_dial_timeout(&cfg.proxy),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn port_override_wins_over_config_file() {
        let file = write_config(
            r#"
            [proxy]
            listen_port = 1433
            store = { url = "redis://localhost:6379" }

            [[buckets]]
            id = "primary"
            host = "sql1.internal"
            port = 1433
            max = 50
            "#,
        );
        let cfg = Config::from_file(file.path().to_str().unwrap(), Some(2000)).unwrap();
        assert_eq!(cfg.proxy.listen_port, 2000);
    }

    #[test]
    fn rejects_empty_bucket_list() {
        let file = write_config(
            r#"
            [proxy]
            store = { url = "redis://localhost:6379" }
            buckets = []
            "#,
        );
        assert!(Config::from_file(file.path().to_str().unwrap(), None).is_err());
    }

    #[test]
    fn rejects_heartbeat_ttl_below_3x_interval() {
        let file = write_config(
            r#"
            [proxy]
            heartbeat_interval = "10s"
            heartbeat_ttl = "20s"
            store = { url = "redis://localhost:6379" }

            [[buckets]]
            id = "primary"
            host = "sql1.internal"
            port = 1433
            max = 50
            "#,
        );
        assert!(Config::from_file(file.path().to_str().unwrap(), None).is_err());
    }

    #[test]
    fn rejects_duplicate_bucket_ids() {
        let file = write_config(
            r#"
            [proxy]
            store = { url = "redis://localhost:6379" }

            [[buckets]]
            id = "primary"
            host = "a"
            port = 1433
            max = 10

            [[buckets]]
            id = "primary"
            host = "b"
            port = 1433
            max = 10
            "#,
        );
        assert!(Config::from_file(file.path().to_str().unwrap(), None).is_err());
    }
}
