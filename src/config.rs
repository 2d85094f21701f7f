//! Configuration for the data plane.

use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid listen address format.
    #[error("invalid listen address '{addr}': {reason}")]
    InvalidListenAddr { addr: String, reason: String },

    /// Invalid admin address format.
    #[error("invalid admin address '{addr}': {reason}")]
    InvalidAdminAddr { addr: String, reason: String },

    /// Duplicate listen and admin addresses.
    #[error("listen address and admin address cannot be the same: {addr}")]
    DuplicateAddrs { addr: String },

    /// Invalid consistent-hash ring parameter.
    #[error("invalid ring parameter: {reason}")]
    InvalidRingParam { reason: String },

    /// Invalid timeout value.
    #[error("invalid timeout value: {reason}")]
    InvalidTimeout { reason: String },

    /// Invalid queue or buffer sizing.
    #[error("invalid size value: {reason}")]
    InvalidSize { reason: String },
}

/// Bounded-load consistent-hash ring parameters, fixed at ring construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RingConfig {
    /// Number of virtual partitions on the ring.
    pub partition_count: usize,
    /// Virtual nodes placed on the ring per member.
    pub replication_factor: usize,
    /// Load-bound multiplier over the average partition share.
    pub load: f64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            partition_count: 100,
            replication_factor: 10,
            load: 1.25,
        }
    }
}

/// Proxy configuration loaded at startup.
///
/// Immutable after initialization and shared across tasks via `Arc`.
///
/// # Environment Variables
///
/// * `EDGEPROXY_LISTEN_ADDR` - Intercept listener address (default: "0.0.0.0:40001")
/// * `EDGEPROXY_ADMIN_ADDR` - Admin endpoint address (default: "127.0.0.1:9090")
/// * `EDGEPROXY_DEFAULT_STRATEGY` - Fallback LB strategy (default: "ROUND_ROBIN")
/// * `EDGEPROXY_RING_PARTITIONS` - Ring partition count (default: 100)
/// * `EDGEPROXY_RING_REPLICAS` - Ring replication factor (default: 10)
/// * `EDGEPROXY_RING_LOAD` - Ring load bound (default: 1.25)
/// * `EDGEPROXY_DIAL_TIMEOUT_MS` - Per-attempt backend dial timeout (default: 5000)
/// * `EDGEPROXY_DIAL_ATTEMPTS` - Backend dial attempts (default: 3)
/// * `EDGEPROXY_IDLE_TIMEOUT_MS` - Relay idle timeout (default: 120000)
/// * `EDGEPROXY_BUFFER_SIZE` - Relay buffer size in bytes (default: 8192)
/// * `EDGEPROXY_EVENT_QUEUE_CAPACITY` - Control-plane queue depth per kind (default: 1024)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the intercept listener binds to.
    pub listen_addr: String,

    /// Address the admin endpoints bind to.
    pub admin_addr: String,

    /// Strategy used when a service has no routing policy, or an unknown one.
    pub default_strategy: String,

    /// Consistent-hash ring parameters.
    #[serde(default)]
    pub ring: RingConfig,

    /// Per-attempt backend dial timeout.
    pub dial_timeout: Duration,

    /// Number of backend dial attempts before giving up.
    pub dial_attempts: u32,

    /// Idle timeout on a relay direction; the connection is torn down after it.
    pub idle_timeout: Duration,

    /// Relay buffer size in bytes.
    pub buffer_size: usize,

    /// Bounded capacity of each control-plane event queue.
    pub event_queue_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:40001".to_string(),
            admin_addr: "127.0.0.1:9090".to_string(),
            default_strategy: "ROUND_ROBIN".to_string(),
            ring: RingConfig::default(),
            dial_timeout: Duration::from_secs(5),
            dial_attempts: 3,
            idle_timeout: Duration::from_secs(120),
            buffer_size: 8192,
            event_queue_capacity: 1024,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

impl ProxyConfig {
    /// Loads configuration from environment variables with fallback to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            listen_addr: env::var("EDGEPROXY_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            admin_addr: env::var("EDGEPROXY_ADMIN_ADDR").unwrap_or(defaults.admin_addr),
            default_strategy: env::var("EDGEPROXY_DEFAULT_STRATEGY")
                .unwrap_or(defaults.default_strategy),
            ring: RingConfig {
                partition_count: env_parse(
                    "EDGEPROXY_RING_PARTITIONS",
                    defaults.ring.partition_count,
                ),
                replication_factor: env_parse(
                    "EDGEPROXY_RING_REPLICAS",
                    defaults.ring.replication_factor,
                ),
                load: env_parse("EDGEPROXY_RING_LOAD", defaults.ring.load),
            },
            dial_timeout: Duration::from_millis(env_parse(
                "EDGEPROXY_DIAL_TIMEOUT_MS",
                defaults.dial_timeout.as_millis() as u64,
            )),
            dial_attempts: env_parse("EDGEPROXY_DIAL_ATTEMPTS", defaults.dial_attempts),
            idle_timeout: Duration::from_millis(env_parse(
                "EDGEPROXY_IDLE_TIMEOUT_MS",
                defaults.idle_timeout.as_millis() as u64,
            )),
            buffer_size: env_parse("EDGEPROXY_BUFFER_SIZE", defaults.buffer_size),
            event_queue_capacity: env_parse(
                "EDGEPROXY_EVENT_QUEUE_CAPACITY",
                defaults.event_queue_capacity,
            ),
        }
    }

    /// Loads configuration from environment variables and validates it.
    pub fn from_env_validated() -> Result<Self, ConfigError> {
        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidListenAddr {
                addr: self.listen_addr.clone(),
                reason: e.to_string(),
            })?;

        self.admin_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidAdminAddr {
                addr: self.admin_addr.clone(),
                reason: e.to_string(),
            })?;

        if self.listen_addr == self.admin_addr {
            return Err(ConfigError::DuplicateAddrs {
                addr: self.listen_addr.clone(),
            });
        }

        if self.ring.partition_count == 0 {
            return Err(ConfigError::InvalidRingParam {
                reason: "partition count must be greater than zero".to_string(),
            });
        }
        if self.ring.replication_factor == 0 {
            return Err(ConfigError::InvalidRingParam {
                reason: "replication factor must be greater than zero".to_string(),
            });
        }
        if self.ring.load <= 1.0 {
            return Err(ConfigError::InvalidRingParam {
                reason: "load bound must exceed 1.0".to_string(),
            });
        }

        if self.dial_timeout.is_zero() || self.idle_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout {
                reason: "timeouts must be greater than zero".to_string(),
            });
        }

        if self.dial_attempts == 0 {
            return Err(ConfigError::InvalidSize {
                reason: "at least one dial attempt is required".to_string(),
            });
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidSize {
                reason: "buffer size must be greater than zero".to_string(),
            });
        }
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::InvalidSize {
                reason: "event queue capacity must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:40001");
        assert_eq!(config.admin_addr, "127.0.0.1:9090");
        assert_eq!(config.default_strategy, "ROUND_ROBIN");
        assert_eq!(config.ring.partition_count, 100);
        assert_eq!(config.ring.replication_factor, 10);
        assert_eq!(config.dial_attempts, 3);
    }

    #[test]
    fn test_validate_valid_config() {
        let config = ProxyConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_listen_addr() {
        let config = ProxyConfig {
            listen_addr: "invalid".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvalidListenAddr { .. }
        ));
    }

    #[test]
    fn test_validate_duplicate_addrs() {
        let config = ProxyConfig {
            listen_addr: "127.0.0.1:9090".to_string(),
            admin_addr: "127.0.0.1:9090".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::DuplicateAddrs { .. }
        ));
    }

    #[test]
    fn test_validate_ring_params() {
        let config = ProxyConfig {
            ring: RingConfig {
                partition_count: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvalidRingParam { .. }
        ));

        let config = ProxyConfig {
            ring: RingConfig {
                load: 1.0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvalidRingParam { .. }
        ));
    }

    #[test]
    fn test_validate_zero_timeout() {
        let config = ProxyConfig {
            dial_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvalidTimeout { .. }
        ));
    }

    #[test]
    fn test_validate_zero_queue_capacity() {
        let config = ProxyConfig {
            event_queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvalidSize { .. }
        ));
    }
}
