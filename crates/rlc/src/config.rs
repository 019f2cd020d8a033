use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{RlcError, RlcResult};

/// Static configuration shared by the connection manager and the runtime
///
/// All fields have defaults, so a partial JSON document is enough:
///
/// ```
/// let config = rlc::RlcConfig::from_json_str(r#"{ "maxConnections": 16 }"#).unwrap();
/// assert_eq!(config.max_connections, 16);
/// assert_eq!(config.message_queue_size, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RlcConfig {
    /// Hard limit on concurrently registered connections
    pub max_connections: usize,
    /// Interval between heartbeat probes
    pub heartbeat_interval_ms: u64,
    /// Silence after which a connection is force-closed
    pub connection_timeout_ms: u64,
    /// Consecutive missed heartbeats tolerated before forced cleanup
    pub max_missed_heartbeats: u32,
    /// Capacity of each connection's outbound queue
    pub message_queue_size: usize,
    /// Snapshots older than this are rejected during hydration
    pub snapshot_max_age_ms: i64,
    /// Optional server secret mixed into snapshot checksums
    pub checksum_secret: Option<String>,
    /// How long a suspended instance without subscribers is retained
    pub suspended_ttl_ms: i64,
    /// Default timeout used by request/response correlation
    pub request_timeout_ms: u64,
}

impl Default for RlcConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            heartbeat_interval_ms: 30_000,
            connection_timeout_ms: 90_000,
            max_missed_heartbeats: 3,
            message_queue_size: 100,
            snapshot_max_age_ms: 86_400_000,
            checksum_secret: None,
            suspended_ttl_ms: 300_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl RlcConfig {
    /// Parse a configuration from JSON, filling unspecified fields with defaults
    pub fn from_json_str(json: &str) -> RlcResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> RlcResult<()> {
        if self.max_connections == 0 {
            return Err(config_error("maxConnections must be greater than zero"));
        }
        if self.message_queue_size == 0 {
            return Err(config_error("messageQueueSize must be greater than zero"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(config_error("heartbeatIntervalMs must be greater than zero"));
        }
        if self.connection_timeout_ms < self.heartbeat_interval_ms {
            return Err(config_error(
                "connectionTimeoutMs must not be shorter than heartbeatIntervalMs",
            ));
        }
        if self.snapshot_max_age_ms <= 0 {
            return Err(config_error("snapshotMaxAgeMs must be greater than zero"));
        }
        if self.suspended_ttl_ms < 0 {
            return Err(config_error("suspendedTtlMs must not be negative"));
        }
        Ok(())
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_connection_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connection_timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_missed_heartbeats(mut self, max_missed: u32) -> Self {
        self.max_missed_heartbeats = max_missed;
        self
    }

    pub fn with_message_queue_size(mut self, size: usize) -> Self {
        self.message_queue_size = size;
        self
    }

    pub fn with_snapshot_max_age_ms(mut self, max_age_ms: i64) -> Self {
        self.snapshot_max_age_ms = max_age_ms;
        self
    }

    pub fn with_checksum_secret(mut self, secret: impl Into<String>) -> Self {
        self.checksum_secret = Some(secret.into());
        self
    }

    pub fn with_suspended_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.suspended_ttl_ms = ttl_ms;
        self
    }

    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn config_error(message: &str) -> RlcError {
    RlcError::Config {
        message: message.to_string(),
    }
}
