//! Config schema types. All sections default so a missing file yields a
//! runnable single-instance setup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoostConfig {
    pub server: ServerConfig,
    pub bus: BusConfig,
    pub session: SessionConfig,
    pub cleanup: CleanupConfig,
    pub rate_limit: RateLimitConfig,
    pub bridge: BridgeConfig,
}

/// HTTP/WebSocket listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Global shutdown deadline in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8088,
            shutdown_timeout_secs: roost_protocol::SHUTDOWN_DEADLINE_SECS,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// PresenceBus (redis) connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub url: String,
    /// When true, an unreachable bus at startup is fatal.
    pub strict: bool,
    /// Deadline for individual bus commands, in milliseconds.
    pub command_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".into(),
            strict: false,
            command_timeout_ms: 2_000,
        }
    }
}

impl BusConfig {
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Per-session socket tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Read deadline: silence longer than this closes the connection.
    pub pong_wait_secs: u64,
    /// Deadline for one socket write.
    pub write_wait_secs: u64,
    /// Upper bound on a single inbound frame, in bytes.
    pub max_frame_bytes: usize,
    /// Capacity of the outbound queue.
    pub outbound_capacity: usize,
    /// Bounded wait when handing an inbound frame to the hub, in seconds.
    pub hub_handoff_wait_secs: u64,
    /// Grace period for pumps to drain on shutdown, in seconds.
    pub graceful_grace_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pong_wait_secs: roost_protocol::PONG_WAIT_SECS,
            write_wait_secs: roost_protocol::WRITE_WAIT_SECS,
            max_frame_bytes: roost_protocol::DEFAULT_MAX_FRAME_BYTES,
            outbound_capacity: roost_protocol::OUTBOUND_QUEUE_CAPACITY,
            hub_handoff_wait_secs: roost_protocol::HUB_HANDOFF_WAIT_SECS,
            graceful_grace_secs: roost_protocol::GRACEFUL_GRACE_SECS,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    #[must_use]
    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(roost_protocol::ping_period_secs(self.pong_wait_secs))
    }

    #[must_use]
    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    #[must_use]
    pub fn hub_handoff_wait(&self) -> Duration {
        Duration::from_secs(self.hub_handoff_wait_secs)
    }

    #[must_use]
    pub fn graceful_grace(&self) -> Duration {
        Duration::from_secs(self.graceful_grace_secs)
    }
}

/// Stale-connection eviction and application heartbeat settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub inactivity_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub max_heartbeat_failures: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 300,
            cleanup_interval_secs: 60,
            heartbeat_interval_secs: 30,
            max_heartbeat_failures: 3,
        }
    }
}

impl CleanupConfig {
    #[must_use]
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Sliding-window budgets, enforced through the PresenceBus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Messages allowed per (user, channel) window.
    pub message_limit: u64,
    pub message_window_secs: u64,
    /// WebSocket upgrades allowed per user window.
    pub socket_limit: u64,
    pub socket_window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            message_limit: 10,
            message_window_secs: 60,
            socket_limit: 30,
            socket_window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    #[must_use]
    pub fn message_window(&self) -> Duration {
        Duration::from_secs(self.message_window_secs)
    }

    #[must_use]
    pub fn socket_window(&self) -> Duration {
        Duration::from_secs(self.socket_window_secs)
    }
}

/// Cross-instance bridge reconnect and circuit-breaker settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub reconnect_base_secs: u64,
    pub reconnect_cap_secs: u64,
    pub reconnect_attempts: u32,
    /// Consecutive connection-class errors before the circuit opens.
    pub circuit_error_threshold: u32,
    pub circuit_open_timeout_secs: u64,
    pub health_ping_interval_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            reconnect_base_secs: 5,
            reconnect_cap_secs: 30,
            reconnect_attempts: 5,
            circuit_error_threshold: 3,
            circuit_open_timeout_secs: 30,
            health_ping_interval_secs: 15,
        }
    }
}

impl BridgeConfig {
    #[must_use]
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_secs(self.reconnect_base_secs)
    }

    #[must_use]
    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_secs(self.reconnect_cap_secs)
    }

    #[must_use]
    pub fn circuit_open_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_open_timeout_secs)
    }

    #[must_use]
    pub fn health_ping_interval(&self) -> Duration {
        Duration::from_secs(self.health_ping_interval_secs)
    }
}
