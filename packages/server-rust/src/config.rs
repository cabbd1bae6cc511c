//! Server-level configuration for the message and fleet coordination core.

use std::time::Duration;

/// Tunables of the core subsystems.
///
/// The defaults match the behaviour described in the protocol: a 4096-entry
/// outbound queue, 30-second command timeouts, 100-millisecond rate limiting
/// windows and a constant one-second reconnection backoff.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name reported in `SYS-VER` responses.
    pub server_name: String,
    /// Version string reported in `SYS-VER` responses.
    pub server_version: String,
    /// Capacity of the outbound message queue of the hub.
    pub outbound_queue_capacity: usize,
    /// How long a single asynchronous command may run before it times out.
    pub command_timeout: Duration,
    /// Interval between cleanup sweeps of the command execution manager.
    pub command_cleanup_period: Duration,
    /// Minimum delay between two dispatches of a batching rate limiter.
    pub rate_limit_delay: Duration,
    /// How long a transitioning connection state may settle before it is
    /// reported.
    pub connection_settle_timeout: Duration,
    /// How recent the previous stable state must be for a settled transient
    /// to be suppressed.
    pub stable_state_freshness: Duration,
    /// Delay between reconnection attempts of the connection supervisor.
    pub supervisor_retry_delay: Duration,
    /// Maximum number of consecutive reconnection attempts; `None` retries
    /// forever.
    pub supervisor_max_attempts: Option<u32>,
    /// Maximum number of objects the object registry accepts; `None` means
    /// unlimited.
    pub object_registry_size_limit: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "fleetlink-server".to_owned(),
            server_version: env!("CARGO_PKG_VERSION").to_owned(),
            outbound_queue_capacity: 4096,
            command_timeout: Duration::from_secs(30),
            command_cleanup_period: Duration::from_secs(1),
            rate_limit_delay: Duration::from_millis(100),
            connection_settle_timeout: Duration::from_millis(100),
            stable_state_freshness: Duration::from_millis(200),
            supervisor_retry_delay: Duration::from_secs(1),
            supervisor_max_attempts: None,
            object_registry_size_limit: None,
        }
    }
}
