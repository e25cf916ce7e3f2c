//! Connection-level options.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options controlling connection behavior.
///
/// The reconnect policy is deliberately simple: a fixed delay and
/// unbounded attempts, so a relay bounce self-heals without user action.
///
/// # Example
///
/// ```rust
/// use robofleet_link::ConnectionOptions;
///
/// let options = ConnectionOptions::default()
///     .with_reconnect_delay_ms(500)
///     .with_time_travel_capacity(256);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Enable automatic reconnection on connection loss.
    /// Default: true.
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// Fixed delay in milliseconds between reconnection attempts.
    /// Default: 2000 ms. No backoff; retries never stop.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Timeout for establishing the WebSocket connection (TCP + TLS +
    /// handshake). Default: 10 seconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Capacity of the time-travel ring buffer of recent inbound frames.
    /// Set to 0 to disable recording. Default: 128.
    #[serde(default = "default_time_travel_capacity")]
    pub time_travel_capacity: usize,
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_reconnect_delay_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_time_travel_capacity() -> usize {
    128
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_delay_ms: 2000,
            connect_timeout_ms: 10_000,
            time_travel_capacity: 128,
        }
    }
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether to automatically reconnect on connection loss.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the fixed delay between reconnection attempts (milliseconds).
    pub fn with_reconnect_delay_ms(mut self, delay_ms: u64) -> Self {
        self.reconnect_delay_ms = delay_ms;
        self
    }

    /// Set the connection establishment timeout (milliseconds).
    pub fn with_connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    /// Set the time-travel ring buffer capacity (0 disables recording).
    pub fn with_time_travel_capacity(mut self, capacity: usize) -> Self {
        self.time_travel_capacity = capacity;
        self
    }

    pub(crate) fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ConnectionOptions::default();
        assert!(options.auto_reconnect);
        assert_eq!(options.reconnect_delay_ms, 2000);
        assert_eq!(options.time_travel_capacity, 128);
    }

    #[test]
    fn test_builder_setters() {
        let options = ConnectionOptions::new()
            .with_auto_reconnect(false)
            .with_reconnect_delay_ms(100)
            .with_connect_timeout_ms(1500)
            .with_time_travel_capacity(0);
        assert!(!options.auto_reconnect);
        assert_eq!(options.reconnect_delay(), Duration::from_millis(100));
        assert_eq!(options.connect_timeout(), Duration::from_millis(1500));
        assert_eq!(options.time_travel_capacity, 0);
    }
}
