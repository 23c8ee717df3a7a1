//! Broker configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_session_queue_size() -> usize {
    100
}

fn default_kill_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_close_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_client_parallel_publishes() -> usize {
    10
}

fn default_client_inflight_messages() -> usize {
    10
}

fn default_client_token_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Tunables for the memory backend and the per-connection engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Capacity of each session's delivery queue.
    #[serde(default = "default_session_queue_size")]
    pub session_queue_size: usize,

    /// How long a takeover waits for the killed client to exit.
    #[serde(with = "humantime_serde", default = "default_kill_timeout")]
    pub kill_timeout: Duration,

    /// How long a graceful close waits for all clients to exit.
    #[serde(with = "humantime_serde", default = "default_close_timeout")]
    pub close_timeout: Duration,

    /// Deadline for the first CONNECT on a fresh connection.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Upper bound on the keep-alive interval the broker enforces.
    /// Zero leaves the client's requested value uncapped.
    #[serde(with = "humantime_serde", default)]
    pub client_maximum_keep_alive: Duration,

    /// Size of the inbound publish-token pool (concurrent unfinished
    /// client-to-broker QoS 1/2 exchanges).
    #[serde(default = "default_client_parallel_publishes")]
    pub client_parallel_publishes: usize,

    /// Size of the outbound inflight-token pool (concurrent
    /// broker-to-client QoS 1/2 exchanges).
    #[serde(default = "default_client_inflight_messages")]
    pub client_inflight_messages: usize,

    /// How long a token acquisition may block before the connection
    /// is dropped.
    #[serde(with = "humantime_serde", default = "default_client_token_timeout")]
    pub client_token_timeout: Duration,

    /// Username/password pairs granting access. `None` admits anyone.
    #[serde(default)]
    pub credentials: Option<HashMap<String, String>>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            session_queue_size: default_session_queue_size(),
            kill_timeout: default_kill_timeout(),
            close_timeout: default_close_timeout(),
            connect_timeout: default_connect_timeout(),
            client_maximum_keep_alive: Duration::ZERO,
            client_parallel_publishes: default_client_parallel_publishes(),
            client_inflight_messages: default_client_inflight_messages(),
            client_token_timeout: default_client_token_timeout(),
            credentials: None,
        }
    }
}

impl BrokerConfig {
    #[must_use]
    pub fn with_credentials(mut self, credentials: HashMap<String, String>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn with_session_queue_size(mut self, size: usize) -> Self {
        self.session_queue_size = size;
        self
    }

    #[must_use]
    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    /// Effective keep-alive after applying the configured cap.
    #[must_use]
    pub fn effective_keep_alive(&self, requested: Duration) -> Duration {
        if self.client_maximum_keep_alive.is_zero() {
            requested
        } else if requested.is_zero() || requested > self.client_maximum_keep_alive {
            self.client_maximum_keep_alive
        } else {
            requested
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.session_queue_size, 100);
        assert_eq!(config.kill_timeout, Duration::from_secs(5));
        assert!(config.credentials.is_none());
    }

    #[test]
    fn test_effective_keep_alive() {
        let mut config = BrokerConfig::default();
        assert_eq!(
            config.effective_keep_alive(Duration::from_secs(30)),
            Duration::from_secs(30)
        );
        // No cap: a zero request disables the deadline.
        assert_eq!(config.effective_keep_alive(Duration::ZERO), Duration::ZERO);

        config.client_maximum_keep_alive = Duration::from_secs(60);
        assert_eq!(
            config.effective_keep_alive(Duration::from_secs(30)),
            Duration::from_secs(30)
        );
        assert_eq!(
            config.effective_keep_alive(Duration::from_secs(120)),
            Duration::from_secs(60)
        );
        assert_eq!(
            config.effective_keep_alive(Duration::ZERO),
            Duration::from_secs(60)
        );
    }
}
