//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for a [`Client`](crate::Client) instance.
///
/// Only `domain` is required; everything else has a workable default.
/// Timing fields are in milliseconds so the struct round-trips cleanly
/// through JSON config files.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend host, optionally with a port (`"dvr.example.com:8443"`).
    pub domain: String,
    /// Username for cookie-session authentication.
    pub username: Option<String>,
    /// Password for cookie-session authentication.
    pub password: Option<String>,
    /// Use `https`/`wss` rather than `http`/`ws`.
    pub use_tls: bool,
    /// Default deadline applied to requests that do not set their own.
    pub request_timeout_ms: u64,
    /// Interval between heartbeats while a session is held.
    pub heartbeat_interval_ms: u64,
    /// How many requests the scheduler lets run at once.
    pub concurrent_limit: usize,
    /// Debounce window for coalescing live-collection update callbacks.
    pub update_debounce_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            username: None,
            password: None,
            use_tls: true,
            request_timeout_ms: 30_000,
            heartbeat_interval_ms: 50_000,
            concurrent_limit: 3,
            update_debounce_ms: 10,
        }
    }
}

impl ClientConfig {
    /// Configuration for `domain` with all defaults.
    #[must_use]
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Self::default()
        }
    }

    /// Set session credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub(crate) fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub(crate) fn update_debounce(&self) -> Duration {
        Duration::from_millis(self.update_debounce_ms)
    }

    /// Absolute HTTP URL for `path` on the configured domain.
    pub(crate) fn http_url(&self, path: &str) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{scheme}://{}{path}", self.domain)
    }

    /// URL of the persistent socket endpoint.
    pub(crate) fn socket_url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!("{scheme}://{}/API/primary", self.domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::new("dvr.example.com");
        assert_eq!(config.domain, "dvr.example.com");
        assert!(config.use_tls);
        assert_eq!(config.request_timeout_ms, 30_000);
        assert_eq!(config.heartbeat_interval_ms, 50_000);
        assert_eq!(config.concurrent_limit, 3);
        assert_eq!(config.update_debounce_ms, 10);
    }

    #[test]
    fn urls_follow_tls_flag() {
        let mut config = ClientConfig::new("dvr.example.com:8443");
        assert_eq!(
            config.http_url("/API/logOn.js"),
            "https://dvr.example.com:8443/API/logOn.js"
        );
        assert_eq!(config.socket_url(), "wss://dvr.example.com:8443/API/primary");

        config.use_tls = false;
        assert_eq!(config.http_url("/ping"), "http://dvr.example.com:8443/ping");
        assert_eq!(config.socket_url(), "ws://dvr.example.com:8443/API/primary");
    }

    #[test]
    fn parses_partial_json() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"domain":"dvr.local","use_tls":false}"#).unwrap();
        assert_eq!(config.domain, "dvr.local");
        assert!(!config.use_tls);
        assert_eq!(config.concurrent_limit, 3);
    }
}
