use serde::Deserialize;
use std::time::Duration;

/// Timeouts and limits for connections, discovery and invocation.
///
/// Read from the `[settings]` table of the config file; every field has a
/// default so the table may be omitted.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HubSettings {
    /// Bound on spawning/connecting plus the `initialize` exchange.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Bound on every request after the handshake.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Bound on listing one server's tools during a refresh.
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_secs: u64,
    /// How many servers are connected or enumerated at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_discovery: usize,
    /// Periodic sync + refresh interval. Set to 0 to disable.
    #[serde(default)]
    pub refresh_interval_secs: u64,
    /// Buffer of the change-event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_handshake_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_discovery_timeout() -> u64 {
    15
}
fn default_max_concurrent() -> usize {
    8
}
fn default_event_capacity() -> usize {
    64
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout(),
            request_timeout_secs: default_request_timeout(),
            discovery_timeout_secs: default_discovery_timeout(),
            max_concurrent_discovery: default_max_concurrent(),
            refresh_interval_secs: 0,
            event_capacity: default_event_capacity(),
        }
    }
}

impl HubSettings {
    /// [`HubSettings::handshake_timeout_secs`] as a `Duration`.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// [`HubSettings::request_timeout_secs`] as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// [`HubSettings::discovery_timeout_secs`] as a `Duration`.
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    /// `None` when periodic refresh is disabled.
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }

    /// Discovery concurrency, at least 1.
    pub fn concurrency(&self) -> usize {
        self.max_concurrent_discovery.max(1)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings: HubSettings = toml::from_str("").unwrap();
        assert_eq!(settings, HubSettings::default());
        assert_eq!(settings.request_timeout(), Duration::from_secs(30));
        assert!(settings.refresh_interval().is_none());
    }

    #[test]
    fn test_settings_custom_values() {
        let settings: HubSettings = toml::from_str(
            "request_timeout_secs = 5\nrefresh_interval_secs = 120\nmax_concurrent_discovery = 0",
        )
        .unwrap();
        assert_eq!(settings.request_timeout_secs, 5);
        assert_eq!(settings.refresh_interval(), Some(Duration::from_secs(120)));
        assert_eq!(settings.concurrency(), 1);
        assert_eq!(settings.handshake_timeout_secs, 10);
    }
}
