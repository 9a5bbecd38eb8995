//! Client configuration.
//!
//! Construction is infallible — the only fallible check (a non-empty
//! credential) happens at [`crate::Client`] construction.

use std::collections::HashSet;
use std::time::Duration;

const DEFAULT_BASE_URI: &str = "https://app.launchdarkly.com";
const DEFAULT_STREAM_URI: &str = "https://stream.launchdarkly.com";
const DEFAULT_EVENTS_URI: &str = "https://events.launchdarkly.com";

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub base_uri: String,
    pub stream_uri: String,
    pub events_uri: String,
    pub stream: bool,
    pub send_events: bool,
    pub timeout: Duration,
    pub flush_interval: Duration,
    pub poll_interval: Duration,
    pub offline: bool,
    pub use_ldd: bool,
    pub all_attributes_private: bool,
    pub private_attribute_names: HashSet<String>,
    pub user_keys_capacity: usize,
    pub user_keys_flush_interval: Duration,
    pub events_capacity: usize,
    pub inline_users_in_events: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_uri: DEFAULT_BASE_URI.into(),
            stream_uri: DEFAULT_STREAM_URI.into(),
            events_uri: DEFAULT_EVENTS_URI.into(),
            stream: true,
            send_events: true,
            timeout: Duration::from_secs(10),
            flush_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(30),
            offline: false,
            use_ldd: false,
            all_attributes_private: false,
            private_attribute_names: HashSet::new(),
            user_keys_capacity: 1000,
            user_keys_flush_interval: Duration::from_secs(5 * 60),
            events_capacity: 10_000,
            inline_users_in_events: false,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Self-consuming builder: each setter consumes `self` and returns `Self`,
/// finished off with `.build()`.
#[derive(Default)]
pub struct ConfigBuilder(Config);

#[allow(dead_code)]
impl ConfigBuilder {
    pub fn base_uri(mut self, uri: impl Into<String>) -> Self {
        self.0.base_uri = uri.into();
        self
    }

    pub fn stream_uri(mut self, uri: impl Into<String>) -> Self {
        self.0.stream_uri = uri.into();
        self
    }

    pub fn events_uri(mut self, uri: impl Into<String>) -> Self {
        self.0.events_uri = uri.into();
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.0.stream = stream;
        self
    }

    pub fn send_events(mut self, send_events: bool) -> Self {
        self.0.send_events = send_events;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.0.timeout = timeout;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.0.flush_interval = interval;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.0.poll_interval = interval;
        self
    }

    pub fn offline(mut self, offline: bool) -> Self {
        self.0.offline = offline;
        self
    }

    pub fn use_ldd(mut self, use_ldd: bool) -> Self {
        self.0.use_ldd = use_ldd;
        self
    }

    pub fn all_attributes_private(mut self, all_private: bool) -> Self {
        self.0.all_attributes_private = all_private;
        self
    }

    pub fn private_attribute_name(mut self, name: impl Into<String>) -> Self {
        self.0.private_attribute_names.insert(name.into());
        self
    }

    pub fn user_keys_capacity(mut self, capacity: usize) -> Self {
        self.0.user_keys_capacity = capacity;
        self
    }

    pub fn user_keys_flush_interval(mut self, interval: Duration) -> Self {
        self.0.user_keys_flush_interval = interval;
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.0.events_capacity = capacity;
        self
    }

    pub fn inline_users_in_events(mut self, inline: bool) -> Self {
        self.0.inline_users_in_events = inline;
        self
    }

    pub fn build(self) -> Config {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert!(config.stream);
        assert!(config.send_events);
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.user_keys_capacity, 1000);
        assert_eq!(config.events_capacity, 10_000);
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = Config::builder()
            .offline(true)
            .events_capacity(50)
            .all_attributes_private(true)
            .build();
        assert!(config.offline);
        assert_eq!(config.events_capacity, 50);
        assert!(config.all_attributes_private);
    }
}
