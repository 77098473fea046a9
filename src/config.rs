//! Configuration structs with the protocol defaults.
//!
//! All durations are expressed in milliseconds when (de)serialized, e.g.
//!
//! ```json
//! { "ack_timeout": 10000, "response_timeout": 20000,
//!   "batch": { "interval": 200 },
//!   "store": { "max_age": 3600000, "cleanup_interval": 180000 } }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hub::OpenRequest;
use crate::message::new_id;

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(20_000);
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_MAX_AGE: Duration = Duration::from_millis(60 * 60 * 1000);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_millis(3 * 60 * 1000);
pub const DEFAULT_NOTIFY_CAPACITY: usize = 256;

/// Batcher settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Interval at which a non-empty buffer is drained
    #[serde(with = "millis")]
    pub interval: Duration,
    /// Drain as soon as this many messages are buffered
    pub max_size: Option<usize>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_BATCH_INTERVAL,
            max_size: None,
        }
    }
}

/// In-memory store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Max message lifetime
    #[serde(with = "millis")]
    pub max_age: Duration,
    /// Expired messages are swept periodically; zero disables the sweep
    #[serde(with = "millis")]
    pub cleanup_interval: Duration,
    /// Per-topic notification buffer
    pub notify_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_MAX_AGE,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
        }
    }
}

/// Assigns an id to a client on first contact
#[derive(Clone)]
pub struct ClientIdGenerator(Arc<dyn Fn(&OpenRequest) -> String + Send + Sync>);

impl ClientIdGenerator {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&OpenRequest) -> String + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn assign(&self, request: &OpenRequest) -> String {
        (self.0)(request)
    }
}

impl Default for ClientIdGenerator {
    fn default() -> Self {
        Self::new(|_| new_id())
    }
}

impl fmt::Debug for ClientIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClientIdGenerator(..)")
    }
}

/// Hub settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// How long `Hub::send` waits for an ack
    #[serde(with = "millis")]
    pub ack_timeout: Duration,
    /// Upper bound on how long a session holds a request open
    #[serde(with = "millis")]
    pub response_timeout: Duration,
    pub batch: BatchConfig,
    pub store: StoreConfig,
    /// Client id the hub acknowledges inbound messages with
    pub server_id: String,
    /// Buffer of the inbound message broadcast
    pub inbound_capacity: usize,
    #[serde(skip)]
    pub client_id: ClientIdGenerator,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            batch: BatchConfig::default(),
            store: StoreConfig::default(),
            server_id: "server".to_string(),
            inbound_capacity: DEFAULT_NOTIFY_CAPACITY,
            client_id: ClientIdGenerator::default(),
        }
    }
}

impl HubConfig {
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch.interval = interval;
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_client_id<F>(mut self, f: F) -> Self
    where
        F: Fn(&OpenRequest) -> String + Send + Sync + 'static,
    {
        self.client_id = ClientIdGenerator::new(f);
        self
    }

    /// Parse a JSON config document; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol() {
        let config = HubConfig::default();
        assert_eq!(config.ack_timeout, Duration::from_secs(10));
        assert_eq!(config.response_timeout, Duration::from_secs(20));
        assert_eq!(config.batch.interval, Duration::from_millis(200));
        assert_eq!(config.store.max_age, Duration::from_secs(3600));
        assert_eq!(config.store.cleanup_interval, Duration::from_secs(180));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            HubConfig::from_json(r#"{"response_timeout": 50, "store": {"max_age": 1000}}"#)
                .unwrap();
        assert_eq!(config.response_timeout, Duration::from_millis(50));
        assert_eq!(config.store.max_age, Duration::from_secs(1));
        assert_eq!(config.store.cleanup_interval, DEFAULT_CLEANUP_INTERVAL);
        assert_eq!(config.ack_timeout, DEFAULT_ACK_TIMEOUT);
        assert_eq!(config.server_id, "server");
    }

    #[test]
    fn custom_client_id_generator() {
        let config = HubConfig::default().with_client_id(|_| "fixed".to_string());
        assert_eq!(config.client_id.assign(&OpenRequest::default()), "fixed");
    }
}
