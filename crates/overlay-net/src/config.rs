//! Node transport configuration
//!
//! A JSON document describing which channels a node runs. Every field has a
//! default; durations are written as milliseconds.
//!
//! ```json
//! {
//!   "system_name": "alice",
//!   "direct": { "listen": "0.0.0.0:22527", "peers": ["10.0.0.2:22527"] },
//!   "relay": { "url": "tcp://relay.example.org:22528", "max_retries": 3 }
//! }
//! ```

use crate::arq::ArqConfig;
use crate::dedup::DEFAULT_DEDUP_CAPACITY;
use crate::direct::{
    DirectConfig, DirectTransportChannel, DEFAULT_DIRECT_PORT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_IDLE_TIMEOUT,
};
use crate::framing::DEFAULT_MAX_FRAME_SIZE;
use crate::local::{LocalDiscovery, LocalTransportChannel};
use crate::relay::protocol::DEFAULT_MAX_LINE_LENGTH;
use crate::relay::{self, RelayConfig, DEFAULT_JOIN_TIMEOUT, DEFAULT_PING_INTERVAL};
use crate::retry::{RetryConfig, DEFAULT_FORGET_DELAY, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY};
use crate::transport::{Transport, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_STARTUP_TIMEOUT};
use overlay_core::KeyPair;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Durations as integer milliseconds
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Settings for the direct channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectSettings {
    pub listen: SocketAddr,
    /// Peers dialed on start
    pub peers: Vec<SocketAddr>,
    #[serde(with = "millis")]
    pub handshake_timeout: Duration,
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for DirectSettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_DIRECT_PORT)),
            peers: Vec::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Settings for the relay channel and its reconnect policy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// `host:port` or `tcp://host:port`
    pub url: String,
    #[serde(with = "millis")]
    pub join_timeout: Duration,
    pub channel: String,
    #[serde(with = "millis")]
    pub retry_delay: Duration,
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub forget_delay: Duration,
    #[serde(with = "millis")]
    pub ping_interval: Duration,
    pub max_line_length: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            channel: "default".to_string(),
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
            forget_delay: DEFAULT_FORGET_DELAY,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Everything needed to assemble a node's [`Transport`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Name announced to peers
    pub system_name: String,
    #[serde(with = "millis")]
    pub startup_timeout: Duration,
    #[serde(with = "millis")]
    pub shutdown_timeout: Duration,
    /// Message ids remembered per connection for duplicate detection
    pub dedup_capacity: usize,
    pub arq: ArqConfig,
    /// Run the in-process channel
    pub local: bool,
    pub direct: Option<DirectSettings>,
    pub relay: Option<RelaySettings>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            system_name: "overlay-node".to_string(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            arq: ArqConfig::default(),
            local: false,
            direct: None,
            relay: None,
        }
    }
}

impl TransportConfig {
    /// Load from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| Err(ConfigError::Invalid(reason.to_string()));

        if self.system_name.trim().is_empty() {
            return invalid("system_name cannot be empty");
        }
        if self.dedup_capacity == 0 {
            return invalid("dedup_capacity must be positive");
        }
        if self.arq.window_size == 0 {
            return invalid("arq.window_size must be positive");
        }
        if self.arq.retry_timeout.is_zero() {
            return invalid("arq.retry_timeout must be positive");
        }
        if let Some(direct) = &self.direct {
            if direct.idle_timeout.is_zero() || direct.handshake_timeout.is_zero() {
                return invalid("direct timeouts must be positive");
            }
            if direct.max_frame_size < 64 {
                return invalid("direct.max_frame_size is too small");
            }
        }
        if let Some(relay) = &self.relay {
            if relay.url.trim().is_empty() {
                return invalid("relay.url cannot be empty");
            }
            if relay.max_retries == 0 {
                return invalid("relay.max_retries must be at least 1");
            }
        }
        if self.direct.is_none() && self.relay.is_none() && !self.local {
            return invalid("no channel configured");
        }
        Ok(())
    }

    /// Assemble a [`Transport`] with channels in priority order: direct,
    /// local, then the reconnecting relay. Without a shared `discovery` the
    /// local channel gets a registry of its own.
    pub fn build(&self, keypair: KeyPair, discovery: Option<LocalDiscovery>) -> Result<Transport, ConfigError> {
        self.validate()?;

        let identity = keypair.identity();
        let mut builder = Transport::builder(identity)
            .startup_timeout(self.startup_timeout)
            .shutdown_timeout(self.shutdown_timeout);
        let sink = builder.sink();

        if let Some(direct) = &self.direct {
            let config = DirectConfig {
                listen: direct.listen,
                peers: direct.peers.clone(),
                system_name: self.system_name.clone(),
                handshake_timeout: direct.handshake_timeout,
                idle_timeout: direct.idle_timeout,
                max_frame_size: direct.max_frame_size,
                arq: self.arq.clone(),
                dedup_capacity: self.dedup_capacity,
            };
            builder = builder.channel(Arc::new(DirectTransportChannel::new(keypair, config, sink.clone())));
        }

        if self.local {
            let discovery = discovery.unwrap_or_default();
            builder = builder.channel(Arc::new(LocalTransportChannel::new(
                identity,
                discovery,
                sink.clone(),
                self.dedup_capacity,
            )));
        }

        if let Some(settings) = &self.relay {
            let config = RelayConfig {
                url: settings.url.clone(),
                join_timeout: settings.join_timeout,
                system_name: self.system_name.clone(),
                channel: settings.channel.clone(),
                retry: RetryConfig {
                    delay: settings.retry_delay,
                    max_retries: settings.max_retries,
                    forget_delay: settings.forget_delay,
                },
                ping_interval: settings.ping_interval,
                dedup_capacity: self.dedup_capacity,
                max_line_length: settings.max_line_length,
            };
            builder = builder.channel(Arc::new(relay::with_retry(identity, config, sink)));
        }

        let transport = builder.build();
        info!(
            "Transport for {} configured with channels: {}",
            identity,
            transport
                .channels()
                .iter()
                .map(|channel| channel.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = TransportConfig::from_json_str(
            r#"{ "system_name": "alice", "relay": { "url": "tcp://127.0.0.1:9", "max_retries": 3 } }"#,
        )
        .unwrap();

        assert_eq!(config.system_name, "alice");
        assert_eq!(config.startup_timeout, DEFAULT_STARTUP_TIMEOUT);
        assert!(config.direct.is_none());
        let relay = config.relay.unwrap();
        assert_eq!(relay.max_retries, 3);
        assert_eq!(relay.retry_delay, DEFAULT_RETRY_DELAY);
        assert_eq!(relay.channel, "default");
    }

    #[test]
    fn test_durations_are_milliseconds() {
        let config = TransportConfig::from_json_str(
            r#"{ "local": true, "startup_timeout": 1500, "arq": { "retry_timeout": 40 },
                 "direct": { "listen": "127.0.0.1:0", "idle_timeout": 2000 } }"#,
        )
        .unwrap();

        assert_eq!(config.startup_timeout, Duration::from_millis(1500));
        assert_eq!(config.arq.retry_timeout, Duration::from_millis(40));
        assert_eq!(config.arq.window_size, ArqConfig::default().window_size);
        assert_eq!(config.direct.unwrap().idle_timeout, Duration::from_secs(2));

        let json = serde_json::to_value(TransportConfig::default()).unwrap();
        assert_eq!(json["shutdown_timeout"], 10_000);
    }

    #[test]
    fn test_invalid_configurations_are_rejected() {
        for text in [
            r#"{}"#,
            r#"{ "local": true, "system_name": " " }"#,
            r#"{ "relay": { "url": "" } }"#,
            r#"{ "relay": { "url": "127.0.0.1:1", "max_retries": 0 } }"#,
            r#"{ "local": true, "arq": { "window_size": 0 } }"#,
        ] {
            assert!(
                matches!(TransportConfig::from_json_str(text), Err(ConfigError::Invalid(_))),
                "accepted {text}"
            );
        }
        assert!(matches!(
            TransportConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{ "system_name": "from-file", "local": true }}"#).unwrap();

        let config = TransportConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.system_name, "from-file");
        assert!(config.local);

        assert!(matches!(
            TransportConfig::from_json_file(file.path().with_extension("missing")),
            Err(ConfigError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_build_orders_channels() {
        let config = TransportConfig {
            local: true,
            direct: Some(DirectSettings {
                listen: "127.0.0.1:0".parse().unwrap(),
                ..Default::default()
            }),
            relay: Some(RelaySettings {
                url: "127.0.0.1:1".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let keypair = KeyPair::from_seed(&[3; 32]);
        let transport = config.build(keypair.clone(), None).unwrap();
        let names: Vec<_> = transport.channels().iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, ["direct", "local", "relay"]);
        assert_eq!(transport.identity(), keypair.identity());
    }

    #[tokio::test]
    async fn test_local_nodes_share_discovery() {
        let config = TransportConfig {
            local: true,
            ..Default::default()
        };
        let discovery = LocalDiscovery::new();
        let a = config.build(KeyPair::from_seed(&[1; 32]), Some(discovery.clone())).unwrap();
        let b = config.build(KeyPair::from_seed(&[2; 32]), Some(discovery.clone())).unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.send(b.identity(), &b"ping"[..]).unwrap().wait().await.unwrap();
        assert_eq!(&b.recv().await.unwrap().payload[..], b"ping");
        assert_eq!(discovery.len(), 2);
    }
}
