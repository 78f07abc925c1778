//! Transport stack for the overlay
//!
//! This crate provides:
//! - Length-prefixed frame codec for direct connections
//! - Go-Back-N ARQ for reliable in-order delivery
//! - Signed system-name handshake and the peer connection registry
//! - Direct, relay, reconnecting and in-process transport channels
//! - The [`Transport`] orchestrator and its JSON configuration

pub mod arq;
pub mod channel;
pub mod config;
pub mod dedup;
pub mod direct;
pub mod framing;
pub mod handshake;
pub mod local;
pub mod peer;
pub mod relay;
pub mod retry;
pub mod transport;

pub use arq::{ArqConfig, GoBackNArqEngine};
pub use channel::{ChannelError, CloseFuture, Delivery, InboundSink, TransportChannel};
pub use config::{ConfigError, TransportConfig};
pub use dedup::DuplicateMessageFilter;
pub use direct::{DirectConfig, DirectTransportChannel};
pub use framing::{Frame, FrameCodec};
pub use handshake::{PeerHandshake, SystemNameMessage};
pub use local::{LocalDiscovery, LocalTransportChannel};
pub use peer::PeerRegistry;
pub use relay::{RelayConfig, RelayTransportChannel};
pub use retry::{RetryAgent, RetryConfig, RetryTransportChannel};
pub use transport::{Transport, TransportError, TransportEvent};
