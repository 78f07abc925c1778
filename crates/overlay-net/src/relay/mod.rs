//! Relay (super-peer) channel
//!
//! All traffic goes through a single TCP connection to a relay server. The
//! client joins with its identity, wraps every outbound envelope in a
//! `ForwardableMessage` and receives forwards addressed to it over the same
//! connection. [`with_retry`] wraps the channel in a reconnecting decorator.

mod channel;
pub mod protocol;

pub use channel::{with_retry, RelayConfig, RelayTransportChannel, DEFAULT_JOIN_TIMEOUT, DEFAULT_PING_INTERVAL};
pub use protocol::{ProtocolError, RelayCodec, RelayMessage};
