//! Overlay Core Library
//!
//! Identity, message identifiers and envelope types shared by every layer of
//! the overlay transport stack.
//!
//! # Modules
//!
//! - [`identity`]: Public-key identities and the signing keypair
//! - [`envelope`]: Outbound/inbound envelopes and the wire envelope encoding
//! - [`error`]: Error types

pub mod envelope;
pub mod error;
pub mod identity;

pub use envelope::{InboundEnvelope, MessageId, OutboundEnvelope, WireEnvelope};
pub use error::{Error, Result};
pub use identity::{Identity, KeyPair};
