//! Message envelopes
//!
//! Envelopes pair an opaque payload with sender and recipient identities.
//! They are immutable values; a channel turns an [`OutboundEnvelope`] into
//! wire bytes and a received frame back into an [`InboundEnvelope`].

use crate::error::{Error, Result};
use crate::identity::Identity;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Identifier used for duplicate detection and response correlation
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    /// Fresh random id
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

impl FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::InvalidIdentifier(e.to_string()))?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| Error::InvalidIdentifier(format!("expected 16 bytes: {s}")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            <[u8; 16]>::deserialize(deserializer).map(Self)
        }
    }
}

/// Message handed to a transport channel for delivery
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundEnvelope {
    pub id: MessageId,
    pub sender: Identity,
    pub recipient: Identity,
    pub payload: Bytes,
}

impl OutboundEnvelope {
    /// Create an envelope with a fresh message id
    pub fn new(sender: Identity, recipient: Identity, payload: impl Into<Bytes>) -> Self {
        Self {
            id: MessageId::random(),
            sender,
            recipient,
            payload: payload.into(),
        }
    }

    /// Wire form of this envelope
    pub fn to_wire(&self) -> WireEnvelope {
        WireEnvelope {
            id: self.id,
            sender: self.sender,
            recipient: self.recipient,
            payload: self.payload.to_vec(),
        }
    }
}

/// Message a channel decoded from the wire and passes upward
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundEnvelope {
    pub id: MessageId,
    pub sender: Identity,
    pub recipient: Identity,
    pub payload: Bytes,
}

impl From<OutboundEnvelope> for InboundEnvelope {
    fn from(envelope: OutboundEnvelope) -> Self {
        Self {
            id: envelope.id,
            sender: envelope.sender,
            recipient: envelope.recipient,
            payload: envelope.payload,
        }
    }
}

/// Postcard encoding carried inside direct-channel data frames
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub id: MessageId,
    pub sender: Identity,
    pub recipient: Identity,
    pub payload: Vec<u8>,
}

impl WireEnvelope {
    /// Encode to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(Error::from)
    }

    /// Decode from bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes(bytes).map_err(Error::from)
    }
}

impl From<WireEnvelope> for InboundEnvelope {
    fn from(wire: WireEnvelope) -> Self {
        Self {
            id: wire.id,
            sender: wire.sender,
            recipient: wire.recipient,
            payload: Bytes::from(wire.payload),
        }
    }
}
