//! Relay wire protocol
//!
//! One JSON object per line. Every message carries a `messageID` and a `type`
//! tag; replies point back at their request through `correspondingId`.
//!
//! ```text
//! {"type":"Join","messageID":"…","uid":"…","systemName":"node-a","channels":["default"]}
//! {"type":"Response","messageID":"…","correspondingId":"…","result":{"type":"Status","messageID":"…","status":200}}
//! ```

use crate::channel::ChannelError;
use bytes::BytesMut;
use overlay_core::{Identity, InboundEnvelope, MessageId, OutboundEnvelope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Default upper bound for one encoded line
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

/// HTTP-style status codes carried in [`RelayMessage::Status`]
pub mod status {
    pub const OK: u16 = 200;
    /// The message was already processed
    pub const ALREADY_REPORTED: u16 = 208;
    pub const BAD_REQUEST: u16 = 400;
    /// The recipient is not joined at the relay
    pub const NOT_FOUND: u16 = 404;
    pub const CONFLICT: u16 = 409;

    pub fn is_success(code: u16) -> bool {
        (200..300).contains(&code)
    }
}

/// Relay protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has no type tag")]
    MissingType,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("line error: {0}")]
    Line(#[from] LinesCodecError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<ProtocolError> for ChannelError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(e) | ProtocolError::Line(LinesCodecError::Io(e)) => Self::Io(Arc::new(e)),
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// Tags accepted by [`RelayMessage::decode`]
pub const MESSAGE_TYPES: &[&str] = &[
    "Join",
    "Leave",
    "ForwardableMessage",
    "Ping",
    "Pong",
    "Status",
    "Response",
    "RequestClientsStocktaking",
    "ClientsStocktaking",
    "RelayException",
];

/// A relay protocol message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayMessage {
    Join {
        #[serde(rename = "messageID")]
        message_id: MessageId,
        uid: Identity,
        #[serde(rename = "systemName", default)]
        system_name: String,
        #[serde(default)]
        channels: Vec<String>,
    },
    Leave {
        #[serde(rename = "messageID")]
        message_id: MessageId,
    },
    ForwardableMessage {
        #[serde(rename = "messageID")]
        message_id: MessageId,
        sender: Identity,
        recipient: Identity,
        #[serde(with = "hex_payload")]
        payload: Vec<u8>,
    },
    Ping {
        #[serde(rename = "messageID")]
        message_id: MessageId,
    },
    Pong {
        #[serde(rename = "messageID")]
        message_id: MessageId,
        #[serde(rename = "correspondingId")]
        corresponding_id: MessageId,
    },
    Status {
        #[serde(rename = "messageID")]
        message_id: MessageId,
        status: u16,
    },
    Response {
        #[serde(rename = "messageID")]
        message_id: MessageId,
        result: Box<RelayMessage>,
        #[serde(rename = "correspondingId")]
        corresponding_id: MessageId,
    },
    RequestClientsStocktaking {
        #[serde(rename = "messageID")]
        message_id: MessageId,
    },
    ClientsStocktaking {
        #[serde(rename = "messageID")]
        message_id: MessageId,
        clients: Vec<Identity>,
    },
    RelayException {
        #[serde(rename = "messageID")]
        message_id: MessageId,
        exception: String,
    },
}

impl RelayMessage {
    pub fn join(uid: Identity, system_name: impl Into<String>, channels: Vec<String>) -> Self {
        Self::Join {
            message_id: MessageId::random(),
            uid,
            system_name: system_name.into(),
            channels,
        }
    }

    pub fn leave() -> Self {
        Self::Leave {
            message_id: MessageId::random(),
        }
    }

    /// Wrap an envelope for relaying; the envelope id becomes the message id.
    pub fn forward(envelope: &OutboundEnvelope) -> Self {
        Self::ForwardableMessage {
            message_id: envelope.id,
            sender: envelope.sender,
            recipient: envelope.recipient,
            payload: envelope.payload.to_vec(),
        }
    }

    pub fn ping() -> Self {
        Self::Ping {
            message_id: MessageId::random(),
        }
    }

    pub fn pong(corresponding_id: MessageId) -> Self {
        Self::Pong {
            message_id: MessageId::random(),
            corresponding_id,
        }
    }

    pub fn status(status: u16) -> Self {
        Self::Status {
            message_id: MessageId::random(),
            status,
        }
    }

    pub fn response(result: RelayMessage, corresponding_id: MessageId) -> Self {
        Self::Response {
            message_id: MessageId::random(),
            result: Box::new(result),
            corresponding_id,
        }
    }

    /// Shorthand for a `Response` wrapping a `Status`
    pub fn status_response(status: u16, corresponding_id: MessageId) -> Self {
        Self::response(Self::status(status), corresponding_id)
    }

    pub fn request_clients_stocktaking() -> Self {
        Self::RequestClientsStocktaking {
            message_id: MessageId::random(),
        }
    }

    pub fn clients_stocktaking(clients: Vec<Identity>) -> Self {
        Self::ClientsStocktaking {
            message_id: MessageId::random(),
            clients,
        }
    }

    pub fn exception(exception: impl Into<String>) -> Self {
        Self::RelayException {
            message_id: MessageId::random(),
            exception: exception.into(),
        }
    }

    pub fn message_id(&self) -> MessageId {
        match self {
            Self::Join { message_id, .. }
            | Self::Leave { message_id }
            | Self::ForwardableMessage { message_id, .. }
            | Self::Ping { message_id }
            | Self::Pong { message_id, .. }
            | Self::Status { message_id, .. }
            | Self::Response { message_id, .. }
            | Self::RequestClientsStocktaking { message_id }
            | Self::ClientsStocktaking { message_id, .. }
            | Self::RelayException { message_id, .. } => *message_id,
        }
    }

    /// The `type` tag of this message
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "Join",
            Self::Leave { .. } => "Leave",
            Self::ForwardableMessage { .. } => "ForwardableMessage",
            Self::Ping { .. } => "Ping",
            Self::Pong { .. } => "Pong",
            Self::Status { .. } => "Status",
            Self::Response { .. } => "Response",
            Self::RequestClientsStocktaking { .. } => "RequestClientsStocktaking",
            Self::ClientsStocktaking { .. } => "ClientsStocktaking",
            Self::RelayException { .. } => "RelayException",
        }
    }

    /// Messages that may legitimately be sent more than once
    pub fn is_repeatable(&self) -> bool {
        matches!(self, Self::Ping { .. } | Self::Pong { .. } | Self::Leave { .. })
    }

    /// Envelope carried by a `ForwardableMessage`
    pub fn into_envelope(self) -> Option<InboundEnvelope> {
        match self {
            Self::ForwardableMessage {
                message_id,
                sender,
                recipient,
                payload,
            } => Some(InboundEnvelope {
                id: message_id,
                sender,
                recipient,
                payload: payload.into(),
            }),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode one line, rejecting tags outside [`MESSAGE_TYPES`].
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line)?;
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;
        if !MESSAGE_TYPES.contains(&tag) {
            return Err(ProtocolError::UnknownType(tag.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }
}

mod hex_payload {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Newline-delimited JSON codec for [`RelayMessage`]s
#[derive(Clone, Debug)]
pub struct RelayCodec {
    lines: LinesCodec,
}

impl RelayCodec {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line_length),
        }
    }
}

impl Default for RelayCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl Decoder for RelayCodec {
    type Item = RelayMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.lines.decode(src)? {
            if !line.trim().is_empty() {
                return RelayMessage::decode(&line).map(Some);
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.lines.decode_eof(src)? {
            if !line.trim().is_empty() {
                return RelayMessage::decode(&line).map(Some);
            }
        }
        Ok(None)
    }
}

impl Encoder<RelayMessage> for RelayCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: RelayMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = item.encode()?;
        self.lines.encode(line, dst)?;
        Ok(())
    }
}
