//! Peer handshake
//!
//! The first frames on a new direct connection tell each side who is on the
//! other end. The initiator sends a signed [`SystemNameMessage`]; the
//! responder verifies it and replies with its own if it has not sent one
//! yet. A later name from the same identity is a rename.

use crate::framing::{Frame, FrameKind};
use overlay_core::identity::domain_digest;
use overlay_core::{Identity, KeyPair};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SYSTEM_NAME_DOMAIN: &str = "overlay-system-name-v1";

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("encoding error: {0}")]
    Encoding(#[from] postcard::Error),
    #[error("invalid signature from {0}")]
    BadSignature(Identity),
    #[error("peer switched identity from {0} to {1}")]
    IdentityChanged(Identity, Identity),
    #[error("connected to ourselves")]
    SelfConnection,
    #[error("expected a system name, got {0:?}")]
    UnexpectedFrame(FrameKind),
}

/// Handshake frame announcing the sender's identity and name
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemNameMessage {
    pub system_name: String,
    pub identity: Identity,
    pub signature: Vec<u8>,
}

impl SystemNameMessage {
    /// Build and sign our own announcement
    pub fn signed(keypair: &KeyPair, system_name: impl Into<String>) -> Self {
        let system_name = system_name.into();
        let identity = keypair.identity();
        let digest = Self::digest(&system_name, &identity);
        Self {
            system_name,
            identity,
            signature: keypair.sign(&digest).to_vec(),
        }
    }

    /// Check that the announcement was signed by the identity it names
    pub fn verify(&self) -> Result<(), HandshakeError> {
        let digest = Self::digest(&self.system_name, &self.identity);
        self.identity
            .verify(&digest, &self.signature)
            .map_err(|_| HandshakeError::BadSignature(self.identity))
    }

    pub fn to_frame(&self) -> Result<Frame, HandshakeError> {
        Ok(Frame::new(FrameKind::SystemName, postcard::to_allocvec(self)?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, HandshakeError> {
        if frame.kind != FrameKind::SystemName {
            return Err(HandshakeError::UnexpectedFrame(frame.kind));
        }
        Ok(postcard::from_bytes(&frame.body)?)
    }

    fn digest(system_name: &str, identity: &Identity) -> [u8; 32] {
        domain_digest(SYSTEM_NAME_DOMAIN, &[system_name.as_bytes(), identity.as_bytes()])
    }
}

/// Which side opened the socket
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Who is on the other end
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemotePeer {
    pub identity: Identity,
    pub system_name: String,
}

/// Result of processing a peer's system name
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeStep {
    /// First name on this connection; send `reply` if present
    Established {
        peer: RemotePeer,
        reply: Option<SystemNameMessage>,
    },
    /// The peer announced a new name on an established connection
    Renamed { peer: RemotePeer },
}

/// Per-connection handshake state
#[derive(Debug)]
pub struct PeerHandshake {
    role: Role,
    local: SystemNameMessage,
    sent: bool,
    remote: Option<RemotePeer>,
}

impl PeerHandshake {
    pub fn new(role: Role, local: SystemNameMessage) -> Self {
        Self {
            role,
            local,
            sent: false,
            remote: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Message the initiator sends as soon as the socket is open
    pub fn opening(&mut self) -> Option<SystemNameMessage> {
        if self.role == Role::Initiator && !self.sent {
            self.sent = true;
            Some(self.local.clone())
        } else {
            None
        }
    }

    /// Process a system name received from the peer
    pub fn on_system_name(&mut self, message: SystemNameMessage) -> Result<HandshakeStep, HandshakeError> {
        message.verify()?;
        if message.identity == self.local.identity {
            return Err(HandshakeError::SelfConnection);
        }

        let peer = RemotePeer {
            identity: message.identity,
            system_name: message.system_name,
        };

        match &mut self.remote {
            Some(remote) if remote.identity == peer.identity => {
                remote.system_name = peer.system_name.clone();
                Ok(HandshakeStep::Renamed { peer })
            }
            Some(remote) => Err(HandshakeError::IdentityChanged(remote.identity, peer.identity)),
            None => {
                let reply = if self.sent {
                    None
                } else {
                    self.sent = true;
                    Some(self.local.clone())
                };
                self.remote = Some(peer.clone());
                Ok(HandshakeStep::Established { peer, reply })
            }
        }
    }

    pub fn is_established(&self) -> bool {
        self.remote.is_some()
    }

    pub fn remote(&self) -> Option<&RemotePeer> {
        self.remote.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair(n: u8) -> KeyPair {
        KeyPair::from_seed(&[n; 32])
    }

    #[test]
    fn test_initiator_and_responder_exchange_names() {
        let alice = keypair(1);
        let bob = keypair(2);
        let mut initiator = PeerHandshake::new(Role::Initiator, SystemNameMessage::signed(&alice, "alice"));
        let mut responder = PeerHandshake::new(Role::Responder, SystemNameMessage::signed(&bob, "bob"));

        assert!(responder.opening().is_none());
        let hello = initiator.opening().unwrap();
        assert!(initiator.opening().is_none());

        // Through the wire format.
        let hello = SystemNameMessage::from_frame(&hello.to_frame().unwrap()).unwrap();
        let reply = match responder.on_system_name(hello).unwrap() {
            HandshakeStep::Established { peer, reply } => {
                assert_eq!(peer.identity, alice.identity());
                assert_eq!(peer.system_name, "alice");
                reply.unwrap()
            }
            other => panic!("unexpected {other:?}"),
        };

        match initiator.on_system_name(reply).unwrap() {
            HandshakeStep::Established { peer, reply } => {
                assert_eq!(peer.identity, bob.identity());
                assert!(reply.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(initiator.is_established() && responder.is_established());
    }

    #[test]
    fn test_second_name_is_a_rename() {
        let alice = keypair(1);
        let mut responder = PeerHandshake::new(Role::Responder, SystemNameMessage::signed(&keypair(2), "bob"));
        responder
            .on_system_name(SystemNameMessage::signed(&alice, "alice"))
            .unwrap();

        let step = responder
            .on_system_name(SystemNameMessage::signed(&alice, "alice-2"))
            .unwrap();
        assert!(matches!(step, HandshakeStep::Renamed { ref peer } if peer.system_name == "alice-2"));
        assert_eq!(responder.remote().unwrap().system_name, "alice-2");
    }

    #[test]
    fn test_tampered_name_is_rejected() {
        let mut message = SystemNameMessage::signed(&keypair(1), "alice");
        message.system_name = "mallory".into();

        let mut responder = PeerHandshake::new(Role::Responder, SystemNameMessage::signed(&keypair(2), "bob"));
        assert!(matches!(
            responder.on_system_name(message),
            Err(HandshakeError::BadSignature(_))
        ));
        assert!(!responder.is_established());
    }

    #[test]
    fn test_identity_switch_and_self_connection_are_rejected() {
        let bob = keypair(2);
        let mut responder = PeerHandshake::new(Role::Responder, SystemNameMessage::signed(&bob, "bob"));

        assert!(matches!(
            responder.on_system_name(SystemNameMessage::signed(&bob, "bob")),
            Err(HandshakeError::SelfConnection)
        ));

        responder
            .on_system_name(SystemNameMessage::signed(&keypair(1), "alice"))
            .unwrap();
        assert!(matches!(
            responder.on_system_name(SystemNameMessage::signed(&keypair(3), "carol")),
            Err(HandshakeError::IdentityChanged(_, _))
        ));
    }

    #[test]
    fn test_non_handshake_frame_is_unexpected() {
        assert!(matches!(
            SystemNameMessage::from_frame(&Frame::ping()),
            Err(HandshakeError::UnexpectedFrame(FrameKind::Ping))
        ));
    }
}
