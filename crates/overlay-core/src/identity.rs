//! Node identities and signing keys
//!
//! A node is addressed by its Ed25519 public key. The keypair never leaves
//! the node; peers only ever see the [`Identity`] and signatures made with it.

use crate::error::{Error, Result};
use blake3::Hasher;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Public-key identity of a node.
///
/// Ordering is plain byte order; the direct channel relies on it for its
/// connection tie-break.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity(pub [u8; 32]);

impl Identity {
    /// Create from an Ed25519 public key
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*public_key)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify a signature made by the holder of this identity
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let verifying_key = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
        let signature: [u8; 64] = signature
            .try_into()
            .map_err(|_| Error::InvalidSignature)?;
        verifying_key
            .verify(message, &Signature::from_bytes(&signature))
            .map_err(|_| Error::InvalidSignature)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self)
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::InvalidIdentifier(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidIdentifier(format!("expected 32 bytes: {s}")))?;
        Ok(Self(bytes))
    }
}

// Hex string in JSON, raw bytes in postcard.
impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            <[u8; 32]>::deserialize(deserializer).map(Self)
        }
    }
}

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes (for deterministic testing)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// The identity peers know us by
    pub fn identity(&self) -> Identity {
        Identity(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}

/// Domain-separated BLAKE3 digest over length-prefixed parts.
///
/// Used for everything that gets signed so a signature made for one purpose
/// can never be replayed as another.
pub fn domain_digest(domain: &str, parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(domain.as_bytes());
    hasher.update(b":");
    for part in parts {
        hasher.update(&(part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::from_seed(&[7u8; 32]);
        let sig = keypair.sign(b"hello");

        assert!(keypair.identity().verify(b"hello", &sig).is_ok());
        assert!(matches!(
            keypair.identity().verify(b"hullo", &sig),
            Err(Error::InvalidSignature)
        ));
        assert!(keypair.identity().verify(b"hello", &sig[..10]).is_err());
    }

    #[test]
    fn test_identity_hex_roundtrip() {
        let identity = KeyPair::from_seed(&[1u8; 32]).identity();
        let parsed: Identity = identity.to_hex().parse().unwrap();
        assert_eq!(parsed, identity);
        assert!("abcd".parse::<Identity>().is_err());
        assert!("zz".parse::<Identity>().is_err());
    }

    #[test]
    fn test_identity_serializes_as_hex_in_json() {
        let identity = KeyPair::from_seed(&[2u8; 32]).identity();
        let json = serde_json::to_string(&identity).unwrap();
        assert_eq!(json, format!("\"{}\"", identity.to_hex()));

        let bytes = postcard::to_allocvec(&identity).unwrap();
        assert_eq!(bytes.len(), 32);
        let back: Identity = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, identity);
    }

    #[test]
    fn test_domain_digest_separates_parts() {
        let a = domain_digest("test", &[b"ab", b"c"]);
        let b = domain_digest("test", &[b"a", b"bc"]);
        let c = domain_digest("other", &[b"ab", b"c"]);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
