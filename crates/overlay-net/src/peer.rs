//! Registry of established peer connections
//!
//! Maps a peer's identity to the one connection used to reach it. Every
//! connection task registers itself once its handshake completes and removes
//! itself on teardown, so all access goes through a single lock.

use overlay_core::Identity;
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// One registered connection
#[derive(Clone, Debug)]
pub struct PeerConnectionEntry<H> {
    /// Peer identity (registry key)
    pub identity: Identity,
    /// Name the peer announced in its handshake
    pub system_name: String,
    /// Remote socket address
    pub remote_addr: SocketAddr,
    /// Locally unique id of the underlying connection
    pub connection_id: u64,
    /// Identity of the side that opened the socket
    pub initiator: Identity,
    /// Handle used to reach the connection task
    pub handle: H,
    /// When the handshake completed
    pub established_at: Instant,
}

/// Outcome of [`PeerRegistry::register`]
#[derive(Debug)]
pub enum Registration<H> {
    /// First connection for this identity
    Inserted,
    /// Same connection announced a new name
    Renamed { previous: String },
    /// The new connection won the tie-break; the old entry is returned so
    /// its connection can be closed
    Replaced(PeerConnectionEntry<H>),
    /// An existing connection won the tie-break; close the new one
    Rejected,
}

/// Identity → connection map with an at-most-one-entry invariant
#[derive(Debug)]
pub struct PeerRegistry<H> {
    local: Identity,
    entries: RwLock<HashMap<Identity, PeerConnectionEntry<H>>>,
}

impl<H: Clone> PeerRegistry<H> {
    pub fn new(local: Identity) -> Self {
        Self {
            local,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection whose handshake completed.
    ///
    /// When two different connections exist for the same peer, the one
    /// opened by the side with the lower identity wins, so both ends keep
    /// the same socket. Two connections opened by the same side are a
    /// reconnect, and the newer one wins.
    pub fn register(&self, entry: PeerConnectionEntry<H>) -> Registration<H> {
        let preferred = self.local.min(entry.identity);
        let mut entries = self.entries.write();
        let existing = match entries.entry(entry.identity) {
            Entry::Vacant(slot) => {
                slot.insert(entry);
                return Registration::Inserted;
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };

        if existing.connection_id == entry.connection_id {
            let previous = std::mem::replace(&mut existing.system_name, entry.system_name);
            return Registration::Renamed { previous };
        }

        if entry.initiator == existing.initiator || entry.initiator == preferred {
            let old = std::mem::replace(existing, entry);
            Registration::Replaced(old)
        } else {
            Registration::Rejected
        }
    }

    /// Remove the entry for `identity` if it still belongs to
    /// `connection_id`.
    pub fn remove(&self, identity: &Identity, connection_id: u64) -> Option<PeerConnectionEntry<H>> {
        let mut entries = self.entries.write();
        match entries.get(identity) {
            Some(entry) if entry.connection_id == connection_id => entries.remove(identity),
            _ => None,
        }
    }

    /// Record a new system name announced on `connection_id`.
    ///
    /// Returns the previous name, or `None` if that connection is no longer
    /// the registered one.
    pub fn rename(&self, identity: &Identity, connection_id: u64, system_name: String) -> Option<String> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(identity)?;
        if entry.connection_id != connection_id {
            return None;
        }
        Some(std::mem::replace(&mut entry.system_name, system_name))
    }

    /// Handle for the connection to `identity`
    pub fn handle(&self, identity: &Identity) -> Option<H> {
        self.entries.read().get(identity).map(|e| e.handle.clone())
    }

    /// Snapshot of the entry for `identity`
    pub fn get(&self, identity: &Identity) -> Option<PeerConnectionEntry<H>> {
        self.entries.read().get(identity).cloned()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.read().contains_key(identity)
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.entries.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Remove and return every entry
    pub fn drain(&self) -> Vec<PeerConnectionEntry<H>> {
        self.entries.write().drain().map(|(_, e)| e).collect()
    }
}
