//! Duplicate message suppression
//!
//! Two bounded FIFO sets of recently seen message ids, one per direction.
//! This is a cache, not authoritative state: an id evicted from the set is
//! simply forgotten.

use overlay_core::MessageId;
use std::collections::{HashSet, VecDeque};
use thiserror::Error;

/// Default number of ids remembered per direction
pub const DEFAULT_DEDUP_CAPACITY: usize = 1024;

/// Raised when an outbound message reuses a recently sent id
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("message {0} was already sent")]
pub struct DuplicateSend(pub MessageId);

/// Bounded insertion-ordered set; the oldest entry is evicted at capacity.
#[derive(Debug)]
pub struct BoundedIdSet {
    capacity: usize,
    order: VecDeque<MessageId>,
    members: HashSet<MessageId>,
}

impl BoundedIdSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    /// Insert an id; returns `false` if it was already present.
    pub fn insert(&mut self, id: MessageId) -> bool {
        if self.members.contains(&id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(id);
        self.members.insert(id);
        true
    }

    /// Remove an id; returns `false` if it was not present.
    pub fn remove(&mut self, id: &MessageId) -> bool {
        if !self.members.remove(id) {
            return false;
        }
        self.order.retain(|member| member != id);
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Verdict for an inbound message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundVerdict {
    /// First sighting, deliver it
    Fresh,
    /// Already processed; acknowledge as such and drop
    Duplicate,
}

/// Per-connection duplicate filter
#[derive(Debug)]
pub struct DuplicateMessageFilter {
    inbound: BoundedIdSet,
    outbound: BoundedIdSet,
}

impl DuplicateMessageFilter {
    pub fn new(capacity: usize) -> Self {
        Self {
            inbound: BoundedIdSet::new(capacity),
            outbound: BoundedIdSet::new(capacity),
        }
    }

    /// Check an outbound message before it is written.
    ///
    /// Repeatable messages (keepalives, leave notices) are never rejected
    /// and are not remembered.
    pub fn check_outbound(&mut self, id: MessageId, repeatable: bool) -> Result<(), DuplicateSend> {
        if repeatable || self.outbound.insert(id) {
            Ok(())
        } else {
            Err(DuplicateSend(id))
        }
    }

    /// Forget an outbound id whose send never left the node, so the caller
    /// may retry it.
    pub fn forget_outbound(&mut self, id: &MessageId) {
        self.outbound.remove(id);
    }

    /// Check an inbound message before it is delivered upward.
    pub fn check_inbound(&mut self, id: MessageId) -> InboundVerdict {
        if self.inbound.insert(id) {
            InboundVerdict::Fresh
        } else {
            InboundVerdict::Duplicate
        }
    }

    pub fn inbound(&self) -> &BoundedIdSet {
        &self.inbound
    }

    pub fn outbound(&self) -> &BoundedIdSet {
        &self.outbound
    }
}

impl Default for DuplicateMessageFilter {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}
