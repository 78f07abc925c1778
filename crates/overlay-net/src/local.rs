//! In-process channel
//!
//! Nodes living in the same process find each other through a shared
//! [`LocalDiscovery`] and hand envelopes straight to each other's sink.

use crate::channel::{ChannelError, CloseFuture, CloseSignal, Delivery, InboundSink, TransportChannel};
use crate::dedup::DuplicateMessageFilter;
use async_trait::async_trait;
use overlay_core::{Identity, OutboundEnvelope};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Registry of in-process nodes, shared by their local channels
#[derive(Clone, Debug, Default)]
pub struct LocalDiscovery {
    nodes: Arc<RwLock<HashMap<Identity, InboundSink>>>,
}

impl LocalDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node; fails if the identity is already present.
    pub fn register(&self, identity: Identity, sink: InboundSink) -> bool {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&identity) {
            return false;
        }
        nodes.insert(identity, sink);
        true
    }

    pub fn deregister(&self, identity: &Identity) {
        self.nodes.write().remove(identity);
    }

    pub fn lookup(&self, identity: &Identity) -> Option<InboundSink> {
        self.nodes.read().get(identity).cloned()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.nodes.read().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Closed,
}

/// Channel delivering to nodes registered in the same [`LocalDiscovery`]
pub struct LocalTransportChannel {
    identity: Identity,
    discovery: LocalDiscovery,
    sink: InboundSink,
    lifecycle: Mutex<Lifecycle>,
    filter: Mutex<DuplicateMessageFilter>,
    close: CloseSignal,
}

impl LocalTransportChannel {
    pub fn new(identity: Identity, discovery: LocalDiscovery, sink: InboundSink, dedup_capacity: usize) -> Self {
        Self {
            identity,
            discovery,
            sink,
            lifecycle: Mutex::new(Lifecycle::Created),
            filter: Mutex::new(DuplicateMessageFilter::new(dedup_capacity)),
            close: CloseSignal::new(),
        }
    }

    fn is_running(&self) -> bool {
        *self.lifecycle.lock() == Lifecycle::Running
    }
}

#[async_trait]
impl TransportChannel for LocalTransportChannel {
    fn name(&self) -> &str {
        "local"
    }

    async fn start(&self) -> Result<(), ChannelError> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Closed => return Err(ChannelError::Closed),
            Lifecycle::Created => {}
        }
        if !self.discovery.register(self.identity, self.sink.clone()) {
            return Err(ChannelError::Protocol(format!(
                "{} is already registered in this process",
                self.identity
            )));
        }
        *lifecycle = Lifecycle::Running;
        info!("Local channel for {} started", self.identity);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Closed);
        if previous == Lifecycle::Running {
            self.discovery.deregister(&self.identity);
        }
        self.close.complete(Ok(()));
        Ok(())
    }

    fn close_future(&self) -> CloseFuture {
        self.close.future()
    }

    fn send(&self, envelope: OutboundEnvelope) -> Result<Delivery, ChannelError> {
        match *self.lifecycle.lock() {
            Lifecycle::Running => {}
            Lifecycle::Created => return Err(ChannelError::NotStarted("local".to_string())),
            Lifecycle::Closed => return Err(ChannelError::Closed),
        }
        let sink = self
            .discovery
            .lookup(&envelope.recipient)
            .ok_or(ChannelError::Unreachable(envelope.recipient))?;
        self.filter.lock().check_outbound(envelope.id, false)?;

        debug!("Delivering message {} to local node {}", envelope.id, envelope.recipient);
        sink.receive(envelope.into());
        Ok(Delivery::completed())
    }

    fn accept(&self, recipient: &Identity) -> bool {
        self.is_running() && self.discovery.contains(recipient)
    }
}
