//! The transport channel contract
//!
//! A [`TransportChannel`] is one way of exchanging messages with remote
//! peers: direct sockets, a relay, or in-process delivery. The
//! [`crate::transport::Transport`] holds an ordered list of them and hands
//! each outbound envelope to the first one that accepts the recipient.
//!
//! # Object safety
//!
//! The trait uses `async_trait` so channels can be held as
//! `Arc<dyn TransportChannel>` and swapped at runtime by the retry decorator.

use crate::dedup::DuplicateSend;
use crate::framing::FrameError;
use crate::handshake::HandshakeError;
use async_trait::async_trait;
use overlay_core::{Identity, InboundEnvelope, OutboundEnvelope};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

/// Channel-scoped, recoverable errors
#[derive(Clone, Debug, Error)]
pub enum ChannelError {
    #[error("channel {0} is not started")]
    NotStarted(String),
    #[error("channel is closed")]
    Closed,
    #[error("channel is reconnecting")]
    Reconnecting,
    #[error("no route to {0} on this channel")]
    Unreachable(Identity),
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("relay did not acknowledge join within {0:?}")]
    JoinTimeout(Duration),
    #[error("relay rejected join: {0}")]
    JoinRejected(String),
    #[error("relay connection lost: {0}")]
    RelayClosed(String),
    #[error("connection to {peer} closed: {cause}")]
    ConnectionClosed { peer: Identity, cause: String },
    #[error(transparent)]
    Duplicate(#[from] DuplicateSend),
    #[error("send queue to {0} is full")]
    Backpressure(Identity),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ChannelError> },
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<FrameError> for ChannelError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => Self::Io(Arc::new(e)),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<HandshakeError> for ChannelError {
    fn from(e: HandshakeError) -> Self {
        Self::Handshake(e.to_string())
    }
}

/// Completion side of a channel's close state.
///
/// Resolves exactly once; later completions are ignored.
#[derive(Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<Option<Result<(), ChannelError>>>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Resolve the close state; returns `false` if it was already resolved.
    pub fn complete(&self, result: Result<(), ChannelError>) -> bool {
        let mut result = Some(result);
        self.tx.send_if_modified(|state| {
            if state.is_none() {
                *state = result.take();
                true
            } else {
                false
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Future observing this signal
    pub fn future(&self) -> CloseFuture {
        CloseFuture {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CloseSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseSignal")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Resolves when the channel has closed, with the reason it closed
#[derive(Clone)]
pub struct CloseFuture {
    rx: watch::Receiver<Option<Result<(), ChannelError>>>,
}

impl CloseFuture {
    /// Wait for the close
    pub async fn wait(mut self) -> Result<(), ChannelError> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(state) => (*state).clone().unwrap_or(Ok(())),
            Err(_) => Err(ChannelError::Closed),
        }
    }

    /// Close result if already resolved
    pub fn peek(&self) -> Option<Result<(), ChannelError>> {
        (*self.rx.borrow()).clone()
    }
}

/// Receipt for one sent envelope
#[derive(Debug)]
pub struct Delivery {
    rx: Option<oneshot::Receiver<Result<(), ChannelError>>>,
}

/// Completion side of a [`Delivery`]
#[derive(Debug)]
pub struct DeliveryPromise {
    tx: oneshot::Sender<Result<(), ChannelError>>,
}

impl Delivery {
    /// A receipt that resolves once the promise is completed
    pub fn pending() -> (DeliveryPromise, Delivery) {
        let (tx, rx) = oneshot::channel();
        (DeliveryPromise { tx }, Delivery { rx: Some(rx) })
    }

    /// A receipt that is already successful
    pub fn completed() -> Self {
        Self { rx: None }
    }

    /// Wait until the envelope was delivered or failed
    pub async fn wait(self) -> Result<(), ChannelError> {
        match self.rx {
            None => Ok(()),
            Some(rx) => rx.await.unwrap_or(Err(ChannelError::Closed)),
        }
    }
}

impl DeliveryPromise {
    pub fn succeed(self) {
        let _ = self.tx.send(Ok(()));
    }

    pub fn fail(self, error: ChannelError) {
        let _ = self.tx.send(Err(error));
    }
}

/// Upward edge from channels to the owning transport
#[derive(Clone, Debug)]
pub struct InboundSink {
    tx: mpsc::UnboundedSender<InboundEnvelope>,
}

impl InboundSink {
    /// Create a sink and the receiver the transport reads from
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<InboundEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver a decoded message upward. Never fails.
    pub fn receive(&self, envelope: InboundEnvelope) {
        let id = envelope.id;
        if self.tx.send(envelope).is_err() {
            debug!("Dropping inbound message {}: transport is gone", id);
        }
    }
}

/// A way to exchange messages with remote peers
#[async_trait]
pub trait TransportChannel: Send + Sync + 'static {
    /// Short name used in logs and events
    fn name(&self) -> &str;

    /// Begin accepting/establishing connections
    async fn start(&self) -> Result<(), ChannelError>;

    /// Release all resources. Calling it again is a no-op.
    async fn shutdown(&self) -> Result<(), ChannelError>;

    /// Resolves once the channel is closed, for whatever reason
    fn close_future(&self) -> CloseFuture;

    /// Enqueue an envelope without waiting for the network
    fn send(&self, envelope: OutboundEnvelope) -> Result<Delivery, ChannelError>;

    /// Whether this channel can currently reach `recipient`
    fn accept(&self, recipient: &Identity) -> bool;

    /// Addresses this channel is reachable at, for listen events
    fn local_addresses(&self) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_signal_resolves_once() {
        let signal = CloseSignal::new();
        let future = signal.future();

        assert!(signal.complete(Err(ChannelError::RelayClosed("gone".into()))));
        assert!(!signal.complete(Ok(())));

        assert!(matches!(future.wait().await, Err(ChannelError::RelayClosed(_))));
        // Late subscribers see the same result.
        assert!(matches!(signal.future().peek(), Some(Err(ChannelError::RelayClosed(_)))));
    }

    #[tokio::test]
    async fn test_close_future_waits_for_completion() {
        let signal = CloseSignal::new();
        let future = signal.future();
        assert!(future.peek().is_none());

        let waiter = tokio::spawn(future.wait());
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        signal.complete(Ok(()));
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_delivery_outcomes() {
        assert!(Delivery::completed().wait().await.is_ok());

        let (promise, delivery) = Delivery::pending();
        promise.fail(ChannelError::Closed);
        assert!(matches!(delivery.wait().await, Err(ChannelError::Closed)));

        let (promise, delivery) = Delivery::pending();
        drop(promise);
        assert!(delivery.wait().await.is_err());
    }
}
