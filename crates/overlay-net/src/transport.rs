//! Transport orchestrator
//!
//! Owns the node's channels in priority order, routes each outbound envelope
//! to the first channel that accepts its recipient and publishes lifecycle
//! events.

use crate::channel::{ChannelError, Delivery, InboundSink, TransportChannel};
use bytes::Bytes;
use overlay_core::{Identity, InboundEnvelope, OutboundEnvelope};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tracing::{error, info, warn, Level};

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CAPACITY: usize = 64;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Startup did not complete within {0:?}")]
    StartupTimeout(Duration),
    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),
    #[error("No channel accepts recipient {0}")]
    NoChannel(Identity),
    #[error("Channel {channel} failed: {source}")]
    Channel {
        channel: String,
        #[source]
        source: ChannelError,
    },
    #[error("Transport already started")]
    AlreadyStarted,
    #[error("Task failed: {0}")]
    Task(String),
}

/// Lifecycle event published to subscribers
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// Channels are up and reachable at these addresses
    Listen { addresses: Vec<String> },
    /// Every channel was shut down
    Shutdown,
    /// A channel closed because of a failure
    Error { channel: String, cause: ChannelError },
}

impl TransportEvent {
    /// Level the event is logged at
    pub fn level(&self) -> Level {
        match self {
            Self::Listen { .. } | Self::Shutdown => Level::INFO,
            Self::Error { .. } => Level::ERROR,
        }
    }
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listen { addresses } if addresses.is_empty() => write!(f, "transport started"),
            Self::Listen { addresses } => write!(f, "transport listening on {}", addresses.join(", ")),
            Self::Shutdown => write!(f, "transport shut down"),
            Self::Error { channel, cause } => write!(f, "{} channel failed: {}", channel, cause),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Closed,
}

/// Builder wiring channels to a shared inbound sink
pub struct TransportBuilder {
    identity: Identity,
    sink: InboundSink,
    inbound: mpsc::UnboundedReceiver<InboundEnvelope>,
    channels: Vec<Arc<dyn TransportChannel>>,
    startup_timeout: Duration,
    shutdown_timeout: Duration,
}

impl TransportBuilder {
    /// Sink that channels deliver inbound envelopes to
    pub fn sink(&self) -> InboundSink {
        self.sink.clone()
    }

    /// Append a channel; earlier channels take precedence
    pub fn channel(mut self, channel: Arc<dyn TransportChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> Transport {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Transport {
            identity: self.identity,
            channels: self.channels,
            inbound: tokio::sync::Mutex::new(self.inbound),
            events,
            startup_timeout: self.startup_timeout,
            shutdown_timeout: self.shutdown_timeout,
            phase: Mutex::new(Phase::Created),
            watchers: Mutex::new(Vec::new()),
        }
    }
}

/// A node's set of transport channels
pub struct Transport {
    /// Our identity; inbound envelopes for anyone else are dropped
    identity: Identity,
    /// Channels in priority order
    channels: Vec<Arc<dyn TransportChannel>>,
    /// Envelopes delivered by all channels
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundEnvelope>>,
    /// Lifecycle event fan-out
    events: broadcast::Sender<TransportEvent>,
    startup_timeout: Duration,
    shutdown_timeout: Duration,
    phase: Mutex<Phase>,
    /// Tasks waiting on channel close futures
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl Transport {
    pub fn builder(identity: Identity) -> TransportBuilder {
        let (sink, inbound) = InboundSink::channel();
        TransportBuilder {
            identity,
            sink,
            inbound,
            channels: Vec::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Get our identity
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Channels in priority order
    pub fn channels(&self) -> &[Arc<dyn TransportChannel>] {
        &self.channels
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Start every channel concurrently within the startup timeout
    pub async fn start(&self) -> Result<(), TransportError> {
        {
            let mut phase = self.phase.lock();
            if *phase != Phase::Created {
                return Err(TransportError::AlreadyStarted);
            }
            *phase = Phase::Running;
        }

        let started = time::timeout(self.startup_timeout, self.start_channels())
            .await
            .unwrap_or(Err(TransportError::StartupTimeout(self.startup_timeout)));
        if let Err(e) = started {
            error!("Transport startup failed: {}", e);
            if let Err(shutdown) = self.shutdown().await {
                warn!("Cleanup after failed startup: {}", shutdown);
            }
            return Err(e);
        }

        self.watch_channels();
        let addresses = self
            .channels
            .iter()
            .flat_map(|channel| channel.local_addresses())
            .collect();
        self.publish(TransportEvent::Listen { addresses });
        Ok(())
    }

    async fn start_channels(&self) -> Result<(), TransportError> {
        let mut starting = JoinSet::new();
        for channel in &self.channels {
            let channel = Arc::clone(channel);
            starting.spawn(async move {
                let result = channel.start().await;
                (channel.name().to_string(), result)
            });
        }

        while let Some(joined) = starting.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!("Channel {} started", name),
                Ok((channel, Err(source))) => return Err(TransportError::Channel { channel, source }),
                Err(e) => return Err(TransportError::Task(e.to_string())),
            }
        }
        Ok(())
    }

    fn watch_channels(&self) {
        let mut watchers = self.watchers.lock();
        for channel in &self.channels {
            let name = channel.name().to_string();
            let close = channel.close_future();
            let events = self.events.clone();
            watchers.push(tokio::spawn(async move {
                if let Err(cause) = close.wait().await {
                    publish(&events, TransportEvent::Error { channel: name, cause });
                }
            }));
        }
    }

    /// Shut every channel down within the shutdown timeout. Idempotent.
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        {
            let mut phase = self.phase.lock();
            if *phase == Phase::Closed {
                return Ok(());
            }
            *phase = Phase::Closed;
        }
        for watcher in self.watchers.lock().drain(..) {
            watcher.abort();
        }

        let mut stopping = JoinSet::new();
        for channel in &self.channels {
            let channel = Arc::clone(channel);
            stopping.spawn(async move {
                if let Err(e) = channel.shutdown().await {
                    warn!("Channel {} did not shut down cleanly: {}", channel.name(), e);
                }
            });
        }
        let drained = time::timeout(self.shutdown_timeout, async {
            while stopping.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            return Err(TransportError::ShutdownTimeout(self.shutdown_timeout));
        }

        self.publish(TransportEvent::Shutdown);
        Ok(())
    }

    /// Send `payload` to `recipient` from our identity
    pub fn send(&self, recipient: Identity, payload: impl Into<Bytes>) -> Result<Delivery, TransportError> {
        self.send_envelope(OutboundEnvelope::new(self.identity, recipient, payload))
    }

    /// Hand an envelope to the first channel that accepts its recipient
    pub fn send_envelope(&self, envelope: OutboundEnvelope) -> Result<Delivery, TransportError> {
        let recipient = envelope.recipient;
        let channel = self
            .channels
            .iter()
            .find(|channel| channel.accept(&recipient))
            .ok_or(TransportError::NoChannel(recipient))?;
        channel.send(envelope).map_err(|source| TransportError::Channel {
            channel: channel.name().to_string(),
            source,
        })
    }

    /// Next envelope addressed to us; `None` once every channel is gone
    pub async fn recv(&self) -> Option<InboundEnvelope> {
        let mut inbound = self.inbound.lock().await;
        loop {
            let envelope = inbound.recv().await?;
            if envelope.recipient == self.identity {
                return Some(envelope);
            }
            error!(
                "Dropping message {} from {} addressed to {}",
                envelope.id, envelope.sender, envelope.recipient
            );
        }
    }

    fn publish(&self, event: TransportEvent) {
        publish(&self.events, event);
    }
}

fn publish(events: &broadcast::Sender<TransportEvent>, event: TransportEvent) {
    let level = event.level();
    if level == Level::ERROR {
        error!("{}", event);
    } else if level == Level::WARN {
        warn!("{}", event);
    } else {
        info!("{}", event);
    }
    // No subscribers is fine.
    let _ = events.send(event);
}
