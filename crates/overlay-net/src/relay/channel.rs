//! Relay client session
//!
//! Dials the relay, joins under the local identity and then runs one task
//! per connection that writes queued messages, keeps the link alive with
//! pings and matches responses to the requests that are waiting on them.

use super::protocol::{status, RelayCodec, RelayMessage, DEFAULT_MAX_LINE_LENGTH};
use crate::channel::{
    ChannelError, CloseFuture, CloseSignal, Delivery, DeliveryPromise, InboundSink, TransportChannel,
};
use crate::dedup::{DuplicateMessageFilter, InboundVerdict, DEFAULT_DEDUP_CAPACITY};
use crate::retry::{FactoryRetryStrategy, RetryConfig, RetryTransportChannel};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use overlay_core::{Identity, MessageId, OutboundEnvelope};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);

type RelayStream = Framed<TcpStream, RelayCodec>;

/// Relay channel configuration
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Relay address, `host:port` or `tcp://host:port`
    pub url: String,
    /// Time allowed for connecting and joining
    pub join_timeout: Duration,
    pub system_name: String,
    /// Logical channel announced in the join
    pub channel: String,
    /// Reconnect policy used by [`with_retry`]
    pub retry: RetryConfig,
    pub ping_interval: Duration,
    pub dedup_capacity: usize,
    pub max_line_length: usize,
}

impl RelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            system_name: "overlay-node".to_string(),
            channel: "default".to_string(),
            retry: RetryConfig::default(),
            ping_interval: DEFAULT_PING_INTERVAL,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }

    /// Socket address part of the URL
    pub fn address(&self) -> &str {
        self.url.strip_prefix("tcp://").unwrap_or(&self.url)
    }
}

enum Outgoing {
    Message(RelayMessage, Option<DeliveryPromise>),
    Request(RelayMessage, oneshot::Sender<RelayMessage>),
}

enum State {
    Created,
    Joining,
    Joined(mpsc::UnboundedSender<Outgoing>),
    Closed,
}

struct Inner {
    identity: Identity,
    config: RelayConfig,
    sink: InboundSink,
    state: Mutex<State>,
    filter: Mutex<DuplicateMessageFilter>,
    close: CloseSignal,
    shutdown: CancellationToken,
    session: Mutex<Option<JoinHandle<()>>>,
}

/// Channel that reaches every peer through one relay connection
pub struct RelayTransportChannel {
    inner: Arc<Inner>,
}

impl RelayTransportChannel {
    pub fn new(identity: Identity, config: RelayConfig, sink: InboundSink) -> Self {
        let filter = DuplicateMessageFilter::new(config.dedup_capacity);
        Self {
            inner: Arc::new(Inner {
                identity,
                config,
                sink,
                state: Mutex::new(State::Created),
                filter: Mutex::new(filter),
                close: CloseSignal::new(),
                shutdown: CancellationToken::new(),
                session: Mutex::new(None),
            }),
        }
    }

    /// Identities currently joined at the relay
    pub async fn request_clients_stocktaking(&self) -> Result<Vec<Identity>, ChannelError> {
        let outgoing = self.inner.outgoing()?;
        let request = RelayMessage::request_clients_stocktaking();
        let (reply_tx, reply_rx) = oneshot::channel();
        outgoing
            .send(Outgoing::Request(request, reply_tx))
            .map_err(|_| ChannelError::Closed)?;

        match time::timeout(self.inner.config.join_timeout, reply_rx).await {
            Err(_) => Err(ChannelError::Protocol("relay did not answer the stocktaking request".to_string())),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Ok(Ok(RelayMessage::ClientsStocktaking { clients, .. })) => Ok(clients),
            Ok(Ok(other)) => Err(ChannelError::Protocol(format!(
                "unexpected {} in reply to stocktaking",
                other.type_name()
            ))),
        }
    }
}

/// Relay channel that reconnects according to `config.retry`
pub fn with_retry(identity: Identity, config: RelayConfig, sink: InboundSink) -> RetryTransportChannel {
    let retry = config.retry.clone();
    let strategy = FactoryRetryStrategy::new(move || {
        Arc::new(RelayTransportChannel::new(identity, config.clone(), sink.clone())) as Arc<dyn TransportChannel>
    });
    RetryTransportChannel::new("relay", strategy, retry)
}

impl Inner {
    fn outgoing(&self) -> Result<mpsc::UnboundedSender<Outgoing>, ChannelError> {
        match &*self.state.lock() {
            State::Joined(outgoing) if !self.close.is_closed() => Ok(outgoing.clone()),
            State::Created | State::Joining => Err(ChannelError::NotStarted("relay".to_string())),
            _ => Err(ChannelError::Closed),
        }
    }

    /// Connect and join; the whole exchange is bounded by `join_timeout`.
    async fn join(&self) -> Result<RelayStream, ChannelError> {
        let join_timeout = self.config.join_timeout;
        time::timeout(join_timeout, self.connect_and_join())
            .await
            .unwrap_or(Err(ChannelError::JoinTimeout(join_timeout)))
    }

    async fn connect_and_join(&self) -> Result<RelayStream, ChannelError> {
        let stream = TcpStream::connect(self.config.address()).await?;
        let mut io = Framed::new(stream, RelayCodec::new(self.config.max_line_length));

        let join = RelayMessage::join(
            self.identity,
            self.config.system_name.clone(),
            vec![self.config.channel.clone()],
        );
        let join_id = join.message_id();
        io.send(join).await?;

        loop {
            let message = io
                .next()
                .await
                .transpose()?
                .ok_or_else(|| ChannelError::RelayClosed("relay closed the connection during join".to_string()))?;
            match message {
                RelayMessage::Response {
                    result,
                    corresponding_id,
                    ..
                } if corresponding_id == join_id => {
                    return match *result {
                        RelayMessage::Status { status: code, .. } if status::is_success(code) => Ok(io),
                        RelayMessage::Status { status: code, .. } => {
                            Err(ChannelError::JoinRejected(format!("status {code}")))
                        }
                        other => Err(ChannelError::JoinRejected(format!(
                            "unexpected {} in join response",
                            other.type_name()
                        ))),
                    };
                }
                RelayMessage::RelayException { exception, .. } => {
                    return Err(ChannelError::JoinRejected(exception));
                }
                other => debug!("Ignoring {} before join completed", other.type_name()),
            }
        }
    }

    async fn run_session(self: Arc<Self>, mut io: RelayStream, mut outgoing: mpsc::UnboundedReceiver<Outgoing>) {
        let mut pending: HashMap<MessageId, oneshot::Sender<RelayMessage>> = HashMap::new();
        let ping_interval = self.config.ping_interval.max(Duration::from_millis(10));
        let mut ping = time::interval_at(time::Instant::now() + ping_interval, ping_interval);

        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    if let Err(e) = io.send(RelayMessage::leave()).await {
                        debug!("Failed to send leave to relay: {}", e);
                    }
                    break Ok(());
                }
                message = outgoing.recv() => match message {
                    Some(Outgoing::Message(message, promise)) => match io.send(message).await {
                        Ok(()) => {
                            if let Some(promise) = promise {
                                promise.succeed();
                            }
                        }
                        Err(e) => {
                            let error = ChannelError::from(e);
                            if let Some(promise) = promise {
                                promise.fail(error.clone());
                            }
                            break Err(error);
                        }
                    },
                    Some(Outgoing::Request(request, reply)) => {
                        pending.insert(request.message_id(), reply);
                        if let Err(e) = io.send(request).await {
                            break Err(e.into());
                        }
                    }
                    None => break Ok(()),
                },
                _ = ping.tick() => {
                    if let Err(e) = io.send(RelayMessage::ping()).await {
                        break Err(e.into());
                    }
                }
                message = io.next() => match message {
                    Some(Ok(message)) => {
                        if let Err(e) = self.on_message(&mut io, &mut pending, message).await {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(e.into()),
                    None => break Err(ChannelError::RelayClosed("relay closed the connection".to_string())),
                },
            }
        };

        *self.state.lock() = State::Closed;
        outgoing.close();
        let failure = match &result {
            Ok(()) => ChannelError::Closed,
            Err(e) => e.clone(),
        };
        while let Ok(message) = outgoing.try_recv() {
            if let Outgoing::Message(_, Some(promise)) = message {
                promise.fail(failure.clone());
            }
        }
        let _ = SinkExt::<RelayMessage>::close(&mut io).await;

        match &result {
            Ok(()) => info!("Left relay {}", self.config.address()),
            Err(e) => warn!("Relay session with {} ended: {}", self.config.address(), e),
        }
        self.close.complete(result);
    }

    async fn on_message(
        &self,
        io: &mut RelayStream,
        pending: &mut HashMap<MessageId, oneshot::Sender<RelayMessage>>,
        message: RelayMessage,
    ) -> Result<(), ChannelError> {
        match message {
            RelayMessage::Ping { message_id } => io.send(RelayMessage::pong(message_id)).await?,
            RelayMessage::Pong { .. } => debug!("Relay answered ping"),
            RelayMessage::ForwardableMessage { message_id, .. } => {
                let verdict = self.filter.lock().check_inbound(message_id);
                match verdict {
                    InboundVerdict::Fresh => {
                        if let Some(envelope) = message.into_envelope() {
                            self.sink.receive(envelope);
                        }
                    }
                    InboundVerdict::Duplicate => {
                        debug!("Message {} already processed", message_id);
                        io.send(RelayMessage::status_response(status::ALREADY_REPORTED, message_id))
                            .await?;
                    }
                }
            }
            RelayMessage::Response {
                result,
                corresponding_id,
                ..
            } => match pending.remove(&corresponding_id) {
                Some(reply) => {
                    let _ = reply.send(*result);
                }
                None => match *result {
                    RelayMessage::Status { status: code, .. } if !status::is_success(code) => {
                        warn!("Relay reported status {} for message {}", code, corresponding_id)
                    }
                    other => debug!("Uncorrelated {} for message {}", other.type_name(), corresponding_id),
                },
            },
            RelayMessage::Leave { .. } => {
                return Err(ChannelError::RelayClosed("relay asked us to leave".to_string()));
            }
            RelayMessage::RelayException { exception, .. } => {
                return Err(ChannelError::RelayClosed(exception));
            }
            other => debug!("Ignoring unexpected {} from relay", other.type_name()),
        }
        Ok(())
    }
}

#[async_trait]
impl TransportChannel for RelayTransportChannel {
    fn name(&self) -> &str {
        "relay"
    }

    async fn start(&self) -> Result<(), ChannelError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                State::Created => *state = State::Joining,
                State::Closed => return Err(ChannelError::Closed),
                State::Joining | State::Joined(_) => return Ok(()),
            }
        }

        let io = match self.inner.join().await {
            Ok(io) => io,
            Err(e) => {
                *self.inner.state.lock() = State::Closed;
                self.inner.close.complete(Err(e.clone()));
                warn!("Failed to join relay {}: {}", self.inner.config.address(), e);
                return Err(e);
            }
        };

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.state.lock();
            if matches!(*state, State::Closed) {
                return Err(ChannelError::Closed);
            }
            *state = State::Joined(outgoing_tx);
        }
        let session = tokio::spawn(Arc::clone(&self.inner).run_session(io, outgoing_rx));
        *self.inner.session.lock() = Some(session);

        info!(
            "Joined relay {} as {} ({})",
            self.inner.config.address(),
            self.inner.identity,
            self.inner.config.system_name
        );
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), State::Closed);
        self.inner.shutdown.cancel();

        let session = self.inner.session.lock().take();
        if let Some(session) = session {
            let _ = session.await;
        }
        if !matches!(previous, State::Closed) {
            self.inner.close.complete(Ok(()));
        }
        Ok(())
    }

    fn close_future(&self) -> CloseFuture {
        self.inner.close.future()
    }

    fn send(&self, envelope: OutboundEnvelope) -> Result<Delivery, ChannelError> {
        let outgoing = self.inner.outgoing()?;
        let message = RelayMessage::forward(&envelope);
        self.inner
            .filter
            .lock()
            .check_outbound(message.message_id(), message.is_repeatable())?;

        let (promise, delivery) = Delivery::pending();
        outgoing
            .send(Outgoing::Message(message, Some(promise)))
            .map_err(|_| ChannelError::RelayClosed("relay session ended".to_string()))?;
        Ok(delivery)
    }

    fn accept(&self, _recipient: &Identity) -> bool {
        matches!(*self.inner.state.lock(), State::Joined(_)) && !self.inner.close.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn config(addr: std::net::SocketAddr) -> RelayConfig {
        RelayConfig {
            join_timeout: Duration::from_millis(300),
            ..RelayConfig::new(format!("tcp://{addr}"))
        }
    }

    #[test]
    fn test_address_strips_scheme() {
        assert_eq!(RelayConfig::new("tcp://relay.example:22527").address(), "relay.example:22527");
        assert_eq!(RelayConfig::new("10.0.0.1:22527").address(), "10.0.0.1:22527");
    }

    #[tokio::test]
    async fn test_rejected_join_fails_start() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut io = Framed::new(stream, RelayCodec::default());
            let join = io.next().await.unwrap().unwrap();
            io.send(RelayMessage::status_response(status::CONFLICT, join.message_id()))
                .await
                .unwrap();
            // Keep the socket open until the client gives up.
            let _ = io.next().await;
        });

        let (sink, _inbox) = InboundSink::channel();
        let channel = RelayTransportChannel::new(Identity([1; 32]), config(addr), sink);
        assert!(matches!(channel.start().await, Err(ChannelError::JoinRejected(_))));
        assert!(matches!(channel.close_future().wait().await, Err(ChannelError::JoinRejected(_))));
        assert!(!channel.accept(&Identity([2; 32])));
    }

    #[tokio::test]
    async fn test_leave_from_relay_closes_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut io = Framed::new(stream, RelayCodec::default());
            let join = io.next().await.unwrap().unwrap();
            io.send(RelayMessage::status_response(status::OK, join.message_id()))
                .await
                .unwrap();
            io.send(RelayMessage::leave()).await.unwrap();
            let _ = io.next().await;
        });

        let (sink, _inbox) = InboundSink::channel();
        let channel = RelayTransportChannel::new(Identity([1; 32]), config(addr), sink);
        channel.start().await.unwrap();

        let closed = time::timeout(Duration::from_secs(2), channel.close_future().wait())
            .await
            .unwrap();
        assert!(matches!(closed, Err(ChannelError::RelayClosed(_))));
        assert!(!channel.accept(&Identity([2; 32])));
        assert!(matches!(
            channel.send(OutboundEnvelope::new(Identity([1; 32]), Identity([2; 32]), &b"x"[..])),
            Err(ChannelError::Closed)
        ));
        channel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_forward_gets_already_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let local = Identity([1; 32]);
        let remote = Identity([2; 32]);
        let forward = RelayMessage::forward(&OutboundEnvelope::new(remote, local, &b"once"[..]));
        let forward_id = forward.message_id();

        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut io = Framed::new(stream, RelayCodec::default());
            let join = io.next().await.unwrap().unwrap();
            io.send(RelayMessage::status_response(status::OK, join.message_id()))
                .await
                .unwrap();
            io.send(forward.clone()).await.unwrap();
            io.send(forward).await.unwrap();
            io.next().await.unwrap().unwrap()
        });

        let (sink, mut inbox) = InboundSink::channel();
        let channel = RelayTransportChannel::new(local, config(addr), sink);
        channel.start().await.unwrap();

        let reply = time::timeout(Duration::from_secs(2), relay).await.unwrap().unwrap();
        match reply {
            RelayMessage::Response {
                result,
                corresponding_id,
                ..
            } => {
                assert_eq!(corresponding_id, forward_id);
                assert!(matches!(*result, RelayMessage::Status { status: 208, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        let delivered = inbox.recv().await.unwrap();
        assert_eq!(&delivered.payload[..], b"once");
        assert!(inbox.try_recv().is_err());
        channel.shutdown().await.unwrap();
    }
}
