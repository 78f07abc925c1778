//! Direct TCP channel
//!
//! Listens for inbound connections, dials configured peers and keeps one
//! ARQ-protected connection per peer identity. Every connection runs in its
//! own task; a failure there closes that connection and nothing else.
//!
//! Connection lifecycle:
//! 1. Handshake: signed [`SystemNameMessage`] exchange within
//!    `handshake_timeout`.
//! 2. Registration in the [`PeerRegistry`]; a losing duplicate connection is
//!    closed right away.
//! 3. Steady state: data flows through the [`ConnectionPipeline`], keepalive
//!    pings go out after a third of `idle_timeout` without traffic.
//! 4. Teardown: the registry entry is removed and unacknowledged sends fail
//!    with [`ChannelError::ConnectionClosed`].

use crate::arq::{ArqConfig, ArqSegment, GoBackNArqEngine};
use crate::channel::{
    ChannelError, CloseFuture, CloseSignal, Delivery, DeliveryPromise, InboundSink, TransportChannel,
};
use crate::dedup::{DuplicateMessageFilter, InboundVerdict, DEFAULT_DEDUP_CAPACITY};
use crate::framing::{Frame, FrameCodec, FrameKind, DEFAULT_MAX_FRAME_SIZE};
use crate::handshake::{HandshakeStep, PeerHandshake, RemotePeer, Role, SystemNameMessage};
use crate::peer::{PeerConnectionEntry, PeerRegistry, Registration};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, SinkExt, StreamExt};
use overlay_core::{Identity, InboundEnvelope, KeyPair, OutboundEnvelope, WireEnvelope};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default port for direct connections
pub const DEFAULT_DIRECT_PORT: u16 = 22527;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

type FrameStream = Framed<TcpStream, FrameCodec>;

/// Direct channel configuration
#[derive(Clone, Debug)]
pub struct DirectConfig {
    /// Address to listen on
    pub listen: SocketAddr,
    /// Peers dialed on start
    pub peers: Vec<SocketAddr>,
    /// Name announced in the handshake
    pub system_name: String,
    pub handshake_timeout: Duration,
    /// Time without inbound traffic before a connection is dropped
    pub idle_timeout: Duration,
    pub max_frame_size: usize,
    pub arq: ArqConfig,
    pub dedup_capacity: usize,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_DIRECT_PORT)),
            peers: Vec::new(),
            system_name: "overlay-node".to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            arq: ArqConfig::default(),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }
}

#[derive(Debug)]
enum Command {
    Send {
        envelope: OutboundEnvelope,
        promise: DeliveryPromise,
    },
    Announce(SystemNameMessage),
}

/// What the registry stores to reach a connection task
#[derive(Clone, Debug)]
struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    filter: Arc<Mutex<DuplicateMessageFilter>>,
    closer: CancellationToken,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Starting,
    Running { local_addr: SocketAddr },
    Closed,
}

/// Frames to write and envelopes to hand upward after one inbound frame
#[derive(Debug, Default)]
pub(crate) struct Inbound {
    pub transmit: Vec<Frame>,
    pub deliver: Vec<InboundEnvelope>,
}

/// Data path of one established connection, free of I/O.
///
/// Outbound: envelope, postcard, ARQ, frames.
/// Inbound: frame, ARQ, envelope, sender check, duplicate filter.
pub(crate) struct ConnectionPipeline {
    peer: Identity,
    engine: GoBackNArqEngine<DeliveryPromise>,
    filter: Arc<Mutex<DuplicateMessageFilter>>,
}

impl ConnectionPipeline {
    pub fn new(peer: Identity, arq: &ArqConfig, filter: Arc<Mutex<DuplicateMessageFilter>>) -> Self {
        Self {
            peer,
            engine: GoBackNArqEngine::new(arq),
            filter,
        }
    }

    pub fn outbound(&mut self, envelope: &OutboundEnvelope, promise: DeliveryPromise, now: Instant) -> Vec<Frame> {
        // A message that never reaches the window must stay resendable.
        if self.engine.sender().is_saturated() {
            self.filter.lock().forget_outbound(&envelope.id);
            promise.fail(ChannelError::Backpressure(self.peer));
            return Vec::new();
        }
        let payload = match envelope.to_wire().encode() {
            Ok(payload) => payload,
            Err(e) => {
                self.filter.lock().forget_outbound(&envelope.id);
                promise.fail(ChannelError::Protocol(e.to_string()));
                return Vec::new();
            }
        };
        match self.engine.send(Bytes::from(payload), promise, now) {
            Ok(output) => to_frames(output.transmit),
            Err(e) => {
                self.filter.lock().forget_outbound(&envelope.id);
                warn!("Dropping message {} to {}: {}", envelope.id, self.peer, e);
                Vec::new()
            }
        }
    }

    pub fn inbound(&mut self, frame: &Frame, now: Instant) -> Result<Inbound, ChannelError> {
        let segment = ArqSegment::from_frame(frame)?;
        let output = self.engine.handle(segment, now);
        for promise in output.acknowledged {
            promise.succeed();
        }

        let mut deliver = Vec::with_capacity(output.delivered.len());
        for payload in output.delivered {
            let envelope: InboundEnvelope = match WireEnvelope::decode(&payload) {
                Ok(wire) => wire.into(),
                Err(e) => {
                    warn!("Dropping undecodable message from {}: {}", self.peer, e);
                    continue;
                }
            };
            if envelope.sender != self.peer {
                warn!(
                    "Dropping message {} claiming sender {} on connection with {}",
                    envelope.id, envelope.sender, self.peer
                );
                continue;
            }
            if self.filter.lock().check_inbound(envelope.id) == InboundVerdict::Duplicate {
                debug!("Message {} from {} already processed", envelope.id, self.peer);
                continue;
            }
            deliver.push(envelope);
        }

        Ok(Inbound {
            transmit: to_frames(output.transmit),
            deliver,
        })
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.engine.next_deadline()
    }

    pub fn poll_timeout(&mut self, now: Instant) -> Vec<Frame> {
        to_frames(self.engine.poll_timeout(now).transmit)
    }

    /// Fail every unacknowledged send
    pub fn fail_all(&mut self, cause: &str) {
        for promise in self.engine.fail_all() {
            promise.fail(ChannelError::ConnectionClosed {
                peer: self.peer,
                cause: cause.to_string(),
            });
        }
    }
}

fn to_frames(segments: Vec<ArqSegment>) -> Vec<Frame> {
    segments.iter().map(ArqSegment::to_frame).collect()
}

/// Per-connection state owned by the connection task
struct Link {
    connection_id: u64,
    remote_addr: SocketAddr,
    peer: RemotePeer,
    handshake: PeerHandshake,
    pipeline: ConnectionPipeline,
    last_received: Instant,
    last_sent: Instant,
}

impl Link {
    fn next_deadline(&self, idle_timeout: Duration) -> Instant {
        let idle = self.last_received + idle_timeout;
        let keepalive = self.last_sent + idle_timeout / 3;
        let mut deadline = idle.min(keepalive);
        if let Some(retransmit) = self.pipeline.next_deadline() {
            deadline = deadline.min(retransmit);
        }
        deadline
    }
}

struct Inner {
    keypair: KeyPair,
    identity: Identity,
    config: DirectConfig,
    announcement: RwLock<SystemNameMessage>,
    registry: PeerRegistry<ConnectionHandle>,
    sink: InboundSink,
    lifecycle: Mutex<Lifecycle>,
    close: CloseSignal,
    shutdown: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    next_connection_id: AtomicU64,
}

/// Peer-to-peer channel over TCP
pub struct DirectTransportChannel {
    inner: Arc<Inner>,
}

impl DirectTransportChannel {
    pub fn new(keypair: KeyPair, config: DirectConfig, sink: InboundSink) -> Self {
        let identity = keypair.identity();
        let announcement = SystemNameMessage::signed(&keypair, config.system_name.clone());
        Self {
            inner: Arc::new(Inner {
                keypair,
                identity,
                config,
                announcement: RwLock::new(announcement),
                registry: PeerRegistry::new(identity),
                sink,
                lifecycle: Mutex::new(Lifecycle::Created),
                close: CloseSignal::new(),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(JoinSet::new()),
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    /// Bound listen address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match *self.inner.lifecycle.lock() {
            Lifecycle::Running { local_addr } => Some(local_addr),
            _ => None,
        }
    }

    /// Dial `addr` and wait until the handshake completes.
    ///
    /// Returns the identity of the peer on the other end.
    pub async fn connect(&self, addr: SocketAddr) -> Result<Identity, ChannelError> {
        self.inner.ensure_running()?;
        let stream = TcpStream::connect(addr).await?;
        let (ready_tx, ready_rx) = oneshot::channel();
        self.inner
            .spawn_connection(stream, addr, Role::Initiator, Some(ready_tx));
        ready_rx.await.unwrap_or(Err(ChannelError::Closed))
    }

    /// Announce a new system name on every open connection
    pub fn set_system_name(&self, system_name: impl Into<String>) {
        let message = SystemNameMessage::signed(&self.inner.keypair, system_name);
        *self.inner.announcement.write() = message.clone();
        for identity in self.inner.registry.identities() {
            if let Some(handle) = self.inner.registry.handle(&identity) {
                if let Err(e) = handle.commands.try_send(Command::Announce(message.clone())) {
                    debug!("Rename not announced to {}: {}", identity, e);
                }
            }
        }
    }

    /// Identities with an established connection
    pub fn connected_peers(&self) -> Vec<Identity> {
        self.inner.registry.identities()
    }

    /// Name the peer announced most recently
    pub fn peer_name(&self, identity: &Identity) -> Option<String> {
        self.inner.registry.get(identity).map(|entry| entry.system_name)
    }
}

impl Inner {
    fn ensure_running(&self) -> Result<(), ChannelError> {
        match *self.lifecycle.lock() {
            Lifecycle::Running { .. } => Ok(()),
            Lifecycle::Closed => Err(ChannelError::Closed),
            _ => Err(ChannelError::NotStarted("direct".to_string())),
        }
    }

    fn spawn_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        role: Role,
        ready: Option<oneshot::Sender<Result<Identity, ChannelError>>>,
    ) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let inner = Arc::clone(self);
        self.tasks
            .lock()
            .spawn(inner.run_connection(stream, remote_addr, role, ready));
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        debug!("Accepted connection from {}", remote_addr);
                        self.spawn_connection(stream, remote_addr, Role::Responder, None);
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        debug!("Accept loop stopped");
    }

    async fn dial(self: Arc<Self>, addr: SocketAddr) {
        let connected = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            connected = TcpStream::connect(addr) => connected,
        };
        match connected {
            Ok(stream) => self.run_connection(stream, addr, Role::Initiator, None).await,
            Err(e) => warn!("Failed to connect to {}: {}", addr, e),
        }
    }

    async fn run_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        role: Role,
        ready: Option<oneshot::Sender<Result<Identity, ChannelError>>>,
    ) {
        let _ = stream.set_nodelay(true);
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let mut io = Framed::new(stream, FrameCodec::with_max_frame_size(self.config.max_frame_size));
        let mut handshake = PeerHandshake::new(role, self.announcement.read().clone());

        let handshake_timeout = self.config.handshake_timeout;
        let established = tokio::select! {
            _ = self.shutdown.cancelled() => Err(ChannelError::Closed),
            result = time::timeout(handshake_timeout, exchange_names(&mut io, &mut handshake)) => {
                result.unwrap_or_else(|_| {
                    Err(ChannelError::Handshake(format!("no system name within {:?}", handshake_timeout)))
                })
            }
        };
        let peer = match established {
            Ok(peer) => peer,
            Err(e) => {
                warn!("Handshake with {} failed: {}", remote_addr, e);
                if let Some(ready) = ready {
                    let _ = ready.send(Err(e));
                }
                return;
            }
        };

        let (commands_tx, mut commands) = mpsc::channel(self.config.arq.max_pending.max(1));
        let handle = ConnectionHandle {
            commands: commands_tx,
            filter: Arc::new(Mutex::new(DuplicateMessageFilter::new(self.config.dedup_capacity))),
            closer: self.shutdown.child_token(),
        };
        let initiator = match role {
            Role::Initiator => self.identity,
            Role::Responder => peer.identity,
        };

        let registration = self.registry.register(PeerConnectionEntry {
            identity: peer.identity,
            system_name: peer.system_name.clone(),
            remote_addr,
            connection_id,
            initiator,
            handle: handle.clone(),
            established_at: Instant::now(),
        });
        match registration {
            Registration::Inserted | Registration::Renamed { .. } => {
                info!(
                    "Connected to peer {} ({}) at {}",
                    peer.identity, peer.system_name, remote_addr
                );
            }
            Registration::Replaced(old) => {
                old.handle.closer.cancel();
                info!(
                    "Connected to peer {} ({}) at {}, replacing connection {}",
                    peer.identity, peer.system_name, remote_addr, old.connection_id
                );
            }
            Registration::Rejected => {
                debug!(
                    "Keeping existing connection to {}, dropping connection {} from {}",
                    peer.identity, connection_id, remote_addr
                );
                if let Some(ready) = ready {
                    let _ = ready.send(Ok(peer.identity));
                }
                let _ = SinkExt::<Frame>::close(&mut io).await;
                return;
            }
        }
        if let Some(ready) = ready {
            let _ = ready.send(Ok(peer.identity));
        }

        let now = Instant::now();
        let mut link = Link {
            connection_id,
            remote_addr,
            pipeline: ConnectionPipeline::new(peer.identity, &self.config.arq, Arc::clone(&handle.filter)),
            peer,
            handshake,
            last_received: now,
            last_sent: now,
        };
        let closer = handle.closer.clone();
        drop(handle);

        let cause = self.drive(&mut io, &mut link, &mut commands, &closer).await;

        self.registry.remove(&link.peer.identity, link.connection_id);
        link.pipeline.fail_all(&cause);
        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let Command::Send { promise, .. } = command {
                promise.fail(ChannelError::ConnectionClosed {
                    peer: link.peer.identity,
                    cause: cause.clone(),
                });
            }
        }
        let _ = SinkExt::<Frame>::close(&mut io).await;
        info!(
            "Connection {} to peer {} at {} closed: {}",
            link.connection_id, link.peer.identity, link.remote_addr, cause
        );
    }

    /// Run an established connection until it closes; returns the cause.
    async fn drive(
        &self,
        io: &mut FrameStream,
        link: &mut Link,
        commands: &mut mpsc::Receiver<Command>,
        closer: &CancellationToken,
    ) -> String {
        let idle_timeout = self.config.idle_timeout;
        loop {
            let deadline = time::Instant::from_std(link.next_deadline(idle_timeout));
            let step = tokio::select! {
                _ = closer.cancelled() => {
                    return if self.shutdown.is_cancelled() {
                        "channel shut down".to_string()
                    } else {
                        "replaced by another connection".to_string()
                    };
                }
                command = commands.recv() => match command {
                    Some(command) => self.on_command(link, command),
                    None => return "connection handle dropped".to_string(),
                },
                frame = io.next() => match frame {
                    Some(Ok(frame)) => self.on_frame(link, frame),
                    Some(Err(e)) => return format!("read failed: {e}"),
                    None => return "closed by peer".to_string(),
                },
                _ = time::sleep_until(deadline) => on_tick(link, idle_timeout),
            };

            match step {
                Ok(frames) if frames.is_empty() => {}
                Ok(frames) => {
                    let mut frames = stream::iter(frames.into_iter().map(Ok));
                    if let Err(e) = io.send_all(&mut frames).await {
                        return format!("write failed: {e}");
                    }
                    link.last_sent = Instant::now();
                }
                Err(cause) => return cause,
            }
        }
    }

    fn on_command(&self, link: &mut Link, command: Command) -> Result<Vec<Frame>, String> {
        match command {
            Command::Send { envelope, promise } => Ok(link.pipeline.outbound(&envelope, promise, Instant::now())),
            Command::Announce(message) => message
                .to_frame()
                .map(|frame| vec![frame])
                .map_err(|e| format!("cannot encode system name: {e}")),
        }
    }

    fn on_frame(&self, link: &mut Link, frame: Frame) -> Result<Vec<Frame>, String> {
        let now = Instant::now();
        link.last_received = now;
        match frame.kind {
            FrameKind::SystemName => {
                let step = SystemNameMessage::from_frame(&frame)
                    .and_then(|message| link.handshake.on_system_name(message))
                    .map_err(|e| format!("handshake violation: {e}"))?;
                if let HandshakeStep::Renamed { peer } = step {
                    if let Some(previous) =
                        self.registry
                            .rename(&peer.identity, link.connection_id, peer.system_name.clone())
                    {
                        info!("Peer {} renamed from {} to {}", peer.identity, previous, peer.system_name);
                    }
                    link.peer = peer;
                }
                Ok(Vec::new())
            }
            FrameKind::ArqData | FrameKind::ArqAck => {
                let inbound = link.pipeline.inbound(&frame, now).map_err(|e| e.to_string())?;
                for envelope in inbound.deliver {
                    self.sink.receive(envelope);
                }
                Ok(inbound.transmit)
            }
            FrameKind::Ping => Ok(vec![Frame::pong()]),
            FrameKind::Pong => Ok(Vec::new()),
        }
    }
}

fn on_tick(link: &mut Link, idle_timeout: Duration) -> Result<Vec<Frame>, String> {
    let now = Instant::now();
    if now.saturating_duration_since(link.last_received) >= idle_timeout {
        return Err(format!("idle for {:?}", idle_timeout));
    }
    let mut frames = link.pipeline.poll_timeout(now);
    if frames.is_empty() && now.saturating_duration_since(link.last_sent) >= idle_timeout / 3 {
        frames.push(Frame::ping());
    }
    Ok(frames)
}

/// Exchange system names until the peer is known
async fn exchange_names(io: &mut FrameStream, handshake: &mut PeerHandshake) -> Result<RemotePeer, ChannelError> {
    if let Some(hello) = handshake.opening() {
        io.send(hello.to_frame()?).await?;
    }
    loop {
        let frame = io
            .next()
            .await
            .transpose()?
            .ok_or_else(|| ChannelError::Handshake("peer closed the connection".to_string()))?;
        let message = SystemNameMessage::from_frame(&frame)?;
        if let HandshakeStep::Established { peer, reply } = handshake.on_system_name(message)? {
            if let Some(reply) = reply {
                io.send(reply.to_frame()?).await?;
            }
            return Ok(peer);
        }
    }
}

#[async_trait]
impl TransportChannel for DirectTransportChannel {
    fn name(&self) -> &str {
        "direct"
    }

    async fn start(&self) -> Result<(), ChannelError> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Running { .. } | Lifecycle::Starting => return Ok(()),
                Lifecycle::Closed => return Err(ChannelError::Closed),
                Lifecycle::Created => *lifecycle = Lifecycle::Starting,
            }
        }

        let bound = match TcpListener::bind(self.inner.config.listen).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                let mut lifecycle = self.inner.lifecycle.lock();
                if *lifecycle == Lifecycle::Starting {
                    *lifecycle = Lifecycle::Created;
                }
                return Err(e.into());
            }
        };

        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if *lifecycle == Lifecycle::Closed {
                return Err(ChannelError::Closed);
            }
            *lifecycle = Lifecycle::Running { local_addr };
        }
        info!(
            "Direct channel for {} listening on {}",
            self.inner.identity, local_addr
        );

        let mut tasks = self.inner.tasks.lock();
        tasks.spawn(Arc::clone(&self.inner).accept_loop(listener));
        for addr in self.inner.config.peers.iter().copied() {
            tasks.spawn(Arc::clone(&self.inner).dial(addr));
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if *lifecycle == Lifecycle::Closed {
                return Ok(());
            }
            *lifecycle = Lifecycle::Closed;
        }

        self.inner.shutdown.cancel();
        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
        while tasks.join_next().await.is_some() {}
        self.inner.registry.drain();

        self.inner.close.complete(Ok(()));
        info!("Direct channel for {} shut down", self.inner.identity);
        Ok(())
    }

    fn close_future(&self) -> CloseFuture {
        self.inner.close.future()
    }

    fn send(&self, envelope: OutboundEnvelope) -> Result<Delivery, ChannelError> {
        self.inner.ensure_running()?;
        let recipient = envelope.recipient;
        let handle = self
            .inner
            .registry
            .handle(&recipient)
            .ok_or(ChannelError::Unreachable(recipient))?;
        let id = envelope.id;
        handle.filter.lock().check_outbound(id, false)?;

        let (promise, delivery) = Delivery::pending();
        if let Err(e) = handle.commands.try_send(Command::Send { envelope, promise }) {
            handle.filter.lock().forget_outbound(&id);
            return Err(match e {
                TrySendError::Full(_) => ChannelError::Backpressure(recipient),
                TrySendError::Closed(_) => ChannelError::ConnectionClosed {
                    peer: recipient,
                    cause: "connection is closing".to_string(),
                },
            });
        }
        Ok(delivery)
    }

    fn accept(&self, recipient: &Identity) -> bool {
        self.inner.ensure_running().is_ok() && self.inner.registry.contains(recipient)
    }

    fn local_addresses(&self) -> Vec<String> {
        self.local_addr()
            .map(|addr| vec![format!("tcp://{addr}")])
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Node {
        keypair: KeyPair,
        channel: DirectTransportChannel,
        inbox: mpsc::UnboundedReceiver<InboundEnvelope>,
    }

    impl Node {
        fn identity(&self) -> Identity {
            self.keypair.identity()
        }

        fn addr(&self) -> SocketAddr {
            self.channel.local_addr().unwrap()
        }
    }

    fn test_config(name: &str) -> DirectConfig {
        DirectConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            system_name: name.to_string(),
            handshake_timeout: Duration::from_secs(2),
            ..DirectConfig::default()
        }
    }

    async fn node(seed: u8, config: DirectConfig) -> Node {
        let keypair = KeyPair::from_seed(&[seed; 32]);
        let (sink, inbox) = InboundSink::channel();
        let channel = DirectTransportChannel::new(keypair.clone(), config, sink);
        channel.start().await.unwrap();
        Node { keypair, channel, inbox }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        time::timeout(Duration::from_secs(5), async {
            while !condition() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn connected_pair() -> (Node, Node) {
        let a = node(1, test_config("alpha")).await;
        let b = node(2, test_config("beta")).await;
        assert_eq!(a.channel.connect(b.addr()).await.unwrap(), b.identity());
        let a_id = a.identity();
        eventually(|| b.channel.accept(&a_id)).await;
        (a, b)
    }

    fn pipeline(peer: Identity) -> ConnectionPipeline {
        ConnectionPipeline::new(peer, &ArqConfig::default(), Arc::new(Mutex::new(DuplicateMessageFilter::new(16))))
    }

    #[tokio::test]
    async fn test_send_over_established_connection() {
        let (a, mut b) = connected_pair().await;

        let envelope = OutboundEnvelope::new(a.identity(), b.identity(), &b"hello"[..]);
        let delivery = a.channel.send(envelope.clone()).unwrap();
        delivery.wait().await.unwrap();

        let received = time::timeout(Duration::from_secs(2), b.inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.id, envelope.id);
        assert_eq!(received.sender, a.identity());
        assert_eq!(&received.payload[..], b"hello");

        time::sleep(Duration::from_millis(50)).await;
        assert!(b.inbox.try_recv().is_err());

        // The same connection carries the reply.
        assert!(b.channel.accept(&a.identity()));
        b.channel
            .send(OutboundEnvelope::new(b.identity(), a.identity(), &b"hi"[..]))
            .unwrap()
            .wait()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resending_same_message_id_is_rejected() {
        let (a, b) = connected_pair().await;
        let envelope = OutboundEnvelope::new(a.identity(), b.identity(), &b"once"[..]);

        a.channel.send(envelope.clone()).unwrap();
        assert!(matches!(a.channel.send(envelope), Err(ChannelError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_message_refused_by_backpressure_can_be_resent() {
        let narrow = |name: &str| DirectConfig {
            arq: ArqConfig {
                max_pending: 1,
                ..ArqConfig::default()
            },
            ..test_config(name)
        };
        let a = node(5, narrow("alpha")).await;
        let mut b = node(6, narrow("beta")).await;
        a.channel.connect(b.addr()).await.unwrap();
        let (a_id, b_id) = (a.identity(), b.identity());

        let first = a.channel.send(OutboundEnvelope::new(a_id, b_id, &b"first"[..])).unwrap();
        let second = OutboundEnvelope::new(a_id, b_id, &b"second"[..]);
        assert!(matches!(
            a.channel.send(second.clone()),
            Err(ChannelError::Backpressure(peer)) if peer == b_id
        ));

        first.wait().await.unwrap();
        a.channel.send(second.clone()).unwrap().wait().await.unwrap();

        let mut received = Vec::new();
        while received.len() < 2 {
            let envelope = time::timeout(Duration::from_secs(2), b.inbox.recv())
                .await
                .unwrap()
                .unwrap();
            received.push(envelope.id);
        }
        assert_eq!(received[1], second.id);
    }

    #[tokio::test]
    async fn test_rename_keeps_single_registry_entry() {
        let (a, b) = connected_pair().await;
        let a_id = a.identity();
        assert_eq!(b.channel.peer_name(&a_id).as_deref(), Some("alpha"));

        a.channel.set_system_name("alpha-2");
        eventually(|| b.channel.peer_name(&a_id).as_deref() == Some("alpha-2")).await;
        assert_eq!(b.channel.connected_peers(), vec![a_id]);
    }

    #[tokio::test]
    async fn test_simultaneous_connects_settle_on_one_connection() {
        let a = node(3, test_config("alpha")).await;
        let b = node(4, test_config("beta")).await;

        let (ab, ba) = tokio::join!(a.channel.connect(b.addr()), b.channel.connect(a.addr()));
        assert_eq!(ab.unwrap(), b.identity());
        assert_eq!(ba.unwrap(), a.identity());

        let (a_id, b_id) = (a.identity(), b.identity());
        eventually(|| a.channel.connected_peers() == vec![b_id] && b.channel.connected_peers() == vec![a_id]).await;
        // Let the losing socket finish closing on both ends.
        time::sleep(Duration::from_millis(200)).await;

        a.channel
            .send(OutboundEnvelope::new(a_id, b_id, &b"ping"[..]))
            .unwrap()
            .wait()
            .await
            .unwrap();
        b.channel
            .send(OutboundEnvelope::new(b_id, a_id, &b"pong"[..]))
            .unwrap()
            .wait()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_peer_shutdown_tears_down_connection() {
        let (a, b) = connected_pair().await;
        let b_id = b.identity();
        let close = b.channel.close_future();

        b.channel.shutdown().await.unwrap();
        assert!(close.wait().await.is_ok());
        b.channel.shutdown().await.unwrap();
        assert!(matches!(
            b.channel.send(OutboundEnvelope::new(b_id, a.identity(), &b"late"[..])),
            Err(ChannelError::Closed)
        ));

        eventually(|| !a.channel.accept(&b_id)).await;
        assert!(matches!(
            a.channel.send(OutboundEnvelope::new(a.identity(), b_id, &b"gone"[..])),
            Err(ChannelError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_garbage_peer_is_disconnected() {
        let (a, b) = connected_pair().await;

        let mut raw = TcpStream::connect(a.addr()).await.unwrap();
        raw.write_all(&[0, 0, 0, 4, 0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();
        let mut buf = [0u8; 16];
        let read = time::timeout(Duration::from_secs(2), raw.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(read, 0);

        // Other connections are unaffected.
        a.channel
            .send(OutboundEnvelope::new(a.identity(), b.identity(), &b"still here"[..]))
            .unwrap()
            .wait()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_silent_peer_hits_handshake_timeout() {
        let a = node(
            5,
            DirectConfig {
                handshake_timeout: Duration::from_millis(200),
                ..test_config("alpha")
            },
        )
        .await;

        let mut raw = TcpStream::connect(a.addr()).await.unwrap();
        let mut buf = [0u8; 16];
        let read = time::timeout(Duration::from_secs(2), raw.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(read, 0);
        assert!(a.channel.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let keypair = KeyPair::from_seed(&[6; 32]);
        let (sink, _inbox) = InboundSink::channel();
        let channel = DirectTransportChannel::new(keypair.clone(), test_config("idle"), sink);

        let envelope = OutboundEnvelope::new(keypair.identity(), Identity([9; 32]), &b"x"[..]);
        assert!(matches!(channel.send(envelope), Err(ChannelError::NotStarted(_))));
        assert!(!channel.accept(&Identity([9; 32])));
    }

    #[tokio::test]
    async fn test_pipeline_delivers_once_and_acknowledges() {
        let alice = Identity([1; 32]);
        let bob = Identity([2; 32]);
        let mut at_alice = pipeline(bob);
        let mut at_bob = pipeline(alice);
        let now = Instant::now();

        let (promise, delivery) = Delivery::pending();
        let frames = at_alice.outbound(&OutboundEnvelope::new(alice, bob, &b"data"[..]), promise, now);
        assert_eq!(frames.len(), 1);

        let inbound = at_bob.inbound(&frames[0], now).unwrap();
        assert_eq!(inbound.deliver.len(), 1);
        assert_eq!(inbound.deliver[0].sender, alice);

        // A retransmitted copy is acknowledged again but not delivered.
        let again = at_bob.inbound(&frames[0], now).unwrap();
        assert!(again.deliver.is_empty());
        assert_eq!(again.transmit.len(), 1);

        for ack in inbound.transmit {
            at_alice.inbound(&ack, now).unwrap();
        }
        assert!(delivery.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_pipeline_drops_spoofed_sender() {
        let alice = Identity([1; 32]);
        let bob = Identity([2; 32]);
        let mallory = Identity([3; 32]);
        let mut at_mallory = pipeline(bob);
        let mut at_bob = pipeline(alice);
        let now = Instant::now();

        let (promise, _delivery) = Delivery::pending();
        let frames = at_mallory.outbound(&OutboundEnvelope::new(mallory, bob, &b"forged"[..]), promise, now);
        let inbound = at_bob.inbound(&frames[0], now).unwrap();
        assert!(inbound.deliver.is_empty());
    }

    #[tokio::test]
    async fn test_saturated_pipeline_forgets_refused_id() {
        let alice = Identity([1; 32]);
        let bob = Identity([2; 32]);
        let arq = ArqConfig {
            window_size: 1,
            max_pending: 1,
            ..ArqConfig::default()
        };
        let filter = Arc::new(Mutex::new(DuplicateMessageFilter::new(16)));
        let mut at_alice = ConnectionPipeline::new(bob, &arq, filter.clone());
        let now = Instant::now();

        let mut deliveries = Vec::new();
        let mut envelopes = Vec::new();
        for body in [&b"one"[..], b"two", b"three"] {
            let envelope = OutboundEnvelope::new(alice, bob, body);
            filter.lock().check_outbound(envelope.id, false).unwrap();
            let (promise, delivery) = Delivery::pending();
            at_alice.outbound(&envelope, promise, now);
            deliveries.push(delivery);
            envelopes.push(envelope);
        }

        let refused = deliveries.pop().unwrap();
        assert!(matches!(refused.wait().await, Err(ChannelError::Backpressure(peer)) if peer == bob));
        let filter = filter.lock();
        assert!(filter.outbound().contains(&envelopes[0].id));
        assert!(filter.outbound().contains(&envelopes[1].id));
        assert!(!filter.outbound().contains(&envelopes[2].id));
    }

    #[tokio::test]
    async fn test_unacked_send_fails_on_teardown() {
        let alice = Identity([1; 32]);
        let bob = Identity([2; 32]);
        let mut at_alice = pipeline(bob);

        let (promise, delivery) = Delivery::pending();
        at_alice.outbound(&OutboundEnvelope::new(alice, bob, &b"lost"[..]), promise, Instant::now());
        at_alice.fail_all("closed by peer");

        match delivery.wait().await {
            Err(ChannelError::ConnectionClosed { peer, cause }) => {
                assert_eq!(peer, bob);
                assert_eq!(cause, "closed by peer");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
