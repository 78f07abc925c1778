//! Reconnecting channel decorator
//!
//! [`RetryTransportChannel`] wraps channels produced by a [`RetryStrategy`].
//! When the wrapped channel fails to start or closes unexpectedly, the
//! strategy builds a brand-new instance, paced by a [`RetryAgent`]:
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CONNECTED -> RECONNECTING -> CONNECTING -> ...
//!                                   \-> CLOSED (shutdown or retries exhausted)
//! ```

use crate::channel::{ChannelError, CloseFuture, CloseSignal, Delivery, TransportChannel};
use async_trait::async_trait;
use overlay_core::{Identity, OutboundEnvelope};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);

pub const DEFAULT_MAX_RETRIES: u32 = 5;

pub const DEFAULT_FORGET_DELAY: Duration = Duration::from_secs(300);

/// Backoff parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Delay unit; attempt `n` waits `delay * (n - 1)`
    pub delay: Duration,
    /// Give up once this many attempts failed within the forget window
    pub max_retries: u32,
    /// Quiet period after which earlier failures are forgotten
    pub forget_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RETRY_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
            forget_delay: DEFAULT_FORGET_DELAY,
        }
    }
}

/// Counts failed attempts and computes the next delay
#[derive(Debug)]
pub struct RetryAgent {
    config: RetryConfig,
    attempts: u32,
    last_retry: Option<Instant>,
}

impl RetryAgent {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: 0,
            last_retry: None,
        }
    }

    /// Record a failed attempt at `now`
    pub fn retry(&mut self, now: Instant) {
        self.forget(now);
        self.attempts = self.attempts.saturating_add(1);
        self.last_retry = Some(now);
    }

    /// Delay before the next attempt; the first retry is immediate.
    pub fn attempt_delay(&self) -> Duration {
        self.config.delay * self.attempts.saturating_sub(1)
    }

    /// Whether the attempt budget is used up
    pub fn too_many_retries(&mut self, now: Instant) -> bool {
        self.forget(now);
        self.attempts >= self.config.max_retries
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn forget(&mut self, now: Instant) {
        if let Some(last) = self.last_retry {
            if now > last + self.config.forget_delay {
                self.attempts = 0;
            }
        }
    }
}

/// Source of replacement channels
#[async_trait]
pub trait RetryStrategy: Send + Sync + 'static {
    /// Shut down `old` (if any) and build a fresh, unstarted channel.
    async fn next_channel(
        &self,
        old: Option<Arc<dyn TransportChannel>>,
    ) -> Result<Arc<dyn TransportChannel>, ChannelError>;

    /// Whether another channel can still be produced
    fn next_channel_available(&self) -> bool {
        true
    }
}

/// Strategy that calls a constructor for every new channel
pub struct FactoryRetryStrategy<F> {
    factory: F,
}

impl<F> FactoryRetryStrategy<F>
where
    F: Fn() -> Arc<dyn TransportChannel> + Send + Sync + 'static,
{
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl<F> RetryStrategy for FactoryRetryStrategy<F>
where
    F: Fn() -> Arc<dyn TransportChannel> + Send + Sync + 'static,
{
    async fn next_channel(
        &self,
        old: Option<Arc<dyn TransportChannel>>,
    ) -> Result<Arc<dyn TransportChannel>, ChannelError> {
        if let Some(old) = old {
            if let Err(e) = old.shutdown().await {
                debug!("Failed to shut down replaced {} channel: {}", old.name(), e);
            }
        }
        Ok((self.factory)())
    }
}

/// Connection state of a [`RetryTransportChannel`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

struct Inner {
    name: String,
    strategy: Box<dyn RetryStrategy>,
    agent: Mutex<RetryAgent>,
    phase: Mutex<RetryPhase>,
    current: RwLock<Option<Arc<dyn TransportChannel>>>,
    close: CloseSignal,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Channel that replaces its wrapped channel after failures
pub struct RetryTransportChannel {
    inner: Arc<Inner>,
}

impl RetryTransportChannel {
    pub fn new(name: impl Into<String>, strategy: impl RetryStrategy, config: RetryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                strategy: Box::new(strategy),
                agent: Mutex::new(RetryAgent::new(config)),
                phase: Mutex::new(RetryPhase::Disconnected),
                current: RwLock::new(None),
                close: CloseSignal::new(),
                cancel: CancellationToken::new(),
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn phase(&self) -> RetryPhase {
        *self.inner.phase.lock()
    }

    /// Failed attempts in the current forget window
    pub fn attempts(&self) -> u32 {
        self.inner.agent.lock().attempts()
    }

    /// The wrapped channel while connected
    pub fn current(&self) -> Option<Arc<dyn TransportChannel>> {
        match self.phase() {
            RetryPhase::Connected => self.inner.current.read().clone(),
            _ => None,
        }
    }
}

impl Inner {
    /// Obtain and start channels until one is up.
    ///
    /// `failure` is the error that made a reconnect necessary, if any; it
    /// counts as an attempt before the first new channel is built.
    async fn connect(&self, mut failure: Option<ChannelError>) -> Result<(), ChannelError> {
        loop {
            if let Some(error) = failure.take() {
                self.back_off(error).await?;
            }
            match self.attempt().await {
                Ok(channel) => return self.install(channel).await,
                Err(_) if self.cancel.is_cancelled() => return Err(ChannelError::Closed),
                Err(e) => failure = Some(e),
            }
        }
    }

    async fn attempt(&self) -> Result<Arc<dyn TransportChannel>, ChannelError> {
        let old = self.current.write().take();
        let channel = self.strategy.next_channel(old).await?;
        let started = tokio::select! {
            _ = self.cancel.cancelled() => Err(ChannelError::Closed),
            started = channel.start() => started,
        };
        match started {
            Ok(()) => Ok(channel),
            Err(e) => {
                // Kept so the strategy shuts it down on the next attempt.
                *self.current.write() = Some(channel);
                Err(e)
            }
        }
    }

    async fn back_off(&self, error: ChannelError) -> Result<(), ChannelError> {
        let (exhausted, attempts, delay) = {
            let mut agent = self.agent.lock();
            let now = Instant::now();
            agent.retry(now);
            (agent.too_many_retries(now), agent.attempts(), agent.attempt_delay())
        };

        if exhausted || !self.strategy.next_channel_available() {
            error!(
                "{} channel failed {} times, giving up: {}",
                self.name, attempts, error
            );
            return Err(ChannelError::RetriesExhausted {
                attempts,
                last: Box::new(error),
            });
        }

        warn!(
            "{} channel failed (attempt {}), retrying in {:?}: {}",
            self.name, attempts, delay, error
        );
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ChannelError::Closed),
            _ = time::sleep(delay) => Ok(()),
        }
    }

    /// Make `channel` current unless shutdown began in the meantime.
    async fn install(&self, channel: Arc<dyn TransportChannel>) -> Result<(), ChannelError> {
        let installed = {
            let mut phase = self.phase.lock();
            if *phase == RetryPhase::Closed {
                false
            } else {
                *self.current.write() = Some(Arc::clone(&channel));
                *phase = RetryPhase::Connected;
                true
            }
        };
        if !installed {
            let _ = channel.shutdown().await;
            return Err(ChannelError::Closed);
        }
        info!("{} channel connected", self.name);
        Ok(())
    }

    fn set_phase(&self, next: RetryPhase) -> bool {
        let mut phase = self.phase.lock();
        if *phase == RetryPhase::Closed {
            return false;
        }
        *phase = next;
        true
    }

    fn give_up(&self, error: ChannelError) {
        *self.phase.lock() = RetryPhase::Closed;
        self.close.complete(Err(error));
    }

    /// Watch the current channel and replace it when it closes
    async fn supervise(self: Arc<Self>) {
        loop {
            let Some(channel) = self.current.read().clone() else {
                return;
            };
            let closed = tokio::select! {
                _ = self.cancel.cancelled() => return,
                closed = channel.close_future().wait() => closed,
            };
            if self.cancel.is_cancelled() {
                return;
            }

            let failure = match closed {
                Ok(()) => ChannelError::Closed,
                Err(e) => e,
            };
            warn!("{} channel lost: {}", self.name, failure);
            if !self.set_phase(RetryPhase::Reconnecting) {
                return;
            }

            match self.connect(Some(failure)).await {
                Ok(()) => {}
                Err(_) if self.cancel.is_cancelled() => return,
                Err(e) => {
                    self.give_up(e);
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl TransportChannel for RetryTransportChannel {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn start(&self) -> Result<(), ChannelError> {
        {
            let mut phase = self.inner.phase.lock();
            match *phase {
                RetryPhase::Disconnected => *phase = RetryPhase::Connecting,
                RetryPhase::Closed => return Err(ChannelError::Closed),
                _ => return Ok(()),
            }
        }

        match self.inner.connect(None).await {
            Ok(()) => {
                let supervisor = tokio::spawn(Arc::clone(&self.inner).supervise());
                *self.inner.supervisor.lock() = Some(supervisor);
                Ok(())
            }
            Err(e) if self.inner.cancel.is_cancelled() => Err(e),
            Err(e) => {
                self.inner.give_up(e.clone());
                Err(e)
            }
        }
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        {
            let mut phase = self.inner.phase.lock();
            if *phase == RetryPhase::Closed && self.inner.cancel.is_cancelled() {
                return Ok(());
            }
            *phase = RetryPhase::Closed;
        }
        self.inner.cancel.cancel();

        let supervisor = self.inner.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }
        let current = self.inner.current.write().take();
        if let Some(channel) = current {
            if let Err(e) = channel.shutdown().await {
                debug!("Failed to shut down {} channel: {}", channel.name(), e);
            }
        }

        self.inner.close.complete(Ok(()));
        info!("{} channel shut down", self.inner.name);
        Ok(())
    }

    fn close_future(&self) -> CloseFuture {
        self.inner.close.future()
    }

    fn send(&self, envelope: OutboundEnvelope) -> Result<Delivery, ChannelError> {
        match self.phase() {
            RetryPhase::Connected => match self.inner.current.read().clone() {
                Some(channel) => channel.send(envelope),
                None => Err(ChannelError::Reconnecting),
            },
            RetryPhase::Disconnected => Err(ChannelError::NotStarted(self.inner.name.clone())),
            RetryPhase::Connecting | RetryPhase::Reconnecting => Err(ChannelError::Reconnecting),
            RetryPhase::Closed => Err(ChannelError::Closed),
        }
    }

    fn accept(&self, recipient: &Identity) -> bool {
        self.current()
            .map(|channel| channel.accept(recipient))
            .unwrap_or(false)
    }

    fn local_addresses(&self) -> Vec<String> {
        self.current()
            .map(|channel| channel.local_addresses())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            delay: Duration::from_millis(10),
            max_retries,
            forget_delay: Duration::from_secs(60),
        }
    }

    struct FakeChannel {
        fail_start: Option<ChannelError>,
        close: CloseSignal,
    }

    impl FakeChannel {
        fn new(fail_start: Option<ChannelError>) -> Arc<Self> {
            Arc::new(Self {
                fail_start,
                close: CloseSignal::new(),
            })
        }
    }

    #[async_trait]
    impl TransportChannel for FakeChannel {
        fn name(&self) -> &str {
            "fake"
        }

        async fn start(&self) -> Result<(), ChannelError> {
            match &self.fail_start {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        async fn shutdown(&self) -> Result<(), ChannelError> {
            self.close.complete(Ok(()));
            Ok(())
        }

        fn close_future(&self) -> CloseFuture {
            self.close.future()
        }

        fn send(&self, _envelope: OutboundEnvelope) -> Result<Delivery, ChannelError> {
            Ok(Delivery::completed())
        }

        fn accept(&self, _recipient: &Identity) -> bool {
            true
        }
    }

    /// Strategy that records every channel it builds
    fn recording(
        fail_start: Option<ChannelError>,
    ) -> (
        FactoryRetryStrategy<impl Fn() -> Arc<dyn TransportChannel> + Send + Sync + 'static>,
        Arc<Mutex<Vec<Arc<FakeChannel>>>>,
    ) {
        let built = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&built);
        let strategy = FactoryRetryStrategy::new(move || {
            let channel = FakeChannel::new(fail_start.clone());
            record.lock().push(Arc::clone(&channel));
            channel as Arc<dyn TransportChannel>
        });
        (strategy, built)
    }

    fn envelope() -> OutboundEnvelope {
        OutboundEnvelope::new(Identity([1; 32]), Identity([2; 32]), &b"x"[..])
    }

    #[test]
    fn test_backoff_grows_linearly_from_zero() {
        let mut agent = RetryAgent::new(RetryConfig {
            delay: Duration::from_millis(100),
            max_retries: 3,
            forget_delay: Duration::from_secs(60),
        });
        let now = Instant::now();

        agent.retry(now);
        assert_eq!(agent.attempt_delay(), Duration::ZERO);
        assert!(!agent.too_many_retries(now));

        agent.retry(now);
        assert_eq!(agent.attempt_delay(), Duration::from_millis(100));
        assert!(!agent.too_many_retries(now));

        agent.retry(now);
        assert_eq!(agent.attempt_delay(), Duration::from_millis(200));
        assert!(agent.too_many_retries(now));
    }

    #[test]
    fn test_attempts_are_forgotten_after_quiet_period() {
        let mut agent = RetryAgent::new(RetryConfig {
            delay: Duration::from_millis(100),
            max_retries: 2,
            forget_delay: Duration::from_secs(10),
        });
        let start = Instant::now();
        agent.retry(start);
        agent.retry(start);
        assert!(agent.too_many_retries(start));

        // Exactly at the boundary nothing is forgotten yet.
        assert!(agent.too_many_retries(start + Duration::from_secs(10)));

        let later = start + Duration::from_secs(11);
        assert!(!agent.too_many_retries(later));
        assert_eq!(agent.attempts(), 0);

        agent.retry(later);
        assert_eq!(agent.attempt_delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_connected_channel_delegates() {
        let (strategy, built) = recording(None);
        let channel = RetryTransportChannel::new("relay", strategy, config(3));
        assert!(matches!(channel.send(envelope()), Err(ChannelError::NotStarted(_))));

        channel.start().await.unwrap();
        assert_eq!(channel.phase(), RetryPhase::Connected);
        assert!(channel.accept(&Identity([2; 32])));
        assert!(channel.send(envelope()).is_ok());
        assert_eq!(built.lock().len(), 1);

        channel.shutdown().await.unwrap();
        channel.shutdown().await.unwrap();
        assert!(channel.close_future().wait().await.is_ok());
        assert!(built.lock()[0].close.is_closed());
    }

    #[tokio::test]
    async fn test_start_gives_up_after_max_retries() {
        let (strategy, built) = recording(Some(ChannelError::JoinRejected("nope".into())));
        let channel = RetryTransportChannel::new("relay", strategy, config(3));

        match channel.start().await {
            Err(ChannelError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, ChannelError::JoinRejected(ref cause) if cause == "nope"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(built.lock().len(), 3);
        assert_eq!(channel.phase(), RetryPhase::Closed);
        assert!(matches!(
            channel.close_future().wait().await,
            Err(ChannelError::RetriesExhausted { attempts: 3, .. })
        ));
        // Failed channels are shut down when replaced.
        assert!(built.lock()[0].close.is_closed());
    }

    #[tokio::test]
    async fn test_lost_channel_is_replaced() {
        let (strategy, built) = recording(None);
        let channel = RetryTransportChannel::new("relay", strategy, config(3));
        channel.start().await.unwrap();

        let first = Arc::clone(&built.lock()[0]);
        first.close.complete(Err(ChannelError::RelayClosed("reset".into())));

        time::timeout(Duration::from_secs(2), async {
            while built.lock().len() < 2 || channel.phase() != RetryPhase::Connected {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(channel.attempts(), 1);
        assert!(channel.close_future().peek().is_none());
        channel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_retry() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let strategy = FactoryRetryStrategy::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            FakeChannel::new(Some(ChannelError::RelayClosed("down".into()))) as Arc<dyn TransportChannel>
        });
        let channel = Arc::new(RetryTransportChannel::new(
            "relay",
            strategy,
            RetryConfig {
                delay: Duration::from_secs(3600),
                max_retries: 10,
                forget_delay: Duration::from_secs(3600),
            },
        ));

        let starting = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.start().await }
        });
        // Two immediate attempts, then a long wait.
        time::timeout(Duration::from_secs(2), async {
            while builds.load(Ordering::SeqCst) < 2 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        channel.shutdown().await.unwrap();
        let started = time::timeout(Duration::from_secs(2), starting).await.unwrap().unwrap();
        assert!(matches!(started, Err(ChannelError::Closed)));
        assert!(channel.close_future().wait().await.is_ok());
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }
}
