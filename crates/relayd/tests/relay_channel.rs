//! Relay channel and reconnect decorator against a live relay server

use clap::Parser;
use overlay_core::{InboundEnvelope, KeyPair, OutboundEnvelope};
use overlay_net::channel::{ChannelError, InboundSink, TransportChannel};
use overlay_net::relay::{self, RelayConfig, RelayTransportChannel};
use overlay_net::retry::RetryConfig;
use relayd::{Config, Server};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time;
use tokio_util::sync::CancellationToken;

async fn spawn_relay() -> (SocketAddr, CancellationToken) {
    let config = Config::parse_from(["relayd", "--listen", "127.0.0.1:0"]);
    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));
    (addr, shutdown)
}

fn relay_config(addr: SocketAddr) -> RelayConfig {
    RelayConfig {
        join_timeout: Duration::from_millis(500),
        retry: RetryConfig {
            delay: Duration::from_millis(20),
            max_retries: 3,
            forget_delay: Duration::from_secs(60),
        },
        ..RelayConfig::new(format!("tcp://{addr}"))
    }
}

fn client(addr: SocketAddr, seed: u8) -> (RelayTransportChannel, KeyPair, UnboundedReceiver<InboundEnvelope>) {
    let keypair = KeyPair::from_seed(&[seed; 32]);
    let (sink, inbox) = InboundSink::channel();
    let channel = RelayTransportChannel::new(keypair.identity(), relay_config(addr), sink);
    (channel, keypair, inbox)
}

#[tokio::test]
async fn test_join_and_stocktaking() {
    let (addr, _shutdown) = spawn_relay().await;
    let (a, a_keys, _a_inbox) = client(addr, 1);
    let (b, b_keys, _b_inbox) = client(addr, 2);

    a.start().await.unwrap();
    b.start().await.unwrap();
    assert!(a.accept(&b_keys.identity()));

    let mut clients = a.request_clients_stocktaking().await.unwrap();
    clients.sort();
    let mut expected = vec![a_keys.identity(), b_keys.identity()];
    expected.sort();
    assert_eq!(clients, expected);
}

#[tokio::test]
async fn test_forward_between_clients() {
    let (addr, _shutdown) = spawn_relay().await;
    let (a, a_keys, _a_inbox) = client(addr, 1);
    let (b, b_keys, mut b_inbox) = client(addr, 2);
    a.start().await.unwrap();
    b.start().await.unwrap();

    let envelope = OutboundEnvelope::new(a_keys.identity(), b_keys.identity(), &b"over the relay"[..]);
    a.send(envelope.clone()).unwrap().wait().await.unwrap();

    let received = time::timeout(Duration::from_secs(2), b_inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.id, envelope.id);
    assert_eq!(received.sender, a_keys.identity());
    assert_eq!(&received.payload[..], b"over the relay");

    assert!(matches!(a.send(envelope), Err(ChannelError::Duplicate(_))));
}

#[tokio::test]
async fn test_join_times_out_against_silent_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _accepting = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let (channel, _, _inbox) = client(addr, 1);
    let started = Instant::now();
    let result = channel.start().await;

    assert!(matches!(result, Err(ChannelError::JoinTimeout(_))));
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(channel.close_future().wait().await.is_err());
}

#[tokio::test]
async fn test_retry_gives_up_after_max_retries() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let keypair = KeyPair::from_seed(&[1; 32]);
    let (sink, _inbox) = InboundSink::channel();
    let channel = relay::with_retry(keypair.identity(), relay_config(addr), sink);

    match channel.start().await {
        Err(ChannelError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        channel.close_future().wait().await,
        Err(ChannelError::RetriesExhausted { .. })
    ));
}

#[tokio::test]
async fn test_retry_channel_fails_once_relay_is_gone() {
    let (addr, shutdown) = spawn_relay().await;
    let keypair = KeyPair::from_seed(&[1; 32]);
    let (sink, _inbox) = InboundSink::channel();
    let channel = relay::with_retry(keypair.identity(), relay_config(addr), sink);
    channel.start().await.unwrap();
    assert!(channel.current().is_some());

    shutdown.cancel();
    let closed = time::timeout(Duration::from_secs(5), channel.close_future().wait())
        .await
        .unwrap();
    assert!(matches!(closed, Err(ChannelError::RetriesExhausted { .. })));
}
