//! relayd server - session loop and message routing

use crate::config::Config;
use futures::{SinkExt, StreamExt};
use overlay_core::{Identity, MessageId};
use overlay_net::dedup::{DuplicateMessageFilter, InboundVerdict};
use overlay_net::relay::protocol::{status, ProtocolError, RelayCodec, RelayMessage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type SessionStream = Framed<TcpStream, RelayCodec>;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("No join received within {0:?}")]
    JoinTimeout(Duration),
    #[error("Session did not join: {0}")]
    NotJoined(String),
}

/// How other sessions reach a joined client
#[derive(Clone, Debug)]
struct SessionHandle {
    id: u64,
    system_name: String,
    outbox: mpsc::UnboundedSender<RelayMessage>,
}

struct Shared {
    config: Config,
    /// Joined clients by identity
    sessions: RwLock<HashMap<Identity, SessionHandle>>,
    next_session: AtomicU64,
}

/// Relay server bound to its listen address
pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Server {
    /// Bind the listener
    pub async fn bind(config: Config) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.listen).await?;
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                config,
                sessions: RwLock::new(HashMap::new()),
                next_session: AtomicU64::new(1),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Identities currently joined
    pub fn clients(&self) -> Vec<Identity> {
        self.shared.clients()
    }

    /// Serve sessions until `shutdown` is cancelled. Joined clients are sent
    /// a `Leave` before their connection is closed.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        info!("Relay listening on {}", self.local_addr()?);
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutting down...");
                    break;
                }
                result = self.listener.accept() => match result {
                    Ok((stream, addr)) => {
                        debug!("Accepted connection from {}", addr);
                        let shared = Arc::clone(&self.shared);
                        let cancel = shutdown.child_token();
                        sessions.spawn(async move {
                            if let Err(e) = shared.handle_connection(stream, cancel).await {
                                warn!("Session from {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        while sessions.join_next().await.is_some() {}
        Ok(())
    }
}

impl Shared {
    fn clients(&self) -> Vec<Identity> {
        let mut clients: Vec<_> = self.sessions.read().keys().copied().collect();
        clients.sort();
        clients
    }

    async fn handle_connection(&self, stream: TcpStream, cancel: CancellationToken) -> Result<(), ServerError> {
        let mut io = Framed::new(stream, RelayCodec::new(self.config.max_line_length));
        let join_timeout = self.config.join_timeout();

        let first = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            first = time::timeout(join_timeout, io.next()) => {
                first.map_err(|_| ServerError::JoinTimeout(join_timeout))?
            }
        };
        let first = match first.transpose() {
            Ok(first) => first,
            Err(e) => {
                let _ = io.send(RelayMessage::exception(e.to_string())).await;
                return Err(e.into());
            }
        };
        let (join_id, uid, system_name) = match first {
            Some(RelayMessage::Join {
                message_id,
                uid,
                system_name,
                ..
            }) => (message_id, uid, system_name),
            Some(other) => {
                let reason = format!("expected Join, got {}", other.type_name());
                io.send(RelayMessage::exception(reason.clone())).await?;
                return Err(ServerError::NotJoined(reason));
            }
            None => return Ok(()),
        };

        let (outbox, mut inbox) = mpsc::unbounded_channel();
        let session_id = self.register(uid, system_name, outbox);
        let result = self.serve(&mut io, uid, join_id, &mut inbox, cancel).await;
        self.deregister(uid, session_id);
        let _ = SinkExt::<RelayMessage>::close(&mut io).await;
        result
    }

    fn register(&self, uid: Identity, system_name: String, outbox: mpsc::UnboundedSender<RelayMessage>) -> u64 {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        info!("{} joined as {}", uid, system_name);
        let handle = SessionHandle {
            id,
            system_name,
            outbox,
        };
        if let Some(replaced) = self.sessions.write().insert(uid, handle) {
            info!("Replacing older session of {} ({})", uid, replaced.system_name);
            let _ = replaced.outbox.send(RelayMessage::leave());
        }
        id
    }

    fn deregister(&self, uid: Identity, session_id: u64) {
        let mut sessions = self.sessions.write();
        if sessions.get(&uid).is_some_and(|session| session.id == session_id) {
            sessions.remove(&uid);
            info!("{} left", uid);
        }
    }

    async fn serve(
        &self,
        io: &mut SessionStream,
        uid: Identity,
        join_id: MessageId,
        inbox: &mut mpsc::UnboundedReceiver<RelayMessage>,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        io.send(RelayMessage::status_response(status::OK, join_id)).await?;
        let mut filter = DuplicateMessageFilter::new(self.config.dedup_capacity);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    io.send(RelayMessage::leave()).await?;
                    return Ok(());
                }
                outgoing = inbox.recv() => match outgoing {
                    Some(message) => {
                        let leaving = matches!(message, RelayMessage::Leave { .. });
                        io.send(message).await?;
                        if leaving {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                },
                incoming = io.next() => match incoming.transpose()? {
                    Some(message) => {
                        if !self.on_message(io, &mut filter, uid, message).await? {
                            return Ok(());
                        }
                    }
                    None => {
                        debug!("{} disconnected", uid);
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Handle one message from a joined client; `false` ends the session.
    async fn on_message(
        &self,
        io: &mut SessionStream,
        filter: &mut DuplicateMessageFilter,
        uid: Identity,
        message: RelayMessage,
    ) -> Result<bool, ServerError> {
        match message {
            RelayMessage::ForwardableMessage {
                message_id,
                sender,
                recipient,
                ..
            } => {
                if sender != uid {
                    warn!("{} tried to forward message {} as {}", uid, message_id, sender);
                    io.send(RelayMessage::status_response(status::CONFLICT, message_id)).await?;
                    return Ok(true);
                }
                if filter.check_inbound(message_id) == InboundVerdict::Duplicate {
                    debug!("Message {} from {} already relayed", message_id, uid);
                    io.send(RelayMessage::status_response(status::ALREADY_REPORTED, message_id))
                        .await?;
                    return Ok(true);
                }

                let target = self.sessions.read().get(&recipient).map(|session| session.outbox.clone());
                let delivered = match target {
                    Some(outbox) => outbox.send(message).is_ok(),
                    None => false,
                };
                if delivered {
                    debug!("Relayed message {} from {} to {}", message_id, uid, recipient);
                } else {
                    debug!("Recipient {} of message {} is not joined", recipient, message_id);
                    io.send(RelayMessage::status_response(status::NOT_FOUND, message_id)).await?;
                }
            }
            RelayMessage::Ping { message_id } => io.send(RelayMessage::pong(message_id)).await?,
            RelayMessage::RequestClientsStocktaking { message_id } => {
                let clients = RelayMessage::clients_stocktaking(self.clients());
                io.send(RelayMessage::response(clients, message_id)).await?;
            }
            RelayMessage::Join { message_id, .. } => {
                io.send(RelayMessage::status_response(status::CONFLICT, message_id)).await?;
            }
            RelayMessage::Leave { .. } => return Ok(false),
            RelayMessage::RelayException { exception, .. } => {
                warn!("{} reported: {}", uid, exception);
                return Ok(false);
            }
            other => debug!("Ignoring {} from {}", other.type_name(), uid),
        }
        Ok(true)
    }
}
