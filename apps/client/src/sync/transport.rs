//! Transports for session sync: the same-process tab bus and the socket channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::model::{SocketMessage, TabEnvelope};
use super::SyncError;

const TAB_BUS_CAPACITY: usize = 256;
const SOCKET_CHANNEL_CAPACITY: usize = 128;

/// Publish/subscribe bus connecting every sync instance (tab) in the process.
#[derive(Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<TabEnvelope>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(TAB_BUS_CAPACITY);
        Self { sender }
    }

    /// Returns the number of peers that saw the envelope.
    pub fn publish(&self, envelope: TabEnvelope) -> usize {
        self.sender.send(envelope).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TabEnvelope> {
        self.sender.subscribe()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

/// An established socket: typed message channels in both directions.
///
/// The connection is considered closed once `inbound` yields `None`.
pub struct SocketLink {
    pub outbound: mpsc::Sender<SocketMessage>,
    pub inbound: mpsc::Receiver<SocketMessage>,
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, session_id: &str) -> Result<SocketLink, SyncError>;
}

/// Connects to a `/ws/session-sync` style endpoint over WebSocket, JSON text frames.
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl SocketConnector for WebSocketConnector {
    async fn connect(&self, session_id: &str) -> Result<SocketLink, SyncError> {
        let (stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| SyncError::Transport(format!("Connection failed: {e}")))?;
        info!(url = %self.url, session_id, "session sync socket connected");

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<SocketMessage>(SOCKET_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<SocketMessage>(SOCKET_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let payload = match serde_json::to_string(&message) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Failed to encode socket message: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(payload)).await {
                    warn!("Socket send failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SocketMessage>(&text) {
                        Ok(message) => {
                            if inbound_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to parse socket message: {e}"),
                    },
                    Ok(Message::Close(_)) => {
                        debug!("Server closed session sync socket");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Session sync socket error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(SocketLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[derive(Default)]
struct MemoryServer {
    refusing: bool,
    received: Vec<SocketMessage>,
    clients: Vec<mpsc::Sender<SocketMessage>>,
}

/// In-process stand-in for the sync server.
///
/// Records every message clients send and lets the owner push messages to, or drop,
/// every connected client.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    server: Arc<Mutex<MemoryServer>>,
    attempts: Arc<AtomicU64>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.server.lock().refusing = !available;
    }

    pub fn received(&self) -> Vec<SocketMessage> {
        self.server.lock().received.clone()
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn connected_clients(&self) -> usize {
        self.server
            .lock()
            .clients
            .iter()
            .filter(|c| !c.is_closed())
            .count()
    }

    /// Delivers `message` to every connected client.
    pub fn push(&self, message: SocketMessage) {
        let mut server = self.server.lock();
        server
            .clients
            .retain(|client| client.try_send(message.clone()).is_ok());
    }

    /// Closes every open connection from the server side.
    pub fn drop_connections(&self) {
        self.server.lock().clients.clear();
    }
}

#[async_trait]
impl SocketConnector for MemoryConnector {
    async fn connect(&self, _session_id: &str) -> Result<SocketLink, SyncError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.server.lock().refusing {
            return Err(SyncError::Transport("Connection refused".to_string()));
        }

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<SocketMessage>(SOCKET_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(SOCKET_CHANNEL_CAPACITY);
        self.server.lock().clients.push(inbound_tx);

        let server = Arc::clone(&self.server);
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                server.lock().received.push(message);
            }
        });

        Ok(SocketLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
