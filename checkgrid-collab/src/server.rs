//! Broadcast server: authoritative grid plus relay.
//!
//! ```text
//! Client A ──┐                         ┌──► Client B
//!            ├── /ws ── Grid (Mutex) ──┤
//! Client C ──┘           │             └──► Client C
//!                        └── BroadcastGroup (fan-out, no echo)
//! ```
//!
//! Every accepted `SET` is applied to the grid and published while the grid
//! lock is held, so all sessions observe mutations in the same order the
//! grid received them. State lives in memory only.
//!
//! Per connection:
//! - on join, every checked cell is announced as a `SET`
//! - text `SET` is applied and relayed; `REQUEST_SNAPSHOT` is answered
//! - binary 5-byte `SET` frames are applied and relayed as JSON
//! - text that fails to parse is answered with `ERROR`
//! - a session that lags behind the fan-out is closed; the client reconnects
//!   and asks for a snapshot, which orders cleanly against its own edits

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, PeerInfo};
use crate::config::{parse_var, validate_grid_size, ConfigError, DEFAULT_GRID_SIZE, WS_PATH};
use crate::grid::Grid;
use crate::protocol::{BinaryFrame, Message, ProtocolError};

const INVALID_JSON: &str = "Invalid JSON format";

type WsSender = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Server configuration.
///
/// Environment variables (see [`ServerConfig::from_env`]):
/// - `CHECKGRID_BIND`: listen address
/// - `CHECKGRID_GRID_SIZE`: total cell count
/// - `CHECKGRID_BROADCAST_CAPACITY`: frames buffered per session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub grid_size: usize,
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            grid_size: DEFAULT_GRID_SIZE,
            broadcast_capacity: 256,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            bind_addr: lookup("CHECKGRID_BIND").unwrap_or(defaults.bind_addr),
            grid_size: parse_var(&lookup, "CHECKGRID_GRID_SIZE").unwrap_or(defaults.grid_size),
            broadcast_capacity: parse_var(&lookup, "CHECKGRID_BROADCAST_CAPACITY")
                .unwrap_or(defaults.broadcast_capacity),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_grid_size(self.grid_size)?;
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "broadcastCapacity",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub relayed_messages: u64,
    pub rejected_messages: u64,
    pub snapshots_sent: u64,
    pub lagged_disconnects: u64,
}

/// Shared state handed to every connection task.
#[derive(Clone)]
struct Shared {
    grid: Arc<Mutex<Grid>>,
    group: Arc<BroadcastGroup>,
    stats: Arc<RwLock<ServerStats>>,
}

impl Shared {
    /// Apply a mutation and publish it to the other sessions.
    async fn apply_and_relay(&self, origin: Uuid, index: usize, value: bool) -> bool {
        let mut grid = self.grid.lock().await;
        if let Err(e) = grid.set(index, value) {
            log::warn!("Rejecting SET from {origin}: {e}");
            return false;
        }
        log::debug!("SET {index} -> {value} from {origin}");
        match self.group.relay(origin, &Message::set(index, value)) {
            Ok(_) => true,
            Err(e) => {
                log::error!("Failed to relay SET {index}: {e}");
                false
            }
        }
    }

    async fn snapshot_frame(&self) -> Result<String, ProtocolError> {
        let cells = self.grid.lock().await.snapshot();
        Message::Snapshot(cells).encode()
    }

    async fn count(&self, update: impl FnOnce(&mut ServerStats)) {
        update(&mut *self.stats.write().await);
    }
}

pub struct SyncServer {
    config: ServerConfig,
    shared: Shared,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let shared = Shared {
            grid: Arc::new(Mutex::new(Grid::new(config.grid_size))),
            group: Arc::new(BroadcastGroup::new(config.broadcast_capacity)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        };
        Self { config, shared }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.config.validate()?;
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local = listener.local_addr()?;
        log::info!(
            "Grid server listening on ws://{local}{WS_PATH} ({} cells)",
            self.config.grid_size
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::log!(connection_error_level(&e), "Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    /// Copy of the authoritative grid.
    pub async fn grid_snapshot(&self) -> Vec<bool> {
        self.shared.grid.lock().await.snapshot()
    }

    pub async fn peer_count(&self) -> usize {
        self.shared.group.peer_count().await
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Refused handshakes and peers vanishing mid-frame are routine.
fn connection_error_level(error: &ServerError) -> log::Level {
    use tokio_tungstenite::tungstenite::Error as WsError;

    match error {
        ServerError::WebSocket(WsError::Http(_)) => log::Level::Debug,
        ServerError::WebSocket(
            WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(_)
            | WsError::Io(_),
        ) => log::Level::Warn,
        _ => log::Level::Error,
    }
}

/// Handshake callback: only the WebSocket path is served.
fn check_path(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path() == WS_PATH {
        return Ok(response);
    }
    log::debug!("Rejecting upgrade for {}", request.uri().path());
    let mut error = ErrorResponse::new(Some("Not Found".to_string()));
    *error.status_mut() = StatusCode::NOT_FOUND;
    Err(error)
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Shared,
) -> Result<(), ServerError> {
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let info = PeerInfo::new(addr);
    let peer_id = info.peer_id;
    // Subscribe before reading the grid so nothing slips between the two.
    let mut broadcast_rx = shared.group.add_peer(info).await;
    shared
        .count(|s| {
            s.total_connections += 1;
            s.active_connections += 1;
        })
        .await;
    log::info!(
        "Client {peer_id} connected from {addr}. Total connections: {}",
        shared.group.peer_count().await
    );

    let result = serve_peer(
        peer_id,
        &shared,
        &mut ws_sender,
        &mut ws_receiver,
        &mut broadcast_rx,
    )
    .await;

    shared.group.remove_peer(&peer_id).await;
    shared.count(|s| s.active_connections -= 1).await;
    log::info!(
        "Client {peer_id} disconnected. Total connections: {}",
        shared.group.peer_count().await
    );
    result
}

async fn serve_peer(
    peer_id: Uuid,
    shared: &Shared,
    ws_sender: &mut WsSender,
    ws_receiver: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    broadcast_rx: &mut broadcast::Receiver<Arc<crate::broadcast::Relay>>,
) -> Result<(), ServerError> {
    let announce: Vec<usize> = shared.grid.lock().await.iter_set().collect();
    for index in announce {
        send_text(ws_sender, Message::set(index, true).encode()?).await?;
    }

    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    shared.count(|s| s.total_messages += 1).await;
                    handle_text(peer_id, shared, ws_sender, text.as_str()).await?;
                }

                Some(Ok(WsMessage::Binary(data))) => {
                    shared.count(|s| s.total_messages += 1).await;
                    handle_binary(peer_id, shared, &data).await;
                }

                Some(Ok(WsMessage::Ping(data))) => {
                    ws_sender.send(WsMessage::Pong(data)).await?;
                }

                Some(Ok(WsMessage::Close(_))) | None => {
                    log::debug!("Connection {peer_id} closed by client");
                    return Ok(());
                }

                Some(Err(e)) => {
                    log::warn!("WebSocket error from {peer_id}: {e}");
                    return Ok(());
                }

                Some(Ok(_)) => {}
            },

            relay = broadcast_rx.recv() => match relay {
                Ok(relay) => {
                    if relay.origin == peer_id {
                        continue;
                    }
                    send_text(ws_sender, relay.frame.clone()).await?;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // A pushed snapshot could overwrite SETs from this peer
                    // that are still unread; a fresh session resyncs safely.
                    log::warn!("Client {peer_id} lagged by {n} messages, closing session");
                    shared.count(|s| s.lagged_disconnects += 1).await;
                    let close = CloseFrame {
                        code: CloseCode::Again,
                        reason: "lagged behind, reconnect".into(),
                    };
                    let _ = ws_sender.send(WsMessage::Close(Some(close))).await;
                    return Ok(());
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn handle_text(
    peer_id: Uuid,
    shared: &Shared,
    ws_sender: &mut WsSender,
    text: &str,
) -> Result<(), ServerError> {
    log::trace!("Text frame from {peer_id}: {text:?}");
    match Message::decode(text) {
        Ok(Message::Set { index, value }) => {
            if shared.apply_and_relay(peer_id, index, value).await {
                shared.count(|s| s.relayed_messages += 1).await;
            } else {
                shared.count(|s| s.rejected_messages += 1).await;
            }
        }
        Ok(Message::RequestSnapshot) => {
            send_text(ws_sender, shared.snapshot_frame().await?).await?;
            shared.count(|s| s.snapshots_sent += 1).await;
        }
        Ok(other) => {
            log::debug!("Ignoring {} from {peer_id}", other.cmd());
        }
        Err(ProtocolError::UnknownCommand(cmd)) => {
            log::debug!("Ignoring unknown command {cmd:?} from {peer_id}");
        }
        Err(e) => {
            log::warn!("Bad frame from {peer_id}: {e}");
            shared.count(|s| s.rejected_messages += 1).await;
            send_text(ws_sender, Message::Error(INVALID_JSON.into()).encode()?).await?;
        }
    }
    Ok(())
}

async fn handle_binary(peer_id: Uuid, shared: &Shared, data: &[u8]) {
    let frame = match BinaryFrame::decode(data) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Binary decode error from {peer_id}: {e}");
            shared.count(|s| s.rejected_messages += 1).await;
            return;
        }
    };

    match frame.to_message() {
        Some(Message::Set { index, value }) => {
            if shared.apply_and_relay(peer_id, index, value).await {
                shared.count(|s| s.relayed_messages += 1).await;
            } else {
                shared.count(|s| s.rejected_messages += 1).await;
            }
        }
        _ => log::debug!("Ignoring binary {:?} from {peer_id}", frame.command),
    }
}

async fn send_text(ws_sender: &mut WsSender, text: String) -> Result<(), ServerError> {
    ws_sender.send(WsMessage::Text(text.into())).await?;
    Ok(())
}
