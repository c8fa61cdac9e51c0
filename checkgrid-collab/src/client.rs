//! Sync client: the coordinator that owns one session and one engine.
//!
//! [`SyncClient::start`] spawns a single task that owns the transport
//! session, the sync engine (and through it the cell store) and the
//! presenter. User toggles arrive over a command channel; the task handles
//! commands and session events one at a time, so the grid only ever has one
//! writer.
//!
//! ```text
//! ClientHandle ──commands──► [client task] ◄──events── TransportSession
//!                               │    ▲
//!                    render/en- │    │ SET / REQUEST_SNAPSHOT
//!                    able input ▼    │
//!                            Presenter
//! ```

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::engine::SyncEngine;
use crate::grid::Grid;
use crate::presenter::Presenter;
use crate::session::{Connector, SessionEvent, SessionState, TransportSession, WsConnector};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Client task is not running")]
    Stopped,
    #[error("Client task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

enum ClientCommand {
    Toggle { index: usize, value: bool },
    Flip { index: usize },
    Snapshot(oneshot::Sender<Vec<bool>>),
    Stop,
}

/// Not-yet-started client.
pub struct SyncClient<C: Connector, P: Presenter> {
    config: ClientConfig,
    connector: C,
    presenter: P,
}

impl<P: Presenter> SyncClient<WsConnector, P> {
    /// Client over WebSocket.
    pub fn websocket(config: ClientConfig, presenter: P) -> Self {
        let connector = WsConnector::new(config.outbound_capacity);
        Self::new(config, connector, presenter)
    }
}

impl<C: Connector, P: Presenter> SyncClient<C, P> {
    pub fn new(config: ClientConfig, connector: C, presenter: P) -> Self {
        Self {
            config,
            connector,
            presenter,
        }
    }

    /// Spawn the client task and begin connecting.
    pub fn start(self) -> ClientHandle<P> {
        let session = TransportSession::new(self.connector, &self.config);
        let state_rx = session.subscribe_state();
        let engine = SyncEngine::new(self.config.grid_size, self.presenter);
        let (command_tx, command_rx) = mpsc::channel(self.config.outbound_capacity);

        log::info!(
            "Starting sync client for {} ({} cells)",
            self.config.server_url,
            self.config.grid_size
        );
        let task = tokio::spawn(run(session, engine, command_rx));

        ClientHandle {
            commands: command_tx,
            state_rx,
            task,
        }
    }
}

/// Handle to a running client.
pub struct ClientHandle<P: Presenter> {
    commands: mpsc::Sender<ClientCommand>,
    state_rx: watch::Receiver<SessionState>,
    task: JoinHandle<SyncEngine<P>>,
}

impl<P: Presenter> ClientHandle<P> {
    /// User set cell `index` to `value`.
    ///
    /// Ignored while the session is not open (input is disabled then).
    pub async fn toggle(&self, index: usize, value: bool) -> Result<(), ClientError> {
        self.command(ClientCommand::Toggle { index, value }).await
    }

    /// User flipped cell `index`.
    pub async fn flip(&self, index: usize) -> Result<(), ClientError> {
        self.command(ClientCommand::Flip { index }).await
    }

    /// Copy of the local mirror.
    pub async fn snapshot(&self) -> Result<Vec<bool>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.command(ClientCommand::Snapshot(tx)).await?;
        rx.await.map_err(|_| ClientError::Stopped)
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Watch session state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Wait until the session reaches `state`.
    pub async fn wait_for_state(&self, state: SessionState) -> Result<(), ClientError> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Stopped)
    }

    /// Stop the client, closing the connection and cancelling any pending
    /// reconnect. Returns the final grid and the presenter.
    pub async fn stop(self) -> Result<(Grid, P), ClientError> {
        // The task may already be gone; joining reports why.
        let _ = self.commands.send(ClientCommand::Stop).await;
        let engine = self.task.await?;
        Ok(engine.into_parts())
    }

    async fn command(&self, command: ClientCommand) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::Stopped)
    }
}

async fn run<C: Connector, P: Presenter>(
    mut session: TransportSession<C>,
    mut engine: SyncEngine<P>,
    mut commands: mpsc::Receiver<ClientCommand>,
) -> SyncEngine<P> {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ClientCommand::Toggle { index, value }) => {
                    local_edit(&session, &mut engine, index, value);
                }
                Some(ClientCommand::Flip { index }) => match engine.grid().get(index) {
                    Ok(current) => local_edit(&session, &mut engine, index, !current),
                    Err(e) => log::warn!("Ignoring flip: {e}"),
                },
                Some(ClientCommand::Snapshot(reply)) => {
                    let _ = reply.send(engine.grid().snapshot());
                }
                Some(ClientCommand::Stop) | None => break,
            },

            event = session.next_event() => match event {
                SessionEvent::Opened => {
                    let request = engine.on_open();
                    session.send(&request);
                }
                SessionEvent::Closed => engine.on_close(),
                SessionEvent::Message(text) => {
                    engine.on_message(&text);
                }
            },
        }
    }

    session.close();
    engine.on_close();
    log::info!("Sync client stopped ({:?})", engine.stats());
    engine
}

fn local_edit<C: Connector, P: Presenter>(
    session: &TransportSession<C>,
    engine: &mut SyncEngine<P>,
    index: usize,
    value: bool,
) {
    if session.state() != SessionState::Open {
        log::debug!("Input disabled, ignoring toggle of {index}");
        return;
    }
    if let Some(message) = engine.local_edit(index, value) {
        session.send(&message);
    }
}
