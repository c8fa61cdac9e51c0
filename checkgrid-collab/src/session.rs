//! Transport session: one logical connection plus its reconnect policy.
//!
//! ```text
//!            connect ok                 disconnect
//! Connecting ──────────► Open ───────────────────────► Closed
//!   ▲   │                                                │
//!   │   │ connect failed: arm timer, wait, retry         │ timer fires
//!   │   └──────────────┘                                 │
//!   └────────────────────────────────────────────────────┘
//! ```
//!
//! At most one reconnect timer exists at a time; arming while one is pending
//! is a no-op and a successful connect clears it. Retries never back off and
//! never give up.
//!
//! The session is driven by a single owner through [`TransportSession::next_event`],
//! which yields `Opened`, `Closed` and inbound `Message` events in order.
//! The in-flight connect attempt and the reconnect timer live inside the
//! session, so dropping a `next_event` future (e.g. losing a `select!` race)
//! does not lose them.

use std::pin::Pin;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Sleep};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::config::ClientConfig;
use crate::protocol::Message;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

/// Events yielded to the session owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connection established, sends are live
    Opened,
    /// Connection lost, a reconnect is scheduled
    Closed,
    /// Inbound text frame
    Message(String),
}

/// Transport errors. None of these reach the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Transport unavailable")]
    TransportUnavailable,
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Connect timed out")]
    ConnectTimeout,
}

/// A live duplex channel of text frames.
///
/// The inbound receiver ending is the disconnect signal. Dropping the link
/// closes the underlying connection.
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Establishes links. Implemented over WebSocket by [`WsConnector`] and by
/// in-memory fakes in tests.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Link, SessionError>>;
}

/// WebSocket connector.
///
/// Each link gets a writer task draining the outbound channel into the
/// socket and a reader task forwarding text frames into the inbound channel.
#[derive(Debug, Clone)]
pub struct WsConnector {
    capacity: usize,
}

impl WsConnector {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Link, SessionError>> {
        let url = url.to_string();
        let capacity = self.capacity;

        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| SessionError::ConnectFailed(e.to_string()))?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::channel::<String>(capacity);
            let (in_tx, in_rx) = mpsc::channel::<String>(capacity);

            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = ws_writer.send(WsMessage::Text(text.into())).await {
                        log::debug!("WebSocket write failed: {e}");
                        break;
                    }
                }
                let _ = ws_writer.close().await;
            });

            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(WsMessage::Text(text)) => {
                            if in_tx.send(text.as_str().to_owned()).await.is_err() {
                                break;
                            }
                        }
                        Ok(WsMessage::Binary(data)) => {
                            log::debug!("Ignoring {}-byte binary frame", data.len());
                        }
                        Ok(WsMessage::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            log::warn!("WebSocket error: {e}");
                            break;
                        }
                    }
                }
            });

            Ok::<_, SessionError>(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}

/// The transport session.
pub struct TransportSession<C: Connector> {
    connector: C,
    url: String,
    reconnect_delay: Duration,
    connect_timeout: Duration,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    link: Option<Link>,
    pending_connect: Option<BoxFuture<'static, Result<Link, SessionError>>>,
    /// Sentinel: `Some` while a reconnect is scheduled
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    connect_attempts: u64,
}

impl<C: Connector> TransportSession<C> {
    pub fn new(connector: C, config: &ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Connecting);
        Self {
            connector,
            url: config.server_url.clone(),
            reconnect_delay: config.reconnect_delay(),
            connect_timeout: config.connect_timeout(),
            state: SessionState::Connecting,
            state_tx,
            link: None,
            pending_connect: None,
            reconnect_timer: None,
            connect_attempts: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Watch state transitions from outside the owning task.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.reconnect_timer.is_some()
    }

    /// When the pending reconnect fires, if one is scheduled.
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_timer.as_ref().map(|t| t.deadline())
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts
    }

    /// Queue a message on the live connection.
    ///
    /// When the session is not open the message is dropped, never buffered
    /// for replay. Returns whether the message was handed to the transport.
    pub fn send(&self, message: &Message) -> bool {
        let Some(link) = self.link.as_ref().filter(|_| self.state == SessionState::Open) else {
            log::debug!(
                "Dropping {} while {:?}: {}",
                message.cmd(),
                self.state,
                SessionError::TransportUnavailable
            );
            return false;
        };

        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Failed to encode {}: {e}", message.cmd());
                return false;
            }
        };

        match link.outbound.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Outbound buffer full, dropping {}", message.cmd());
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Writer gone, dropping {}", message.cmd());
                false
            }
        }
    }

    /// Drive the state machine until the next event.
    ///
    /// Cancel-safe. After [`close`](Self::close) this never resolves.
    pub async fn next_event(&mut self) -> SessionEvent {
        loop {
            match self.state {
                SessionState::Connecting => {
                    if let Some(timer) = self.reconnect_timer.as_mut() {
                        timer.as_mut().await;
                        self.reconnect_timer = None;
                    }

                    if self.pending_connect.is_none() {
                        self.pending_connect = Some(self.start_connect());
                    }
                    let Some(attempt) = self.pending_connect.as_mut() else {
                        continue;
                    };
                    let result = attempt.as_mut().await;
                    self.pending_connect = None;

                    match result {
                        Ok(link) => return self.mark_open(link),
                        Err(e) => {
                            log::warn!("Connection to {} failed: {e}", self.url);
                            self.arm_reconnect();
                        }
                    }
                }

                SessionState::Open => {
                    let inbound = match self.link.as_mut() {
                        Some(link) => link.inbound.recv().await,
                        None => None,
                    };
                    match inbound {
                        Some(text) => return SessionEvent::Message(text),
                        None => {
                            log::info!("Disconnected from {}", self.url);
                            self.mark_closed();
                            return SessionEvent::Closed;
                        }
                    }
                }

                SessionState::Closed => match self.reconnect_timer.as_mut() {
                    Some(timer) => {
                        timer.as_mut().await;
                        self.reconnect_timer = None;
                        self.set_state(SessionState::Connecting);
                    }
                    None => std::future::pending::<()>().await,
                },
            }
        }
    }

    /// Tear down the connection and cancel any pending reconnect.
    pub fn close(&mut self) {
        self.link = None;
        self.pending_connect = None;
        self.reconnect_timer = None;
        self.set_state(SessionState::Closed);
        log::info!("Session to {} closed", self.url);
    }

    fn start_connect(&mut self) -> BoxFuture<'static, Result<Link, SessionError>> {
        self.connect_attempts += 1;
        log::info!("Connecting to {} (attempt {})", self.url, self.connect_attempts);

        let connect = self.connector.connect(&self.url);
        let timeout = self.connect_timeout;
        Box::pin(async move {
            tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| SessionError::ConnectTimeout)?
        })
    }

    fn mark_open(&mut self, link: Link) -> SessionEvent {
        self.link = Some(link);
        if self.reconnect_timer.take().is_some() {
            log::debug!("Cleared pending reconnect timer");
        }
        self.set_state(SessionState::Open);
        log::info!("Connected to {}", self.url);
        SessionEvent::Opened
    }

    fn mark_closed(&mut self) {
        self.link = None;
        self.set_state(SessionState::Closed);
        self.arm_reconnect();
    }

    /// Schedule a reconnect unless one is already pending.
    fn arm_reconnect(&mut self) -> bool {
        if self.reconnect_timer.is_some() {
            log::debug!("Reconnect already scheduled");
            return false;
        }
        log::info!("Reconnecting in {}ms", self.reconnect_delay.as_millis());
        self.reconnect_timer = Some(Box::pin(tokio::time::sleep(self.reconnect_delay)));
        true
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeConnector;
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig {
            server_url: "ws://fake/ws".into(),
            ..ClientConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_connect_opens() {
        let connector = FakeConnector::new();
        let _remote = connector.accept();
        let mut session = TransportSession::new(connector.clone(), &config());

        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.next_event().await, SessionEvent::Opened);
        assert_eq!(session.state(), SessionState::Open);
        assert!(!session.has_pending_reconnect());
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_dropped_when_not_open() {
        let connector = FakeConnector::new();
        let mut remote = connector.accept();
        let mut session = TransportSession::new(connector, &config());

        assert!(!session.send(&Message::set(1, true)));

        session.next_event().await;
        assert!(session.send(&Message::set(1, true)));
        assert_eq!(
            remote.from_client.recv().await.unwrap(),
            r#"{"cmd":"SET","index":1,"value":"true"}"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_messages_in_order() {
        let connector = FakeConnector::new();
        let remote = connector.accept();
        let mut session = TransportSession::new(connector, &config());
        session.next_event().await;

        remote.to_client.send("a".into()).await.unwrap();
        remote.to_client.send("b".into()).await.unwrap();
        assert_eq!(session.next_event().await, SessionEvent::Message("a".into()));
        assert_eq!(session.next_event().await, SessionEvent::Message("b".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_schedules_one_reconnect_at_delay() {
        let connector = FakeConnector::new();
        let remote = connector.accept();
        let _second = connector.accept();
        let mut session = TransportSession::new(connector.clone(), &config());
        session.next_event().await;

        drop(remote);
        let dropped_at = Instant::now();
        assert_eq!(session.next_event().await, SessionEvent::Closed);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            session.reconnect_deadline(),
            Some(dropped_at + Duration::from_millis(3000))
        );
        assert!(!session.send(&Message::set(0, true)));

        assert_eq!(session.next_event().await, SessionEvent::Opened);
        assert!(Instant::now() >= dropped_at + Duration::from_millis(3000));
        assert!(!session.has_pending_reconnect());
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_drop_keeps_single_timer() {
        let connector = FakeConnector::new();
        let _remote = connector.accept();
        let mut session = TransportSession::new(connector, &config());
        session.next_event().await;

        session.mark_closed();
        let deadline = session.reconnect_deadline();
        assert!(deadline.is_some());

        tokio::time::advance(Duration::from_millis(1000)).await;
        session.mark_closed();
        assert!(!session.arm_reconnect());
        assert_eq!(session.reconnect_deadline(), deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_retries_forever_at_fixed_delay() {
        let connector = FakeConnector::new();
        connector.refuse();
        connector.refuse();
        connector.refuse();
        let _remote = connector.accept();
        let mut session = TransportSession::new(connector.clone(), &config());

        let start = Instant::now();
        assert_eq!(session.next_event().await, SessionEvent::Opened);
        assert_eq!(connector.attempts(), 4);
        let elapsed = Instant::now() - start;
        assert!(elapsed >= Duration::from_millis(9000), "retried too early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(9100), "retried too late: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_counts_as_failure() {
        let connector = FakeConnector::with_delay(Duration::from_secs(60));
        let _remote = connector.accept();
        let mut session = TransportSession::new(connector.clone(), &config());

        let result =
            tokio::time::timeout(Duration::from_millis(5500), session.next_event()).await;
        assert!(result.is_err());
        assert!(session.has_pending_reconnect());
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_event_is_cancel_safe() {
        let connector = FakeConnector::with_delay(Duration::from_millis(100));
        let _remote = connector.accept();
        let mut session = TransportSession::new(connector.clone(), &config());

        let early = tokio::time::timeout(Duration::from_millis(10), session.next_event()).await;
        assert!(early.is_err());

        assert_eq!(session.next_event().await, SessionEvent::Opened);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_reconnect() {
        let connector = FakeConnector::new();
        let remote = connector.accept();
        let mut session = TransportSession::new(connector, &config());
        let state_rx = session.subscribe_state();
        session.next_event().await;
        assert_eq!(*state_rx.borrow(), SessionState::Open);

        drop(remote);
        session.next_event().await;
        assert!(session.has_pending_reconnect());

        session.close();
        assert!(!session.has_pending_reconnect());
        assert_eq!(*state_rx.borrow(), SessionState::Closed);
        let stalled =
            tokio::time::timeout(Duration::from_secs(10), session.next_event()).await;
        assert!(stalled.is_err());
    }
}
