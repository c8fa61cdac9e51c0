//! End-to-end tests: a real server on a loopback port with real
//! WebSocket clients.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use checkgrid_collab::client::SyncClient;
use checkgrid_collab::config::ClientConfig;
use checkgrid_collab::presenter::Presenter;
use checkgrid_collab::protocol::{BinaryFrame, Message};
use checkgrid_collab::server::{ServerConfig, SyncServer};
use checkgrid_collab::session::SessionState;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

/// Presenter that keeps every render call for inspection.
#[derive(Clone, Default)]
struct SharedPresenter {
    renders: Arc<Mutex<Vec<(usize, bool)>>>,
}

impl SharedPresenter {
    fn renders(&self) -> Vec<(usize, bool)> {
        self.renders.lock().unwrap().clone()
    }
}

impl Presenter for SharedPresenter {
    fn render_cell(&mut self, index: usize, value: bool) {
        self.renders.lock().unwrap().push((index, value));
    }

    fn set_input_enabled(&mut self, _enabled: bool) {}
}

async fn start_server_on(listener: tokio::net::TcpListener) -> Arc<SyncServer> {
    let server = Arc::new(SyncServer::new(ServerConfig {
        bind_addr: listener.local_addr().unwrap().to_string(),
        grid_size: 100,
        broadcast_capacity: 64,
    }));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    server
}

async fn start_test_server() -> (Arc<SyncServer>, SocketAddr) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (start_server_on(listener).await, addr)
}

fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        server_url: format!("ws://{addr}/ws"),
        reconnect_delay_ms: 100,
        connect_timeout_ms: 1000,
        ..ClientConfig::default()
    }
}

async fn raw_connect(addr: SocketAddr) -> RawSocket {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    ws
}

async fn next_message(ws: &mut RawSocket) -> Message {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let WsMessage::Text(text) = frame {
            return Message::decode(text.as_str()).unwrap();
        }
    }
}

async fn expect_silence(ws: &mut RawSocket) {
    let result = timeout(Duration::from_millis(300), ws.next()).await;
    assert!(result.is_err(), "unexpected frame: {result:?}");
}

async fn send_text(ws: &mut RawSocket, msg: &Message) {
    ws.send(WsMessage::Text(msg.encode().unwrap().into()))
        .await
        .unwrap();
}

async fn eventually<F: FnMut() -> bool>(mut check: F) {
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn wait_for_peers(server: &SyncServer, count: usize) {
    timeout(WAIT, async {
        while server.peer_count().await != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peers did not join in time");
}

async fn wait_for_cells(server: &SyncServer, cells: &[usize]) {
    timeout(WAIT, async {
        loop {
            let grid = server.grid_snapshot().await;
            if cells.iter().all(|&i| grid[i]) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server grid did not change in time");
}

#[tokio::test]
async fn test_toggle_reaches_other_viewer_without_echo() {
    let (server, addr) = start_test_server().await;

    let alice_view = SharedPresenter::default();
    let bob_view = SharedPresenter::default();
    let alice = SyncClient::websocket(client_config(addr), alice_view.clone()).start();
    let bob = SyncClient::websocket(client_config(addr), bob_view.clone()).start();

    timeout(WAIT, alice.wait_for_state(SessionState::Open)).await.unwrap().unwrap();
    timeout(WAIT, bob.wait_for_state(SessionState::Open)).await.unwrap().unwrap();
    wait_for_peers(&server, 2).await;

    alice.toggle(2, true).await.unwrap();

    eventually(|| bob_view.renders().contains(&(2, true))).await;
    assert_eq!(bob_view.renders(), vec![(2, true)]);
    assert!(server.grid_snapshot().await[2]);

    let bob_grid = bob.snapshot().await.unwrap();
    assert_eq!(bob_grid.iter().filter(|c| **c).count(), 1);

    // Alice's own toggle is rendered locally, exactly once
    assert_eq!(alice_view.renders(), vec![(2, true)]);
    assert!(alice.snapshot().await.unwrap()[2]);

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_reconnects_and_resyncs() {
    // Reserve a port, then leave it closed so the first attempts fail.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let view = SharedPresenter::default();
    let client = SyncClient::websocket(client_config(addr), view.clone()).start();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_ne!(client.state(), SessionState::Open);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let server = start_server_on(listener).await;

    let mut writer = raw_connect(addr).await;
    send_text(&mut writer, &Message::set(7, true)).await;
    wait_for_cells(&server, &[7]).await;

    timeout(WAIT, client.wait_for_state(SessionState::Open)).await.unwrap().unwrap();
    eventually(|| view.renders().contains(&(7, true))).await;
    assert_eq!(client.snapshot().await.unwrap(), server.grid_snapshot().await);

    let (grid, _) = client.stop().await.unwrap();
    assert_eq!(grid.count_set(), 1);
}

#[tokio::test]
async fn test_invalid_json_gets_error_reply() {
    let (_server, addr) = start_test_server().await;
    let mut ws = raw_connect(addr).await;

    ws.send(WsMessage::Text("not json".into())).await.unwrap();
    assert_eq!(
        next_message(&mut ws).await,
        Message::Error("Invalid JSON format".into())
    );

    // Connection stays usable
    send_text(&mut ws, &Message::RequestSnapshot).await;
    assert!(matches!(next_message(&mut ws).await, Message::Snapshot(cells) if cells.len() == 100));
}

#[tokio::test]
async fn test_binary_set_is_relayed_as_json() {
    let (server, addr) = start_test_server().await;
    let mut listener_ws = raw_connect(addr).await;
    let mut sender_ws = raw_connect(addr).await;
    wait_for_peers(&server, 2).await;

    let frame = BinaryFrame::set(9, true).encode().unwrap();
    sender_ws
        .send(WsMessage::Binary(frame.to_vec().into()))
        .await
        .unwrap();

    assert_eq!(next_message(&mut listener_ws).await, Message::set(9, true));
    assert!(server.grid_snapshot().await[9]);
}

#[tokio::test]
async fn test_late_joiner_gets_checked_cells() {
    let (server, addr) = start_test_server().await;
    let mut first = raw_connect(addr).await;
    send_text(&mut first, &Message::set(4, true)).await;
    send_text(&mut first, &Message::set(60, true)).await;
    wait_for_cells(&server, &[4, 60]).await;

    let mut late = raw_connect(addr).await;
    assert_eq!(next_message(&mut late).await, Message::set(4, true));
    assert_eq!(next_message(&mut late).await, Message::set(60, true));
}

#[tokio::test]
async fn test_out_of_range_set_is_not_relayed() {
    let (server, addr) = start_test_server().await;
    let mut watcher = raw_connect(addr).await;
    let mut sender = raw_connect(addr).await;
    wait_for_peers(&server, 2).await;

    send_text(&mut sender, &Message::set(100, true)).await;
    send_text(&mut sender, &Message::set(99, true)).await;

    // Frames are handled in order, so the first relay seen is the valid one.
    assert_eq!(next_message(&mut watcher).await, Message::set(99, true));
    assert_eq!(server.stats().await.rejected_messages, 1);
}

#[tokio::test]
async fn test_other_paths_are_rejected() {
    let (_server, addr) = start_test_server().await;
    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/other")).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 404);
        }
        other => panic!("expected HTTP 404, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_sender_never_gets_its_own_set_back() {
    let (server, addr) = start_test_server().await;
    let mut watcher = raw_connect(addr).await;
    let mut sender = raw_connect(addr).await;
    wait_for_peers(&server, 2).await;

    send_text(&mut sender, &Message::set(11, true)).await;
    let frame = BinaryFrame::set(12, true).encode().unwrap();
    sender
        .send(WsMessage::Binary(frame.to_vec().into()))
        .await
        .unwrap();
    // Same value again is still relayed, but not to its sender either
    send_text(&mut sender, &Message::set(11, true)).await;

    assert_eq!(next_message(&mut watcher).await, Message::set(11, true));
    assert_eq!(next_message(&mut watcher).await, Message::set(12, true));
    assert_eq!(next_message(&mut watcher).await, Message::set(11, true));
    expect_silence(&mut sender).await;
}

#[tokio::test]
async fn test_lagging_session_is_closed() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(SyncServer::new(ServerConfig {
        bind_addr: addr.to_string(),
        grid_size: 100,
        broadcast_capacity: 1,
    }));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });

    let mut slow = raw_connect(addr).await;
    let mut sender = raw_connect(addr).await;
    wait_for_peers(&server, 2).await;

    // One burst is far more than a single-slot buffer can hold. The sender's
    // own session may be cut off mid-burst too, so write errors are expected.
    for round in 0..20 {
        for index in 0..100 {
            let text = Message::set(index, round % 2 == 0).encode().unwrap();
            let _ = sender.feed(WsMessage::Text(text.into())).await;
        }
    }
    let _ = sender.flush().await;

    // The slow session is cut off instead of being sent a snapshot that
    // could overwrite its own unread edits.
    let closed = timeout(WAIT, async {
        while let Some(frame) = slow.next().await {
            match frame {
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(WsMessage::Text(text)) => {
                    let msg = Message::decode(text.as_str()).unwrap();
                    assert!(matches!(msg, Message::Set { .. }), "unexpected {msg:?}");
                }
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "lagging session was not closed");

    assert!(server.stats().await.lagged_disconnects >= 1);
    assert_eq!(server.stats().await.snapshots_sent, 0);
}

#[tokio::test]
async fn test_client_resyncs_after_lag_disconnect() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(SyncServer::new(ServerConfig {
        bind_addr: addr.to_string(),
        grid_size: 100,
        broadcast_capacity: 1,
    }));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });

    let view = SharedPresenter::default();
    let client = SyncClient::websocket(client_config(addr), view).start();
    timeout(WAIT, client.wait_for_state(SessionState::Open)).await.unwrap().unwrap();
    let mut sender = raw_connect(addr).await;
    wait_for_peers(&server, 2).await;

    for index in 0..100 {
        let text = Message::set(index, true).encode().unwrap();
        let _ = sender.feed(WsMessage::Text(text.into())).await;
    }
    let _ = sender.flush().await;
    wait_for_cells(&server, &[0]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Whether or not this client was cut off, it ends up on the server grid.
    timeout(WAIT, async {
        loop {
            if client.state() == SessionState::Open
                && client.snapshot().await.unwrap() == server.grid_snapshot().await
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("client did not converge");

    client.stop().await.unwrap();
}
