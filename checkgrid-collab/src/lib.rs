//! # checkgrid-collab: shared checkbox grid synchronized over WebSocket
//!
//! Every connected viewer mirrors one grid of boolean cells. A toggle in
//! any viewer is sent to the server, applied to the authoritative grid and
//! relayed to every other viewer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per viewer)│     JSON frames     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ SyncEngine  │                     │ Grid        │
//! │ + Grid      │                     │ (authority) │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                           ┌───────┴───────┐
//! ┌─────────────┐                    │ BroadcastGroup│
//! │ Presenter   │                    │ (fan-out)     │
//! └─────────────┘                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`grid`]: Cell store
//! - [`protocol`]: JSON wire messages and the 5-byte binary frame
//! - [`session`]: Transport session with fixed-delay reconnect
//! - [`engine`]: Sync engine: local edits, remote frames, snapshot resync
//! - [`client`]: Task that ties a session, an engine and a presenter together
//! - [`presenter`]: Rendering boundary
//! - [`config`]: Client configuration and shared constants
//! - [`broadcast`]: Fan-out without echo
//! - [`server`]: WebSocket relay server

pub mod broadcast;
pub mod client;
pub mod config;
pub mod engine;
pub mod grid;
pub mod presenter;
pub mod protocol;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, PeerInfo};
pub use client::{ClientError, ClientHandle, SyncClient};
pub use config::{ClientConfig, ConfigError};
pub use engine::{EngineStats, SyncEngine, SyncError};
pub use grid::{Grid, GridError};
pub use presenter::{LogPresenter, Presenter};
pub use protocol::{BinaryFrame, FrameCommand, Message, ProtocolError};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use session::{
    Connector, Link, SessionError, SessionEvent, SessionState, TransportSession, WsConnector,
};
