//! Sync engine: bridges local intent and remote events to the cell store.
//!
//! Two paths touch the grid:
//!
//! - **local**: a user toggle is applied and always produces a `SET` for the
//!   server, even when the cell already held that value. A changed cell is
//!   rendered so every view of the grid stays in step with the store.
//! - **remote**: an inbound frame is decoded and applied; the presenter is
//!   told to re-render only cells whose value actually changed. This path
//!   returns no outbound messages at all, so a remote value can never be
//!   echoed back.
//!
//! On every (re)open the engine asks for a snapshot. Cells edited locally
//! between that request and the reply keep their local value, since the
//! server answered the request before it saw those edits. A snapshot that
//! was not asked for is discarded: the engine cannot tell which local edits
//! it already reflects.

use std::collections::HashSet;

use thiserror::Error;

use crate::grid::{Grid, GridError};
use crate::presenter::Presenter;
use crate::protocol::{Message, ProtocolError};

/// Reasons an inbound frame was discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("Unexpected {0} from server")]
    UnexpectedCommand(&'static str),
}

/// Engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub local_edits: u64,
    pub remote_applied: u64,
    pub remote_redundant: u64,
    pub snapshots_applied: u64,
    pub discarded: u64,
}

pub struct SyncEngine<P: Presenter> {
    grid: Grid,
    presenter: P,
    awaiting_snapshot: bool,
    edited_since_request: HashSet<usize>,
    stats: EngineStats,
}

impl<P: Presenter> SyncEngine<P> {
    /// Create an engine over a fresh grid. Input starts disabled until the
    /// session opens.
    pub fn new(grid_size: usize, mut presenter: P) -> Self {
        presenter.set_input_enabled(false);
        Self {
            grid: Grid::new(grid_size),
            presenter,
            awaiting_snapshot: false,
            edited_since_request: HashSet::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    pub fn presenter_mut(&mut self) -> &mut P {
        &mut self.presenter
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn into_parts(self) -> (Grid, P) {
        (self.grid, self.presenter)
    }

    /// Apply a user toggle and produce the message to send.
    ///
    /// Out-of-range indices are logged and produce nothing.
    pub fn local_edit(&mut self, index: usize, value: bool) -> Option<Message> {
        match self.grid.set(index, value) {
            Ok(changed) => {
                if changed {
                    self.presenter.render_cell(index, value);
                }
                if self.awaiting_snapshot {
                    self.edited_since_request.insert(index);
                }
                self.stats.local_edits += 1;
                Some(Message::set(index, value))
            }
            Err(e) => {
                log::warn!("Discarding local edit: {e}");
                self.stats.discarded += 1;
                None
            }
        }
    }

    /// Session opened: enable input and request a resync.
    pub fn on_open(&mut self) -> Message {
        self.presenter.set_input_enabled(true);
        self.awaiting_snapshot = true;
        self.edited_since_request.clear();
        Message::RequestSnapshot
    }

    /// Session closed: disable input.
    pub fn on_close(&mut self) {
        self.presenter.set_input_enabled(false);
        self.awaiting_snapshot = false;
        self.edited_since_request.clear();
    }

    /// Handle one inbound text frame. Returns how many cells were
    /// re-rendered; malformed or out-of-range frames are logged and dropped.
    pub fn on_message(&mut self, text: &str) -> usize {
        match self.apply_remote(text) {
            Ok(rendered) => rendered,
            Err(e) => {
                log::warn!("Discarding inbound message: {e} ({text:?})");
                self.stats.discarded += 1;
                0
            }
        }
    }

    fn apply_remote(&mut self, text: &str) -> Result<usize, SyncError> {
        match Message::decode(text)? {
            Message::Set { index, value } => {
                if self.grid.set(index, value)? {
                    self.presenter.render_cell(index, value);
                    self.stats.remote_applied += 1;
                    Ok(1)
                } else {
                    log::trace!("SET {index}={value} already applied");
                    self.stats.remote_redundant += 1;
                    Ok(0)
                }
            }
            Message::Snapshot(_) if !self.awaiting_snapshot => {
                Err(SyncError::UnexpectedCommand("SNAPSHOT"))
            }
            Message::Snapshot(cells) => self.apply_snapshot(cells),
            Message::Error(reason) => {
                log::warn!("Server reported error: {reason}");
                Ok(0)
            }
            Message::RequestSnapshot => Err(SyncError::UnexpectedCommand("REQUEST_SNAPSHOT")),
        }
    }

    fn apply_snapshot(&mut self, mut cells: Vec<bool>) -> Result<usize, SyncError> {
        if cells.len() == self.grid.size() {
            for &index in &self.edited_since_request {
                cells[index] = self.grid.get(index)?;
            }
        }

        let changed = self.grid.apply_snapshot(&cells)?;
        for &index in &changed {
            self.presenter.render_cell(index, cells[index]);
        }

        log::debug!(
            "Applied snapshot: {} cells changed, {} local edits kept",
            changed.len(),
            self.edited_since_request.len()
        );
        self.awaiting_snapshot = false;
        self.edited_since_request.clear();
        self.stats.snapshots_applied += 1;
        Ok(changed.len())
    }
}
