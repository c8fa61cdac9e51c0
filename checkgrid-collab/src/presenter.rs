//! Presentation boundary.
//!
//! The sync engine drives a `Presenter` and never touches a rendering
//! surface directly, so it runs headless in tests. User toggles flow the
//! other way through [`crate::client::ClientHandle::toggle`].

/// Rendering capability consumed by the sync engine.
pub trait Presenter: Send + 'static {
    /// Show cell `index` as `value`.
    ///
    /// Only called when the mirrored value actually changed. Implementations
    /// must not report this back as a user toggle.
    fn render_cell(&mut self, index: usize, value: bool);

    /// Enable or disable user input (tracks connection state).
    fn set_input_enabled(&mut self, enabled: bool);
}

/// Presenter that only logs. Useful for headless clients and bots.
#[derive(Debug, Default)]
pub struct LogPresenter {
    input_enabled: bool,
}

impl LogPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input_enabled(&self) -> bool {
        self.input_enabled
    }
}

impl Presenter for LogPresenter {
    fn render_cell(&mut self, index: usize, value: bool) {
        log::info!("cell {index} -> {}", if value { "on" } else { "off" });
    }

    fn set_input_enabled(&mut self, enabled: bool) {
        self.input_enabled = enabled;
        log::info!("{}", if enabled { "Connected" } else { "Disconnected" });
    }
}
