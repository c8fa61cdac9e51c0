//! Text rendering of the grid for the `join` command.

use std::io::Write;

use checkgrid_collab::presenter::Presenter;

const ON: char = '#';
const OFF: char = '.';

/// Presenter that prints the row of every cell that changes.
pub struct TerminalPresenter {
    cells: Vec<bool>,
    columns: usize,
    input_enabled: bool,
}

impl TerminalPresenter {
    pub fn new(grid_size: usize, columns: usize) -> Self {
        Self {
            cells: vec![false; grid_size],
            columns: columns.max(1),
            input_enabled: false,
        }
    }

    /// Square-ish layout for `grid_size` cells.
    pub fn for_grid(grid_size: usize) -> Self {
        let columns = (grid_size as f64).sqrt().ceil() as usize;
        Self::new(grid_size, columns)
    }

    /// Offline view over a copy of the grid, for one-off printing.
    pub fn from_cells(cells: Vec<bool>) -> Self {
        let mut presenter = Self::for_grid(cells.len());
        presenter.cells = cells;
        presenter
    }

    pub fn input_enabled(&self) -> bool {
        self.input_enabled
    }

    /// One row as text, prefixed with the index of its first cell.
    pub fn row_text(&self, row: usize) -> String {
        let start = row * self.columns;
        let end = (start + self.columns).min(self.cells.len());
        let cells: String = self.cells[start.min(end)..end]
            .iter()
            .map(|&on| if on { ON } else { OFF })
            .collect();
        format!("{start:>6} {cells}")
    }

    pub fn rows(&self) -> usize {
        self.cells.len().div_ceil(self.columns)
    }

    /// Whole grid, one row per line.
    pub fn grid_text(&self) -> String {
        (0..self.rows())
            .map(|row| self.row_text(row))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn print(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        // A closed stdout is not worth failing the client over.
        let _ = writeln!(out, "{text}");
    }
}

impl Presenter for TerminalPresenter {
    fn render_cell(&mut self, index: usize, value: bool) {
        let Some(cell) = self.cells.get_mut(index) else {
            log::warn!("Render for cell {index} outside the grid");
            return;
        };
        *cell = value;
        self.print(&self.row_text(index / self.columns));
    }

    fn set_input_enabled(&mut self, enabled: bool) {
        if self.input_enabled != enabled {
            self.input_enabled = enabled;
            self.print(if enabled {
                "-- connected, input enabled --"
            } else {
                "-- disconnected, input disabled --"
            });
        }
    }
}
