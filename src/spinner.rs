//! Terminal progress indicator for interactive runs.

use std::io::{stdout, Write};

use crossterm::tty::IsTty;

const FRAMES: [char; 4] = ['|', '/', '-', '\\'];

/// True when stdout is attached to an interactive terminal. Non-TTY runs
/// (pipes, service managers) skip the spinner entirely.
pub fn is_tty() -> bool {
    stdout().is_tty()
}

pub struct Spinner {
    message: &'static str,
    frame: usize,
}

impl Spinner {
    pub fn new(message: &'static str) -> Self {
        Self { message, frame: 0 }
    }

    /// Redraw the spinner in place. Called on a 100ms tick.
    pub fn tick(&mut self) {
        print!("\r{}{}", self.message, FRAMES[self.frame]);
        let _ = stdout().flush();
        self.frame = (self.frame + 1) % FRAMES.len();
    }
}
