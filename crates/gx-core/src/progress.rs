//! User-facing progress output.
//!
//! Diagnostics go through `tracing`; this sink only carries the status line
//! and persistent result lines, so tests can swap in a recorder.

use std::sync::Mutex;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Sink for user-visible progress output.
pub trait Printer: Send + Sync {
    /// Updates the transient status line.
    fn status(&self, message: &str);
    /// Prints a line that survives status updates.
    fn persistent(&self, message: &str);
    /// Flushes and tears down any live display.
    fn close(&self) {}
}

/// Spinner-backed printer for interactive runs.
pub struct SpinnerPrinter {
    bar: ProgressBar,
}

impl SpinnerPrinter {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.green} {msg}")
                .expect("spinner template is valid"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }
}

impl Default for SpinnerPrinter {
    fn default() -> Self {
        Self::new()
    }
}

impl Printer for SpinnerPrinter {
    fn status(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    fn persistent(&self, message: &str) {
        self.bar.println(message);
    }

    fn close(&self) {
        self.bar.finish_and_clear();
    }
}

/// Plain line printer for verbose runs.
pub struct PlainPrinter;

impl Printer for PlainPrinter {
    fn status(&self, message: &str) {
        println!("{message}");
    }

    fn persistent(&self, message: &str) {
        println!("{message}");
    }
}

/// Quiet printer: suppresses everything (errors still reach stderr via the
/// CLI adapter).
pub struct QuietPrinter;

impl Printer for QuietPrinter {
    fn status(&self, _message: &str) {}

    fn persistent(&self, _message: &str) {}
}

/// Records output for assertions in tests.
#[derive(Default)]
pub struct MemoryPrinter {
    lines: Mutex<Vec<String>>,
}

impl MemoryPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }
}

impl Printer for MemoryPrinter {
    fn status(&self, message: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.to_string());
    }

    fn persistent(&self, message: &str) {
        self.status(message);
    }
}
