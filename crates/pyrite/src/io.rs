//! Output sinks for the `print()` builtin.
//!
//! The VM is generic over a [`PrintWriter`] so embedders can capture or
//! redirect interpreted output without touching process stdout.

use std::{
    borrow::Cow,
    io::{self, Write as _},
};

/// Trait for handling output from the `print()` builtin.
pub trait PrintWriter {
    /// Writes the formatted text of one `print()` argument.
    ///
    /// Separators and the trailing terminator are emitted separately via
    /// [`PrintWriter::stdout_push`]; this method must not add them.
    fn stdout_write(&mut self, output: Cow<'_, str>);

    /// Writes a single separator or terminator character.
    fn stdout_push(&mut self, end: char);
}

/// Default writer: buffered process stdout, flushed on drop.
#[derive(Debug, Default)]
pub struct StdPrint {
    buffer: String,
}

impl StdPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PrintWriter for StdPrint {
    fn stdout_write(&mut self, output: Cow<'_, str>) {
        self.buffer.push_str(&output);
    }

    fn stdout_push(&mut self, end: char) {
        self.buffer.push(end);
    }
}

impl Drop for StdPrint {
    fn drop(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let _ = io::stdout().write_all(self.buffer.as_bytes());
        let _ = io::stdout().flush();
        self.buffer.clear();
    }
}

/// Writer that collects all output into a string, for tests and embedders.
#[derive(Debug, Default)]
pub struct CollectStringPrint(String);

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the collected output so far.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.0
    }

    /// Consumes the writer and returns the collected output.
    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl PrintWriter for CollectStringPrint {
    fn stdout_write(&mut self, output: Cow<'_, str>) {
        self.0.push_str(&output);
    }

    fn stdout_push(&mut self, end: char) {
        self.0.push(end);
    }
}

/// Writer that discards everything.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn stdout_write(&mut self, _output: Cow<'_, str>) {}

    fn stdout_push(&mut self, _end: char) {}
}
