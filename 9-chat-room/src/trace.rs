//! Pluggable diagnostics for the hub.
//!
//! The hub never talks to a logger directly. It is handed an
//! `Arc<dyn Tracer>` at construction and reports every membership change and
//! delivery attempt through it. [`Off`] discards everything,
//! [`WriterTracer`] prints one line per event to any [`io::Write`], and
//! [`LogTracer`] hands the line to `tracing`.

use std::{
    fmt::{self, Display, Write as _},
    io,
    sync::{Arc, Mutex},
};

use tracing::debug;

pub trait Tracer: Send + Sync {
    fn trace(&self, items: &[&dyn Display]);
}

/// Tracer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct Off;

impl Tracer for Off {
    fn trace(&self, _items: &[&dyn Display]) {}
}

/// Writes each event as a single newline-terminated line.
pub struct WriterTracer<W> {
    out: Mutex<W>,
}

impl<W: io::Write> WriterTracer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: io::Write + Send> Tracer for WriterTracer<W> {
    fn trace(&self, items: &[&dyn Display]) {
        let mut line = render(items);
        line.push('\n');

        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Diagnostics must never take the room down, so write failures are dropped.
        let _ = out.write_all(line.as_bytes()).and_then(|()| out.flush());
    }
}

impl<W> fmt::Debug for WriterTracer<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterTracer").finish_non_exhaustive()
    }
}

/// Forwards events to the `tracing` subscriber at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracer;

impl Tracer for LogTracer {
    fn trace(&self, items: &[&dyn Display]) {
        debug!(target: "chat_room::room", "{}", render(items));
    }
}

pub fn off() -> Arc<dyn Tracer> {
    Arc::new(Off)
}

/// Items are separated by a single space.
fn render(items: &[&dyn Display]) -> String {
    let mut line = String::new();
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            line.push(' ');
        }
        let _ = write!(line, "{item}");
    }
    line
}
