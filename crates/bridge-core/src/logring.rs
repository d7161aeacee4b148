//! Log Ring — a fixed-capacity ring of structured log entries, fed by every
//! `tracing` call site in the process via a custom `tracing_subscriber::Layer`,
//! so producers never make a separate logging call to populate it.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

const DEFAULT_CAPACITY: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
    /// Used only by the HTTP request-log middleware.
    Request,
}

impl LogLevel {
    pub fn as_wire(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Success => "success",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Request => "request",
        }
    }

    fn from_tracing(level: &Level) -> Self {
        match *level {
            Level::ERROR => LogLevel::Error,
            Level::WARN => LogLevel::Warning,
            _ => LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: std::time::SystemTime,
    pub level: LogLevel,
    pub message: String,
}

/// A `Mutex<VecDeque<LogEntry>>` ring; producers append and the oldest entry
/// past capacity is discarded. Non-blocking: append never allocates beyond
/// the entry itself and never awaits.
pub struct LogRing {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        LogRing {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, level: LogLevel, message: String) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            timestamp: std::time::SystemTime::now(),
            level,
            message,
        });
    }

    /// Explicit helper for the HTTP request-log middleware, which logs at a
    /// level distinct from ordinary `tracing` severities.
    pub fn push_request(&self, message: String) {
        self.push(LogLevel::Request, message);
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }
}

impl Default for LogRing {
    fn default() -> Self {
        LogRing::new(DEFAULT_CAPACITY)
    }
}

/// Extracts the event's formatted message field (`message = ...`) the way
/// `tracing`'s own fmt subscriber does, ignoring other structured fields for
/// the ring's plain-text rendering.
#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

/// A `tracing_subscriber::Layer` that mirrors every event into a shared
/// [`LogRing`], in addition to whatever other layers (e.g. an env-filtered
/// fmt layer) are installed.
pub struct LogRingLayer {
    ring: std::sync::Arc<LogRing>,
}

impl LogRingLayer {
    pub fn new(ring: std::sync::Arc<LogRing>) -> Self {
        LogRingLayer { ring }
    }
}

impl<S: Subscriber> Layer<S> for LogRingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let level = LogLevel::from_tracing(event.metadata().level());
        self.ring.push(level, visitor.message);
    }
}
