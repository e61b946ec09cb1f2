//! Optional wire tracing.
//!
//! A [`WireTracer`] sees every line written and read on a connection, plus
//! diagnostics such as the TLS handshake outcome. Sensitive writes (AUTH
//! payloads, PASS, APOP digests) are passed in redacted form.

use std::sync::{Arc, Mutex};

/// Event observed on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// Line sent to the server, without the CRLF terminator.
    Write(String),
    /// Line received from the server, without the CRLF terminator.
    Read(String),
    /// Free-form diagnostic from the client.
    Diagnostic(String),
    /// Connection closed.
    Closed,
}

/// Receiver of wire events.
pub trait WireTracer: Send + Sync {
    /// Records one event.
    fn trace_event(&self, event: TraceEvent);
}

/// Shared tracer handle.
pub type SharedTracer = Arc<dyn WireTracer>;

/// Tracer that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingTracer {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Returns the written lines only.
    #[must_use]
    pub fn writes(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TraceEvent::Write(line) => Some(line),
                _ => None,
            })
            .collect()
    }
}

impl WireTracer for RecordingTracer {
    fn trace_event(&self, event: TraceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Tracer forwarding events to `tracing` at trace level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracer;

impl WireTracer for LogTracer {
    fn trace_event(&self, event: TraceEvent) {
        match event {
            TraceEvent::Write(line) => tracing::trace!(target: "mailprobe::wire", "C: {line}"),
            TraceEvent::Read(line) => tracing::trace!(target: "mailprobe::wire", "S: {line}"),
            TraceEvent::Diagnostic(message) => {
                tracing::debug!(target: "mailprobe::wire", "{message}");
            }
            TraceEvent::Closed => tracing::trace!(target: "mailprobe::wire", "closed"),
        }
    }
}
