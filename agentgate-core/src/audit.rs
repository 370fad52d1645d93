//! Audit emission.
//!
//! Every decision the engine makes is offered to an [`AuditSink`]. The
//! [`AuditEmitter`] fans events out to any number of sinks in
//! registration order and keeps running counters. Sinks are invoked on
//! the calling context and must not block the hot path: the bounded
//! [`ChannelSink`] drops events when its consumer falls behind, and the
//! writer-backed sinks swallow I/O errors rather than surface them into
//! the request path.
//!
//! The line format of [`StdoutSink`] follows the SELinux AVC denial log
//! shape, so existing ausearch-style tooling and eyeballs both work:
//!
//! ```text
//! type=AVC msg=audit(1714060800.123:req_ab12): avc: denied { tool_call } for tool="file.read" ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::SecondsFormat;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::{AgentContext, AuditEvent, Decision};

/// Consumer of audit events.
///
/// Implementations may filter, reformat and route; they must be cheap or
/// internally buffered, because `log` runs on the evaluation path.
pub trait AuditSink: Send + Sync {
    fn log(&self, event: &AuditEvent);
}

// ─────────────────────────────────────────────────────────────────────────────
// Emitter
// ─────────────────────────────────────────────────────────────────────────────

/// Counters kept by the emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditStats {
    pub total: u64,
    pub allow: u64,
    pub deny: u64,
    pub cached: u64,
}

/// Fans audit events out to zero or more sinks.
///
/// Events are delivered in sink registration order; `add_sink` may race
/// with `log` safely.
#[derive(Default)]
pub struct AuditEmitter {
    sinks: RwLock<Vec<Arc<dyn AuditSink>>>,
    total: AtomicU64,
    allow: AtomicU64,
    deny: AtomicU64,
    cached: AtomicU64,
}

impl AuditEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emitter pre-populated with sinks.
    pub fn with_sinks(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self {
            sinks: RwLock::new(sinks),
            ..Self::default()
        }
    }

    /// Register another sink. Subsequent events reach it last.
    pub fn add_sink(&self, sink: Arc<dyn AuditSink>) {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    pub fn stats(&self) -> AuditStats {
        AuditStats {
            total: self.total.load(Ordering::Relaxed),
            allow: self.allow.load(Ordering::Relaxed),
            deny: self.deny.load(Ordering::Relaxed),
            cached: self.cached.load(Ordering::Relaxed),
        }
    }
}

impl AuditSink for AuditEmitter {
    fn log(&self, event: &AuditEvent) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match event.decision {
            Decision::Allow => self.allow.fetch_add(1, Ordering::Relaxed),
            Decision::Deny => self.deny.fetch_add(1, Ordering::Relaxed),
        };
        if event.cached {
            self.cached.fetch_add(1, Ordering::Relaxed);
        }

        let sinks = self.sinks.read().unwrap_or_else(PoisonError::into_inner);
        for sink in sinks.iter() {
            sink.log(event);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AVC Formatting
// ─────────────────────────────────────────────────────────────────────────────

/// Render an event as a single AVC-style line.
pub fn format_avc(event: &AuditEvent) -> String {
    let action = match event.decision {
        Decision::Deny => "denied",
        Decision::Allow => "granted",
    };
    let cached = if event.cached { " cached=1" } else { "" };
    format!(
        "type=AVC msg=audit({}.{:03}:{}): avc: {} {{ tool_call }} for tool=\"{}\" agent_type=\"{}\" sandbox=\"{}\" tenant=\"{}\" mts=\"{}\" reason=\"{}\"{}",
        event.timestamp.timestamp(),
        event.timestamp.timestamp_subsec_millis(),
        event.request_id,
        action,
        event.tool,
        event.agent.agent_type,
        event.agent.sandbox_id,
        event.agent.tenant_id,
        event.agent.mts_label,
        event.reason,
        cached,
    )
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    timestamp: String,
    request_id: &'a str,
    decision: String,
    tool: &'a str,
    agent: &'a AgentContext,
    reason: &'a str,
    cached: bool,
}

fn json_record(event: &AuditEvent) -> JsonRecord<'_> {
    JsonRecord {
        kind: "AVC",
        timestamp: event
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Nanos, true),
        request_id: &event.request_id,
        decision: event.decision.to_string(),
        tool: &event.tool,
        agent: &event.agent,
        reason: &event.reason,
        cached: event.cached,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sinks
// ─────────────────────────────────────────────────────────────────────────────

/// AVC-style lines on stdout. Useful in development and as a container
/// log stream.
pub struct StdoutSink {
    /// Log deny events only, like `ausearch --message AVC`.
    only_denials: bool,
}

impl StdoutSink {
    pub fn new(only_denials: bool) -> Self {
        Self { only_denials }
    }
}

impl AuditSink for StdoutSink {
    fn log(&self, event: &AuditEvent) {
        if self.only_denials && event.decision == Decision::Allow {
            return;
        }
        println!("{}", format_avc(event));
    }
}

/// JSON lines to any writer, one event per line. Suitable for structured
/// log shippers.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
    only_denials: bool,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W, only_denials: bool) -> Self {
        Self {
            writer: Mutex::new(writer),
            only_denials,
        }
    }
}

impl<W: Write + Send> AuditSink for JsonLinesSink<W> {
    fn log(&self, event: &AuditEvent) {
        if self.only_denials && event.decision == Decision::Allow {
            return;
        }
        let Ok(line) = serde_json::to_string(&json_record(event)) else {
            return;
        };
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        // Write errors are dropped; audit must not fail the request path.
        let _ = writeln!(writer, "{line}");
    }
}

/// On-disk audit format for [`FileSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditFormat {
    Avc,
    Json,
}

/// Append-only audit file.
pub struct FileSink {
    file: Mutex<File>,
    format: AuditFormat,
    only_denials: bool,
}

impl FileSink {
    /// Open (or create) the audit file for appending.
    pub fn create(
        path: impl AsRef<Path>,
        format: AuditFormat,
        only_denials: bool,
    ) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            format,
            only_denials,
        })
    }
}

impl AuditSink for FileSink {
    fn log(&self, event: &AuditEvent) {
        if self.only_denials && event.decision == Decision::Allow {
            return;
        }
        let line = match self.format {
            AuditFormat::Avc => format_avc(event),
            AuditFormat::Json => match serde_json::to_string(&json_record(event)) {
                Ok(line) => line,
                Err(_) => return,
            },
        };
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = writeln!(file, "{line}");
    }
}

/// Bounded channel for asynchronous consumers.
///
/// `log` never waits: when the buffer is full the event is dropped, so a
/// stalled consumer cannot apply back-pressure to the engine.
pub struct ChannelSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl ChannelSink {
    /// Create the sink and the receiving half.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelSink {
    fn log(&self, event: &AuditEvent) {
        let _ = self.tx.try_send(event.clone());
    }
}

/// Keeps events in memory. Used in tests and by embedders that want to
/// inspect recent decisions.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl AuditSink for MemorySink {
    fn log(&self, event: &AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Discards everything.
pub struct NullSink;

impl AuditSink for NullSink {
    fn log(&self, _event: &AuditEvent) {}
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
