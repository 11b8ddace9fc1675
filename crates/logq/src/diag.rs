//! Per-transaction diagnostics.
//!
//! Malformed payloads, impossible links and forced completions are non-fatal:
//! the offending transaction keeps assembling, and a [`Diag`] describing the
//! hiccup goes to the sink installed at construction. The default sink routes
//! to the `tracing` subscriber; [`JsonSink`] writes one JSON object per line;
//! [`MemorySink`] captures for inspection in tests.

use crate::record::{Record, Tag};
use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;

/// Why a transaction was flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DiagReason {
    /// A `Begin`/`Link` payload did not parse.
    ParseError,
    /// A transaction type was reasserted to a different value.
    TypeMismatch,
    /// A second parent link was attempted.
    DuplicateLink,
    /// A link was attempted after the target was already ready.
    LinkTooLate,
    /// A record arrived after `End`.
    LateRecord,
    /// A record arrived before `Begin`.
    EarlyRecord,
    /// A transaction completed without ever learning its type.
    UnknownType,
    /// Forced completion: incomplete past the age limit.
    Timeout,
    /// Forced completion: too many simultaneously incomplete transactions.
    StoreOverflow,
    /// Forced completion: explicit flush.
    Flush,
}

impl DiagReason {
    /// Stable human-readable form.
    pub fn as_str(self) -> &'static str {
        match self {
            DiagReason::ParseError => "parse error",
            DiagReason::TypeMismatch => "type mismatch",
            DiagReason::DuplicateLink => "duplicate link",
            DiagReason::LinkTooLate => "link too late",
            DiagReason::LateRecord => "late log record",
            DiagReason::EarlyRecord => "early log record",
            DiagReason::UnknownType => "completed with unknown type",
            DiagReason::Timeout => "incomplete - timeout",
            DiagReason::StoreOverflow => "incomplete - store overflow",
            DiagReason::Flush => "incomplete - flushing",
        }
    }
}

/// One diagnostic event, tied to the transaction it concerns.
#[derive(Debug, Clone, Serialize)]
pub struct Diag {
    /// Transaction the diagnostic is about.
    pub vxid: u32,
    /// What happened.
    pub reason: DiagReason,
    /// Tag of the offending record, when one exists.
    pub tag: Option<Tag>,
    /// Offending payload, lossily decoded.
    pub detail: Option<String>,
}

impl Diag {
    pub(crate) fn new(vxid: u32, reason: DiagReason) -> Self {
        Diag {
            vxid,
            reason,
            tag: None,
            detail: None,
        }
    }

    pub(crate) fn with_record(vxid: u32, reason: DiagReason, rec: Record) -> Self {
        Diag {
            vxid,
            reason,
            tag: Some(rec.tag()),
            detail: Some(String::from_utf8_lossy(rec.payload()).into_owned()),
        }
    }
}

impl std::fmt::Display for Diag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>: {}", self.vxid, self.reason.as_str())?;
        if let Some(tag) = self.tag {
            write!(f, " ({}", tag)?;
            if let Some(detail) = &self.detail {
                write!(f, ": {detail}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// Destination for diagnostics, installed at construction.
pub trait DiagSink {
    /// Receives one diagnostic event.
    fn emit(&self, diag: &Diag);
}

/// Routes diagnostics to the `tracing` subscriber at `WARN`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagSink for TracingSink {
    fn emit(&self, diag: &Diag) {
        tracing::warn!(
            vxid = diag.vxid,
            reason = diag.reason.as_str(),
            tag = diag.tag.map(Tag::name),
            detail = diag.detail.as_deref(),
            "transaction diagnostic"
        );
    }
}

/// Writes diagnostics as JSON lines.
pub struct JsonSink<W: Write> {
    out: Mutex<W>,
}

impl<W: Write> JsonSink<W> {
    /// Wraps a writer.
    pub fn new(out: W) -> Self {
        JsonSink {
            out: Mutex::new(out),
        }
    }
}

impl<W: Write> DiagSink for JsonSink<W> {
    fn emit(&self, diag: &Diag) {
        let mut out = self.out.lock().expect("diag writer poisoned");
        if let Err(err) = serde_json::to_writer(&mut *out, diag).map_err(std::io::Error::from)
            .and_then(|()| out.write_all(b"\n"))
        {
            tracing::error!(error = %err, "failed to write diagnostic");
        }
    }
}

/// Captures diagnostics in memory, for tests and introspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    diags: Mutex<Vec<Diag>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clones out everything captured so far.
    pub fn snapshot(&self) -> Vec<Diag> {
        self.diags.lock().expect("diag store poisoned").clone()
    }

    /// Drains everything captured so far.
    pub fn take(&self) -> Vec<Diag> {
        std::mem::take(&mut *self.diags.lock().expect("diag store poisoned"))
    }

    /// Number of captured diagnostics with the given reason.
    pub fn count(&self, reason: DiagReason) -> usize {
        self.diags
            .lock()
            .expect("diag store poisoned")
            .iter()
            .filter(|d| d.reason == reason)
            .count()
    }
}

impl DiagSink for MemorySink {
    fn emit(&self, diag: &Diag) {
        self.diags
            .lock()
            .expect("diag store poisoned")
            .push(diag.clone());
    }
}
