//! Append-only audit ledger.
//!
//! Two logical JSONL streams share one monotonic sequence: `audit` for
//! label changes, trust conflicts, tainted writes, policy denials, and
//! guard decisions; `sig` for events forwarded unchanged from the signing
//! collaborator. A write failure is a warning, never an operation abort.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::dispatch::context::OpSummary;
use crate::label::SecurityDescriptor;

/// Ring capacity for the in-memory (ephemeral) backend.
const MEMORY_RING_CAPACITY: usize = 4096;

/// Internal ledger failure; always demoted to a warning by [`AuditLedger::emit`].
#[derive(Debug, Error)]
pub enum AuditError {
    /// Underlying sink write failed.
    #[error("audit write failed: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding failed.
    #[error("audit record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    /// The ledger mutex was poisoned.
    #[error("audit writer lock poisoned")]
    Poisoned,
}

/// Logical stream a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStream {
    /// Primary security stream (`.mlld/sec/audit.jsonl`).
    Audit,
    /// Signing events (`.sig/audit.jsonl`).
    Sig,
}

/// Record kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    /// Policy pre-decision.
    Policy,
    /// A guard decision.
    Guard,
    /// A label mutation (add, removal, blessing, clear, trust conflict).
    Label,
    /// A file write with its taint.
    Write,
    /// A file read (including recovered taint).
    Read,
    /// Signing collaborator event.
    Sign,
    /// Internal invariant breach.
    Panic,
}

/// One structured ledger record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonic sequence number, shared across both streams.
    #[serde(default)]
    pub seq: u64,
    /// RFC-3339 timestamp.
    #[serde(default)]
    pub ts: String,
    /// Record kind.
    pub kind: AuditKind,
    /// Operation summary, when the record belongs to a dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<OpSummary>,
    /// Descriptor before a label change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<SecurityDescriptor>,
    /// Descriptor after a label change (or the descriptor of a write).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<SecurityDescriptor>,
    /// Decision string (`permit`, `deny`, `retry`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    /// Human-readable reasoning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Correlation id threading retries of one dispatch together.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corr: Option<String>,
    /// Rule id, for policy-synthesized decisions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    /// Policy name, when a named policy layer decided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
}

impl AuditRecord {
    /// Start a record; `seq` and `ts` are assigned at emit time.
    pub fn new(kind: AuditKind) -> Self {
        Self {
            seq: 0,
            ts: String::new(),
            kind,
            op: None,
            before: None,
            after: None,
            decision: None,
            reason: None,
            corr: None,
            rule: None,
            policy: None,
        }
    }

    /// Attach the operation summary.
    pub fn with_op(mut self, op: OpSummary) -> Self {
        self.op = Some(op);
        self
    }

    /// Attach before/after descriptors.
    pub fn with_change(
        mut self,
        before: Option<SecurityDescriptor>,
        after: Option<SecurityDescriptor>,
    ) -> Self {
        self.before = before;
        self.after = after;
        self
    }

    /// Attach the decision string.
    pub fn with_decision(mut self, decision: impl Into<String>) -> Self {
        self.decision = Some(decision.into());
        self
    }

    /// Attach the reasoning text.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach the correlation id.
    pub fn with_corr(mut self, corr: Uuid) -> Self {
        self.corr = Some(corr.to_string());
        self
    }

    /// Attach the rule id.
    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }
}

enum SinkBackend {
    File {
        writer: Box<dyn Write + Send>,
        path: PathBuf,
    },
    Memory(VecDeque<String>),
    Writer(Box<dyn Write + Send>),
}

struct Sink {
    backend: SinkBackend,
}

impl Sink {
    fn append(&mut self, line: &str) -> Result<(), AuditError> {
        match &mut self.backend {
            SinkBackend::File { writer, .. } | SinkBackend::Writer(writer) => {
                writeln!(writer, "{line}")?;
                writer.flush()?;
                Ok(())
            }
            SinkBackend::Memory(ring) => {
                if ring.len() >= MEMORY_RING_CAPACITY {
                    ring.pop_front();
                }
                ring.push_back(line.to_owned());
                Ok(())
            }
        }
    }

    /// Raw lines, oldest first. `None` when the backend cannot be read
    /// back (opaque writer).
    fn lines(&mut self) -> Option<Vec<String>> {
        match &mut self.backend {
            SinkBackend::File { writer, path } => {
                let _ = writer.flush();
                match std::fs::read_to_string(path) {
                    Ok(text) => Some(text.lines().map(str::to_owned).collect()),
                    Err(_) => Some(Vec::new()),
                }
            }
            SinkBackend::Memory(ring) => Some(ring.iter().cloned().collect()),
            SinkBackend::Writer(_) => None,
        }
    }
}

struct LedgerInner {
    audit: Sink,
    sig: Sink,
    seq: u64,
}

/// The process-wide ledger writer. Emitters hand records to it; it
/// linearizes them by sequence number.
pub struct AuditLedger {
    inner: Mutex<LedgerInner>,
}

impl AuditLedger {
    /// Open (or reopen) file-backed streams, appending to existing files
    /// and continuing their sequence numbering.
    pub fn open(audit_path: &Path, sig_path: &Path) -> anyhow::Result<Self> {
        let audit = open_file_sink(audit_path)?;
        let sig = open_file_sink(sig_path)?;
        let seq = tail_seq(audit_path).max(tail_seq(sig_path));
        Ok(Self {
            inner: Mutex::new(LedgerInner { audit, sig, seq }),
        })
    }

    /// In-memory ring ledger for `MLLD_EPHEMERAL` runs.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                audit: Sink {
                    backend: SinkBackend::Memory(VecDeque::new()),
                },
                sig: Sink {
                    backend: SinkBackend::Memory(VecDeque::new()),
                },
                seq: 0,
            }),
        }
    }

    /// Build from arbitrary writers (test seam). Such a ledger cannot be
    /// scanned back.
    pub fn from_writers(audit: Box<dyn Write + Send>, sig: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                audit: Sink {
                    backend: SinkBackend::Writer(audit),
                },
                sig: Sink {
                    backend: SinkBackend::Writer(sig),
                },
                seq: 0,
            }),
        }
    }

    /// Emit a record. Assigns sequence and timestamp; returns the
    /// sequence number. Failures are logged and swallowed -- the ledger
    /// never aborts an operation.
    pub fn emit(&self, stream: AuditStream, record: AuditRecord) -> u64 {
        match self.try_emit(stream, record) {
            Ok(seq) => seq,
            Err(e) => {
                warn!(error = %e, "audit ledger write failed");
                0
            }
        }
    }

    fn try_emit(&self, stream: AuditStream, mut record: AuditRecord) -> Result<u64, AuditError> {
        let mut inner = self.inner.lock().map_err(|_| AuditError::Poisoned)?;
        inner.seq = inner.seq.saturating_add(1);
        record.seq = inner.seq;
        record.ts = Utc::now().to_rfc3339();
        let line = serde_json::to_string(&record)?;
        let sink = match stream {
            AuditStream::Audit => &mut inner.audit,
            AuditStream::Sig => &mut inner.sig,
        };
        sink.append(&line)?;
        Ok(record.seq)
    }

    /// Forward a signing collaborator event to the `sig` stream
    /// unchanged.
    pub fn forward_sign_event(&self, event: &serde_json::Value) {
        let result = (|| -> Result<(), AuditError> {
            let mut inner = self.inner.lock().map_err(|_| AuditError::Poisoned)?;
            let line = serde_json::to_string(event)?;
            inner.sig.append(&line)
        })();
        if let Err(e) = result {
            warn!(error = %e, "sig ledger write failed");
        }
    }

    /// Parse every record currently in the audit stream, oldest first.
    /// Unparseable lines are skipped. `None` when the backend is opaque.
    pub fn scan_audit(&self) -> Option<Vec<AuditRecord>> {
        let mut inner = self.inner.lock().ok()?;
        let lines = inner.audit.lines()?;
        Some(
            lines
                .iter()
                .filter_map(|line| serde_json::from_str::<AuditRecord>(line).ok())
                .collect(),
        )
    }
}

fn open_file_sink(path: &Path) -> anyhow::Result<Sink> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(Sink {
        backend: SinkBackend::File {
            writer: Box::new(file),
            path: path.to_path_buf(),
        },
    })
}

/// Highest sequence number already present in a stream file.
fn tail_seq(path: &Path) -> u64 {
    let Ok(text) = std::fs::read_to_string(path) else {
        return 0;
    };
    text.lines()
        .filter_map(|line| serde_json::from_str::<AuditRecord>(line).ok())
        .map(|r| r.seq)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationType;
    use std::io::Cursor;
    use std::sync::Arc;

    /// Shared buffer for capturing ledger output in tests.
    #[derive(Clone)]
    struct SharedBuf(Arc<Mutex<Cursor<Vec<u8>>>>);

    impl SharedBuf {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(Cursor::new(Vec::new()))))
        }

        fn contents(&self) -> String {
            let cursor = self.0.lock().expect("test lock");
            String::from_utf8_lossy(cursor.get_ref()).to_string()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("test lock").write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.0.lock().expect("test lock").flush()
        }
    }

    fn op_summary() -> OpSummary {
        OpSummary {
            op_type: OperationType::Run,
            name: "cmd:echo".to_owned(),
            op_labels: vec!["op:run".to_owned()],
        }
    }

    #[test]
    fn emit_assigns_monotonic_sequence() {
        let buf = SharedBuf::new();
        let ledger =
            AuditLedger::from_writers(Box::new(buf.clone()), Box::new(SharedBuf::new()));

        let s1 = ledger.emit(
            AuditStream::Audit,
            AuditRecord::new(AuditKind::Policy).with_decision("permit"),
        );
        let s2 = ledger.emit(
            AuditStream::Audit,
            AuditRecord::new(AuditKind::Guard).with_decision("allow"),
        );
        assert_eq!(s1, 1);
        assert_eq!(s2, 2);

        let output = buf.contents();
        let lines: Vec<&str> = output.trim().lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            let record: serde_json::Value =
                serde_json::from_str(line).expect("each line is valid JSON");
            assert!(record["ts"].as_str().is_some_and(|t| !t.is_empty()));
        }
    }

    #[test]
    fn sequence_is_shared_across_streams() {
        let ledger = AuditLedger::in_memory();
        let s1 = ledger.emit(AuditStream::Audit, AuditRecord::new(AuditKind::Policy));
        let s2 = ledger.emit(AuditStream::Sig, AuditRecord::new(AuditKind::Sign));
        let s3 = ledger.emit(AuditStream::Audit, AuditRecord::new(AuditKind::Guard));
        assert_eq!((s1, s2, s3), (1, 2, 3));
    }

    #[test]
    fn scan_reads_back_memory_records() {
        let ledger = AuditLedger::in_memory();
        ledger.emit(
            AuditStream::Audit,
            AuditRecord::new(AuditKind::Write)
                .with_op(op_summary())
                .with_decision("allow"),
        );

        let records = ledger.scan_audit().expect("memory backend is scannable");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, AuditKind::Write);
        assert_eq!(
            records[0].op.as_ref().map(|o| o.name.as_str()),
            Some("cmd:echo")
        );
    }

    #[test]
    fn file_backend_reopens_and_continues_sequence() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let audit_path = dir.path().join("sec/audit.jsonl");
        let sig_path = dir.path().join("sig/audit.jsonl");

        {
            let ledger = AuditLedger::open(&audit_path, &sig_path).expect("open");
            ledger.emit(AuditStream::Audit, AuditRecord::new(AuditKind::Policy));
            ledger.emit(AuditStream::Audit, AuditRecord::new(AuditKind::Guard));
        }

        // A second program run appends and continues numbering.
        let ledger = AuditLedger::open(&audit_path, &sig_path).expect("reopen");
        let seq = ledger.emit(AuditStream::Audit, AuditRecord::new(AuditKind::Label));
        assert_eq!(seq, 3);

        let records = ledger.scan_audit().expect("file backend is scannable");
        assert_eq!(records.len(), 3);
        assert!(records.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn sign_events_are_forwarded_unchanged() {
        let buf = SharedBuf::new();
        let ledger =
            AuditLedger::from_writers(Box::new(SharedBuf::new()), Box::new(buf.clone()));

        let event = serde_json::json!({"kind": "sign", "module": "x", "verdict": "ok"});
        ledger.forward_sign_event(&event);

        let output = buf.contents();
        let parsed: serde_json::Value =
            serde_json::from_str(output.trim()).expect("valid JSON");
        assert_eq!(parsed, event);
    }

    #[test]
    fn memory_ring_drops_oldest_past_capacity() {
        let ledger = AuditLedger::in_memory();
        for _ in 0..(MEMORY_RING_CAPACITY.saturating_add(10)) {
            ledger.emit(AuditStream::Audit, AuditRecord::new(AuditKind::Guard));
        }
        let records = ledger.scan_audit().expect("scannable");
        assert_eq!(records.len(), MEMORY_RING_CAPACITY);
        // Oldest entries were evicted; the tail survives.
        assert_eq!(
            records.last().map(|r| r.seq),
            Some(u64::try_from(MEMORY_RING_CAPACITY).expect("fits").saturating_add(10))
        );
    }

    #[test]
    fn record_serde_round_trip() {
        let record = AuditRecord::new(AuditKind::Guard)
            .with_op(op_summary())
            .with_decision("deny")
            .with_reason("secret cannot flow to exfil")
            .with_rule("no-secret-exfil")
            .with_corr(Uuid::nil());
        let line = serde_json::to_string(&record).expect("serialize");
        let back: AuditRecord = serde_json::from_str(&line).expect("deserialize");
        assert_eq!(back.rule.as_deref(), Some("no-secret-exfil"));
        assert_eq!(back.kind, AuditKind::Guard);
    }
}
