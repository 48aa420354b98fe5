//! Read-taint recovery.
//!
//! Taint must survive disk persistence: a `secret` written to a file is
//! still `secret` when a later program run reads it back, with no
//! in-memory state in between. On every permitted `read`, the dispatcher
//! asks this module for the descriptor of the most recent audited `write`
//! to the same absolute path and merges it into the read result.
//!
//! Ephemeral runs (`MLLD_EPHEMERAL=true`) have no persistent ledger, so
//! recovery is a no-op there.

use std::sync::Arc;

use tracing::debug;

use crate::audit::{AuditKind, AuditLedger};
use crate::label::SecurityDescriptor;

/// Restores descriptors from prior `write` ledger records.
pub struct ReadTaintRecovery {
    ledger: Arc<AuditLedger>,
    enabled: bool,
}

impl ReadTaintRecovery {
    /// Recovery over the given ledger; `enabled = false` makes every
    /// lookup a no-op (ephemeral mode).
    pub fn new(ledger: Arc<AuditLedger>, enabled: bool) -> Self {
        Self { ledger, enabled }
    }

    /// Whether lookups are live.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Descriptor of the most recent audited write to `path`, if any.
    pub fn recover(&self, path: &str) -> Option<SecurityDescriptor> {
        if !self.enabled {
            return None;
        }
        let records = self.ledger.scan_audit()?;
        let descriptor = records
            .iter()
            .rev()
            .find(|r| {
                r.kind == AuditKind::Write
                    && r.op.as_ref().is_some_and(|op| op.name == path)
            })
            .and_then(|r| r.after.clone());
        if descriptor.is_some() {
            debug!(path = %path, "restored taint from prior write record");
        }
        descriptor
    }
}
