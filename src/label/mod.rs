//! Taint algebra -- the descriptor attached to every runtime value, and
//! the operations that derive, merge, and (under privilege) strip labels.
//!
//! Descriptors only grow through ordinary derivation: the output of an
//! operation carries the union of its inputs' labels and taint. The only
//! ways a label leaves a descriptor are an explicit privileged removal or
//! a privileged clear, and factual markers survive even those.

pub mod detect;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::types::{Label, TrustConflictResolver};

/// Errors raised by descriptor mutation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    /// `secret`, `untrusted`, and `src:*` need a privileged guard to remove.
    #[error("protected label '{label}' cannot be removed without privilege")]
    ProtectedLabelRemoval {
        /// The label whose removal was refused.
        label: Label,
    },
    /// Raised under the `error` trust-conflict resolver.
    #[error("trust conflict: cannot add 'trusted' to a value bearing 'untrusted'")]
    TrustConflict,
    /// `op:*` labels live on operations, never on values.
    #[error("operation label '{label}' cannot be placed on a value")]
    OperationLabelOnValue {
        /// The offending operation label.
        label: Label,
    },
    /// The requested mutation is privileged-only.
    #[error("privilege required: {0}")]
    PrivilegeRequired(&'static str),
}

/// Outcome detail of adding a label; the dispatcher audits conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustNote {
    /// No trust conflict occurred.
    Clean,
    /// `trusted` was added over `untrusted`; both were kept and the value
    /// is still treated as untrusted by policy.
    ConflictKeptBoth,
}

/// The security descriptor attached to every value.
///
/// `taint` is a superset of `labels`: it additionally carries the factual
/// source and directory markers, and is what guards and flow rules
/// inspect. `sources` is the append-only provenance trail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityDescriptor {
    labels: BTreeSet<Label>,
    taint: BTreeSet<Label>,
    sources: Vec<String>,
}

impl SecurityDescriptor {
    /// An empty descriptor (unlabeled value).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Construct from an initial label set, normalizing trust conflicts
    /// with the given resolver.
    pub fn of(
        labels: impl IntoIterator<Item = Label>,
        resolver: TrustConflictResolver,
    ) -> Result<Self, LabelError> {
        let mut descriptor = Self::empty();
        for label in labels {
            descriptor.add_label(label, resolver)?;
        }
        Ok(descriptor)
    }

    /// The explicit label set.
    pub fn labels(&self) -> &BTreeSet<Label> {
        &self.labels
    }

    /// The taint set guards inspect (labels plus factual markers).
    pub fn taint(&self) -> &BTreeSet<Label> {
        &self.taint
    }

    /// Ordered provenance trail of transformation source tags.
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// True when no explicit labels are present (factual taint may still
    /// exist); policy applies its unlabeled default to such values.
    pub fn is_unlabeled(&self) -> bool {
        self.labels.is_empty()
    }

    /// Derived attribute: present iff `influenced` is a label.
    pub fn is_influenced(&self) -> bool {
        self.labels.contains(&Label::influenced())
    }

    /// A value whose taint carries `untrusted` is treated as untrusted by
    /// policy even when `trusted` coexists after a kept conflict.
    pub fn effectively_untrusted(&self) -> bool {
        self.taint.contains(&Label::untrusted())
    }

    /// Add a label, applying trust asymmetry.
    ///
    /// Adding `untrusted` always succeeds and discards any `trusted`.
    /// Adding `trusted` over `untrusted` runs the resolver. Operation
    /// labels are rejected outright.
    pub fn add_label(
        &mut self,
        label: Label,
        resolver: TrustConflictResolver,
    ) -> Result<TrustNote, LabelError> {
        if label.kind() == crate::types::LabelKind::Operation {
            return Err(LabelError::OperationLabelOnValue { label });
        }

        if label == Label::untrusted() {
            self.labels.remove(&Label::trusted());
            self.taint.remove(&Label::trusted());
            self.labels.insert(label.clone());
            self.taint.insert(label);
            return Ok(TrustNote::Clean);
        }

        if label == Label::trusted() && self.taint.contains(&Label::untrusted()) {
            return match resolver {
                TrustConflictResolver::Error => Err(LabelError::TrustConflict),
                TrustConflictResolver::Warn => {
                    warn!("trust conflict: keeping both 'trusted' and 'untrusted'");
                    self.labels.insert(label.clone());
                    self.taint.insert(label);
                    Ok(TrustNote::ConflictKeptBoth)
                }
                TrustConflictResolver::Silent => {
                    self.labels.insert(label.clone());
                    self.taint.insert(label);
                    Ok(TrustNote::ConflictKeptBoth)
                }
            };
        }

        self.labels.insert(label.clone());
        self.taint.insert(label);
        Ok(TrustNote::Clean)
    }

    /// Add a factual marker (`src:*` / `dir:*`) to taint only.
    ///
    /// Factual markers record where data came from; they are part of what
    /// guards inspect but are not explicit labels.
    pub fn add_taint_marker(&mut self, label: Label) {
        debug_assert!(label.is_factual(), "taint markers must be factual");
        self.taint.insert(label);
    }

    /// Remove a label. Protected labels require privilege.
    ///
    /// Factual labels stay in `taint` even after removal from `labels`.
    pub fn remove_label(&mut self, label: &Label, privileged: bool) -> Result<(), LabelError> {
        if label.is_protected() && !privileged {
            return Err(LabelError::ProtectedLabelRemoval {
                label: label.clone(),
            });
        }
        self.labels.remove(label);
        if !label.is_factual() {
            self.taint.remove(label);
        }
        Ok(())
    }

    /// Strip every non-factual label and taint entry. Privileged only.
    pub fn clear_non_factual(&mut self, privileged: bool) -> Result<(), LabelError> {
        if !privileged {
            return Err(LabelError::PrivilegeRequired(
                "clearing non-factual labels",
            ));
        }
        self.labels.retain(Label::is_factual);
        self.taint.retain(Label::is_factual);
        Ok(())
    }

    /// Privileged replacement of `untrusted` with `trusted`.
    pub fn bless(&mut self, privileged: bool) -> Result<(), LabelError> {
        self.remove_label(&Label::untrusted(), privileged)?;
        // A blessing cannot conflict: untrusted is gone.
        let _ = self.add_label(Label::trusted(), TrustConflictResolver::Error)?;
        Ok(())
    }

    /// Append a transformation source tag, deduplicating consecutive
    /// repeats. Tags are opaque strings such as `mcp:createIssue`.
    pub fn record_source(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if self.sources.last().map(String::as_str) != Some(tag.as_str()) {
            self.sources.push(tag);
        }
    }

    /// Hierarchical containment over the taint set.
    ///
    /// `op:` and `dir:` patterns match by left-anchored segment prefix;
    /// everything else matches exactly.
    pub fn taint_contains(&self, pattern: &Label) -> bool {
        self.taint.iter().any(|label| label.matches(pattern))
    }

    /// Exact containment over the explicit label set.
    pub fn has_label(&self, label: &Label) -> bool {
        self.labels.contains(label)
    }

    /// Set union of labels and taint, source trails concatenated in input
    /// order with consecutive repeats deduplicated.
    pub fn union<'a>(parts: impl IntoIterator<Item = &'a SecurityDescriptor>) -> Self {
        let mut merged = Self::empty();
        for part in parts {
            merged.labels.extend(part.labels.iter().cloned());
            merged.taint.extend(part.taint.iter().cloned());
            for tag in &part.sources {
                merged.record_source(tag.clone());
            }
        }
        merged
    }
}

/// True when any descriptor's taint matches the pattern.
pub fn any_contains(descriptors: &[&SecurityDescriptor], pattern: &Label) -> bool {
    descriptors.iter().any(|d| d.taint_contains(pattern))
}

/// True when every descriptor's taint matches the pattern. Empty input
/// yields true, matching universal quantification.
pub fn all_contain(descriptors: &[&SecurityDescriptor], pattern: &Label) -> bool {
    descriptors.iter().all(|d| d.taint_contains(pattern))
}

/// True when no descriptor's taint matches the pattern.
pub fn none_contain(descriptors: &[&SecurityDescriptor], pattern: &Label) -> bool {
    !any_contains(descriptors, pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(raw: &str) -> Label {
        Label::parse(raw).expect("valid test label")
    }

    fn descriptor_of(raw: &[&str]) -> SecurityDescriptor {
        SecurityDescriptor::of(
            raw.iter().map(|s| label(s)),
            TrustConflictResolver::Warn,
        )
        .expect("valid test descriptor")
    }

    #[test]
    fn labels_are_mirrored_into_taint() {
        let d = descriptor_of(&["secret", "pii"]);
        assert!(d.has_label(&label("secret")));
        assert!(d.taint_contains(&label("secret")));
        assert!(d.taint_contains(&label("pii")));
    }

    #[test]
    fn operation_labels_rejected_on_values() {
        let mut d = SecurityDescriptor::empty();
        let result = d.add_label(label("op:run"), TrustConflictResolver::Warn);
        assert!(matches!(
            result,
            Err(LabelError::OperationLabelOnValue { .. })
        ));
    }

    #[test]
    fn adding_untrusted_discards_trusted() {
        let mut d = descriptor_of(&["trusted"]);
        d.add_label(label("untrusted"), TrustConflictResolver::Warn)
            .expect("add");
        assert!(!d.has_label(&label("trusted")));
        assert!(d.has_label(&label("untrusted")));
        assert!(d.effectively_untrusted());
    }

    #[test]
    fn trusted_over_untrusted_warn_keeps_both() {
        let mut d = descriptor_of(&["untrusted"]);
        let note = d
            .add_label(label("trusted"), TrustConflictResolver::Warn)
            .expect("add");
        assert_eq!(note, TrustNote::ConflictKeptBoth);
        assert!(d.has_label(&label("trusted")));
        assert!(d.has_label(&label("untrusted")));
        // Policy still treats the value as untrusted.
        assert!(d.effectively_untrusted());
    }

    #[test]
    fn trusted_over_untrusted_error_resolver() {
        let mut d = descriptor_of(&["untrusted"]);
        let result = d.add_label(label("trusted"), TrustConflictResolver::Error);
        assert_eq!(result, Err(LabelError::TrustConflict));
    }

    #[test]
    fn protected_removal_requires_privilege() {
        for protected in ["secret", "untrusted", "src:cmd"] {
            let mut d = SecurityDescriptor::empty();
            if protected.starts_with("src:") {
                d.add_taint_marker(label(protected));
            } else {
                d.add_label(label(protected), TrustConflictResolver::Warn)
                    .expect("add");
            }
            let result = d.remove_label(&label(protected), false);
            assert!(
                matches!(result, Err(LabelError::ProtectedLabelRemoval { .. })),
                "removal of {protected} should need privilege"
            );
        }
    }

    #[test]
    fn privileged_removal_keeps_factual_taint() {
        let mut d = descriptor_of(&["secret"]);
        d.add_taint_marker(label("src:file"));
        d.remove_label(&label("secret"), true).expect("remove");
        assert!(!d.taint_contains(&label("secret")));

        // src:file is factual: removal clears the label slot but taint stays.
        d.remove_label(&label("src:file"), true).expect("remove");
        assert!(d.taint_contains(&label("src:file")));
    }

    #[test]
    fn clear_non_factual_requires_privilege() {
        let mut d = descriptor_of(&["secret", "pii"]);
        d.add_taint_marker(label("src:mcp"));
        d.add_taint_marker(label("dir:/tmp"));

        assert!(matches!(
            d.clear_non_factual(false),
            Err(LabelError::PrivilegeRequired(_))
        ));

        d.clear_non_factual(true).expect("clear");
        assert!(!d.taint_contains(&label("secret")));
        assert!(!d.taint_contains(&label("pii")));
        assert!(d.taint_contains(&label("src:mcp")));
        assert!(d.taint_contains(&label("dir:/tmp")));
    }

    #[test]
    fn bless_swaps_untrusted_for_trusted() {
        let mut d = descriptor_of(&["untrusted"]);
        assert!(d.bless(false).is_err());
        d.bless(true).expect("bless");
        assert!(d.has_label(&label("trusted")));
        assert!(!d.effectively_untrusted());
    }

    #[test]
    fn union_merges_labels_taint_and_sources() {
        let mut a = descriptor_of(&["secret"]);
        a.record_source("command:curl");
        a.add_taint_marker(label("src:cmd"));
        let mut b = descriptor_of(&["untrusted"]);
        b.record_source("mcp:createIssue");

        let merged = SecurityDescriptor::union([&a, &b]);
        assert!(merged.has_label(&label("secret")));
        assert!(merged.has_label(&label("untrusted")));
        assert!(merged.taint_contains(&label("src:cmd")));
        assert_eq!(merged.sources(), ["command:curl", "mcp:createIssue"]);
    }

    #[test]
    fn union_dedups_consecutive_sources_only() {
        let mut a = SecurityDescriptor::empty();
        a.record_source("pipe:parse");
        let mut b = SecurityDescriptor::empty();
        b.record_source("pipe:parse");
        let mut c = SecurityDescriptor::empty();
        c.record_source("template:x");
        let mut d = SecurityDescriptor::empty();
        d.record_source("pipe:parse");

        let merged = SecurityDescriptor::union([&a, &b, &c, &d]);
        assert_eq!(
            merged.sources(),
            ["pipe:parse", "template:x", "pipe:parse"]
        );
    }

    #[test]
    fn record_source_dedups_consecutive() {
        let mut d = SecurityDescriptor::empty();
        d.record_source("pipe:parse");
        d.record_source("pipe:parse");
        d.record_source("template:x");
        assert_eq!(d.sources(), ["pipe:parse", "template:x"]);
    }

    #[test]
    fn taint_contains_is_hierarchical_for_dir() {
        let mut d = SecurityDescriptor::empty();
        d.add_taint_marker(label("dir:/tmp/uploads/in"));
        assert!(d.taint_contains(&label("dir:/tmp/uploads")));
        assert!(!d.taint_contains(&label("dir:/var")));
    }

    #[test]
    fn aggregates_over_multiple_descriptors() {
        let a = descriptor_of(&["secret"]);
        let b = descriptor_of(&["untrusted"]);
        let ds: Vec<&SecurityDescriptor> = vec![&a, &b];

        assert!(any_contains(&ds, &label("secret")));
        assert!(!all_contain(&ds, &label("secret")));
        assert!(none_contain(&ds, &label("pii")));
    }

    #[test]
    fn descriptor_serde_round_trip() {
        let mut d = descriptor_of(&["secret", "untrusted"]);
        d.add_taint_marker(label("src:file"));
        d.record_source("read:/tmp/x");

        let json = serde_json::to_string(&d).expect("serialize");
        let back: SecurityDescriptor = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, d);
    }
}
