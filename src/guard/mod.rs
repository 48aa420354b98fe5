//! Guard registration, matching, and attempt state.
//!
//! Guards register during module load (user `guard` directives plus the
//! guards synthesized from policy rule bundles) and the registry freezes
//! before the first dispatch. Matching resolves a guard's filter against
//! an operation's inputs or labels; ordering is builtins first, then
//! declaration order.

pub mod eval;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::dispatch::context::OperationContext;
use crate::policy::pattern::matches_label;
use crate::policy::{BuiltinRule, Policy};
use crate::types::{GuardAttemptEntry, GuardFilterKind, GuardTiming};

/// Maximum nested dispatch depth a guard chain may reach.
pub const MAX_GUARD_RECURSION: usize = 64;

/// Errors raised by guard registration and scheduling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardError {
    /// The registry froze before this registration arrived.
    #[error("guard registry is frozen; registration arrived after module load")]
    RegistryFrozen,
    /// A guard chain nested dispatches past [`MAX_GUARD_RECURSION`].
    #[error("guard recursion limit ({MAX_GUARD_RECURSION}) exceeded")]
    RecursionLimit,
}

/// Stable identity of a registered guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GuardId(u64);

/// The body of a guard: a synthesized built-in predicate, or an opaque
/// block the external evaluator runs in a prepared scope.
#[derive(Debug, Clone)]
pub enum GuardBlock {
    /// Precompiled policy rule; short-circuits block evaluation.
    Builtin(BuiltinRule),
    /// Opaque `when`-arm AST handed back to the evaluator collaborator.
    External(serde_json::Value),
}

/// A guard as delivered by a `guard` directive (or synthesized).
#[derive(Debug, Clone)]
pub struct GuardDef {
    /// Optional user-facing name.
    pub name: Option<String>,
    /// Privileged guards may remove protected labels and bless values.
    pub privileged: bool,
    /// Phase(s) the guard participates in.
    pub timing: GuardTiming,
    /// How the filter is interpreted; `Auto` resolves at registration.
    pub filter_kind: GuardFilterKind,
    /// Filter pattern: a label such as `secret` or `op:cmd:git`, with
    /// `*` segments permitted (`op:*`).
    pub filter: String,
    /// Guard body.
    pub block: GuardBlock,
}

/// A guard plus its registration metadata.
#[derive(Debug)]
pub struct RegisteredGuard {
    /// Identity used in attempt state and reentrancy tracking.
    pub id: GuardId,
    /// The guard definition with `Auto` filters resolved.
    pub def: GuardDef,
    /// Source order; builtins sort before all user guards.
    pub declaration_order: i64,
    /// True for guards synthesized from policy rule bundles.
    pub builtin: bool,
}

impl RegisteredGuard {
    /// Name for audit records and error messages.
    pub fn display_name(&self) -> String {
        match &self.def.name {
            Some(name) => name.clone(),
            None => format!("guard#{}", self.id.0),
        }
    }

    /// Does this guard participate in the before phase?
    pub fn runs_before(&self) -> bool {
        matches!(self.def.timing, GuardTiming::Before | GuardTiming::Always)
    }

    /// Does this guard participate in the after phase?
    pub fn runs_after(&self) -> bool {
        matches!(self.def.timing, GuardTiming::After | GuardTiming::Always)
    }
}

/// A matched guard with the inputs its filter selected (empty when the
/// guard matched on the operation side only).
#[derive(Debug, Clone)]
pub struct GuardMatch {
    /// The matched guard.
    pub guard: Arc<RegisteredGuard>,
    /// Indices into `op.inputs` that satisfied a data-label filter.
    pub matched_inputs: Vec<usize>,
}

/// Process-wide guard registry. Append-only during module load, frozen
/// before evaluation begins.
#[derive(Default)]
pub struct GuardRegistry {
    guards: RwLock<Vec<Arc<RegisteredGuard>>>,
    frozen: AtomicBool,
    next_user_order: AtomicI64,
    next_id: AtomicI64,
}

impl GuardRegistry {
    /// Empty, unfrozen registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user guard in declaration order.
    pub fn register(&self, mut def: GuardDef) -> Result<GuardId, GuardError> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(GuardError::RegistryFrozen);
        }
        def.filter_kind = resolve_filter_kind(def.filter_kind, &def.filter);
        let id = GuardId(self.bump_id());
        let order = self.next_user_order.fetch_add(1, Ordering::SeqCst);
        self.push(RegisteredGuard {
            id,
            def,
            declaration_order: order,
            builtin: false,
        })?;
        Ok(id)
    }

    /// Synthesize and register the privileged guards for every rule
    /// bundle the policy enables. Builtins precede all user guards.
    pub fn install_builtins(&self, policy: &Policy) -> Result<(), GuardError> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(GuardError::RegistryFrozen);
        }
        for (i, rule) in policy.defaults_rules().iter().enumerate() {
            let (timing, filter) = match rule {
                BuiltinRule::UntrustedLlmsGetInfluenced => {
                    (GuardTiming::After, "op:llm".to_owned())
                }
                _ => (GuardTiming::Before, "op:*".to_owned()),
            };
            let id = GuardId(self.bump_id());
            let order = i64::MIN.saturating_add(i64::try_from(i).unwrap_or(i64::MAX));
            self.push(RegisteredGuard {
                id,
                def: GuardDef {
                    name: Some(rule.guard_name()),
                    privileged: true,
                    timing,
                    filter_kind: GuardFilterKind::OpLabel,
                    filter,
                    block: GuardBlock::Builtin(*rule),
                },
                declaration_order: order,
                builtin: true,
            })?;
        }
        Ok(())
    }

    /// Freeze the registry; all later registrations fail.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    /// Has the registry frozen yet?
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Number of registered guards (builtin and user).
    pub fn len(&self) -> usize {
        self.guards.read().map(|g| g.len()).unwrap_or(0)
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ordered guards matching this operation: builtins first, then
    /// declaration order.
    pub fn matches(&self, op: &OperationContext) -> Vec<GuardMatch> {
        let guards = match self.guards.read() {
            Ok(guards) => guards,
            Err(_) => return Vec::new(),
        };

        let op_side_labels = op.flow_match_labels();
        let mut matched: Vec<GuardMatch> = Vec::new();

        for guard in guards.iter() {
            let filter = &guard.def.filter;
            match guard.def.filter_kind {
                GuardFilterKind::OpLabel => {
                    if op_side_labels.iter().any(|l| matches_label(filter, l)) {
                        matched.push(GuardMatch {
                            guard: Arc::clone(guard),
                            matched_inputs: Vec::new(),
                        });
                    }
                }
                GuardFilterKind::DataLabel | GuardFilterKind::Auto => {
                    let matched_inputs: Vec<usize> = op
                        .inputs
                        .iter()
                        .enumerate()
                        .filter(|(_, input)| {
                            input
                                .descriptor
                                .taint()
                                .iter()
                                .any(|l| matches_label(filter, l))
                        })
                        .map(|(i, _)| i)
                        .collect();
                    // Bare labels match both sides: an exe labeled
                    // `sensitive` triggers data-label guards on `sensitive`.
                    let op_side = op_side_labels.iter().any(|l| matches_label(filter, l));
                    if !matched_inputs.is_empty() || op_side {
                        matched.push(GuardMatch {
                            guard: Arc::clone(guard),
                            matched_inputs,
                        });
                    }
                }
            }
        }

        matched.sort_by_key(|m| (!m.guard.builtin, m.guard.declaration_order, m.guard.id));
        debug!(
            op = %op.name,
            count = matched.len(),
            "guard matching complete"
        );
        matched
    }

    fn push(&self, guard: RegisteredGuard) -> Result<(), GuardError> {
        let mut guards = self.guards.write().map_err(|_| GuardError::RegistryFrozen)?;
        guards.push(Arc::new(guard));
        Ok(())
    }

    fn bump_id(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        u64::try_from(id).unwrap_or(0)
    }
}

/// `Auto` resolves by inspection: `op:`-prefixed filters narrow to
/// operations, anything else matches data.
fn resolve_filter_kind(kind: GuardFilterKind, filter: &str) -> GuardFilterKind {
    match kind {
        GuardFilterKind::Auto => {
            if filter.starts_with("op:") {
                GuardFilterKind::OpLabel
            } else {
                GuardFilterKind::DataLabel
            }
        }
        other => other,
    }
}

/// Per-dispatch attempt state, keyed by `(guard, operation fingerprint)`.
/// Dropped when the dispatcher exits.
#[derive(Debug, Default)]
pub struct AttemptStore {
    entries: HashMap<(GuardId, String), AttemptState>,
}

/// Retry bookkeeping for one guard on one operation.
#[derive(Debug, Default)]
pub struct AttemptState {
    /// Next 1-based try number for this guard.
    pub next_attempt: u32,
    /// Prior decisions, oldest first.
    pub history: Vec<GuardAttemptEntry>,
}

impl AttemptStore {
    /// Fresh store for one dispatch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment and return the 1-based try counter for a guard.
    pub fn begin_try(&mut self, guard: GuardId, fingerprint: &str) -> u32 {
        let state = self
            .entries
            .entry((guard, fingerprint.to_owned()))
            .or_default();
        state.next_attempt = state.next_attempt.saturating_add(1);
        state.next_attempt
    }

    /// Record a decision for history exposure on later tries.
    pub fn record(&mut self, guard: GuardId, fingerprint: &str, entry: GuardAttemptEntry) {
        let state = self
            .entries
            .entry((guard, fingerprint.to_owned()))
            .or_default();
        state.history.push(entry);
    }

    /// History of prior decisions for a guard, oldest first.
    pub fn history(&self, guard: GuardId, fingerprint: &str) -> &[GuardAttemptEntry] {
        self.entries
            .get(&(guard, fingerprint.to_owned()))
            .map(|s| s.history.as_slice())
            .unwrap_or(&[])
    }

    /// Hints from prior retry decisions, oldest first.
    pub fn hint_history(&self, guard: GuardId, fingerprint: &str) -> Vec<String> {
        self.history(guard, fingerprint)
            .iter()
            .filter_map(|e| e.hint.clone())
            .collect()
    }
}
