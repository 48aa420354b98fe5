//! Guard evaluation.
//!
//! The core never interprets a user guard's `when` arms itself. It builds
//! a [`GuardScope`] -- the data the block may see, with previews redacted
//! when `secret` is in play -- and hands the opaque block to the external
//! evaluator through [`GuardBlockRunner`]. Policy-synthesized builtins
//! skip the round trip and run a precompiled predicate.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use super::{GuardBlock, GuardId, RegisteredGuard};
use crate::dispatch::context::{LabeledValue, OperationContext};
use crate::label::SecurityDescriptor;
use crate::policy::{BuiltinRule, Policy, RISK_DESTRUCTIVE, RISK_EXFIL, RISK_PRIVILEGED};
use crate::types::{GuardAction, GuardAttemptEntry, GuardTiming, Label};

/// Canonical replacement marker for redacted previews.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Errors raised while evaluating a guard.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The external evaluator failed to run the block.
    #[error("guard block '{guard}' evaluation failed: {reason}")]
    Block {
        /// Guard display name.
        guard: String,
        /// Evaluator-supplied failure reason.
        reason: String,
    },
}

/// Redacts known secret values and token-like patterns from previews.
#[derive(Debug, Clone)]
pub struct Redactor {
    exact_secrets: Vec<String>,
    patterns: Vec<Regex>,
}

impl Redactor {
    /// Create a redactor from known secret values.
    pub fn new(exact_secrets: Vec<String>) -> Self {
        Self {
            exact_secrets,
            patterns: default_patterns(),
        }
    }

    /// Redact exact known secrets and known secret patterns.
    pub fn redact(&self, text: &str) -> String {
        let mut sanitized = text.to_owned();
        for secret in &self.exact_secrets {
            if !secret.is_empty() {
                sanitized = sanitized.replace(secret, REDACTION_MARKER);
            }
        }
        for pattern in &self.patterns {
            sanitized = pattern
                .replace_all(&sanitized, REDACTION_MARKER)
                .to_string();
        }
        sanitized
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

fn default_patterns() -> Vec<Regex> {
    let patterns = [
        r"sk-ant-[A-Za-z0-9_\-]{10,}",
        r"sk-[A-Za-z0-9]{32,}",
        r"ghp_[A-Za-z0-9]{20,}",
        r"glpat-[A-Za-z0-9_\-]{16,}",
        r"xoxb-[A-Za-z0-9\-]{20,}",
    ];
    patterns
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
}

/// One labeled value as seen from inside a guard block.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeValue {
    /// Variable name at the call site.
    pub name: String,
    /// Content preview; `[REDACTED]` under secret without privilege.
    pub preview: String,
    /// Explicit labels.
    pub labels: Vec<String>,
    /// Taint (labels plus factual markers) -- what guards inspect.
    pub taint: Vec<String>,
    /// Provenance trail.
    pub sources: Vec<String>,
}

/// Precomputed any/all aggregates over the candidate inputs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScopeAggregates {
    /// Union of taint across inputs.
    pub any_taint: Vec<String>,
    /// Intersection of taint across inputs.
    pub all_taint: Vec<String>,
    /// Union of explicit labels across inputs.
    pub any_labels: Vec<String>,
    /// Intersection of explicit labels across inputs.
    pub all_labels: Vec<String>,
}

/// Attempt bookkeeping exposed as `mx.guard`.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeGuardInfo {
    /// 1-based try counter for this guard on this operation.
    #[serde(rename = "try")]
    pub try_number: u32,
    /// Prior decisions, oldest first.
    pub tries: Vec<GuardAttemptEntry>,
    /// Retry budget.
    pub max: u32,
    /// Hints from prior retries, oldest first.
    pub hint_history: Vec<String>,
    /// Phase the guard is currently running in.
    pub timing: GuardTiming,
}

/// The `mx` block of a guard scope.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeMx {
    /// Operation summary: type, name, labels.
    pub op: crate::dispatch::context::OpSummary,
    /// Union of explicit labels over candidate inputs.
    pub labels: Vec<String>,
    /// Union of taint over candidate inputs.
    pub taint: Vec<String>,
    /// Concatenated provenance over candidate inputs.
    pub sources: Vec<String>,
    /// Attempt state.
    pub guard: ScopeGuardInfo,
}

/// The prepared child scope a guard block executes in.
#[derive(Debug, Clone, Serialize)]
pub struct GuardScope {
    /// Candidate inputs (one for per-input guards, all for op guards).
    pub input: Vec<ScopeValue>,
    /// Aggregate views over `input`.
    pub aggregates: ScopeAggregates,
    /// Output preview; empty before-phase.
    pub output: String,
    /// The `mx` metadata block.
    pub mx: ScopeMx,
}

/// Collaborator that runs an opaque guard block in a prepared scope.
#[async_trait]
pub trait GuardBlockRunner: Send + Sync {
    /// Execute the block and produce a single action.
    async fn run(
        &self,
        block: &serde_json::Value,
        scope: &GuardScope,
    ) -> anyhow::Result<GuardAction>;
}

/// The evaluator's verdict, normalized for dispatcher composition.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardVerdict {
    /// Proceed.
    Allow {
        /// Optional user-facing warning.
        warning: Option<String>,
    },
    /// Proceed with a replacement value (last-wins across guards).
    AllowReplace {
        /// Replacement content.
        value: serde_json::Value,
    },
    /// Builtin-only output transform: add a label to the result.
    AddOutputLabel {
        /// Label to add.
        label: Label,
    },
    /// Refuse the operation.
    Deny {
        /// Human-readable reason.
        reason: String,
        /// Rule id for policy-synthesized guards.
        rule: Option<String>,
        /// Deterministic remediation hints.
        suggestions: Vec<String>,
    },
    /// Re-run the operation.
    Retry {
        /// Hint for the next attempt.
        hint: String,
    },
    /// Narrow the environment for this operation and re-enter.
    Env {
        /// Narrowing config.
        config: serde_json::Value,
    },
}

impl GuardVerdict {
    /// Short decision string for audit records.
    pub fn as_audit_str(&self) -> &'static str {
        match self {
            Self::Allow { .. } => "allow",
            Self::AllowReplace { .. } => "allow-replace",
            Self::AddOutputLabel { .. } => "allow-label",
            Self::Deny { .. } => "deny",
            Self::Retry { .. } => "retry",
            Self::Env { .. } => "env",
        }
    }
}

/// One evaluated guard's result.
#[derive(Debug, Clone)]
pub struct GuardOutcome {
    /// Guard identity for attempt state.
    pub guard_id: GuardId,
    /// Display name for audit and errors.
    pub guard_name: String,
    /// Whether the guard may perform privileged label operations.
    pub privileged: bool,
    /// The verdict.
    pub verdict: GuardVerdict,
}

/// Evaluates single guards against a concrete operation.
pub struct GuardEvaluator {
    runner: Arc<dyn GuardBlockRunner>,
    policy: Arc<Policy>,
    redactor: Redactor,
}

impl GuardEvaluator {
    /// Build an evaluator around the external block runner.
    pub fn new(runner: Arc<dyn GuardBlockRunner>, policy: Arc<Policy>) -> Self {
        Self {
            runner,
            policy,
            redactor: Redactor::default(),
        }
    }

    /// Use a redactor primed with known secret values.
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    /// Evaluate one guard in one phase.
    ///
    /// `matched_inputs` selects the per-input candidates (empty means the
    /// operation snapshot: all inputs). `output` is present after-phase.
    #[allow(clippy::too_many_arguments)]
    pub async fn evaluate(
        &self,
        guard: &RegisteredGuard,
        op: &OperationContext,
        matched_inputs: &[usize],
        output: Option<&LabeledValue>,
        timing: GuardTiming,
        try_number: u32,
        max_tries: u32,
        history: &[GuardAttemptEntry],
        hint_history: Vec<String>,
    ) -> Result<GuardOutcome, EvalError> {
        let verdict = match &guard.def.block {
            GuardBlock::Builtin(rule) => self.evaluate_builtin(*rule, op, timing),
            GuardBlock::External(block) => {
                let scope = self.build_scope(
                    guard,
                    op,
                    matched_inputs,
                    output,
                    timing,
                    try_number,
                    max_tries,
                    history,
                    hint_history,
                );
                let action =
                    self.runner
                        .run(block, &scope)
                        .await
                        .map_err(|e| EvalError::Block {
                            guard: guard.display_name(),
                            reason: e.to_string(),
                        })?;
                match action {
                    GuardAction::Allow { warning } => GuardVerdict::Allow { warning },
                    GuardAction::AllowReplace { value } => GuardVerdict::AllowReplace { value },
                    GuardAction::Deny { reason } => GuardVerdict::Deny {
                        reason,
                        rule: None,
                        suggestions: Vec::new(),
                    },
                    GuardAction::Retry { hint } => GuardVerdict::Retry { hint },
                    GuardAction::Env { config } => GuardVerdict::Env { config },
                }
            }
        };

        Ok(GuardOutcome {
            guard_id: guard.id,
            guard_name: guard.display_name(),
            privileged: guard.def.privileged,
            verdict,
        })
    }

    /// Precompiled predicates for the built-in rule bundles.
    fn evaluate_builtin(
        &self,
        rule: BuiltinRule,
        op: &OperationContext,
        timing: GuardTiming,
    ) -> GuardVerdict {
        let descriptors = op.input_descriptors();
        match rule {
            BuiltinRule::NoSecretExfil => {
                self.deny_flow_risk(op, &descriptors, &Label::secret(), RISK_EXFIL, rule)
            }
            BuiltinRule::NoSensitiveExfil => {
                self.deny_flow_risk(op, &descriptors, &Label::sensitive(), RISK_EXFIL, rule)
            }
            BuiltinRule::NoUntrustedDestructive => self.deny_flow_risk(
                op,
                &descriptors,
                &Label::untrusted(),
                RISK_DESTRUCTIVE,
                rule,
            ),
            BuiltinRule::NoUntrustedPrivileged => self.deny_flow_risk(
                op,
                &descriptors,
                &Label::untrusted(),
                RISK_PRIVILEGED,
                rule,
            ),
            BuiltinRule::UntrustedLlmsGetInfluenced => {
                if timing == GuardTiming::After
                    && descriptors.iter().any(|d| d.effectively_untrusted())
                {
                    GuardVerdict::AddOutputLabel {
                        label: Label::influenced(),
                    }
                } else {
                    GuardVerdict::Allow { warning: None }
                }
            }
        }
    }

    fn deny_flow_risk(
        &self,
        op: &OperationContext,
        descriptors: &[&SecurityDescriptor],
        data: &Label,
        risk: &str,
        rule: BuiltinRule,
    ) -> GuardVerdict {
        let data_present = descriptors.iter().any(|d| d.taint_contains(data));
        let risk_present = self.policy.op_carries_risk(op.op_labels.iter(), risk);
        if data_present && risk_present {
            GuardVerdict::Deny {
                reason: format!("{data} cannot flow to {risk}"),
                rule: Some(rule.id().to_owned()),
                suggestions: vec![
                    format!("remove '{data}' via a privileged guard"),
                    format!("add '{}' to capabilities.danger", op.name),
                ],
            }
        } else {
            GuardVerdict::Allow { warning: None }
        }
    }

    /// Build the child scope, applying secret redaction for unprivileged
    /// guards.
    #[allow(clippy::too_many_arguments)]
    fn build_scope(
        &self,
        guard: &RegisteredGuard,
        op: &OperationContext,
        matched_inputs: &[usize],
        output: Option<&LabeledValue>,
        timing: GuardTiming,
        try_number: u32,
        max_tries: u32,
        history: &[GuardAttemptEntry],
        hint_history: Vec<String>,
    ) -> GuardScope {
        let candidate_indices: Vec<usize> = if matched_inputs.is_empty() {
            (0..op.inputs.len()).collect()
        } else {
            matched_inputs.to_vec()
        };

        let mut secret_in_context = output
            .map(|o| o.descriptor.taint_contains(&Label::secret()))
            .unwrap_or(false);
        for &i in &candidate_indices {
            if let Some(input) = op.inputs.get(i) {
                if input.descriptor.taint_contains(&Label::secret()) {
                    secret_in_context = true;
                }
            }
        }
        let redact = secret_in_context && !guard.def.privileged;

        let preview_of = |value: &serde_json::Value| -> String {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if redact {
                REDACTION_MARKER.to_owned()
            } else {
                self.redactor.redact(&text)
            }
        };

        let mut input_values = Vec::new();
        let mut candidate_descriptors: Vec<&SecurityDescriptor> = Vec::new();
        for &i in &candidate_indices {
            if let Some(input) = op.inputs.get(i) {
                candidate_descriptors.push(&input.descriptor);
                input_values.push(ScopeValue {
                    name: input.name.clone(),
                    preview: preview_of(&input.value),
                    labels: string_set(input.descriptor.labels().iter()),
                    taint: string_set(input.descriptor.taint().iter()),
                    sources: input.descriptor.sources().to_vec(),
                });
            }
        }

        let aggregates = build_aggregates(&candidate_descriptors);
        let merged = SecurityDescriptor::union(candidate_descriptors.iter().copied());

        GuardScope {
            input: input_values,
            aggregates,
            output: output.map(|o| preview_of(&o.value)).unwrap_or_default(),
            mx: ScopeMx {
                op: op.summary(),
                labels: string_set(merged.labels().iter()),
                taint: string_set(merged.taint().iter()),
                sources: merged.sources().to_vec(),
                guard: ScopeGuardInfo {
                    try_number,
                    tries: history.to_vec(),
                    max: max_tries,
                    hint_history,
                    timing,
                },
            },
        }
    }
}

fn string_set<'a>(labels: impl Iterator<Item = &'a Label>) -> Vec<String> {
    labels.map(|l| l.to_string()).collect()
}

fn build_aggregates(descriptors: &[&SecurityDescriptor]) -> ScopeAggregates {
    let mut aggregates = ScopeAggregates::default();
    for (i, d) in descriptors.iter().enumerate() {
        let taint: Vec<String> = string_set(d.taint().iter());
        let labels: Vec<String> = string_set(d.labels().iter());
        for t in &taint {
            if !aggregates.any_taint.contains(t) {
                aggregates.any_taint.push(t.clone());
            }
        }
        for l in &labels {
            if !aggregates.any_labels.contains(l) {
                aggregates.any_labels.push(l.clone());
            }
        }
        if i == 0 {
            aggregates.all_taint = taint;
            aggregates.all_labels = labels;
        } else {
            aggregates.all_taint.retain(|t| taint.contains(t));
            aggregates.all_labels.retain(|l| labels.contains(l));
        }
    }
    aggregates
}
