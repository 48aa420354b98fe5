//! Per-operation policy decisions.
//!
//! The enforcer runs before any guard: capability gates (allow and the
//! danger opt-in, with deny overriding both), label-flow deny rules over
//! input taint, and the credential-binding check. Its denials are hard
//! errors -- no `denied =>` handler can intercept them.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use super::pattern::{matches_label, matches_name};
use super::{Policy, RISK_DESTRUCTIVE, RISK_PRIVILEGED};
use crate::dispatch::context::OperationContext;
use crate::types::{Label, OperationType};

/// A hard policy denial. Never catchable by user code.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Capability gate failed.
    #[error("capability denied for '{name}': {reason}")]
    Capability {
        /// Operation name that was refused.
        name: String,
        /// Which gate refused it.
        reason: String,
    },
    /// A label-flow deny rule matched.
    #[error("label flow denied: '{data}' cannot flow to '{op}' (rule {rule})")]
    LabelFlow {
        /// The input taint label that matched.
        data: String,
        /// The operation pattern that matched.
        op: String,
        /// Rule identifier for the audit trail.
        rule: String,
        /// Deterministic remediation hints.
        suggestions: Vec<String>,
    },
    /// A referenced credential is not bound in the active environment.
    #[error("credential '{name}' denied: {reason}")]
    Auth {
        /// Credential name as referenced.
        name: String,
        /// Why the reference failed.
        reason: String,
    },
}

/// Outcome of the policy pre-decision.
#[derive(Debug)]
pub enum Decision {
    /// All gates passed.
    Permit,
    /// One gate refused; carries the hard error to raise.
    Deny(PolicyError),
}

impl Decision {
    /// Short decision string for audit records.
    pub fn as_audit_str(&self) -> &'static str {
        match self {
            Self::Permit => "permit",
            Self::Deny(PolicyError::Capability { .. }) => "deny-capability",
            Self::Deny(PolicyError::LabelFlow { .. }) => "deny-label-flow",
            Self::Deny(PolicyError::Auth { .. }) => "deny-auth",
        }
    }
}

/// Evaluates the compiled policy against one operation at a time.
pub struct PolicyEnforcer {
    policy: Arc<Policy>,
}

impl PolicyEnforcer {
    /// Wrap a compiled policy.
    pub fn new(policy: Arc<Policy>) -> Self {
        Self { policy }
    }

    /// The compiled policy this enforcer consults.
    pub fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    /// Decide whether the operation may proceed to its guards.
    pub fn decide(&self, op: &OperationContext) -> Decision {
        // Checkpoints are security-neutral; placement rules live in the
        // dispatcher.
        if op.op_type == OperationType::Checkpoint {
            return Decision::Permit;
        }

        if let Some(decision) = self.check_capability(op) {
            return decision;
        }
        if let Some(decision) = self.check_label_flow(op) {
            return decision;
        }
        if let Some(decision) = self.check_auth(op) {
            return decision;
        }
        Decision::Permit
    }

    /// Deny override beats allow and danger; allow and danger must both
    /// pass (danger only when the operation carries an action risk).
    fn check_capability(&self, op: &OperationContext) -> Option<Decision> {
        if let Some(pattern) = self
            .policy
            .capability_deny()
            .iter()
            .find(|p| matches_name(p, &op.name))
        {
            return Some(Decision::Deny(PolicyError::Capability {
                name: op.name.clone(),
                reason: format!("explicitly denied by pattern '{pattern}'"),
            }));
        }

        if let Some(allow) = self.policy.capability_allow() {
            if !allow.iter().any(|p| matches_name(p, &op.name)) {
                return Some(Decision::Deny(PolicyError::Capability {
                    name: op.name.clone(),
                    reason: "not covered by capabilities.allow".to_owned(),
                }));
            }
        }

        if self.policy.op_is_dangerous(op.op_labels.iter()) {
            let opted_in = self
                .policy
                .capability_danger()
                .iter()
                .any(|p| matches_name(p, &op.name));
            if !opted_in {
                let risks: Vec<&str> = [RISK_DESTRUCTIVE, RISK_PRIVILEGED]
                    .into_iter()
                    .filter(|r| self.policy.op_carries_risk(op.op_labels.iter(), r))
                    .collect();
                return Some(Decision::Deny(PolicyError::Capability {
                    name: op.name.clone(),
                    reason: format!(
                        "operation carries {} risk without a capabilities.danger opt-in",
                        risks.join("+")
                    ),
                }));
            }
        }

        None
    }

    /// Any input taint label matching a deny rule whose operation pattern
    /// matches this operation denies the flow. Deny wins over allow.
    fn check_label_flow(&self, op: &OperationContext) -> Option<Decision> {
        let op_labels = op.flow_match_labels();

        for input in &op.inputs {
            for taint_label in input.descriptor.taint() {
                for rule in self.policy.flow_deny_candidates(taint_label) {
                    if !matches_label(&rule.data, taint_label) {
                        continue;
                    }
                    if !self.op_pattern_matches(&rule.op, &op_labels) {
                        continue;
                    }
                    debug!(
                        data = %taint_label,
                        op = %rule.op,
                        input = %input.name,
                        "label-flow deny rule matched"
                    );
                    return Some(Decision::Deny(PolicyError::LabelFlow {
                        data: taint_label.to_string(),
                        op: rule.op.clone(),
                        rule: format!("{}->{}", rule.data, rule.op),
                        suggestions: flow_suggestions(taint_label, &op.name),
                    }));
                }
            }
        }
        None
    }

    /// An operation pattern matches via the operation's labels, or -- for
    /// bare patterns -- via the policy risk mapping.
    fn op_pattern_matches(&self, pattern: &str, op_labels: &[Label]) -> bool {
        if op_labels.iter().any(|l| matches_label(pattern, l)) {
            return true;
        }
        !pattern.starts_with("op:") && self.policy.op_carries_risk(op_labels.iter(), pattern)
    }

    fn check_auth(&self, op: &OperationContext) -> Option<Decision> {
        for name in &op.auth {
            if !self.policy.auth_table().contains_key(name) {
                return Some(Decision::Deny(PolicyError::Auth {
                    name: name.clone(),
                    reason: "not declared in any policy auth table".to_owned(),
                }));
            }
            if !op.environment.has_credential(&self.policy, name) {
                return Some(Decision::Deny(PolicyError::Auth {
                    name: name.clone(),
                    reason: "not bound in the active environment".to_owned(),
                }));
            }
        }
        None
    }
}

/// Deterministic remediation hints for a label-flow denial. Never
/// includes data values, only label and operation names.
fn flow_suggestions(data: &Label, op_name: &str) -> Vec<String> {
    let mut suggestions = Vec::new();
    if data.is_protected() {
        suggestions.push(format!("remove '{data}' via a privileged guard"));
    } else {
        suggestions.push(format!("remove '{data}' before invoking '{op_name}'"));
    }
    suggestions.push(format!("add '{op_name}' to capabilities.danger"));
    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::context::OperationInput;
    use crate::env::EnvironmentContext;
    use crate::label::SecurityDescriptor;
    use crate::policy::{PolicyConfig, PolicyCompileError};
    use crate::types::TrustConflictResolver;

    fn compile(toml_text: &str) -> Result<Arc<Policy>, PolicyCompileError> {
        Ok(Arc::new(Policy::compile(PolicyConfig::from_toml(
            toml_text,
        )?)?))
    }

    fn op_with_inputs(
        op_type: OperationType,
        name: &str,
        exe_labels: &[&str],
        inputs: Vec<OperationInput>,
    ) -> OperationContext {
        OperationContext::new(
            op_type,
            name,
            exe_labels
                .iter()
                .map(|l| Label::parse(*l).expect("valid test label")),
            inputs,
            EnvironmentContext::permissive(),
        )
    }

    fn input(name: &str, labels: &[&str]) -> OperationInput {
        OperationInput {
            name: name.to_owned(),
            value: serde_json::json!("payload"),
            descriptor: SecurityDescriptor::of(
                labels
                    .iter()
                    .map(|l| Label::parse(*l).expect("valid test label")),
                TrustConflictResolver::Warn,
            )
            .expect("descriptor"),
        }
    }

    #[test]
    fn allow_gate_denies_uncovered_names() {
        let policy = compile(
            r#"
[capabilities]
allow = ["cmd:git:*"]
"#,
        )
        .expect("compile");
        let enforcer = PolicyEnforcer::new(policy);

        let denied = op_with_inputs(OperationType::Run, "cmd:echo:hi", &[], vec![]);
        assert!(matches!(
            enforcer.decide(&denied),
            Decision::Deny(PolicyError::Capability { .. })
        ));

        let permitted = op_with_inputs(OperationType::Run, "cmd:git:status", &[], vec![]);
        assert!(matches!(enforcer.decide(&permitted), Decision::Permit));
    }

    #[test]
    fn deny_overrides_allow() {
        let policy = compile(
            r#"
[capabilities]
allow = ["cmd:*"]
deny = ["cmd:rm:*"]
"#,
        )
        .expect("compile");
        let enforcer = PolicyEnforcer::new(policy);

        let op = op_with_inputs(OperationType::Run, "cmd:rm:rf", &[], vec![]);
        assert!(matches!(
            enforcer.decide(&op),
            Decision::Deny(PolicyError::Capability { reason, .. }) if reason.contains("denied")
        ));
    }

    #[test]
    fn danger_gate_requires_opt_in() {
        let policy = compile(
            r#"
[operations]
"fs:w" = "destructive"
"#,
        )
        .expect("compile");
        let enforcer = PolicyEnforcer::new(policy);

        let op = op_with_inputs(OperationType::Exe, "@wipe", &["fs:w"], vec![]);
        assert!(matches!(
            enforcer.decide(&op),
            Decision::Deny(PolicyError::Capability { reason, .. })
                if reason.contains("danger")
        ));

        let opted = compile(
            r#"
[operations]
"fs:w" = "destructive"

[capabilities]
danger = ["@wipe"]
"#,
        )
        .expect("compile");
        let enforcer = PolicyEnforcer::new(opted);
        let op = op_with_inputs(OperationType::Exe, "@wipe", &["fs:w"], vec![]);
        assert!(matches!(enforcer.decide(&op), Decision::Permit));
    }

    #[test]
    fn label_flow_deny_matches_taint_hierarchically() {
        let policy = compile(
            r#"
[[flow]]
data = "dir:/tmp/uploads"
op = "op:cmd:curl"
action = "deny"
"#,
        )
        .expect("compile");
        let enforcer = PolicyEnforcer::new(policy);

        let mut tainted = input("f", &[]);
        tainted
            .descriptor
            .add_taint_marker(Label::directory("/tmp/uploads/in"));

        let op = op_with_inputs(OperationType::Run, "cmd:curl:post", &[], vec![tainted]);
        match enforcer.decide(&op) {
            Decision::Deny(PolicyError::LabelFlow { data, suggestions, .. }) => {
                assert_eq!(data, "dir:/tmp/uploads/in");
                assert!(!suggestions.is_empty());
            }
            other => panic!("expected label-flow deny, got {other:?}"),
        }
    }

    #[test]
    fn label_flow_bare_op_pattern_uses_risk_mapping() {
        let policy = compile(
            r#"
[operations]
"net:w" = "exfil"

[[flow]]
data = "secret"
op = "exfil"
action = "deny"
"#,
        )
        .expect("compile");
        let enforcer = PolicyEnforcer::new(policy);

        let op = op_with_inputs(
            OperationType::Exe,
            "@send",
            &["net:w"],
            vec![input("k", &["secret"])],
        );
        assert!(matches!(
            enforcer.decide(&op),
            Decision::Deny(PolicyError::LabelFlow { .. })
        ));
    }

    #[test]
    fn label_flow_protected_label_suggests_privileged_guard() {
        let policy = compile(
            r#"
[[flow]]
data = "untrusted"
op = "op:run"
action = "deny"
"#,
        )
        .expect("compile");
        let enforcer = PolicyEnforcer::new(policy);

        let op = op_with_inputs(
            OperationType::Run,
            "cmd:echo",
            &[],
            vec![input("x", &["untrusted"])],
        );
        match enforcer.decide(&op) {
            Decision::Deny(PolicyError::LabelFlow { suggestions, .. }) => {
                assert!(suggestions[0].contains("privileged guard"));
            }
            other => panic!("expected label-flow deny, got {other:?}"),
        }
    }

    #[test]
    fn auth_unknown_and_unbound_are_denied() {
        let policy = compile(
            r#"
[auth.slack]
from = "keychain:slack"
as = "SLACK_TOKEN"
"#,
        )
        .expect("compile");
        let enforcer = PolicyEnforcer::new(policy);

        let unknown =
            op_with_inputs(OperationType::Run, "cmd:echo", &[], vec![]).with_auth(vec![
                "stripe".to_owned(),
            ]);
        assert!(matches!(
            enforcer.decide(&unknown),
            Decision::Deny(PolicyError::Auth { name, .. }) if name == "stripe"
        ));

        // Declared in the table but never bound into the environment.
        let unbound =
            op_with_inputs(OperationType::Run, "cmd:echo", &[], vec![]).with_auth(vec![
                "slack".to_owned(),
            ]);
        assert!(matches!(
            enforcer.decide(&unbound),
            Decision::Deny(PolicyError::Auth { name, .. }) if name == "slack"
        ));
    }

    #[test]
    fn checkpoint_is_always_permitted() {
        let policy = compile(
            r#"
[capabilities]
allow = []
"#,
        )
        .expect("compile");
        let enforcer = PolicyEnforcer::new(policy);
        let op = op_with_inputs(OperationType::Checkpoint, "phase-1", &[], vec![]);
        assert!(matches!(enforcer.decide(&op), Decision::Permit));
    }
}
