//! Operation context assembled per dispatch.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use base64::Engine;
use serde::Serialize;
use uuid::Uuid;

use crate::env::EnvironmentContext;
use crate::label::SecurityDescriptor;
use crate::types::{GuardAttemptEntry, Label, OperationType};

/// One labeled input to an operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationInput {
    /// Variable name at the call site.
    pub name: String,
    /// The input content (or a preview of it).
    pub value: serde_json::Value,
    /// The input's security descriptor.
    pub descriptor: SecurityDescriptor,
}

/// A value bound to its security descriptor -- the dispatcher's result.
#[derive(Debug, Clone, Serialize)]
pub struct LabeledValue {
    /// The raw result produced by the executor.
    pub value: serde_json::Value,
    /// Labels, taint, and provenance for the value.
    pub descriptor: SecurityDescriptor,
}

/// Everything the policy enforcer and guards see about one operation.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Operation kind.
    pub op_type: OperationType,
    /// Identifier or pattern, e.g. `cmd:git:status` or `@ask`.
    pub name: String,
    /// Labels declared on the exe plus the intrinsic kind labels
    /// (`op:<type>`, and `op:<name>` when a name is present).
    pub op_labels: BTreeSet<Label>,
    /// Inputs with their descriptors.
    pub inputs: Vec<OperationInput>,
    /// The environment the side effect will execute in.
    pub environment: EnvironmentContext,
    /// Credential names the operation references (`using auth:<name>`).
    pub auth: Vec<String>,
    /// Whether the directive sits at top level (or is the direct result
    /// of a top-level `when`). Consulted for checkpoint placement only;
    /// defaults to nested, so the evaluator must mark top-level
    /// checkpoints via [`OperationContext::at_top_level`].
    pub top_level: bool,
    /// 1-based retry count, maintained by the dispatcher.
    pub attempt: u32,
    /// Prior guard decisions across retries of this operation.
    pub tries: Vec<GuardAttemptEntry>,
    /// Correlation id threaded through every audit record and retry.
    pub corr: Uuid,
}

impl OperationContext {
    /// Assemble a context. `exe_labels` are the bare labels declared on
    /// the exe; the intrinsic `op:` kind labels are added here.
    pub fn new(
        op_type: OperationType,
        name: impl Into<String>,
        exe_labels: impl IntoIterator<Item = Label>,
        inputs: Vec<OperationInput>,
        environment: EnvironmentContext,
    ) -> Self {
        let name = name.into();
        let mut op_labels: BTreeSet<Label> = exe_labels.into_iter().collect();
        op_labels.insert(Label::operation(op_type.as_str()));
        if !name.is_empty() {
            if let Ok(label) = Label::parse(format!("op:{name}")) {
                op_labels.insert(label);
            }
        }
        Self {
            op_type,
            name,
            op_labels,
            inputs,
            environment,
            auth: Vec::new(),
            top_level: false,
            attempt: 1,
            tries: Vec::new(),
            corr: Uuid::new_v4(),
        }
    }

    /// Credential names referenced by the operation.
    pub fn with_auth(mut self, auth: Vec<String>) -> Self {
        self.auth = auth;
        self
    }

    /// Mark the directive as top-level (or the direct result of a
    /// top-level `when`).
    pub fn at_top_level(mut self) -> Self {
        self.top_level = true;
        self
    }

    /// Descriptors of all inputs, in input order.
    pub fn input_descriptors(&self) -> Vec<&SecurityDescriptor> {
        self.inputs.iter().map(|i| &i.descriptor).collect()
    }

    /// The labels flow rules match against: `opLabels` plus the composite
    /// `op:<type>:<name>` form.
    pub fn flow_match_labels(&self) -> Vec<Label> {
        let mut labels: Vec<Label> = self.op_labels.iter().cloned().collect();
        if !self.name.is_empty() {
            if let Ok(composite) = Label::parse(format!("op:{}:{}", self.op_type, self.name)) {
                labels.push(composite);
            }
        }
        labels
    }

    /// Stable digest of `(type, name, inputs)` used to key per-guard
    /// attempt state. Stable within one dispatch; not a wire format.
    pub fn fingerprint(&self) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.op_type.hash(&mut hasher);
        self.name.hash(&mut hasher);
        for input in &self.inputs {
            input.name.hash(&mut hasher);
            input.value.to_string().hash(&mut hasher);
            for label in input.descriptor.taint() {
                label.as_str().hash(&mut hasher);
            }
        }
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(hasher.finish().to_le_bytes())
    }

    /// Short summary for audit records.
    pub fn summary(&self) -> OpSummary {
        OpSummary {
            op_type: self.op_type,
            name: self.name.clone(),
            op_labels: self.op_labels.iter().map(|l| l.to_string()).collect(),
        }
    }
}

/// Compact operation summary embedded in audit records.
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct OpSummary {
    /// Operation kind.
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Operation name.
    pub name: String,
    /// Operation labels as strings.
    #[serde(rename = "opLabels", default)]
    pub op_labels: Vec<String>,
}
