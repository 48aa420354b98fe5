//! Policy compilation and composition.
//!
//! Declarative policy objects arrive as plain maps (from `policy`
//! directives in a document, or from TOML files on disk) and compile into
//! an immutable [`Policy`]: capability tables, risk mappings, label-flow
//! rules, built-in rule bundles, and the credential auth table. Layered
//! policies compose toward the most restrictive interpretation.

pub mod enforcer;
pub mod pattern;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Label, TrustConflictResolver};

/// Risk category tag for exfiltration-capable operations.
pub const RISK_EXFIL: &str = "exfil";
/// Risk category tag for destructive operations.
pub const RISK_DESTRUCTIVE: &str = "destructive";
/// Risk category tag for privileged operations.
pub const RISK_PRIVILEGED: &str = "privileged";

/// Errors raised while compiling or composing policies.
#[derive(Debug, Error)]
pub enum PolicyCompileError {
    /// `defaults.rules` named a bundle that does not exist.
    #[error("unknown built-in rule bundle: '{0}'")]
    UnknownRule(String),
    /// Two composed layers bind the same credential name.
    #[error("duplicate auth entry for credential '{0}' across policy layers")]
    DuplicateAuthEntry(String),
    /// A flow rule pattern failed label validation.
    #[error("invalid flow rule pattern '{0}'")]
    InvalidFlowPattern(String),
    /// TOML parse failure for an on-disk policy file.
    #[error("failed to parse policy TOML: {0}")]
    Parse(#[from] toml::de::Error),
    /// A `policy` directive delivered a malformed map.
    #[error("failed to interpret policy object: {0}")]
    ParseValue(#[from] serde_json::Error),
}

/// Built-in rule bundles, compiled into privileged guards named
/// `builtin:<id>` that run before all user guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuiltinRule {
    /// `before op:*`: any input has `secret` and op carries exfil risk -- deny.
    NoSecretExfil,
    /// As above for `sensitive`.
    NoSensitiveExfil,
    /// `before op:*`: any input has `untrusted` and op carries destructive risk -- deny.
    NoUntrustedDestructive,
    /// As above for privileged risk.
    NoUntrustedPrivileged,
    /// `after op:llm`: any input had `untrusted` -- add `influenced` to output.
    UntrustedLlmsGetInfluenced,
}

impl BuiltinRule {
    /// Stable bundle identifier as written in `defaults.rules`.
    pub fn id(&self) -> &'static str {
        match self {
            Self::NoSecretExfil => "no-secret-exfil",
            Self::NoSensitiveExfil => "no-sensitive-exfil",
            Self::NoUntrustedDestructive => "no-untrusted-destructive",
            Self::NoUntrustedPrivileged => "no-untrusted-privileged",
            Self::UntrustedLlmsGetInfluenced => "untrusted-llms-get-influenced",
        }
    }

    /// Guard name for audit records and error messages.
    pub fn guard_name(&self) -> String {
        format!("builtin:{}", self.id())
    }
}

impl std::str::FromStr for BuiltinRule {
    type Err = PolicyCompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no-secret-exfil" => Ok(Self::NoSecretExfil),
            "no-sensitive-exfil" => Ok(Self::NoSensitiveExfil),
            "no-untrusted-destructive" => Ok(Self::NoUntrustedDestructive),
            "no-untrusted-privileged" => Ok(Self::NoUntrustedPrivileged),
            "untrusted-llms-get-influenced" => Ok(Self::UntrustedLlmsGetInfluenced),
            other => Err(PolicyCompileError::UnknownRule(other.to_owned())),
        }
    }
}

/// Default trust applied to values with no explicit labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnlabeledDefault {
    /// Unlabeled values are treated as trusted.
    Trusted,
    /// Unlabeled values are treated as untrusted.
    Untrusted,
}

/// Resource ceilings; composed component-wise by minimum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Memory ceiling in bytes.
    pub mem_bytes: Option<u64>,
    /// CPU ceiling in milliseconds.
    pub cpu_millis: Option<u64>,
    /// Wall-clock deadline per operation in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl Limits {
    /// Component-wise minimum; `None` means unbounded.
    pub fn min(&self, other: &Limits) -> Limits {
        fn field_min(a: Option<u64>, b: Option<u64>) -> Option<u64> {
            match (a, b) {
                (Some(x), Some(y)) => Some(x.min(y)),
                (Some(x), None) | (None, Some(x)) => Some(x),
                (None, None) => None,
            }
        }
        Limits {
            mem_bytes: field_min(self.mem_bytes, other.mem_bytes),
            cpu_millis: field_min(self.cpu_millis, other.cpu_millis),
            timeout_ms: field_min(self.timeout_ms, other.timeout_ms),
        }
    }
}

/// One credential-injection entry: where the secret lives and the env var
/// it is exported under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEntry {
    /// Sealed-path reference, e.g. `keychain:slack`. Opaque to the core.
    pub from: String,
    /// Environment variable name the executor exports the secret as.
    #[serde(rename = "as")]
    pub export: String,
}

/// Whether a flow rule denies or allows a (data, operation) pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowAction {
    /// Forbid the flow. Deny wins over allow.
    Deny,
    /// Permit the flow explicitly.
    Allow,
}

/// A label-flow rule: data-label pattern against operation-label pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRule {
    /// Pattern over input taint labels (`secret`, `src:*`, `dir:/tmp/*`).
    pub data: String,
    /// Pattern over operation labels (`op:cmd:git:push`, `exfil`).
    pub op: String,
    /// Deny or allow.
    pub action: FlowAction,
}

// -- Raw configuration (serde) --

/// `defaults` section of a policy object.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Built-in rule bundle ids to enable.
    pub rules: Vec<String>,
}

/// `capabilities` section of a policy object.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CapabilitiesConfig {
    /// Allow patterns; absent means unrestricted.
    pub allow: Option<Vec<String>>,
    /// Deny patterns; deny beats allow and danger.
    pub deny: Vec<String>,
    /// Danger opt-in patterns for risk-flagged operations.
    pub danger: Vec<String>,
}

/// Risk value in `operations`: a single tag or a list of tags.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RiskSpec {
    /// One risk tag.
    One(String),
    /// Several risk tags.
    Many(Vec<String>),
}

impl RiskSpec {
    fn into_set(self) -> BTreeSet<String> {
        match self {
            Self::One(tag) => BTreeSet::from([tag]),
            Self::Many(tags) => tags.into_iter().collect(),
        }
    }
}

/// A policy configuration object as delivered by a `policy` directive or
/// loaded from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Built-in rule bundles.
    pub defaults: DefaultsConfig,
    /// Map from user/semantic label to risk category tag(s).
    pub operations: BTreeMap<String, RiskSpec>,
    /// Capability allow/deny/danger pattern lists.
    pub capabilities: CapabilitiesConfig,
    /// Label-flow rules.
    pub flow: Vec<FlowRule>,
    /// Trust applied to unlabeled values.
    pub unlabeled: Option<UnlabeledDefault>,
    /// Trust-conflict resolver override.
    pub trust_conflict: Option<TrustConflictResolver>,
    /// Credential-injection table.
    pub auth: BTreeMap<String, AuthEntry>,
    /// Resource ceilings.
    pub limits: Option<Limits>,
}

impl PolicyConfig {
    /// Parse a policy object from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, PolicyCompileError> {
        Ok(toml::from_str(text)?)
    }

    /// Interpret the plain map a `policy` directive delivers.
    pub fn from_value(value: serde_json::Value) -> Result<Self, PolicyCompileError> {
        Ok(serde_json::from_value(value)?)
    }
}

// -- Compiled form --

/// Compiled, immutable policy held by the enforcer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    capability_allow: Option<BTreeSet<String>>,
    capability_deny: BTreeSet<String>,
    capability_danger: BTreeSet<String>,
    operation_risk: BTreeMap<String, BTreeSet<String>>,
    flow_deny: Vec<FlowRule>,
    flow_allow: Vec<FlowRule>,
    flow_index: BTreeMap<String, Vec<usize>>,
    defaults_rules: BTreeSet<BuiltinRule>,
    unlabeled_default: Option<UnlabeledDefault>,
    trust_conflict: TrustConflictResolver,
    auth_table: BTreeMap<String, AuthEntry>,
    limits: Limits,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            capability_allow: None,
            capability_deny: BTreeSet::new(),
            capability_danger: BTreeSet::new(),
            operation_risk: BTreeMap::new(),
            flow_deny: Vec::new(),
            flow_allow: Vec::new(),
            flow_index: BTreeMap::new(),
            defaults_rules: BTreeSet::new(),
            unlabeled_default: None,
            trust_conflict: TrustConflictResolver::default(),
            auth_table: BTreeMap::new(),
            limits: Limits::default(),
        }
    }
}

impl Policy {
    /// Compile a single configuration object.
    pub fn compile(config: PolicyConfig) -> Result<Self, PolicyCompileError> {
        let mut defaults_rules = BTreeSet::new();
        for raw in &config.defaults.rules {
            defaults_rules.insert(raw.parse::<BuiltinRule>()?);
        }

        for rule in &config.flow {
            if rule.data.is_empty() || rule.op.is_empty() {
                return Err(PolicyCompileError::InvalidFlowPattern(format!(
                    "{} -> {}",
                    rule.data, rule.op
                )));
            }
        }

        let (flow_deny, flow_allow): (Vec<FlowRule>, Vec<FlowRule>) = config
            .flow
            .into_iter()
            .partition(|r| r.action == FlowAction::Deny);

        let mut policy = Self {
            capability_allow: config
                .capabilities
                .allow
                .map(|list| list.into_iter().collect()),
            capability_deny: config.capabilities.deny.into_iter().collect(),
            capability_danger: config.capabilities.danger.into_iter().collect(),
            operation_risk: config
                .operations
                .into_iter()
                .map(|(label, spec)| (label, spec.into_set()))
                .collect(),
            flow_deny,
            flow_allow,
            flow_index: BTreeMap::new(),
            defaults_rules,
            unlabeled_default: config.unlabeled,
            trust_conflict: config.trust_conflict.unwrap_or_default(),
            auth_table: config.auth,
            limits: config.limits.unwrap_or_default(),
        };
        policy.rebuild_flow_index();
        Ok(policy)
    }

    /// Compile a stack of configuration layers, composing most-restrictive.
    pub fn compile_layers(
        configs: impl IntoIterator<Item = PolicyConfig>,
    ) -> Result<Self, PolicyCompileError> {
        let mut layers = configs.into_iter();
        let first = match layers.next() {
            Some(config) => Self::compile(config)?,
            None => return Ok(Self::default()),
        };
        layers.try_fold(first, |acc, config| acc.compose(&Self::compile(config)?))
    }

    /// Merge two policy layers toward the most restrictive interpretation.
    pub fn compose(&self, other: &Policy) -> Result<Policy, PolicyCompileError> {
        // Allow: must be allowed by all layers; an unspecified layer is
        // unrestricted. Empty intersection blocks everything.
        let capability_allow = match (&self.capability_allow, &other.capability_allow) {
            (Some(a), Some(b)) => Some(a.intersection(b).cloned().collect()),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };

        let capability_deny: BTreeSet<String> = self
            .capability_deny
            .union(&other.capability_deny)
            .cloned()
            .collect();

        // Danger opt-ins require every layer to opt in.
        let capability_danger: BTreeSet<String> = self
            .capability_danger
            .intersection(&other.capability_danger)
            .cloned()
            .collect();

        let mut operation_risk = self.operation_risk.clone();
        for (label, risks) in &other.operation_risk {
            operation_risk
                .entry(label.clone())
                .or_default()
                .extend(risks.iter().cloned());
        }

        let mut flow_deny = self.flow_deny.clone();
        for rule in &other.flow_deny {
            if !flow_deny.contains(rule) {
                flow_deny.push(rule.clone());
            }
        }

        // Allow rules are kept only while no deny covers the same pair.
        let mut flow_allow: Vec<FlowRule> = Vec::new();
        for rule in self.flow_allow.iter().chain(&other.flow_allow) {
            let conflicted = flow_deny
                .iter()
                .any(|d| d.data == rule.data && d.op == rule.op);
            if !conflicted && !flow_allow.contains(rule) {
                flow_allow.push(rule.clone());
            }
        }

        let defaults_rules: BTreeSet<BuiltinRule> = self
            .defaults_rules
            .union(&other.defaults_rules)
            .copied()
            .collect();

        let unlabeled_default = match (self.unlabeled_default, other.unlabeled_default) {
            (Some(UnlabeledDefault::Untrusted), _) | (_, Some(UnlabeledDefault::Untrusted)) => {
                Some(UnlabeledDefault::Untrusted)
            }
            (Some(UnlabeledDefault::Trusted), _) | (_, Some(UnlabeledDefault::Trusted)) => {
                Some(UnlabeledDefault::Trusted)
            }
            (None, None) => None,
        };

        let mut auth_table = self.auth_table.clone();
        for (name, entry) in &other.auth_table {
            if auth_table.contains_key(name) {
                return Err(PolicyCompileError::DuplicateAuthEntry(name.clone()));
            }
            auth_table.insert(name.clone(), entry.clone());
        }

        let trust_conflict = most_restrictive_resolver(self.trust_conflict, other.trust_conflict);

        let mut composed = Policy {
            capability_allow,
            capability_deny,
            capability_danger,
            operation_risk,
            flow_deny,
            flow_allow,
            flow_index: BTreeMap::new(),
            defaults_rules,
            unlabeled_default,
            trust_conflict,
            auth_table,
            limits: self.limits.min(&other.limits),
        };
        composed.rebuild_flow_index();
        Ok(composed)
    }

    fn rebuild_flow_index(&mut self) {
        self.flow_index.clear();
        for (i, rule) in self.flow_deny.iter().enumerate() {
            let root = pattern::pattern_root(&rule.data).to_owned();
            self.flow_index.entry(root).or_default().push(i);
        }
    }

    /// Deny rules whose data-pattern root could match the given label.
    pub(crate) fn flow_deny_candidates(&self, label: &Label) -> impl Iterator<Item = &FlowRule> {
        let root = pattern::pattern_root(label.as_str()).to_owned();
        let rooted = self.flow_index.get(&root).into_iter().flatten();
        let starred = self.flow_index.get("*").into_iter().flatten();
        rooted.chain(starred).filter_map(|&i| self.flow_deny.get(i))
    }

    /// Allow patterns, `None` meaning unrestricted.
    pub fn capability_allow(&self) -> Option<&BTreeSet<String>> {
        self.capability_allow.as_ref()
    }

    /// Deny patterns.
    pub fn capability_deny(&self) -> &BTreeSet<String> {
        &self.capability_deny
    }

    /// Danger opt-in patterns.
    pub fn capability_danger(&self) -> &BTreeSet<String> {
        &self.capability_danger
    }

    /// Risk tags mapped to a label, if any.
    pub fn risks_for(&self, label: &Label) -> Option<&BTreeSet<String>> {
        self.operation_risk.get(label.as_str())
    }

    /// True when a set of operation labels carries the given risk tag,
    /// either literally (the label *is* the tag) or via the risk mapping.
    pub fn op_carries_risk<'a>(
        &self,
        op_labels: impl IntoIterator<Item = &'a Label>,
        risk: &str,
    ) -> bool {
        op_labels.into_iter().any(|label| {
            label.as_str() == risk
                || self
                    .risks_for(label)
                    .is_some_and(|risks| risks.contains(risk))
        })
    }

    /// An operation is dangerous when any of its labels maps to the
    /// destructive or privileged risk category; such operations need a
    /// `capabilities.danger` opt-in.
    pub fn op_is_dangerous<'a>(
        &self,
        op_labels: impl IntoIterator<Item = &'a Label> + Clone,
    ) -> bool {
        self.op_carries_risk(op_labels.clone(), RISK_DESTRUCTIVE)
            || self.op_carries_risk(op_labels, RISK_PRIVILEGED)
    }

    /// Enabled built-in rule bundles.
    pub fn defaults_rules(&self) -> &BTreeSet<BuiltinRule> {
        &self.defaults_rules
    }

    /// Trust applied to unlabeled values.
    pub fn unlabeled_default(&self) -> Option<UnlabeledDefault> {
        self.unlabeled_default
    }

    /// The active trust-conflict resolver.
    pub fn trust_conflict(&self) -> TrustConflictResolver {
        self.trust_conflict
    }

    /// The credential-injection table.
    pub fn auth_table(&self) -> &BTreeMap<String, AuthEntry> {
        &self.auth_table
    }

    /// Resource ceilings.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Explicit allow flow rules (informational; deny wins at evaluation).
    pub fn flow_allow(&self) -> &[FlowRule] {
        &self.flow_allow
    }

    /// Deny flow rules, in layer order.
    pub fn flow_deny(&self) -> &[FlowRule] {
        &self.flow_deny
    }
}

/// `Error` beats `Warn` beats `Silent`.
fn most_restrictive_resolver(
    a: TrustConflictResolver,
    b: TrustConflictResolver,
) -> TrustConflictResolver {
    fn rank(r: TrustConflictResolver) -> u8 {
        match r {
            TrustConflictResolver::Silent => 0,
            TrustConflictResolver::Warn => 1,
            TrustConflictResolver::Error => 2,
        }
    }
    if rank(a) >= rank(b) {
        a
    } else {
        b
    }
}
