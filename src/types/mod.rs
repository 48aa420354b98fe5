//! Core vocabulary shared by every security-core subsystem.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised when a string cannot be parsed as a [`Label`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelParseError {
    /// Labels cannot be empty.
    #[error("label cannot be empty")]
    Empty,
    /// Labels never contain whitespace.
    #[error("label '{0}' contains whitespace")]
    Whitespace(String),
    /// A `src:` label must have exactly one word after the prefix.
    #[error("source label '{0}' must be 'src:<word>'")]
    MalformedSource(String),
    /// A `dir:` label must carry an absolute path.
    #[error("directory label '{0}' must be 'dir:/<abspath>'")]
    MalformedDirectory(String),
    /// An `op:` label must have at least one segment after the prefix.
    #[error("operation label '{0}' must be 'op:<type>[:<sub>...]'")]
    MalformedOperation(String),
}

/// Kind of a label, determined by its prefix (never stored separately).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelKind {
    /// Bare label such as `secret`, `pii`, or a user-defined tag.
    /// Semantic exe labels (`net:w`, `exfil`, ...) live here too; their
    /// meaning is supplied by policy mappings, not by the type.
    Sensitivity,
    /// `trusted` / `untrusted` (mutually exclusive after normalization).
    Trust,
    /// `influenced`, auto-applied to LLM outputs with untrusted context.
    Influence,
    /// `src:<word>` -- factual origin marker.
    Source,
    /// `dir:<abspath>` -- factual parent-directory marker on file loads.
    Directory,
    /// `op:<type>[:<sub>...]` -- ephemeral, attached to operations only.
    Operation,
}

/// A tagged string attached to values or operations.
///
/// The kind is intrinsic: it is derived from the prefix on demand and is
/// never a separate field. Labels are ordered so descriptors can hold them
/// in `BTreeSet`s with deterministic audit output.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Label(String);

impl Label {
    /// Parse and validate a label.
    pub fn parse(raw: impl Into<String>) -> Result<Self, LabelParseError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(LabelParseError::Empty);
        }
        if raw.contains(char::is_whitespace) {
            return Err(LabelParseError::Whitespace(raw));
        }
        if let Some(rest) = raw.strip_prefix("src:") {
            if rest.is_empty() || rest.contains(':') {
                return Err(LabelParseError::MalformedSource(raw));
            }
        } else if let Some(rest) = raw.strip_prefix("dir:") {
            if !rest.starts_with('/') {
                return Err(LabelParseError::MalformedDirectory(raw));
            }
        } else if let Some(rest) = raw.strip_prefix("op:") {
            if rest.is_empty() || rest.split(':').any(str::is_empty) {
                return Err(LabelParseError::MalformedOperation(raw));
            }
        }
        Ok(Self(raw))
    }

    /// The `secret` sensitivity label.
    pub fn secret() -> Self {
        Self("secret".to_owned())
    }

    /// The `sensitive` sensitivity label.
    pub fn sensitive() -> Self {
        Self("sensitive".to_owned())
    }

    /// The `trusted` trust label.
    pub fn trusted() -> Self {
        Self("trusted".to_owned())
    }

    /// The `untrusted` trust label.
    pub fn untrusted() -> Self {
        Self("untrusted".to_owned())
    }

    /// The `influenced` label.
    pub fn influenced() -> Self {
        Self("influenced".to_owned())
    }

    /// Build a `src:<word>` label.
    pub fn source(word: &str) -> Self {
        Self(format!("src:{word}"))
    }

    /// Build a `dir:<abspath>` label.
    pub fn directory(abspath: &str) -> Self {
        Self(format!("dir:{abspath}"))
    }

    /// Build an `op:<...>` label from `:`-joined segments.
    pub fn operation(segments: &str) -> Self {
        Self(format!("op:{segments}"))
    }

    /// The raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Kind, derived from the prefix (and the two reserved bare names).
    pub fn kind(&self) -> LabelKind {
        if self.0.starts_with("src:") {
            LabelKind::Source
        } else if self.0.starts_with("dir:") {
            LabelKind::Directory
        } else if self.0.starts_with("op:") {
            LabelKind::Operation
        } else if self.0 == "trusted" || self.0 == "untrusted" {
            LabelKind::Trust
        } else if self.0 == "influenced" {
            LabelKind::Influence
        } else {
            LabelKind::Sensitivity
        }
    }

    /// Protected labels may only be removed by privileged guards.
    pub fn is_protected(&self) -> bool {
        self.0 == "secret" || self.0 == "untrusted" || self.kind() == LabelKind::Source
    }

    /// Factual labels (`src:*`, `dir:*`) survive in taint even after a
    /// privileged clear.
    pub fn is_factual(&self) -> bool {
        matches!(self.kind(), LabelKind::Source | LabelKind::Directory)
    }

    /// Does this label match `pattern`?
    ///
    /// For `op:` and `dir:` patterns, matching is left-anchored segment
    /// prefix: `op:a:b` matches `op:a:b:c` but not `op:ab:c`. All other
    /// kinds match by exact equality.
    pub fn matches(&self, pattern: &Label) -> bool {
        match pattern.kind() {
            LabelKind::Operation => {
                self.kind() == LabelKind::Operation
                    && segment_prefix(&pattern.0["op:".len()..], &self.0["op:".len()..], ':')
            }
            LabelKind::Directory => {
                self.kind() == LabelKind::Directory
                    && segment_prefix(&pattern.0["dir:".len()..], &self.0["dir:".len()..], '/')
            }
            _ => self == pattern,
        }
    }
}

/// True when every `sep`-separated segment of `prefix` equals the
/// corresponding leading segment of `full`.
fn segment_prefix(prefix: &str, full: &str, sep: char) -> bool {
    let mut full_segments = full.split(sep);
    for wanted in prefix.split(sep) {
        match full_segments.next() {
            Some(seg) if seg == wanted => {}
            _ => return false,
        }
    }
    true
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Label {
    type Error = LabelParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Label> for String {
    fn from(value: Label) -> Self {
        value.0
    }
}

impl std::str::FromStr for Label {
    type Err = LabelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Observable actions the evaluator routes through the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Render a value into the document.
    Show,
    /// Shell command execution.
    Run,
    /// Invocation of a declared exe (including `mcp:` tools).
    Exe,
    /// File read.
    Read,
    /// File write.
    Write,
    /// URL fetch.
    Fetch,
    /// LLM call.
    Llm,
    /// Module import.
    Import,
    /// Named cache-continuation marker; security-neutral.
    Checkpoint,
}

impl OperationType {
    /// Lowercase wire name, also used as the intrinsic `op:<type>` label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Show => "show",
            Self::Run => "run",
            Self::Exe => "exe",
            Self::Read => "read",
            Self::Write => "write",
            Self::Fetch => "fetch",
            Self::Llm => "llm",
            Self::Import => "import",
            Self::Checkpoint => "checkpoint",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a guard fires relative to its operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardTiming {
    /// Before the side effect executes.
    Before,
    /// After the side effect executes, over the bound output.
    After,
    /// Both phases; the decision in each phase is independent.
    Always,
}

/// How a guard's filter value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardFilterKind {
    /// Match against input taint.
    DataLabel,
    /// Match against the operation's labels.
    OpLabel,
    /// Resolve by inspecting the filter value at registration time.
    Auto,
}

/// Resolver behavior when `trusted` is added over `untrusted`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustConflictResolver {
    /// Keep both, emit a warning event, treat the value as untrusted.
    #[default]
    Warn,
    /// Raise a hard trust-conflict error.
    Error,
    /// Keep both without a warning.
    Silent,
}

/// The action a guard block resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GuardAction {
    /// Let the operation proceed, optionally with a user-facing warning.
    Allow {
        /// Warning text surfaced alongside the allow.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
    /// Let the operation proceed with a replacement value.
    AllowReplace {
        /// The replacement; its descriptor is unioned with the original's.
        value: serde_json::Value,
    },
    /// Refuse the operation.
    Deny {
        /// Reason surfaced to the user and the audit ledger.
        reason: String,
    },
    /// Ask the dispatcher to re-run the operation with a hint.
    Retry {
        /// Hint made available to the next attempt.
        hint: String,
    },
    /// Switch to a narrowed child environment for this operation only.
    Env {
        /// Environment narrowing config, interpreted by [`crate::env`].
        config: serde_json::Value,
    },
}

/// One prior guard decision on an operation, kept across retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardAttemptEntry {
    /// 1-based attempt number the decision belongs to.
    pub attempt: u32,
    /// Name of the deciding guard.
    pub guard: String,
    /// Stringified decision (`allow`, `deny`, `retry`, ...).
    pub decision: String,
    /// Retry hint, when the decision was a retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}
