//! Scoped execution environments.
//!
//! An [`EnvironmentContext`] narrows what an operation may touch:
//! filesystem globs, network tier, resource limits, runtime tools, MCP
//! servers, and credential bindings. Composition is attenuation-only --
//! a child can never widen its parent, and an attempt to do so fails at
//! construction.

pub mod sealed;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::policy::{Limits, Policy};

pub use sealed::{render_template, SealedSecret, TemplateVar};

/// Errors raised by environment construction and credential handling.
#[derive(Debug, Error)]
pub enum EnvError {
    /// A child config asked for a capability its parent does not hold.
    #[error("environment widening rejected: {0}")]
    Widening(String),
    /// A referenced credential has no entry in the policy auth table.
    #[error("credential '{0}' is not declared in the policy auth table")]
    UnknownCredential(String),
    /// The credential resolver failed to produce the secret.
    #[error("failed to resolve credential '{name}': {reason}")]
    ResolveFailed {
        /// Credential name as referenced.
        name: String,
        /// Resolver-supplied reason.
        reason: String,
    },
    /// A sealed credential was about to be rendered into a string.
    #[error("sealed credential '{0}' cannot be interpolated into a string")]
    CredentialLeak(String),
    /// The narrowing config could not be interpreted.
    #[error("invalid environment config: {0}")]
    InvalidConfig(String),
}

/// Network access tier, ordered by permissiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetAccess {
    /// No network.
    None,
    /// Restricted egress via the provider's allowlist.
    Limited,
    /// Full host network.
    Host,
}

/// Filesystem access as glob lists over absolute paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FsAccess {
    /// Readable path globs.
    pub read: Vec<String>,
    /// Writable path globs.
    pub write: Vec<String>,
}

/// Resolves a sealed-path reference (e.g. `keychain:slack`) to a secret.
///
/// The core never sees credential material outside [`SealedSecret`];
/// the resolver is the seam where a keychain or vault plugs in.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Resolve the reference to sealed material.
    async fn resolve(&self, sealed_from: &str) -> Result<SealedSecret, EnvError>;
}

/// Map-backed resolver for tests and single-process embedding.
#[derive(Default)]
pub struct StaticCredentialResolver {
    entries: BTreeMap<String, SealedSecret>,
}

impl StaticCredentialResolver {
    /// Empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resolvable reference.
    pub fn with(mut self, sealed_from: impl Into<String>, secret: SealedSecret) -> Self {
        self.entries.insert(sealed_from.into(), secret);
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, sealed_from: &str) -> Result<SealedSecret, EnvError> {
        self.entries
            .get(sealed_from)
            .cloned()
            .ok_or_else(|| EnvError::ResolveFailed {
                name: sealed_from.to_owned(),
                reason: "no such sealed path".to_owned(),
            })
    }
}

/// Narrowing config as delivered by an `env` directive or a guard's
/// env-switch action.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Isolation provider id; opaque to the core.
    pub provider: Option<String>,
    /// Filesystem narrowing; absent fields inherit the parent.
    pub fs: Option<FsAccess>,
    /// Network tier; result is the minimum of parent and child.
    pub net: Option<NetAccess>,
    /// Limit ceilings; result is the component-wise minimum.
    pub limits: Option<Limits>,
    /// Runtime tool allowlist; must be a subset of the parent's.
    pub tools: Option<Vec<String>>,
    /// MCP server allowlist; must be a subset of the parent's.
    pub mcps: Option<Vec<String>>,
    /// Credential names to bind (`using auth:<name>`).
    pub auth: Vec<String>,
}

impl EnvConfig {
    /// Interpret a JSON config object (guard env-switch payload).
    pub fn from_value(value: &serde_json::Value) -> Result<Self, EnvError> {
        serde_json::from_value(value.clone())
            .map_err(|e| EnvError::InvalidConfig(e.to_string()))
    }
}

/// An immutable, sealed execution environment.
#[derive(Debug, Clone)]
pub struct EnvironmentContext {
    id: Uuid,
    parent: Option<Uuid>,
    provider: String,
    fs: FsAccess,
    net: NetAccess,
    limits: Limits,
    tools: BTreeSet<String>,
    mcps: BTreeSet<String>,
    auth_bindings: BTreeMap<String, SealedSecret>,
}

impl EnvironmentContext {
    /// Root environment with the given capability set.
    pub fn root(
        provider: impl Into<String>,
        fs: FsAccess,
        net: NetAccess,
        limits: Limits,
        tools: impl IntoIterator<Item = String>,
        mcps: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent: None,
            provider: provider.into(),
            fs,
            net,
            limits,
            tools: tools.into_iter().collect(),
            mcps: mcps.into_iter().collect(),
            auth_bindings: BTreeMap::new(),
        }
    }

    /// A permissive root for hosts without an isolation provider.
    pub fn permissive() -> Self {
        Self::root(
            "host",
            FsAccess {
                read: vec!["/**".to_owned()],
                write: vec!["/**".to_owned()],
            },
            NetAccess::Host,
            Limits::default(),
            [],
            [],
        )
    }

    /// Unique id of this environment instance.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Parent id, used to verify attenuation chains in audit output.
    pub fn parent(&self) -> Option<Uuid> {
        self.parent
    }

    /// Isolation provider id.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Filesystem globs.
    pub fn fs(&self) -> &FsAccess {
        &self.fs
    }

    /// Network tier.
    pub fn net(&self) -> NetAccess {
        self.net
    }

    /// Resource limits.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Runtime tool allowlist.
    pub fn tools(&self) -> &BTreeSet<String> {
        &self.tools
    }

    /// MCP server allowlist.
    pub fn mcps(&self) -> &BTreeSet<String> {
        &self.mcps
    }

    /// Sealed credential bound under the given exported env-var name.
    pub fn auth_binding(&self, export: &str) -> Option<&SealedSecret> {
        self.auth_bindings.get(export)
    }

    /// All bindings, for the executor to export into a subprocess env.
    pub fn auth_exports(&self) -> impl Iterator<Item = (&str, &SealedSecret)> {
        self.auth_bindings.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// True when a credential *name* from the policy auth table is bound
    /// here (resolution happened at narrow time).
    pub fn has_credential(&self, policy: &Policy, name: &str) -> bool {
        policy
            .auth_table()
            .get(name)
            .is_some_and(|entry| self.auth_bindings.contains_key(&entry.export))
    }

    /// Derive a child environment. Every capability of the child is at
    /// most that of the parent; widening attempts fail.
    pub async fn narrow(
        &self,
        config: &EnvConfig,
        policy: &Policy,
        resolver: &dyn CredentialResolver,
    ) -> Result<Self, EnvError> {
        let fs = match &config.fs {
            Some(child_fs) => FsAccess {
                read: attenuate_globs(&self.fs.read, &child_fs.read, "fs.read")?,
                write: attenuate_globs(&self.fs.write, &child_fs.write, "fs.write")?,
            },
            None => self.fs.clone(),
        };

        let net = match config.net {
            Some(child_net) => self.net.min(child_net),
            None => self.net,
        };

        let limits = match &config.limits {
            Some(child_limits) => self.limits.min(child_limits),
            None => self.limits,
        };

        let tools = match &config.tools {
            Some(list) => attenuate_set(&self.tools, list, "tools")?,
            None => self.tools.clone(),
        };
        let mcps = match &config.mcps {
            Some(list) => attenuate_set(&self.mcps, list, "mcps")?,
            None => self.mcps.clone(),
        };

        let mut auth_bindings = self.auth_bindings.clone();
        for name in &config.auth {
            let entry = policy
                .auth_table()
                .get(name)
                .ok_or_else(|| EnvError::UnknownCredential(name.clone()))?;
            let secret = resolver.resolve(&entry.from).await?;
            auth_bindings.insert(entry.export.clone(), secret);
        }

        Ok(Self {
            id: Uuid::new_v4(),
            parent: Some(self.id),
            provider: config.provider.clone().unwrap_or_else(|| self.provider.clone()),
            fs,
            net,
            limits,
            tools,
            mcps,
            auth_bindings,
        })
    }
}

/// Child glob entries must each be covered by some parent entry; the
/// result is the child's list (the intersection, expressed as the more
/// specific side).
fn attenuate_globs(
    parent: &[String],
    child: &[String],
    field: &str,
) -> Result<Vec<String>, EnvError> {
    for entry in child {
        if !parent.iter().any(|p| glob_covers(p, entry)) {
            return Err(EnvError::Widening(format!(
                "{field}: '{entry}' is not covered by the parent environment"
            )));
        }
    }
    Ok(child.to_vec())
}

/// Child set entries must each exist in the parent; the result is the
/// intersection.
fn attenuate_set(
    parent: &BTreeSet<String>,
    child: &[String],
    field: &str,
) -> Result<BTreeSet<String>, EnvError> {
    for entry in child {
        if !parent.contains(entry) {
            return Err(EnvError::Widening(format!(
                "{field}: '{entry}' is not held by the parent environment"
            )));
        }
    }
    Ok(child.iter().cloned().collect())
}

/// Does `parent` (a path glob) cover `child` (a path glob or literal)?
///
/// Supported shapes: exact equality, a trailing `/**` prefix glob, and
/// the bare `/**` universe. Anything else must match exactly.
fn glob_covers(parent: &str, child: &str) -> bool {
    if parent == child || parent == "/**" {
        return true;
    }
    if let Some(prefix) = parent.strip_suffix("/**") {
        let child_base = child.strip_suffix("/**").unwrap_or(child);
        return child_base == prefix
            || child_base
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_env() -> EnvironmentContext {
        EnvironmentContext::root(
            "sandbox",
            FsAccess {
                read: vec!["/work/**".to_owned(), "/tmp/**".to_owned()],
                write: vec!["/work/out/**".to_owned()],
            },
            NetAccess::Limited,
            Limits {
                mem_bytes: Some(536_870_912),
                cpu_millis: Some(60_000),
                timeout_ms: Some(30_000),
            },
            ["Bash".to_owned(), "Read".to_owned(), "Write".to_owned()],
            ["github".to_owned()],
        )
    }

    fn policy_with_slack_auth() -> Policy {
        let config = crate::policy::PolicyConfig::from_toml(
            r#"
[auth.slack]
from = "keychain:slack"
as = "SLACK_TOKEN"
"#,
        )
        .expect("parse");
        Policy::compile(config).expect("compile")
    }

    #[tokio::test]
    async fn narrow_intersects_and_attenuates() {
        let parent = root_env();
        let config = EnvConfig {
            fs: Some(FsAccess {
                read: vec!["/work/src/**".to_owned()],
                write: vec![],
            }),
            net: Some(NetAccess::None),
            limits: Some(Limits {
                timeout_ms: Some(5_000),
                ..Limits::default()
            }),
            tools: Some(vec!["Read".to_owned()]),
            ..EnvConfig::default()
        };

        let child = parent
            .narrow(&config, &Policy::default(), &StaticCredentialResolver::new())
            .await
            .expect("narrow");

        assert_eq!(child.fs().read, vec!["/work/src/**".to_owned()]);
        assert!(child.fs().write.is_empty());
        assert_eq!(child.net(), NetAccess::None);
        assert_eq!(child.limits().timeout_ms, Some(5_000));
        assert_eq!(child.limits().cpu_millis, Some(60_000));
        assert_eq!(child.tools().len(), 1);
        assert_eq!(child.parent(), Some(parent.id()));
    }

    #[tokio::test]
    async fn narrow_rejects_fs_widening() {
        let parent = root_env();
        let config = EnvConfig {
            fs: Some(FsAccess {
                read: vec!["/etc/**".to_owned()],
                write: vec![],
            }),
            ..EnvConfig::default()
        };

        let result = parent
            .narrow(&config, &Policy::default(), &StaticCredentialResolver::new())
            .await;
        assert!(matches!(result, Err(EnvError::Widening(_))));
    }

    #[tokio::test]
    async fn narrow_rejects_tool_widening() {
        let parent = root_env();
        let config = EnvConfig {
            tools: Some(vec!["Bash".to_owned(), "WebFetch".to_owned()]),
            ..EnvConfig::default()
        };

        let result = parent
            .narrow(&config, &Policy::default(), &StaticCredentialResolver::new())
            .await;
        assert!(matches!(result, Err(EnvError::Widening(_))));
    }

    #[tokio::test]
    async fn narrow_cannot_raise_net_tier() {
        let parent = root_env();
        let config = EnvConfig {
            net: Some(NetAccess::Host),
            ..EnvConfig::default()
        };
        let child = parent
            .narrow(&config, &Policy::default(), &StaticCredentialResolver::new())
            .await
            .expect("narrow");
        // min(Limited, Host) = Limited: requesting more yields no more.
        assert_eq!(child.net(), NetAccess::Limited);
    }

    #[tokio::test]
    async fn auth_binding_resolves_through_the_table() {
        let parent = root_env();
        let policy = policy_with_slack_auth();
        let resolver =
            StaticCredentialResolver::new().with("keychain:slack", SealedSecret::new("xoxb-123"));

        let config = EnvConfig {
            auth: vec!["slack".to_owned()],
            ..EnvConfig::default()
        };
        let child = parent
            .narrow(&config, &policy, &resolver)
            .await
            .expect("narrow");

        let bound = child.auth_binding("SLACK_TOKEN").expect("bound");
        assert_eq!(bound.expose_for_exec(), "xoxb-123");
        assert!(child.has_credential(&policy, "slack"));
    }

    #[tokio::test]
    async fn unknown_credential_name_is_rejected() {
        let parent = root_env();
        let config = EnvConfig {
            auth: vec!["stripe".to_owned()],
            ..EnvConfig::default()
        };
        let result = parent
            .narrow(
                &config,
                &policy_with_slack_auth(),
                &StaticCredentialResolver::new(),
            )
            .await;
        assert!(matches!(result, Err(EnvError::UnknownCredential(name)) if name == "stripe"));
    }

    #[test]
    fn glob_cover_rules() {
        assert!(glob_covers("/**", "/anything/below"));
        assert!(glob_covers("/work/**", "/work/src/**"));
        assert!(glob_covers("/work/**", "/work"));
        assert!(!glob_covers("/work/**", "/worked/src"));
        assert!(!glob_covers("/work/src", "/work/src/**"));
        assert!(glob_covers("/work/src", "/work/src"));
    }

    #[test]
    fn env_config_from_json_value() {
        let value = serde_json::json!({
            "net": "none",
            "tools": ["Read"],
            "auth": ["slack"],
        });
        let config = EnvConfig::from_value(&value).expect("parse");
        assert_eq!(config.net, Some(NetAccess::None));
        assert_eq!(config.auth, vec!["slack".to_owned()]);
    }
}
