//! Runtime configuration: project paths, the ephemeral switch, and
//! on-disk policy layers.
//!
//! The ledger lives at `.mlld/sec/audit.jsonl` with signing events in
//! `.sig/audit.jsonl`, both relative to the project root. Policy TOML
//! files under `.mlld/sec/policies/` compose with in-document layers.
//! Env resolvers are passed as closures so tests never mutate process
//! state.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::audit::AuditLedger;
use crate::policy::PolicyConfig;

/// Filesystem locations for persistent security state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    /// Project root every other path hangs off.
    pub project_root: PathBuf,
    /// `.mlld/sec` directory.
    pub sec_dir: PathBuf,
    /// Primary audit stream, `.mlld/sec/audit.jsonl`.
    pub audit_log: PathBuf,
    /// Signing stream, `.sig/audit.jsonl`.
    pub sig_log: PathBuf,
    /// On-disk policy layers, `.mlld/sec/policies/`.
    pub policies_dir: PathBuf,
}

/// Resolve runtime paths from the process environment.
///
/// `MLLD_PROJECT_ROOT` overrides the working directory.
pub fn runtime_paths() -> Result<RuntimePaths> {
    let cwd = std::env::current_dir().context("cannot resolve working directory")?;
    Ok(runtime_paths_with(
        |key| std::env::var(key).ok(),
        &cwd,
    ))
}

/// Resolve runtime paths with an injectable env resolver (for tests).
pub fn runtime_paths_with(
    env: impl Fn(&str) -> Option<String>,
    cwd: &Path,
) -> RuntimePaths {
    let project_root = env("MLLD_PROJECT_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| cwd.to_path_buf());
    let sec_dir = project_root.join(".mlld/sec");
    RuntimePaths {
        audit_log: sec_dir.join("audit.jsonl"),
        sig_log: project_root.join(".sig/audit.jsonl"),
        policies_dir: sec_dir.join("policies"),
        sec_dir,
        project_root,
    }
}

/// Is the run ephemeral? Ephemeral runs keep the ledger in memory and
/// disable read-taint recovery.
pub fn is_ephemeral() -> bool {
    is_ephemeral_with(|key| std::env::var(key).ok())
}

/// Ephemeral check with an injectable env resolver.
pub fn is_ephemeral_with(env: impl Fn(&str) -> Option<String>) -> bool {
    env("MLLD_EPHEMERAL")
        .map(|v| {
            let v = v.trim().to_lowercase();
            v == "true" || v == "1"
        })
        .unwrap_or(false)
}

/// Open the ledger for these paths: file-backed normally, an in-memory
/// ring when ephemeral.
pub fn open_ledger(paths: &RuntimePaths, ephemeral: bool) -> Result<AuditLedger> {
    if ephemeral {
        info!("ephemeral run: audit ledger bound to in-memory ring");
        return Ok(AuditLedger::in_memory());
    }
    AuditLedger::open(&paths.audit_log, &paths.sig_log)
}

/// Load every `.toml` policy layer from a directory, sorted by file name
/// so composition order is deterministic. A missing directory yields no
/// layers.
pub fn load_policy_dir(path: &Path) -> Result<Vec<PolicyConfig>> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(anyhow::anyhow!(
                "failed to read policy directory {}: {e}",
                path.display()
            ))
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("toml"))
        .collect();
    files.sort();

    let mut configs = Vec::new();
    for file in files {
        let text = std::fs::read_to_string(&file)
            .with_context(|| format!("failed to read policy file {}", file.display()))?;
        let config = PolicyConfig::from_toml(&text)
            .with_context(|| format!("failed to parse policy file {}", file.display()))?;
        info!(path = %file.display(), "loaded policy layer");
        configs.push(config);
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_project_root() {
        let paths = runtime_paths_with(
            |key| {
                (key == "MLLD_PROJECT_ROOT").then(|| "/proj".to_owned())
            },
            Path::new("/elsewhere"),
        );
        assert_eq!(paths.project_root, PathBuf::from("/proj"));
        assert_eq!(paths.audit_log, PathBuf::from("/proj/.mlld/sec/audit.jsonl"));
        assert_eq!(paths.sig_log, PathBuf::from("/proj/.sig/audit.jsonl"));
        assert_eq!(
            paths.policies_dir,
            PathBuf::from("/proj/.mlld/sec/policies")
        );
    }

    #[test]
    fn paths_default_to_cwd() {
        let paths = runtime_paths_with(|_| None, Path::new("/work"));
        assert_eq!(paths.project_root, PathBuf::from("/work"));
    }

    #[test]
    fn ephemeral_accepts_true_and_one() {
        assert!(is_ephemeral_with(|_| Some("true".to_owned())));
        assert!(is_ephemeral_with(|_| Some("1".to_owned())));
        assert!(is_ephemeral_with(|_| Some(" TRUE ".to_owned())));
        assert!(!is_ephemeral_with(|_| Some("false".to_owned())));
        assert!(!is_ephemeral_with(|_| None));
    }

    #[test]
    fn policy_dir_loads_sorted_layers() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        std::fs::write(
            dir.path().join("10-base.toml"),
            "[capabilities]\nallow = [\"cmd:*\"]\n",
        )
        .expect("write");
        std::fs::write(
            dir.path().join("20-tighten.toml"),
            "[capabilities]\ndeny = [\"cmd:rm:*\"]\n",
        )
        .expect("write");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write");

        let configs = load_policy_dir(dir.path()).expect("load");
        assert_eq!(configs.len(), 2);
        assert!(configs[0].capabilities.allow.is_some());
        assert_eq!(configs[1].capabilities.deny, vec!["cmd:rm:*".to_owned()]);
    }

    #[test]
    fn missing_policy_dir_is_empty() {
        let configs = load_policy_dir(Path::new("/no/such/dir")).expect("load");
        assert!(configs.is_empty());
    }

    #[test]
    fn invalid_policy_file_is_an_error() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("bad.toml"), "capabilities = 42").expect("write");
        assert!(load_policy_dir(dir.path()).is_err());
    }
}
