//! Sealed credential handles.
//!
//! A [`SealedSecret`] is the only form in which a credential crosses the
//! core. It can be exported to a subprocess environment by the executor,
//! but it has no `Display` impl, its `Debug` output is redacted, and the
//! template renderer refuses to substitute it -- interpolation is how
//! injected prompts exfiltrate tokens.

use std::collections::BTreeMap;

use super::EnvError;

/// Opaque credential handle resolved from a sealed-path reference.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedSecret {
    material: String,
}

impl SealedSecret {
    /// Seal resolved credential material.
    pub fn new(material: impl Into<String>) -> Self {
        Self {
            material: material.into(),
        }
    }

    /// Expose the material for subprocess environment injection.
    ///
    /// This is the executor-only escape hatch; nothing else in the core
    /// calls it, and the rendered string must never re-enter a template.
    pub fn expose_for_exec(&self) -> &str {
        &self.material
    }
}

impl std::fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[SEALED]")
    }
}

/// A template variable: ordinary text, or a sealed credential that must
/// not be rendered.
#[derive(Debug, Clone)]
pub enum TemplateVar {
    /// Plain text; substituted verbatim.
    Text(String),
    /// Sealed credential; any substitution attempt is a credential leak.
    Sealed(SealedSecret),
}

/// Render `@name` references in a template against a variable map.
///
/// Unknown names are left verbatim (the evaluator resolves its own scope
/// first). Referencing a sealed variable raises `CREDENTIAL_LEAK` before
/// any side effect can observe the material.
pub fn render_template(
    template: &str,
    vars: &BTreeMap<String, TemplateVar>,
) -> Result<String, EnvError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(at) = rest.find('@') {
        let (before, tail) = rest.split_at(at);
        out.push_str(before);

        let after_at = &tail[1..];
        let name_len = after_at
            .char_indices()
            .take_while(|(i, c)| {
                if *i == 0 {
                    c.is_ascii_alphabetic() || *c == '_'
                } else {
                    c.is_ascii_alphanumeric() || *c == '_'
                }
            })
            .count();

        if name_len == 0 {
            out.push('@');
            rest = after_at;
            continue;
        }

        let name = &after_at[..name_len];
        match vars.get(name) {
            Some(TemplateVar::Text(text)) => out.push_str(text),
            Some(TemplateVar::Sealed(_)) => {
                return Err(EnvError::CredentialLeak(name.to_owned()));
            }
            None => {
                out.push('@');
                out.push_str(name);
            }
        }
        rest = &after_at[name_len..];
    }

    out.push_str(rest);
    Ok(out)
}
