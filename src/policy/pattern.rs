//! Pattern matching for capability and label-flow rules.
//!
//! Operation names and labels are `:`-separated. A `*` segment matches any
//! single segment; a trailing `*` matches any remainder (including none).

use crate::types::Label;

/// Match a capability pattern against an operation name.
///
/// `cmd:git:*` matches `cmd:git:push` and `cmd:git`; `cmd:*:status`
/// matches `cmd:git:status` but not `cmd:git:push`; `*` matches anything.
pub fn matches_name(pattern: &str, name: &str) -> bool {
    let mut name_segments = name.split(':');
    let mut pattern_segments = pattern.split(':').peekable();

    while let Some(p) = pattern_segments.next() {
        if p == "*" && pattern_segments.peek().is_none() {
            // Trailing star swallows the rest, including an empty rest.
            return true;
        }
        match name_segments.next() {
            Some(seg) if p == "*" || p == seg => {}
            _ => return false,
        }
    }
    name_segments.next().is_none()
}

/// Match a data-label pattern against a concrete label.
///
/// A plain pattern uses the label algebra's own matching (hierarchical for
/// `op:` / `dir:`, exact otherwise). A pattern with a trailing `:*` or `*`
/// segment falls back to segment matching over the raw string, so flow
/// rules can say `src:*` or `dir:/tmp/*`.
pub fn matches_label(pattern: &str, label: &Label) -> bool {
    if pattern.split(':').any(|seg| seg == "*") || pattern.ends_with('*') {
        return matches_name(pattern, label.as_str());
    }
    match Label::parse(pattern) {
        Ok(pattern_label) => label.matches(&pattern_label),
        Err(_) => false,
    }
}

/// Root of a data-label pattern, used to index flow rules: the first
/// `:`-separated segment (`secret`, `untrusted`, `src`, `dir`, `op`).
pub fn pattern_root(pattern: &str) -> &str {
    pattern.split(':').next().unwrap_or(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_wildcard_name_matching() {
        assert!(matches_name("cmd:echo", "cmd:echo"));
        assert!(!matches_name("cmd:echo", "cmd:echo:hi"));
        assert!(matches_name("cmd:echo:*", "cmd:echo:hi"));
        assert!(matches_name("cmd:echo:*", "cmd:echo"));
        assert!(matches_name("cmd:*:status", "cmd:git:status"));
        assert!(!matches_name("cmd:*:status", "cmd:git:push"));
        assert!(matches_name("*", "anything:at:all"));
    }

    #[test]
    fn star_matches_one_segment_in_the_middle() {
        assert!(!matches_name("cmd:*", "notcmd:echo"));
        assert!(matches_name("cmd:*", "cmd:echo:deep"));
    }

    #[test]
    fn label_pattern_plain_uses_label_matching() {
        let value = Label::operation("cmd:git:push");
        assert!(matches_label("op:cmd:git", &value));
        assert!(!matches_label("op:cmd:gi", &value));
        assert!(matches_label("secret", &Label::secret()));
        assert!(!matches_label("secret", &Label::sensitive()));
    }

    #[test]
    fn label_pattern_with_star_uses_segments() {
        assert!(matches_label("src:*", &Label::source("mcp")));
        assert!(matches_label("src:*", &Label::source("cmd")));
        assert!(!matches_label("src:*", &Label::secret()));
    }

    #[test]
    fn pattern_roots() {
        assert_eq!(pattern_root("secret"), "secret");
        assert_eq!(pattern_root("src:*"), "src");
        assert_eq!(pattern_root("op:cmd:git"), "op");
    }
}
