//! Name-pattern matching.
//!
//! Patterns are exact names (case-insensitive), `prefix*`, `*suffix`, or
//! the bare wildcard `*`.

/// True when `name` matches `pattern`.
#[must_use]
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let pattern_lower = pattern.to_lowercase();
    let name_lower = name.to_lowercase();

    if let Some(prefix) = pattern_lower.strip_suffix('*') {
        return name_lower.starts_with(prefix);
    }
    if let Some(suffix) = pattern_lower.strip_prefix('*') {
        return name_lower.ends_with(suffix);
    }
    pattern_lower == name_lower
}

/// True when the pattern is an exact name, not a wildcard form.
#[must_use]
pub fn is_exact(pattern: &str) -> bool {
    !pattern.contains('*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_is_case_insensitive() {
        assert!(pattern_matches("Lead", "lead"));
        assert!(pattern_matches("lead", "LEAD"));
        assert!(!pattern_matches("lead", "leader"));
    }

    #[test]
    fn prefix_wildcard() {
        assert!(pattern_matches("worker-*", "worker-1"));
        assert!(pattern_matches("worker-*", "Worker-ALPHA"));
        assert!(!pattern_matches("worker-*", "manager-1"));
    }

    #[test]
    fn suffix_wildcard() {
        assert!(pattern_matches("*-reviewer", "pr-reviewer"));
        assert!(!pattern_matches("*-reviewer", "reviewer-pr"));
    }

    #[test]
    fn bare_wildcard_matches_everything() {
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("*", ""));
    }

    #[test]
    fn exactness() {
        assert!(is_exact("lead"));
        assert!(!is_exact("worker-*"));
        assert!(!is_exact("*"));
    }
}
