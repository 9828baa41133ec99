//! Input validation applied at trust boundaries.
//!
//! Work item ids flow into git branch names, worktree paths, and tracker
//! CLI argv, so they are validated before any external command sees them.

use regex::Regex;
use std::sync::OnceLock;

/// Work item ids look like `trk-abc123` or `tmpro-ddk9g-b2fi3m`:
/// lowercase alphanumeric segments joined by single hyphens, first segment
/// starting with a letter, at least two segments. Rejects empty strings,
/// leading/trailing hyphens, leading digits, and anything a shell would
/// interpret.
pub fn is_valid_work_item_id(id: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"^[a-z][a-z0-9]*(-[a-z0-9]+)+$").unwrap());
    re.is_match(id)
}

/// Lowercase alphanumeric slug with single hyphens, for branch names.
pub fn slugify(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_ids() {
        for id in [
            "trk-1abc23",
            "proj-xyz789",
            "test-a1b2c3",
            "cadence-abcdef",
            "tmpro-ddk9g-b2fi3m",
            "cadence-executor-trk-0ikoux",
        ] {
            assert!(is_valid_work_item_id(id), "should be valid: {id}");
        }
    }

    #[test]
    fn rejects_malformed_ids() {
        for id in [
            "",
            "nohyphen",
            "123-456",
            "abc",
            "../etc/passwd",
            "task; rm -rf /",
            "task`whoami`test",
            "task$(cat /etc/passwd)",
            "-startswithhyphen",
            "ends-with-hyphen-",
            "Caps-notallowed",
            "double--hyphen",
        ] {
            assert!(!is_valid_work_item_id(id), "should be invalid: {id}");
        }
    }

    #[test]
    fn slugify_basics() {
        assert_eq!(slugify("My Feature"), "my-feature");
        assert_eq!(slugify("add-new-thing"), "add-new-thing");
        assert_eq!(slugify("Fix Bug #123"), "fix-bug-123");
        assert_eq!(slugify("  spaces  "), "spaces");
        assert_eq!(slugify("CamelCase"), "camelcase");
    }
}
