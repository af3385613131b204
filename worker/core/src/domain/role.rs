// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Role names and delegated path patterns.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A metadata role: one of the four top-level roles or a delegated targets role
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RoleName {
    Root,
    Targets,
    Snapshot,
    Timestamp,
    Delegated(String),
}

impl RoleName {
    pub fn top_level() -> [RoleName; 4] {
        [Self::Root, Self::Targets, Self::Snapshot, Self::Timestamp]
    }

    pub fn parse(name: &str) -> Self {
        match name {
            "root" => Self::Root,
            "targets" => Self::Targets,
            "snapshot" => Self::Snapshot,
            "timestamp" => Self::Timestamp,
            other => Self::Delegated(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Root => "root",
            Self::Targets => "targets",
            Self::Snapshot => "snapshot",
            Self::Timestamp => "timestamp",
            Self::Delegated(name) => name,
        }
    }

    pub fn is_top_level(&self) -> bool {
        !matches!(self, Self::Delegated(_))
    }

    /// Name used for this role inside snapshot/timestamp `meta` maps
    pub fn metadata_filename(&self) -> String {
        format!("{}.json", self.as_str())
    }

    /// Published file name under consistent-snapshot conventions
    pub fn published_filename(&self, version: u64) -> String {
        match self {
            Self::Timestamp => self.metadata_filename(),
            _ => format!("{}.{}", version, self.metadata_filename()),
        }
    }
}

impl std::fmt::Display for RoleName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for RoleName {
    fn from(name: String) -> Self {
        Self::parse(&name)
    }
}

impl From<RoleName> for String {
    fn from(role: RoleName) -> Self {
        role.as_str().to_string()
    }
}

/// Check a delegated role name: non-empty, not a top-level name, and safe to
/// use in a file name.
pub fn is_valid_delegated_name(name: &str) -> bool {
    !name.is_empty()
        && !RoleName::parse(name).is_top_level()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.')
}

/// Match a target path against a delegation pattern.
///
/// `*` and `?` never match across `/`, so a pattern only matches paths with
/// the same number of segments.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str("[^/]*"),
            '?' => expr.push_str("[^/]"),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');

    Regex::new(&expr).map(|re| re.is_match(path)).unwrap_or(false)
}

/// Whether every pattern in `child` lies inside the namespace of `parent`.
///
/// `None` for the parent means unrestricted (top-level targets). A child
/// pattern is inside the parent when one of the parent's patterns covers
/// every path the child can match, e.g. `releases/app-*` is inside
/// `releases/*` but not inside `releases/app-?`.
pub fn patterns_within(child: &[String], parent: Option<&[String]>) -> bool {
    match parent {
        None => true,
        Some(parent) => child
            .iter()
            .all(|c| parent.iter().any(|p| pattern_covers(p, c))),
    }
}

/// Whether `outer` matches every path `inner` matches
fn pattern_covers(outer: &str, inner: &str) -> bool {
    let outer: Vec<&str> = outer.split('/').collect();
    let inner: Vec<&str> = inner.split('/').collect();
    outer.len() == inner.len()
        && outer
            .iter()
            .zip(&inner)
            .all(|(o, i)| segment_covers(o, i))
}

/// Segment containment. A literal in `inner` is covered by the same
/// literal, `?` or `*`; an inner `?` by `?` or `*`; an inner `*` only by
/// `*`.
fn segment_covers(outer: &str, inner: &str) -> bool {
    let outer: Vec<char> = outer.chars().collect();
    let inner: Vec<char> = inner.chars().collect();
    let (m, n) = (outer.len(), inner.len());

    // covered[j][i]: outer[j..] covers inner[i..]
    let mut covered = vec![vec![false; n + 1]; m + 1];
    covered[m][n] = true;
    for j in (0..m).rev() {
        for i in (0..=n).rev() {
            covered[j][i] = match outer[j] {
                '*' => covered[j + 1][i] || (i < n && covered[j][i + 1]),
                '?' => i < n && inner[i] != '*' && covered[j + 1][i + 1],
                literal => i < n && inner[i] == literal && covered[j + 1][i + 1],
            };
        }
    }
    covered[0][0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_name_parse_and_display() {
        assert_eq!(RoleName::parse("root"), RoleName::Root);
        assert_eq!(RoleName::parse("bins-1f"), RoleName::Delegated("bins-1f".to_string()));
        assert_eq!(RoleName::Snapshot.to_string(), "snapshot");
        assert!(RoleName::Timestamp.is_top_level());
        assert!(!RoleName::parse("project-a").is_top_level());
    }

    #[test]
    fn test_published_filenames() {
        assert_eq!(RoleName::Timestamp.published_filename(9), "timestamp.json");
        assert_eq!(RoleName::Snapshot.published_filename(3), "3.snapshot.json");
        assert_eq!(RoleName::parse("bins-0").published_filename(1), "1.bins-0.json");
    }

    #[test]
    fn test_role_name_serde() {
        let json = serde_json::to_string(&RoleName::Targets).unwrap();
        assert_eq!(json, "\"targets\"");
        let parsed: RoleName = serde_json::from_str("\"project-a\"").unwrap();
        assert_eq!(parsed, RoleName::Delegated("project-a".to_string()));
    }

    #[test]
    fn test_delegated_name_validation() {
        assert!(is_valid_delegated_name("project-a"));
        assert!(!is_valid_delegated_name("targets"));
        assert!(!is_valid_delegated_name(""));
        assert!(!is_valid_delegated_name("../escape"));
    }

    #[test]
    fn test_path_matching_is_segment_aware() {
        assert!(path_matches("releases/*", "releases/app-1.0.bin"));
        assert!(!path_matches("releases/*", "releases/nested/app.bin"));
        assert!(path_matches("app-?.bin", "app-1.bin"));
        assert!(!path_matches("app-?.bin", "app-10.bin"));
        assert!(path_matches("a+b(1).txt", "a+b(1).txt"));
    }

    #[test]
    fn test_patterns_within() {
        let parent = vec!["releases/*".to_string()];
        assert!(patterns_within(&["releases/app-*".to_string()], Some(&parent)));
        assert!(!patterns_within(&["nightly/*".to_string()], Some(&parent)));
        assert!(patterns_within(&["anything/**".to_string()], None));
    }

    #[test]
    fn test_wildcard_child_needs_wildcard_parent() {
        let within = |child: &str, parent: &str| {
            patterns_within(&[child.to_string()], Some(&[parent.to_string()]))
        };
        assert!(!within("a*", "a?"));
        assert!(!within("releases/app-*", "releases/app-?"));
        assert!(!within("a?", "ab"));
        assert!(!within("releases/*", "releases/app-*"));
        assert!(!within("releases/*/app", "releases/*"));

        assert!(within("a?", "a*"));
        assert!(within("a?", "a?"));
        assert!(within("ab", "a?"));
        assert!(within("a*b", "a*"));
        assert!(within("releases/app-*", "releases/app-*"));
        assert!(within("releases/app-?.bin", "releases/*.bin"));
        assert!(within("x*y*z", "*z"));
    }
}
