//! Glob-style resource patterns.
//!
//! Patterns are split on `/` and matched segment by segment, anchored at both
//! ends:
//!
//! - `**` matches zero or more whole segments
//! - a segment that is exactly `*` matches one non-empty segment
//! - `*` inside a segment matches any run of characters within that segment
//!
//! Resources without a `/` (tool names, domains, commands) are a single
//! segment, so `git_*` or `*.example.com` work as expected.

use std::fmt;

use serde::{Deserialize, Serialize};

const ANY_DEPTH: &str = "**";
const ANY_SEGMENT: &str = "*";

/// A glob pattern matched against concrete resource identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourcePattern(String);

impl ResourcePattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// Pattern matching every resource.
    pub fn any() -> Self {
        Self::new(ANY_DEPTH)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `resource` is matched by this pattern.
    ///
    /// Resources containing a `..` segment never match: they cannot be
    /// compared against a pattern without filesystem normalization.
    pub fn matches(&self, resource: &str) -> bool {
        let resource: Vec<&str> = resource.split('/').collect();
        if resource.contains(&"..") {
            return false;
        }
        let pattern: Vec<&str> = self.0.split('/').collect();
        match_segments(&pattern, &resource)
    }

    /// Whether every resource matched by `other` is also matched by `self`.
    ///
    /// The check is conservative: a wildcard inside a segment of `other` is
    /// only covered by an identical segment or a whole-segment wildcard.
    pub fn covers(&self, other: &ResourcePattern) -> bool {
        let parent: Vec<&str> = self.0.split('/').collect();
        let child: Vec<&str> = other.0.split('/').collect();
        if child.contains(&"..") {
            return false;
        }
        covers_segments(&parent, &child)
    }
}

impl From<&str> for ResourcePattern {
    fn from(pattern: &str) -> Self {
        Self::new(pattern)
    }
}

impl From<String> for ResourcePattern {
    fn from(pattern: String) -> Self {
        Self(pattern)
    }
}

impl fmt::Display for ResourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn match_segments(pattern: &[&str], resource: &[&str]) -> bool {
    walk_segments(pattern, resource, match_segment)
}

fn covers_segments(parent: &[&str], child: &[&str]) -> bool {
    // A single parent segment cannot absorb arbitrary depth.
    walk_segments(parent, child, |segment, head| {
        head != ANY_DEPTH && segment_covers(segment, head)
    })
}

/// Anchored segment match where `**` spans any number of target segments.
///
/// Filled in from the last pattern segment backwards, one row per pattern
/// segment, so runs of `**` cost `pattern.len() * target.len()` steps.
fn walk_segments(
    pattern: &[&str],
    target: &[&str],
    segment_matches: impl Fn(&str, &str) -> bool,
) -> bool {
    // suffix[j]: the pattern segments after the current one match target[j..].
    let mut suffix = vec![false; target.len() + 1];
    suffix[target.len()] = true;

    for &segment in pattern.iter().rev() {
        let mut row = vec![false; target.len() + 1];
        if segment == ANY_DEPTH {
            let mut reachable = false;
            for j in (0..=target.len()).rev() {
                reachable |= suffix[j];
                row[j] = reachable;
            }
        } else {
            for (j, &head) in target.iter().enumerate() {
                row[j] = suffix[j + 1] && segment_matches(segment, head);
            }
        }
        suffix = row;
    }

    suffix[0]
}

fn segment_covers(parent: &str, child: &str) -> bool {
    if parent == child {
        return true;
    }
    if parent == ANY_SEGMENT {
        return !child.is_empty();
    }
    !child.contains('*') && match_segment(parent, child)
}

fn match_segment(pattern: &str, text: &str) -> bool {
    if pattern == ANY_SEGMENT {
        return !text.is_empty();
    }
    glob(pattern.as_bytes(), text.as_bytes())
}

/// Single-segment glob where `*` matches any run of bytes.
fn glob(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((star, consumed)) = backtrack {
            p = star + 1;
            t = consumed + 1;
            backtrack = Some((star, consumed + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&b| b == b'*')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pat(s: &str) -> ResourcePattern {
        ResourcePattern::new(s)
    }

    #[test]
    fn recursive_glob_matches_any_depth() {
        let p = pat("/tmp/**");
        assert!(p.matches("/tmp/a/b.txt"));
        assert!(p.matches("/tmp/a"));
        assert!(p.matches("/tmp"));
        assert!(!p.matches("/etc/passwd"));
        assert!(!p.matches("/tmpfoo/a"));
    }

    #[test]
    fn single_star_matches_exactly_one_segment() {
        let p = pat("/home/*/documents/**");
        assert!(p.matches("/home/alice/documents/report.pdf"));
        assert!(p.matches("/home/bob/documents/a/b/c"));
        assert!(!p.matches("/home/alice/bob/documents/x"));
        assert!(!p.matches("/home//documents/x"));
        assert!(!p.matches("/etc/passwd"));
    }

    #[test]
    fn matching_is_anchored() {
        let p = pat("/var/log/*.log");
        assert!(p.matches("/var/log/syslog.log"));
        assert!(!p.matches("/var/log/syslog.log.1"));
        assert!(!p.matches("/srv/var/log/syslog.log"));
        assert!(!p.matches("/var/log/nested/syslog.log"));
    }

    #[test]
    fn parent_segments_never_match() {
        assert!(!pat("/tmp/**").matches("/tmp/../etc/passwd"));
    }

    #[test]
    fn single_segment_resources() {
        assert!(pat("git_*").matches("git_status"));
        assert!(!pat("git_*").matches("rm_rf"));
        assert!(pat("*.example.com").matches("api.example.com"));
        assert!(pat("**").matches("/anything/at/all"));
    }

    #[test]
    fn covers_accepts_narrower_patterns() {
        assert!(pat("/tmp/**").covers(&pat("/tmp/a/**")));
        assert!(pat("/tmp/**").covers(&pat("/tmp/*/b.txt")));
        assert!(pat("/tmp/**").covers(&pat("/tmp/**")));
        assert!(pat("/home/*/docs").covers(&pat("/home/alice/docs")));
        assert!(pat("/data/*.csv").covers(&pat("/data/sales.csv")));
    }

    #[test]
    fn covers_rejects_wider_patterns() {
        assert!(!pat("/tmp/*").covers(&pat("/tmp/**")));
        assert!(!pat("/tmp/a/**").covers(&pat("/tmp/**")));
        assert!(!pat("/tmp/**").covers(&pat("/etc/**")));
        assert!(!pat("/data/sales.csv").covers(&pat("/data/*.csv")));
        assert!(!pat("/tmp/**").covers(&pat("/tmp/../etc")));
    }

    #[test]
    fn repeated_recursive_globs_stay_linear() {
        let deep = format!("/{}", vec!["d"; 40].join("/"));
        let stacked = pat(&format!("/{}/x", vec!["**"; 12].join("/")));
        assert!(!stacked.matches(&format!("{deep}/y")));
        assert!(stacked.matches(&format!("{deep}/x")));

        let interleaved = pat(&format!("/{}/x", vec!["**/d"; 12].join("/")));
        assert!(!interleaved.matches(&format!("{deep}/y")));
        assert!(interleaved.matches(&format!("{deep}/x")));

        assert!(stacked.covers(&pat(&format!("{deep}/**/x"))));
        assert!(!stacked.covers(&pat(&format!("{deep}/**"))));
    }
}
