//! Pure lease-overlap resolution.
//!
//! Two leases conflict iff they are held by different agents, at least one
//! side is exclusive, and their patterns overlap. Overlap is approximated by
//! matching each pattern as a glob against the other side taken literally
//! (plus exact equality). This is deliberately not a true pattern
//! intersection: `a/*.py` vs `a/b*.py` may be classified differently from
//! real set intersection. The approximation is symmetric and must be kept
//! as-is; callers depend on its exact behavior.

use chrono::{DateTime, Utc};
use glob::Pattern;

use crate::error::{Result, WardenError};
use crate::model::Lease;

/// Reject malformed or empty patterns before anything is persisted or locked.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.trim().is_empty() {
        return Err(WardenError::InvalidPattern(
            pattern.to_string(),
            "pattern is empty".to_string(),
        ));
    }
    Pattern::new(pattern)
        .map(|_| ())
        .map_err(|e| WardenError::InvalidPattern(pattern.to_string(), e.to_string()))
}

fn glob_matches(pattern: &str, literal: &str) -> bool {
    // Stored patterns that no longer parse degrade to literal comparison.
    Pattern::new(pattern)
        .map(|p| p.matches(literal))
        .unwrap_or(false)
}

/// Symmetric overlap check between two path patterns.
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    a == b || glob_matches(a, b) || glob_matches(b, a)
}

/// Does `existing` block a candidate request? Deterministic and symmetric in
/// the pattern comparison; an agent never conflicts with itself, and two
/// shared leases never conflict even on identical patterns.
pub fn lease_conflicts(
    existing: &Lease,
    candidate_agent_id: i64,
    candidate_path: &str,
    candidate_exclusive: bool,
    now: DateTime<Utc>,
) -> bool {
    if !existing.is_active(now) {
        return false;
    }
    if existing.agent_id == candidate_agent_id {
        return false;
    }
    if !existing.exclusive && !candidate_exclusive {
        return false;
    }
    patterns_overlap(&existing.path_pattern, candidate_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn lease(agent_id: i64, pattern: &str, exclusive: bool) -> Lease {
        let now = Utc::now();
        Lease {
            id: 1,
            project_id: 1,
            agent_id,
            agent_name: format!("agent-{agent_id}"),
            path_pattern: pattern.into(),
            exclusive,
            reason: String::new(),
            created_ts: now,
            expires_ts: now + Duration::seconds(3600),
            released_ts: None,
        }
    }

    #[test]
    fn overlap_is_symmetric() {
        let cases = [
            ("src/*.py", "src/app.py"),
            ("src/app.py", "src/*.py"),
            ("a/*.py", "a/b*.py"),
            ("docs/*", "docs/readme.md"),
            ("same/path.rs", "same/path.rs"),
            ("x/y.rs", "z/w.rs"),
        ];
        for (a, b) in cases {
            assert_eq!(
                patterns_overlap(a, b),
                patterns_overlap(b, a),
                "asymmetric for {a} vs {b}"
            );
        }
    }

    #[test]
    fn glob_matches_literal_side() {
        assert!(patterns_overlap("src/*.py", "src/app.py"));
        assert!(patterns_overlap("src/app.py", "src/*.py"));
        assert!(patterns_overlap("src/**", "src/deep/nested.rs"));
        assert!(!patterns_overlap("src/*.py", "lib/app.py"));
    }

    #[test]
    fn identical_patterns_overlap() {
        assert!(patterns_overlap("src/*.py", "src/*.py"));
    }

    #[test]
    fn self_never_conflicts() {
        let existing = lease(1, "src/*.py", true);
        assert!(!lease_conflicts(&existing, 1, "src/*.py", true, Utc::now()));
        assert!(!lease_conflicts(&existing, 1, "src/app.py", true, Utc::now()));
    }

    #[test]
    fn shared_pair_never_conflicts() {
        let existing = lease(1, "src/*.py", false);
        assert!(!lease_conflicts(&existing, 2, "src/*.py", false, Utc::now()));
    }

    #[test]
    fn exclusive_blocks_overlapping_requests() {
        let exclusive_holder = lease(1, "src/*.py", true);
        // exclusive vs shared, shared vs exclusive, exclusive vs exclusive
        assert!(lease_conflicts(&exclusive_holder, 2, "src/app.py", false, Utc::now()));
        let shared_holder = lease(1, "src/*.py", false);
        assert!(lease_conflicts(&shared_holder, 2, "src/app.py", true, Utc::now()));
        assert!(lease_conflicts(&exclusive_holder, 2, "src/app.py", true, Utc::now()));
    }

    #[test]
    fn inactive_lease_never_conflicts() {
        let mut expired = lease(1, "src/*.py", true);
        expired.expires_ts = Utc::now() - Duration::seconds(1);
        assert!(!lease_conflicts(&expired, 2, "src/app.py", true, Utc::now()));

        let mut released = lease(1, "src/*.py", true);
        released.released_ts = Some(Utc::now());
        assert!(!lease_conflicts(&released, 2, "src/app.py", true, Utc::now()));
    }

    #[test]
    fn validate_rejects_empty_and_malformed() {
        assert!(validate_pattern("src/*.py").is_ok());
        assert!(validate_pattern("").is_err());
        assert!(validate_pattern("   ").is_err());
        assert!(validate_pattern("src/[unclosed").is_err());
    }
}
