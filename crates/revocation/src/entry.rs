use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How long a revocation stays in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationExpiry {
    Permanent,
    /// Revoked until this instant. Typically the natural expiry of the
    /// revoked credential, after which the entry is no longer needed.
    Until(DateTime<Utc>),
}

impl RevocationExpiry {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent)
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Permanent => true,
            Self::Until(at) => now < *at,
        }
    }

    /// Combine two revocations of the same id. Permanent wins, otherwise the
    /// later expiry is kept. Commutative and idempotent.
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Permanent, _) | (_, Self::Permanent) => Self::Permanent,
            (Self::Until(a), Self::Until(b)) => Self::Until(a.max(b)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationEntry {
    pub id: String,
    pub expiry: RevocationExpiry,
}

impl RevocationEntry {
    pub fn permanent(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            expiry: RevocationExpiry::Permanent,
        }
    }

    pub fn until(id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            expiry: RevocationExpiry::Until(at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn permanent_wins_merge() {
        let later = RevocationExpiry::Until(Utc::now() + Duration::hours(1));
        assert_eq!(later.merge(RevocationExpiry::Permanent), RevocationExpiry::Permanent);
        assert_eq!(RevocationExpiry::Permanent.merge(later), RevocationExpiry::Permanent);
    }

    #[test]
    fn later_expiry_wins_merge() {
        let now = Utc::now();
        let soon = RevocationExpiry::Until(now + Duration::minutes(1));
        let later = RevocationExpiry::Until(now + Duration::hours(1));
        assert_eq!(soon.merge(later), later);
        assert_eq!(later.merge(soon), later);
        assert_eq!(later.merge(later), later);
    }

    #[test]
    fn temporary_entry_lapses() {
        let now = Utc::now();
        let expiry = RevocationExpiry::Until(now);
        assert!(expiry.is_active_at(now - Duration::seconds(1)));
        assert!(!expiry.is_active_at(now));
        assert!(RevocationExpiry::Permanent.is_active_at(now + Duration::days(365)));
    }

    #[test]
    fn entry_serializes_with_snake_case_expiry() {
        let json = serde_json::to_value(RevocationEntry::permanent("cap_1")).unwrap();
        assert_eq!(json, serde_json::json!({ "id": "cap_1", "expiry": "permanent" }));
    }
}
