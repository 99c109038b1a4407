//! Typed constraint sets and the narrowing rules used by delegation.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Operation, ResourcePattern};

/// The kinds of restriction a [`ConstraintSet`] can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    Paths,
    Operations,
    Extensions,
    TimeWindow,
    RateLimit,
    MaxDelegations,
    ExpiresAt,
}

impl ConstraintKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paths => "paths",
            Self::Operations => "operations",
            Self::Extensions => "extensions",
            Self::TimeWindow => "time_window",
            Self::RateLimit => "rate_limit",
            Self::MaxDelegations => "max_delegations",
            Self::ExpiresAt => "expires_at",
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Daily window of UTC hours, `[start_hour, end_hour)`.
///
/// A window with `start_hour > end_hour` wraps past midnight; equal bounds
/// cover the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl TimeWindow {
    pub fn new(start_hour: u8, end_hour: u8) -> Self {
        Self {
            start_hour: start_hour % 24,
            end_hour: end_hour % 24,
        }
    }

    pub fn contains_hour(&self, hour: u8) -> bool {
        let (start, end) = (self.start_hour, self.end_hour);
        if start == end {
            true
        } else if start < end {
            (start..end).contains(&hour)
        } else {
            hour >= start || hour < end
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.contains_hour(at.hour() as u8)
    }

    /// Whether every hour of `other` also falls inside `self`.
    pub fn covers(&self, other: &TimeWindow) -> bool {
        (0..24u8)
            .filter(|h| other.contains_hour(*h))
            .all(|h| self.contains_hour(h))
    }
}

/// At most `max_requests` uses in any `per_secs` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_requests: u32,
    pub per_secs: u64,
}

impl RateLimit {
    pub fn new(max_requests: u32, per_secs: u64) -> Self {
        Self {
            max_requests,
            per_secs,
        }
    }

    /// Whether `other` allows neither a larger burst nor a higher rate.
    pub fn covers(&self, other: &RateLimit) -> bool {
        other.max_requests <= self.max_requests
            && u128::from(other.max_requests) * u128::from(self.per_secs)
                <= u128::from(self.max_requests) * u128::from(other.per_secs)
    }
}

/// A capability's restrictions. `None` means the kind is unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<ResourcePattern>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<BTreeSet<Operation>>,

    /// Lowercase file extensions without the leading dot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<BTreeSet<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,

    /// How many further delegation hops are allowed below this holder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delegations: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// A constraint check failed for a concrete request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Denial {
    #[error("operation '{0}' is not permitted")]
    OperationNotPermitted(Operation),

    #[error("resource '{0}' is not permitted")]
    ResourceNotPermitted(String),

    #[error("extension of '{0}' is not allowed")]
    ExtensionNotAllowed(String),

    #[error("request falls outside the allowed time window")]
    OutsideTimeWindow,

    #[error("rate limit of {max_requests} per {per_secs}s exceeded")]
    RateLimited { max_requests: u32, per_secs: u64 },
}

impl Denial {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::OperationNotPermitted(_) => "operation_not_permitted",
            Self::ResourceNotPermitted(_) => "resource_not_permitted",
            Self::ExtensionNotAllowed(_) => "extension_not_allowed",
            Self::OutsideTimeWindow => "outside_time_window",
            Self::RateLimited { .. } => "rate_limited",
        }
    }
}

/// A delegation tried to grant more than the parent holds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("delegation would widen the {kind} constraint: {detail}")]
pub struct Widening {
    pub kind: ConstraintKind,
    pub detail: String,
}

impl Widening {
    fn new(kind: ConstraintKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ResourcePattern>,
    {
        self.paths = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_operations<I, O>(mut self, operations: I) -> Self
    where
        I: IntoIterator<Item = O>,
        O: Into<Operation>,
    {
        self.operations = Some(operations.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions = Some(
            extensions
                .into_iter()
                .map(|e| normalize_extension(e.as_ref()))
                .collect(),
        );
        self
    }

    #[must_use]
    pub fn with_time_window(mut self, window: TimeWindow) -> Self {
        self.time_window = Some(window);
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_max_delegations(mut self, max: u32) -> Self {
        self.max_delegations = Some(max);
        self
    }

    #[must_use]
    pub fn with_expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Check a concrete request against the stateless constraints.
    ///
    /// Expiry and rate limits are enforced by the caller, which owns the
    /// clock and the usage counters.
    pub fn permits(
        &self,
        operation: &Operation,
        resource: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Denial> {
        if matches!(&self.operations, Some(ops) if !ops.contains(operation)) {
            return Err(Denial::OperationNotPermitted(operation.clone()));
        }

        if matches!(&self.paths, Some(paths) if !paths.iter().any(|p| p.matches(resource))) {
            return Err(Denial::ResourceNotPermitted(resource.to_string()));
        }

        if let Some(extensions) = &self.extensions {
            let allowed = extension_of(resource).is_some_and(|ext| extensions.contains(&ext));
            if !allowed {
                return Err(Denial::ExtensionNotAllowed(resource.to_string()));
            }
        }

        if matches!(&self.time_window, Some(window) if !window.contains(now)) {
            return Err(Denial::OutsideTimeWindow);
        }

        Ok(())
    }

    /// Derive the constraints of a child delegated with `extra`.
    ///
    /// Every kind set in `extra` must be at least as strict as the parent's.
    /// The child's delegation budget is one less than the parent's, and its
    /// expiry is clamped to the parent's.
    pub fn narrow(&self, extra: &ConstraintSet) -> Result<ConstraintSet, Widening> {
        let paths = match (&self.paths, &extra.paths) {
            (Some(parent), Some(child)) => {
                if let Some(wider) = child.iter().find(|c| !parent.iter().any(|p| p.covers(c))) {
                    return Err(Widening::new(
                        ConstraintKind::Paths,
                        format!("'{wider}' is not covered by the parent's paths"),
                    ));
                }
                Some(child.clone())
            }
            (parent, child) => child.clone().or_else(|| parent.clone()),
        };

        let operations = narrow_set(&self.operations, &extra.operations, ConstraintKind::Operations)?;
        let extensions = narrow_set(&self.extensions, &extra.extensions, ConstraintKind::Extensions)?;

        let time_window = match (self.time_window, extra.time_window) {
            (Some(parent), Some(child)) if !parent.covers(&child) => {
                return Err(Widening::new(
                    ConstraintKind::TimeWindow,
                    format!(
                        "{}..{} is outside {}..{}",
                        child.start_hour, child.end_hour, parent.start_hour, parent.end_hour
                    ),
                ));
            }
            (parent, child) => child.or(parent),
        };

        let rate_limit = match (self.rate_limit, extra.rate_limit) {
            (Some(parent), Some(child)) if !parent.covers(&child) => {
                return Err(Widening::new(
                    ConstraintKind::RateLimit,
                    format!(
                        "{}/{}s exceeds {}/{}s",
                        child.max_requests, child.per_secs, parent.max_requests, parent.per_secs
                    ),
                ));
            }
            (parent, child) => child.or(parent),
        };

        let remaining = self.max_delegations.map(|m| m.saturating_sub(1));
        let max_delegations = match (remaining, extra.max_delegations) {
            (Some(budget), Some(requested)) if requested > budget => {
                return Err(Widening::new(
                    ConstraintKind::MaxDelegations,
                    format!("{requested} exceeds the remaining budget of {budget}"),
                ));
            }
            (budget, requested) => requested.or(budget),
        };

        let expires_at = match (self.expires_at, extra.expires_at) {
            (Some(parent), Some(child)) => Some(parent.min(child)),
            (parent, child) => parent.or(child),
        };

        Ok(ConstraintSet {
            paths,
            operations,
            extensions,
            time_window,
            rate_limit,
            max_delegations,
            expires_at,
        })
    }

    /// Whether `self` grants nothing beyond `parent`.
    pub fn is_subset_of(&self, parent: &ConstraintSet) -> bool {
        let paths = match (&parent.paths, &self.paths) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(p), Some(c)) => c.iter().all(|c| p.iter().any(|p| p.covers(c))),
        };
        let operations = subset(&parent.operations, &self.operations);
        let extensions = subset(&parent.extensions, &self.extensions);
        let time_window = match (parent.time_window, self.time_window) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(p), Some(c)) => p.covers(&c),
        };
        let rate_limit = match (parent.rate_limit, self.rate_limit) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(p), Some(c)) => p.covers(&c),
        };
        let max_delegations = match (parent.max_delegations, self.max_delegations) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(p), Some(c)) => c <= p,
        };
        let expires_at = match (parent.expires_at, self.expires_at) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(p), Some(c)) => c <= p,
        };

        paths && operations && extensions && time_window && rate_limit && max_delegations && expires_at
    }
}

fn narrow_set<T>(
    parent: &Option<BTreeSet<T>>,
    child: &Option<BTreeSet<T>>,
    kind: ConstraintKind,
) -> Result<Option<BTreeSet<T>>, Widening>
where
    T: Ord + Clone + fmt::Display,
{
    match (parent, child) {
        (Some(parent), Some(child)) => {
            if let Some(extra) = child.difference(parent).next() {
                return Err(Widening::new(kind, format!("'{extra}' is not held by the parent")));
            }
            Ok(Some(child.clone()))
        }
        (parent, child) => Ok(child.clone().or_else(|| parent.clone())),
    }
}

fn subset<T: Ord>(parent: &Option<BTreeSet<T>>, child: &Option<BTreeSet<T>>) -> bool {
    match (parent, child) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(p), Some(c)) => c.is_subset(p),
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim_start_matches('.').to_ascii_lowercase()
}

fn extension_of(resource: &str) -> Option<String> {
    let name = resource.rsplit('/').next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(normalize_extension(ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap()
    }

    fn tmp_read() -> ConstraintSet {
        ConstraintSet::new()
            .with_paths(["/tmp/**"])
            .with_operations(["read", "write"])
            .with_max_delegations(2)
            .with_expires_at(noon() + Duration::hours(1))
    }

    #[test]
    fn permits_checks_operation_then_resource() {
        let c = ConstraintSet::new().with_paths(["/tmp/**"]).with_operations(["read"]);
        assert!(c.permits(&Operation::read(), "/tmp/a/b.txt", noon()).is_ok());
        assert_eq!(
            c.permits(&Operation::write(), "/tmp/a/b.txt", noon()).unwrap_err().reason(),
            "operation_not_permitted"
        );
        assert_eq!(
            c.permits(&Operation::read(), "/etc/passwd", noon()).unwrap_err().reason(),
            "resource_not_permitted"
        );
    }

    #[test]
    fn extension_allowlist_is_case_insensitive() {
        let c = ConstraintSet::new().with_extensions([".TXT", "md"]);
        assert!(c.permits(&Operation::read(), "/tmp/notes.txt", noon()).is_ok());
        assert!(c.permits(&Operation::read(), "/tmp/README.MD", noon()).is_ok());
        let err = c.permits(&Operation::read(), "/tmp/run.sh", noon()).unwrap_err();
        assert_eq!(err.reason(), "extension_not_allowed");
        assert!(c.permits(&Operation::read(), "/tmp/.bashrc", noon()).is_err());
    }

    #[test]
    fn time_window_wraps_midnight() {
        let night = TimeWindow::new(22, 6);
        assert!(night.contains_hour(23));
        assert!(night.contains_hour(3));
        assert!(!night.contains_hour(12));
        assert!(TimeWindow::new(0, 0).contains_hour(12));

        let c = ConstraintSet::new().with_time_window(night);
        assert_eq!(
            c.permits(&Operation::read(), "x", noon()).unwrap_err(),
            Denial::OutsideTimeWindow
        );
    }

    #[test]
    fn narrow_intersects_and_decrements_budget() {
        let child = tmp_read()
            .narrow(&ConstraintSet::new().with_operations(["read"]))
            .unwrap();
        assert_eq!(child.operations, Some(["read".into()].into_iter().collect()));
        assert_eq!(child.paths, tmp_read().paths);
        assert_eq!(child.max_delegations, Some(1));
        assert!(child.is_subset_of(&tmp_read()));
    }

    #[test]
    fn narrow_clamps_expiry_to_parent() {
        let later = noon() + Duration::days(3);
        let child = tmp_read()
            .narrow(&ConstraintSet::new().with_expires_at(later))
            .unwrap();
        assert_eq!(child.expires_at, tmp_read().expires_at);

        let sooner = noon() + Duration::minutes(5);
        let child = tmp_read()
            .narrow(&ConstraintSet::new().with_expires_at(sooner))
            .unwrap();
        assert_eq!(child.expires_at, Some(sooner));
    }

    #[test]
    fn narrow_rejects_widening() {
        let parent = tmp_read();

        let err = parent
            .narrow(&ConstraintSet::new().with_operations(["read", "execute"]))
            .unwrap_err();
        assert_eq!(err.kind, ConstraintKind::Operations);

        let err = parent
            .narrow(&ConstraintSet::new().with_paths(["/etc/**"]))
            .unwrap_err();
        assert_eq!(err.kind, ConstraintKind::Paths);

        let err = parent
            .narrow(&ConstraintSet::new().with_max_delegations(5))
            .unwrap_err();
        assert_eq!(err.kind, ConstraintKind::MaxDelegations);
    }

    #[test]
    fn narrow_rejects_wider_rate_and_window() {
        let parent = ConstraintSet::new()
            .with_rate_limit(RateLimit::new(10, 60))
            .with_time_window(TimeWindow::new(9, 17));

        assert!(parent
            .narrow(&ConstraintSet::new().with_rate_limit(RateLimit::new(5, 60)))
            .is_ok());
        let err = parent
            .narrow(&ConstraintSet::new().with_rate_limit(RateLimit::new(10, 30)))
            .unwrap_err();
        assert_eq!(err.kind, ConstraintKind::RateLimit);

        assert!(parent
            .narrow(&ConstraintSet::new().with_time_window(TimeWindow::new(10, 12)))
            .is_ok());
        let err = parent
            .narrow(&ConstraintSet::new().with_time_window(TimeWindow::new(8, 12)))
            .unwrap_err();
        assert_eq!(err.kind, ConstraintKind::TimeWindow);
    }

    #[test]
    fn unrestricted_parent_accepts_any_restriction() {
        let child = ConstraintSet::new()
            .narrow(&ConstraintSet::new().with_extensions(["rs"]))
            .unwrap();
        assert_eq!(child.extensions, Some(["rs".to_string()].into_iter().collect()));
        assert!(!ConstraintSet::new().is_subset_of(&child));
    }

    #[test]
    fn serializes_only_set_kinds() {
        let json = serde_json::to_value(ConstraintSet::new().with_operations(["read"])).unwrap();
        assert_eq!(json, serde_json::json!({ "operations": ["read"] }));
    }
}
