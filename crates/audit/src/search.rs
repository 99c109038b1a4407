//! Filtered read access to audit history.

use chrono::{DateTime, Utc};

use crate::{AuditEvent, AuditEventType};

/// Default number of events returned by a search.
pub const DEFAULT_SEARCH_LIMIT: usize = 100;

/// Filters applied to a search; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    pub event_type: Option<AuditEventType>,
    pub principal_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl SearchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn event_type(mut self, event_type: AuditEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    #[must_use]
    pub fn principal(mut self, principal_id: impl Into<String>) -> Self {
        self.principal_id = Some(principal_id.into());
        self
    }

    #[must_use]
    pub fn since(mut self, at: DateTime<Utc>) -> Self {
        self.since = Some(at);
        self
    }

    #[must_use]
    pub fn until(mut self, at: DateTime<Utc>) -> Self {
        self.until = Some(at);
        self
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.event_type.is_none_or(|t| t == event.event_type)
            && self
                .principal_id
                .as_deref()
                .is_none_or(|p| event.principal_id.as_deref() == Some(p))
            && self.since.is_none_or(|at| event.timestamp >= at)
            && self.until.is_none_or(|at| event.timestamp <= at)
    }
}

/// Result shaping for a search.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    pub newest_first: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_SEARCH_LIMIT,
            newest_first: false,
        }
    }
}

impl SearchOptions {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }
}
