//! Sliding-window enforcement of [`RateLimit`] constraints.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{Denial, RateLimit};

/// Per-key sliding windows of recent uses.
///
/// Keys are usually capability or token ids. A use is recorded only when it
/// is admitted.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, key: &str, limit: &RateLimit) -> Result<(), Denial> {
        self.check_at(key, limit, Instant::now())
    }

    pub fn check_at(&self, key: &str, limit: &RateLimit, now: Instant) -> Result<(), Denial> {
        let window = Duration::from_secs(limit.per_secs);
        let mut windows = self.windows.lock();
        let uses = windows.entry(key.to_string()).or_default();

        while uses
            .front()
            .is_some_and(|first| now.saturating_duration_since(*first) >= window)
        {
            uses.pop_front();
        }

        if uses.len() >= limit.max_requests as usize {
            return Err(Denial::RateLimited {
                max_requests: limit.max_requests,
                per_secs: limit.per_secs,
            });
        }
        uses.push_back(now);
        Ok(())
    }

    pub fn forget(&self, key: &str) {
        self.windows.lock().remove(key);
    }

    /// Number of keys with recorded uses.
    pub fn tracked(&self) -> usize {
        self.windows.lock().len()
    }
}
