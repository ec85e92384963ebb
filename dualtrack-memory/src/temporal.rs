//! Access and lifecycle timestamps for memory records
//!
//! Tracks creation, mutation, and access history. The rolling window of
//! recent accesses drives frequency-based promotion; `below_floor_since`
//! drives forgetting.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Upper bound on remembered access timestamps per record
const MAX_RECENT_ACCESSES: usize = 64;

/// Timestamps and counters attached to every memory record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalMetadata {
    /// When the record was created
    pub created_at: DateTime<Utc>,

    /// Last content, metadata, or relation change
    pub updated_at: DateTime<Utc>,

    /// Last read through the public API
    pub last_accessed_at: DateTime<Utc>,

    /// Total number of accesses since creation
    pub access_count: u64,

    /// Point in time the stored strength value was computed for
    pub strength_updated_at: DateTime<Utc>,

    /// Access timestamps inside the promotion window, oldest first
    pub recent_accesses: VecDeque<DateTime<Utc>>,

    /// When strength first dropped under the forgetting floor
    pub below_floor_since: Option<DateTime<Utc>>,
}

impl TemporalMetadata {
    /// Metadata for a record created now
    pub fn new_current() -> Self {
        Self::new_at(Utc::now())
    }

    /// Metadata for a record created at `now`
    pub fn new_at(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            access_count: 0,
            strength_updated_at: now,
            recent_accesses: VecDeque::new(),
            below_floor_since: None,
        }
    }

    /// Record one access at `now`, forgetting accesses older than `window`
    pub fn record_access(&mut self, now: DateTime<Utc>, window: Duration) {
        self.access_count += 1;
        if now > self.last_accessed_at {
            self.last_accessed_at = now;
        }
        self.recent_accesses.push_back(now);
        self.prune(now, window);
        while self.recent_accesses.len() > MAX_RECENT_ACCESSES {
            self.recent_accesses.pop_front();
        }
        self.below_floor_since = None;
    }

    /// Number of accesses in `(now - window, now]`
    pub fn accesses_within(&self, now: DateTime<Utc>, window: Duration) -> usize {
        let since = now - window;
        self.recent_accesses
            .iter()
            .filter(|t| **t > since && **t <= now)
            .count()
    }

    /// Mark the record as mutated
    pub fn touch_updated(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Check whether `created_at` falls in the optional half-open range
    pub fn created_between(
        &self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> bool {
        let after_ok = after.map_or(true, |a| self.created_at >= a);
        let before_ok = before.map_or(true, |b| self.created_at < b);
        after_ok && before_ok
    }

    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let since = now - window;
        while let Some(front) = self.recent_accesses.front() {
            if *front <= since {
                self.recent_accesses.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for TemporalMetadata {
    fn default() -> Self {
        Self::new_current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_current() {
        let meta = TemporalMetadata::new_current();
        assert_eq!(meta.access_count, 0);
        assert_eq!(meta.created_at, meta.last_accessed_at);
        assert!(meta.below_floor_since.is_none());
    }

    #[test]
    fn test_access_window() {
        let t0 = Utc::now();
        let mut meta = TemporalMetadata::new_at(t0);
        let window = Duration::minutes(10);

        meta.record_access(t0 + Duration::minutes(1), window);
        meta.record_access(t0 + Duration::minutes(2), window);
        meta.record_access(t0 + Duration::minutes(20), window);

        assert_eq!(meta.access_count, 3);
        assert_eq!(meta.accesses_within(t0 + Duration::minutes(20), window), 1);
        assert_eq!(meta.recent_accesses.len(), 1);
        assert_eq!(meta.last_accessed_at, t0 + Duration::minutes(20));
    }

    #[test]
    fn test_access_clears_floor_clock() {
        let t0 = Utc::now();
        let mut meta = TemporalMetadata::new_at(t0);
        meta.below_floor_since = Some(t0);
        meta.record_access(t0 + Duration::seconds(1), Duration::hours(1));
        assert!(meta.below_floor_since.is_none());
    }

    #[test]
    fn test_created_between() {
        let t0 = Utc::now();
        let meta = TemporalMetadata::new_at(t0);
        assert!(meta.created_between(None, None));
        assert!(meta.created_between(Some(t0), Some(t0 + Duration::seconds(1))));
        assert!(!meta.created_between(Some(t0 + Duration::seconds(1)), None));
        assert!(!meta.created_between(None, Some(t0)));
    }
}
