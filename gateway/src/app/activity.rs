//! Last-seen activity per domain.

use core::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};

use super::clock::Now;

/// Records the most recent activity of every domain.
///
/// Values only ever move forward; a record older than the stored one is dropped.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    last: DashMap<String, Now>,
}

impl ActivityTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records activity at `at`. Returns whether the stored value advanced.
    pub fn record(&self, domain: &str, at: Now) -> bool {
        match self.last.entry(domain.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().mono < at.mono {
                    entry.insert(at);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(at);
                true
            }
        }
    }

    #[must_use]
    pub fn last_activity(&self, domain: &str) -> Option<Now> {
        self.last.get(domain).map(|entry| *entry)
    }

    /// Seeds the tracker from a persisted wall-clock timestamp.
    ///
    /// The monotonic instant is derived from the age of `seen` relative to `now`.
    /// Timestamps in the future are clamped to `now`; ones older than the
    /// monotonic clock can represent are skipped.
    pub fn restore(&self, domain: &str, seen: DateTime<Utc>, now: Now) -> bool {
        let age = (now.wall - seen).to_std().unwrap_or(Duration::ZERO);
        let Some(mono) = now.mono.checked_sub(age) else {
            return false;
        };
        self.record(
            domain,
            Now {
                wall: seen.min(now.wall),
                mono,
            },
        )
    }

    pub fn forget(&self, domain: &str) {
        drop(self.last.remove(domain));
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use chrono::TimeDelta;
    use tokio::time::Instant;

    use super::*;

    fn now() -> Now {
        Now {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn older_records_are_ignored() {
        let tracker = ActivityTracker::new();
        let first = now();
        tokio::time::advance(Duration::from_secs(5)).await;
        let second = now();

        assert!(tracker.record("nas", second));
        assert!(!tracker.record("nas", first));
        assert_eq!(tracker.last_activity("nas").unwrap().mono, second.mono);
        assert!(!tracker.record("nas", second));
        assert!(tracker.last_activity("media").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_writers_keep_the_newest() {
        let tracker = Arc::new(ActivityTracker::new());
        let base = now();
        let handles: Vec<_> = (0..32_u64)
            .map(|i| {
                let tracker = tracker.clone();
                let at = Now {
                    wall: base.wall,
                    mono: base.mono + Duration::from_millis(i),
                };
                tokio::spawn(async move { tracker.record("nas", at) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(
            tracker.last_activity("nas").unwrap().mono,
            base.mono + Duration::from_millis(31)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn restore_converts_wall_age() {
        tokio::time::advance(Duration::from_secs(3600)).await;
        let tracker = ActivityTracker::new();
        let now = now();
        let seen = now.wall - TimeDelta::minutes(10);
        assert!(tracker.restore("nas", seen, now));
        let restored = tracker.last_activity("nas").unwrap();
        assert_eq!(now.mono - restored.mono, Duration::from_secs(600));
        assert_eq!(restored.wall, seen);

        tracker.forget("nas");
        assert!(tracker.last_activity("nas").is_none());
    }
}
