//! Time-windowed deduplication
//!
//! Tracks `HashKey -> last seen` for every admitted point. Thread-safe
//! using a parking_lot mutex; lock acquisition is bounded and a timeout
//! admits the point instead of dropping it.
//!
//! # Memory Behavior
//!
//! `admit` never removes entries. The cache janitor calls [`Deduplicator::sweep`]
//! periodically to drop expired hashes and enforce `max_entries`, so memory
//! may grow between sweeps.

use crate::error::SourceError;
use crate::point::{DataPoint, HashKey};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// How long `admit` waits for the cache lock before failing open
const LOCK_TIMEOUT: Duration = Duration::from_millis(5);

/// Result of offering a point to the deduplicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting within the window (or the cache was unavailable)
    Accepted,
    /// Same hash seen within the freshness window
    Duplicate,
}

/// What a sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Entries older than the freshness window
    pub expired: usize,
    /// Entries evicted to honour `max_entries`
    pub evicted: usize,
    /// Entries left after the sweep
    pub remaining: usize,
}

/// Hash-and-time-window filter
pub struct Deduplicator {
    /// Hash -> last seen time
    seen: Mutex<HashMap<HashKey, Instant>>,
    /// Points with the same hash inside this window are duplicates
    freshness_window: Duration,
    /// Timestamp rounding applied before hashing
    granularity: Duration,
    /// Sweeps trim the cache to this many entries
    max_entries: usize,
    admitted: AtomicU64,
    duplicates: AtomicU64,
    fail_open: AtomicU64,
}

impl Deduplicator {
    /// Create a deduplicator with the given window and a 1s hash granularity
    pub fn new(freshness_window: Duration) -> Self {
        Self::with_limits(freshness_window, Duration::from_secs(1), 100_000)
    }

    /// Create a deduplicator with every parameter specified
    pub fn with_limits(freshness_window: Duration, granularity: Duration, max_entries: usize) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            freshness_window,
            granularity,
            max_entries,
            admitted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            fail_open: AtomicU64::new(0),
        }
    }

    /// Offer a point
    pub fn admit(&self, point: &DataPoint) -> Admission {
        self.admit_at(point.hash_key(self.granularity), Instant::now())
    }

    /// Offer a precomputed key at an explicit instant
    ///
    /// If the cache lock cannot be taken within a few milliseconds the key
    /// is admitted without being recorded.
    pub fn admit_at(&self, key: HashKey, now: Instant) -> Admission {
        let mut seen = match self.lock_seen() {
            Ok(seen) => seen,
            Err(e) => {
                self.fail_open.fetch_add(1, Ordering::Relaxed);
                warn!(hash = %key, error = %e, "Admitting point without dedup");
                return Admission::Accepted;
            }
        };

        let fresh = seen
            .get(&key)
            .is_some_and(|last_seen| now.saturating_duration_since(*last_seen) < self.freshness_window);
        if fresh {
            drop(seen);
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return Admission::Duplicate;
        }

        // New or expired - record and allow
        seen.insert(key, now);
        drop(seen);
        self.admitted.fetch_add(1, Ordering::Relaxed);
        Admission::Accepted
    }

    /// Remove expired entries, then evict oldest entries above `max_entries`
    pub fn sweep(&self, now: Instant) -> SweepStats {
        let mut seen = self.seen.lock();

        let before = seen.len();
        let window = self.freshness_window;
        seen.retain(|_, last_seen| now.saturating_duration_since(*last_seen) < window);
        let expired = before - seen.len();

        let mut evicted = 0;
        if seen.len() > self.max_entries {
            let excess = seen.len() - self.max_entries;
            let mut by_age: Vec<(HashKey, Instant)> = seen.iter().map(|(k, t)| (*k, *t)).collect();
            by_age.sort_unstable_by_key(|(_, t)| *t);
            for (key, _) in by_age.into_iter().take(excess) {
                seen.remove(&key);
                evicted += 1;
            }
        }

        SweepStats {
            expired,
            evicted,
            remaining: seen.len(),
        }
    }

    /// Get current number of tracked hashes
    ///
    /// Returns a snapshot at the time of the call. The value may change
    /// immediately after due to concurrent access.
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// Check if the cache is currently empty
    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    /// Total points admitted
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Total duplicates rejected
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Total points admitted because the cache was unavailable
    pub fn fail_open_count(&self) -> u64 {
        self.fail_open.load(Ordering::Relaxed)
    }

    pub fn freshness_window(&self) -> Duration {
        self.freshness_window
    }

    fn lock_seen(&self) -> Result<MutexGuard<'_, HashMap<HashKey, Instant>>, SourceError> {
        self.seen.try_lock_for(LOCK_TIMEOUT).ok_or_else(|| {
            SourceError::DedupCache(format!("lock not acquired within {LOCK_TIMEOUT:?}"))
        })
    }

    pub fn granularity(&self) -> Duration {
        self.granularity
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::point::{DataType, Priority};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn point(n: i64) -> DataPoint {
        DataPoint::new(
            "ticks",
            DataType::MarketData,
            Priority::High,
            Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        )
        .with_symbol("AAPL")
        .with_field("seq", n)
    }

    fn key(n: i64) -> HashKey {
        point(n).hash_key(Duration::from_secs(1))
    }

    #[test]
    fn test_first_point_accepted() {
        let dedup = Deduplicator::new(Duration::from_secs(60));
        assert_eq!(dedup.admit(&point(1)), Admission::Accepted);
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_duplicate_within_window() {
        let dedup = Deduplicator::new(Duration::from_secs(60));

        assert_eq!(dedup.admit(&point(1)), Admission::Accepted);
        assert_eq!(dedup.admit(&point(1)), Admission::Duplicate);
        assert_eq!(dedup.admit(&point(2)), Admission::Accepted);

        assert_eq!(dedup.admitted(), 2);
        assert_eq!(dedup.duplicates(), 1);
    }

    #[test]
    fn test_expired_passes_again() {
        let dedup = Deduplicator::new(Duration::from_secs(300));
        let t0 = Instant::now();

        assert_eq!(dedup.admit_at(key(1), t0), Admission::Accepted);
        assert_eq!(
            dedup.admit_at(key(1), t0 + Duration::from_secs(299)),
            Admission::Duplicate
        );
        assert_eq!(
            dedup.admit_at(key(1), t0 + Duration::from_secs(300)),
            Admission::Accepted
        );
    }

    #[test]
    fn test_accept_refreshes_timestamp() {
        let dedup = Deduplicator::new(Duration::from_secs(10));
        let t0 = Instant::now();

        dedup.admit_at(key(1), t0);
        // Expired at t0+10, re-admitted and refreshed
        dedup.admit_at(key(1), t0 + Duration::from_secs(10));
        assert_eq!(
            dedup.admit_at(key(1), t0 + Duration::from_secs(15)),
            Admission::Duplicate
        );
    }

    #[test]
    fn test_sweep_expires_old_entries() {
        let dedup = Deduplicator::new(Duration::from_secs(10));
        let t0 = Instant::now();

        for n in 0..5 {
            dedup.admit_at(key(n), t0);
        }
        for n in 5..8 {
            dedup.admit_at(key(n), t0 + Duration::from_secs(8));
        }

        let stats = dedup.sweep(t0 + Duration::from_secs(12));
        assert_eq!(stats.expired, 5);
        assert_eq!(stats.evicted, 0);
        assert_eq!(stats.remaining, 3);
    }

    #[test]
    fn test_sweep_evicts_oldest_above_cap() {
        let dedup = Deduplicator::with_limits(Duration::from_secs(600), Duration::from_secs(1), 3);
        let t0 = Instant::now();

        for n in 0..6 {
            dedup.admit_at(key(n), t0 + Duration::from_secs(n as u64));
        }

        let stats = dedup.sweep(t0 + Duration::from_secs(10));
        assert_eq!(stats.expired, 0);
        assert_eq!(stats.evicted, 3);
        assert_eq!(dedup.len(), 3);

        // The three newest survive
        let later = t0 + Duration::from_secs(11);
        assert_eq!(dedup.admit_at(key(5), later), Admission::Duplicate);
        assert_eq!(dedup.admit_at(key(0), later), Admission::Accepted);
    }

    #[test]
    fn test_fail_open_when_cache_locked() {
        let dedup = Deduplicator::new(Duration::from_secs(60));
        dedup.admit(&point(1));

        let guard = dedup.seen.lock();
        assert!(matches!(dedup.lock_seen(), Err(SourceError::DedupCache(_))));
        assert_eq!(dedup.admit(&point(1)), Admission::Accepted);
        drop(guard);

        assert_eq!(dedup.fail_open_count(), 1);
        assert_eq!(dedup.admit(&point(1)), Admission::Duplicate);
    }

    #[test]
    fn test_dedup_concurrent() {
        use std::thread;

        let dedup = Arc::new(Deduplicator::new(Duration::from_secs(60)));
        let mut handles = vec![];

        // Multiple threads offering the same point
        for _ in 0..10 {
            let dedup = Arc::clone(&dedup);
            handles.push(thread::spawn(move || dedup.admit(&point(7))));
        }

        let results: Vec<Admission> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Exactly one should be accepted
        let accepted = results.iter().filter(|r| **r == Admission::Accepted).count();
        assert_eq!(accepted, 1, "expected exactly 1 accepted, got {}", accepted);
    }
}
