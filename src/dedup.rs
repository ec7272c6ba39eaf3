//! Duplicate-frame suppression over a sliding time window.
//!
//! [`DedupCache`] remembers a content hash for every frame it has seen in
//! the last `period`. A frame whose hash was inserted within the window is
//! reported as [`PacketStatus::Duplicate`] and dropped by the router before
//! routing. Every router instance owns its own cache, so routers in the
//! same process never contend and one instance's traffic cannot evict
//! another's entries.
//!
//! Expired entries are evicted on the way in: a FIFO queue of
//! `(insertion-time, hash)` pairs is drained from the front until only
//! in-window entries remain, keeping eviction O(expired) per check.

use ahash::AHasher;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// Outcome of a dedup check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    /// First sighting within the window; the hash was recorded.
    New,
    /// An identical payload was seen within the window.
    Duplicate,
}

struct DedupInner {
    period: Duration,
    start: Instant,
    /// FIFO of (milliseconds-since-start, hash), oldest first.
    queue: VecDeque<(u64, u64)>,
    seen: HashSet<u64, ahash::RandomState>,
}

/// Sliding-window duplicate detector. All operations are a single critical
/// section under one mutex; a zero period short-circuits without touching
/// the structures.
pub struct DedupCache {
    inner: Mutex<DedupInner>,
}

#[inline]
fn payload_hash(payload: &[u8]) -> u64 {
    let mut hasher = AHasher::default();
    payload.hash(&mut hasher);
    hasher.finish()
}

impl DedupCache {
    /// Creates a cache with the given window. `Duration::ZERO` disables
    /// deduplication entirely.
    pub fn new(period: Duration) -> Self {
        Self {
            inner: Mutex::new(DedupInner {
                period,
                start: Instant::now(),
                queue: VecDeque::new(),
                seen: HashSet::with_hasher(ahash::RandomState::new()),
            }),
        }
    }

    /// Changes the window. A zero period clears the recorded state.
    pub fn set_period(&self, period: Duration) {
        let mut inner = self.inner.lock();
        inner.period = period;
        if period.is_zero() {
            inner.queue.clear();
            inner.seen.clear();
        }
    }

    /// Checks a payload against the window and records it when new.
    pub fn check_packet(&self, payload: &[u8]) -> PacketStatus {
        let mut inner = self.inner.lock();
        if inner.period.is_zero() {
            return PacketStatus::New;
        }

        let now_ms = inner.start.elapsed().as_millis() as u64;
        let period_ms = inner.period.as_millis() as u64;

        // Evict everything that fell out of the window
        while let Some(&(inserted_ms, hash)) = inner.queue.front() {
            if now_ms > inserted_ms + period_ms {
                inner.seen.remove(&hash);
                inner.queue.pop_front();
            } else {
                break;
            }
        }

        let hash = payload_hash(payload);
        if inner.seen.contains(&hash) {
            return PacketStatus::Duplicate;
        }

        inner.seen.insert(hash);
        inner.queue.push_back((now_ms, hash));
        PacketStatus::New
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_new_then_duplicate_then_expired() {
        let cache = DedupCache::new(Duration::from_millis(100));
        let payload = b"payload";

        assert_eq!(cache.check_packet(payload), PacketStatus::New);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.check_packet(payload), PacketStatus::Duplicate);

        // Past the window the same payload is new again
        thread::sleep(Duration::from_millis(160));
        assert_eq!(cache.check_packet(payload), PacketStatus::New);
    }

    #[test]
    fn test_distinct_payloads_are_independent() {
        let cache = DedupCache::new(Duration::from_millis(500));

        assert_eq!(cache.check_packet(b"one"), PacketStatus::New);
        assert_eq!(cache.check_packet(b"two"), PacketStatus::New);
        assert_eq!(cache.check_packet(b"one"), PacketStatus::Duplicate);
        assert_eq!(cache.check_packet(b"two"), PacketStatus::Duplicate);
    }

    #[test]
    fn test_zero_period_bypasses_cache() {
        let cache = DedupCache::new(Duration::ZERO);
        let payload = b"same";

        assert_eq!(cache.check_packet(payload), PacketStatus::New);
        assert_eq!(cache.check_packet(payload), PacketStatus::New);
    }

    #[test]
    fn test_set_period_zero_clears_state() {
        let cache = DedupCache::new(Duration::from_secs(10));
        assert_eq!(cache.check_packet(b"x"), PacketStatus::New);
        assert_eq!(cache.check_packet(b"x"), PacketStatus::Duplicate);

        cache.set_period(Duration::ZERO);
        assert_eq!(cache.check_packet(b"x"), PacketStatus::New);

        // Re-enabling starts from an empty window
        cache.set_period(Duration::from_secs(10));
        assert_eq!(cache.check_packet(b"x"), PacketStatus::New);
        assert_eq!(cache.check_packet(b"x"), PacketStatus::Duplicate);
    }

    #[test]
    fn test_eviction_is_exact_at_window_edge() {
        let cache = DedupCache::new(Duration::from_millis(40));
        assert_eq!(cache.check_packet(b"edge"), PacketStatus::New);

        // Still within (t - period, t]
        thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.check_packet(b"edge"), PacketStatus::Duplicate);

        thread::sleep(Duration::from_millis(80));
        assert_eq!(cache.check_packet(b"edge"), PacketStatus::New);
    }
}
