// =============================================================================
// KlineBuffer -- bounded per-interval ring of bars
// =============================================================================
//
// One ring per interval, keyed by open_time.  The live (unclosed) bar is
// continuously replaced in place; when a bar closes it becomes permanent and
// the ring is trimmed to capacity.
//
// Invariant: open_times are strictly increasing and only the tail may be an
// open bar.  A bar older than the tail is rejected as out-of-order rather
// than silently ignored.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use crate::error::EngineError;
use crate::market_data::Bar;

/// Thread-safe ring buffer that stores the most recent bars per interval.
pub struct KlineBuffer {
    rings: RwLock<HashMap<String, VecDeque<Bar>>>,
    capacity: usize,
}

impl KlineBuffer {
    /// Create a buffer that retains at most `capacity` closed bars per
    /// interval, plus one in-progress bar.
    pub fn new(capacity: usize) -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Insert or replace the latest bar for its interval.
    ///
    /// * `open_time == tail.open_time` — replace the tail (in-progress
    ///   update, or the closing version of the same bar).
    /// * `open_time > tail.open_time` — append; reject when the previous
    ///   tail is still open (a commit must arrive before the next bar).
    /// * `open_time < tail.open_time` — out-of-order, rejected.
    pub fn append_or_replace_last(&self, bar: Bar) -> Result<(), EngineError> {
        let mut map = self.rings.write();
        let ring = map
            .entry(bar.interval.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity + 1));

        match ring.back() {
            None => ring.push_back(bar),
            Some(tail) if bar.open_time == tail.open_time => {
                *ring.back_mut().expect("tail exists") = bar;
            }
            Some(tail) if bar.open_time > tail.open_time => {
                // A still-open tail is finalized as-is when the feed skips
                // its commit; gap repair overwrites it later.
                if !tail.closed {
                    ring.back_mut().expect("tail exists").closed = true;
                }
                ring.push_back(bar);
                while ring.len() > self.capacity {
                    ring.pop_front();
                }
            }
            Some(tail) => {
                return Err(EngineError::stale_bar(
                    &bar.interval,
                    bar.open_time,
                    tail.open_time,
                ));
            }
        }
        Ok(())
    }

    /// The most recent `n` **closed** bars for `interval`, oldest-first.
    pub fn last_closed(&self, interval: &str, n: usize) -> Vec<Bar> {
        let map = self.rings.read();
        match map.get(interval) {
            Some(ring) => {
                let closed: Vec<&Bar> = ring.iter().filter(|b| b.closed).collect();
                let start = closed.len().saturating_sub(n);
                closed[start..].iter().map(|b| (*b).clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// Look up a bar by open_time.  The ring is ordered, so this is a
    /// binary search.
    pub fn get(&self, interval: &str, open_time: i64) -> Option<Bar> {
        let map = self.rings.read();
        let ring = map.get(interval)?;
        let idx = ring
            .binary_search_by_key(&open_time, |b| b.open_time)
            .ok()?;
        ring.get(idx).cloned()
    }

    /// Open time of the newest bar for `interval`, if any.
    pub fn tail_open_time(&self, interval: &str) -> Option<i64> {
        let map = self.rings.read();
        map.get(interval).and_then(|r| r.back().map(|b| b.open_time))
    }

    /// Open time of the newest **closed** bar for `interval`, if any.
    pub fn last_closed_open_time(&self, interval: &str) -> Option<i64> {
        let map = self.rings.read();
        map.get(interval)
            .and_then(|r| r.iter().rev().find(|b| b.closed).map(|b| b.open_time))
    }

    /// Total bars (including any in-progress bar) stored for `interval`.
    pub fn count(&self, interval: &str) -> usize {
        let map = self.rings.read();
        map.get(interval).map_or(0, VecDeque::len)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
