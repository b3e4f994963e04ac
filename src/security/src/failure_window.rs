//! Per-key failure counters that reset after a fixed window
//!
//! Backs the failed-login and access-denial counters. An entry whose window
//! has elapsed counts as zero and is dropped on the next touch or sweep.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Writes between two full sweeps of expired entries
const SWEEP_EVERY: u64 = 256;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started: Instant,
}

/// Failure counts keyed by source (IP, user id), each in its own time window
#[derive(Debug)]
pub struct FailureCounter<K: Eq + Hash> {
    windows: DashMap<K, Window>,
    window: Duration,
    writes: AtomicU64,
}

impl<K: Eq + Hash + Clone> FailureCounter<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            writes: AtomicU64::new(0),
        }
    }

    fn is_live(&self, window: &Window, now: Instant) -> bool {
        now.duration_since(window.started) < self.window
    }

    /// Count one failure, returning the count within the current window
    pub fn increment(&self, key: K) -> u32 {
        let now = Instant::now();
        let count = {
            let mut entry = self.windows.entry(key).or_insert(Window {
                count: 0,
                started: now,
            });
            if !self.is_live(&entry, now) {
                *entry = Window {
                    count: 0,
                    started: now,
                };
            }
            entry.count += 1;
            entry.count
        };

        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.purge_expired();
        }
        count
    }

    /// Failures within the current window, dropping an expired entry
    pub fn count<Q>(&self, key: &Q) -> u32
    where
        K: std::borrow::Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let now = Instant::now();
        match self.windows.get(key).map(|entry| *entry) {
            Some(window) if self.is_live(&window, now) => window.count,
            Some(_) => {
                self.windows
                    .remove_if(key, |_, window| !self.is_live(window, now));
                0
            }
            None => 0,
        }
    }

    pub fn reset<Q>(&self, key: &Q)
    where
        K: std::borrow::Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.windows.remove(key);
    }

    /// Live entries with their counts
    pub fn live(&self) -> Vec<(K, u32)> {
        let now = Instant::now();
        self.windows
            .iter()
            .filter(|entry| self.is_live(entry.value(), now))
            .map(|entry| (entry.key().clone(), entry.value().count))
            .collect()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| self.is_live(window, now));
        before.saturating_sub(self.windows.len())
    }

    /// Tracked keys, expired or not
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_count_resets_after_window() {
        let counter = FailureCounter::new(Duration::from_secs(60));
        assert_eq!(counter.increment("a"), 1);
        assert_eq!(counter.increment("a"), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(counter.count("a"), 0);
        assert!(counter.is_empty());
        assert_eq!(counter.increment("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_bounds_rotating_keys() {
        let counter = FailureCounter::new(Duration::from_secs(60));
        for i in 0..100u32 {
            counter.increment(i);
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        counter.increment(1000);
        assert_eq!(counter.purge_expired(), 100);
        assert_eq!(counter.len(), 1);

        // Writes alone trigger sweeps
        tokio::time::advance(Duration::from_secs(61)).await;
        for i in 0..(2 * SWEEP_EVERY) as u32 {
            counter.increment(5000 + i);
            if i == SWEEP_EVERY as u32 {
                tokio::time::advance(Duration::from_secs(61)).await;
            }
        }
        assert!(counter.len() < (2 * SWEEP_EVERY) as usize);
    }
}
