//! Explicit TTL cache for last-month cost lookups.
//!
//! Keyed by (service, account, month). The cache is owned by whoever drives
//! the aggregation, passed down explicitly; there is no process-wide
//! memoization.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: f64,
    inserted_at: Instant,
}

/// Monthly cost cache with a fixed time-to-live per entry.
#[derive(Debug)]
pub struct MonthlyCostCache {
    ttl: Duration,
    entries: HashMap<(String, String, String), CacheEntry>,
}

impl MonthlyCostCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Cached cost for (service, account, month), if present and not
    /// expired. `month` is a `YYYY-MM` label.
    pub fn get(&self, service: &str, account: &str, month: &str) -> Option<f64> {
        let entry = self
            .entries
            .get(&(service.to_string(), account.to_string(), month.to_string()))?;
        if entry.inserted_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.value)
    }

    pub fn insert(&mut self, service: &str, account: &str, month: &str, value: f64) {
        self.entries.insert(
            (service.to_string(), account.to_string(), month.to_string()),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop every entry. Explicit invalidation for callers that know the
    /// upstream data changed.
    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    /// Drop only the entries whose TTL has lapsed.
    pub fn purge_expired(&mut self) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| entry.inserted_at.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
