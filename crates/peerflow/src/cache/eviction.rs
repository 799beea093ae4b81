// Pluggable eviction strategies over cold cache entries.
//
// Strategies only ever see cold candidates; hot entries are filtered out by
// the store before selection.

use std::time::Duration;

/// Read-only view of a cold entry offered for eviction.
#[derive(Debug, Clone)]
pub struct EvictionCandidate<'a> {
    pub key: &'a str,
    pub size: u64,
    /// Time since insertion.
    pub age: Duration,
    /// Time until TTL expiry (zero when already expired).
    pub ttl_remaining: Duration,
    pub access_count: u64,
    /// Time since last access.
    pub idle: Duration,
}

/// Picks the next cold entry to evict. Returning `None` means no candidate
/// is acceptable and the pending insertion is abandoned.
pub trait EvictionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select_victim(&self, candidates: &[EvictionCandidate<'_>]) -> Option<String>;
}

/// Evicts the entry idle the longest.
pub struct LeastRecentlyUsed;

impl EvictionStrategy for LeastRecentlyUsed {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn select_victim(&self, candidates: &[EvictionCandidate<'_>]) -> Option<String> {
        candidates
            .iter()
            .max_by_key(|c| c.idle)
            .map(|c| c.key.to_string())
    }
}

/// Evicts the entry with the fewest accesses; ties fall back to idle time.
pub struct LeastFrequentlyUsed;

impl EvictionStrategy for LeastFrequentlyUsed {
    fn name(&self) -> &'static str {
        "lfu"
    }

    fn select_victim(&self, candidates: &[EvictionCandidate<'_>]) -> Option<String> {
        candidates
            .iter()
            .min_by(|a, b| {
                a.access_count
                    .cmp(&b.access_count)
                    .then(b.idle.cmp(&a.idle))
            })
            .map(|c| c.key.to_string())
    }
}

/// Evicts the entry closest to its TTL expiry.
pub struct NearestExpiration;

impl EvictionStrategy for NearestExpiration {
    fn name(&self) -> &'static str {
        "nearest-expiration"
    }

    fn select_victim(&self, candidates: &[EvictionCandidate<'_>]) -> Option<String> {
        candidates
            .iter()
            .min_by_key(|c| c.ttl_remaining)
            .map(|c| c.key.to_string())
    }
}

/// Evicts the largest entry to free the most space per eviction.
pub struct LargestFirst;

impl EvictionStrategy for LargestFirst {
    fn name(&self) -> &'static str {
        "largest-first"
    }

    fn select_victim(&self, candidates: &[EvictionCandidate<'_>]) -> Option<String> {
        candidates
            .iter()
            .max_by_key(|c| c.size)
            .map(|c| c.key.to_string())
    }
}

/// Weighted blend of the other signals. Each component is normalized to
/// [0, 1] over the candidate set; the candidate with the highest combined
/// eviction pressure wins.
pub struct Composite {
    pub recency_weight: f64,
    pub frequency_weight: f64,
    pub expiry_weight: f64,
    pub size_weight: f64,
}

impl Default for Composite {
    fn default() -> Self {
        Self {
            recency_weight: 0.4,
            frequency_weight: 0.2,
            expiry_weight: 0.2,
            size_weight: 0.2,
        }
    }
}

impl EvictionStrategy for Composite {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn select_victim(&self, candidates: &[EvictionCandidate<'_>]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let max_idle = candidates
            .iter()
            .map(|c| c.idle.as_secs_f64())
            .fold(0.0, f64::max)
            .max(f64::EPSILON);
        let max_access = candidates
            .iter()
            .map(|c| c.access_count)
            .max()
            .unwrap_or(0)
            .max(1) as f64;
        let max_ttl = candidates
            .iter()
            .map(|c| c.ttl_remaining.as_secs_f64())
            .fold(0.0, f64::max)
            .max(f64::EPSILON);
        let max_size = candidates.iter().map(|c| c.size).max().unwrap_or(0).max(1) as f64;

        candidates
            .iter()
            .map(|c| {
                let recency = c.idle.as_secs_f64() / max_idle;
                let infrequency = 1.0 - (c.access_count as f64 / max_access);
                let expiry = 1.0 - (c.ttl_remaining.as_secs_f64() / max_ttl);
                let size = c.size as f64 / max_size;
                let score = self.recency_weight * recency
                    + self.frequency_weight * infrequency
                    + self.expiry_weight * expiry
                    + self.size_weight * size;
                (score, c.key)
            })
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, key)| key.to_string())
    }
}
