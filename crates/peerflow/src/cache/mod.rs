// Keyed cache with TTL, hot protection, pluggable eviction and the
// time-to-segment index.
//
// Hot entries (playlists, init segments) are never offered for eviction and
// never expire; cold bytes are kept under the configured limit by evicting
// strategy-selected victims before each insertion.

mod eviction;
mod time_index;

pub use eviction::{
    Composite, EvictionCandidate, EvictionStrategy, LargestFirst, LeastFrequentlyUsed,
    LeastRecentlyUsed, NearestExpiration,
};
pub use time_index::{IndexedSegment, TimeIndex};

use crate::media::{InitSegment, MasterPlaylist, VariantPlaylist};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Uniform cacheable payload.
#[derive(Debug, Clone)]
pub enum Cached {
    Bytes(Bytes),
    Init(InitSegment),
    Master(Arc<MasterPlaylist>),
    Variant(Arc<VariantPlaylist>),
}

impl Cached {
    /// Byte size used for cold-cache accounting. Playlists are estimated
    /// from their segment count.
    pub fn size(&self) -> u64 {
        match self {
            Cached::Bytes(b) => b.len() as u64,
            Cached::Init(init) => init.data.len() as u64,
            Cached::Master(master) => 256 + master.qualities.len() as u64 * 128,
            Cached::Variant(variant) => 256 + variant.segments.len() as u64 * 96,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Cached::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// Canonical cache key constructors.
pub mod keys {
    pub fn segment(stream_id: &str, quality_id: &str, segment_id: &str) -> String {
        format!("segment:{stream_id}:{quality_id}:{segment_id}")
    }

    pub fn init(stream_id: &str, quality_id: &str) -> String {
        format!("init:{stream_id}:{quality_id}")
    }

    pub fn master(stream_id: &str) -> String {
        format!("master:{stream_id}")
    }

    pub fn variant(stream_id: &str, quality_id: &str) -> String {
        format!("variant:{stream_id}:{quality_id}")
    }

    /// Split a media-segment key back into (stream, quality, segment).
    pub fn parse_segment(key: &str) -> Option<(&str, &str, &str)> {
        let rest = key.strip_prefix("segment:")?;
        let mut parts = rest.splitn(3, ':');
        Some((parts.next()?, parts.next()?, parts.next()?))
    }
}

struct Entry {
    data: Cached,
    size: u64,
    inserted_at: Instant,
    ttl: Duration,
    access_count: u64,
    last_access: Instant,
    hot: bool,
}

impl Entry {
    fn expired(&self) -> bool {
        // Hot entries are exempt from expiry as well as eviction.
        !self.hot && self.inserted_at.elapsed() >= self.ttl
    }

    fn ttl_remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.inserted_at.elapsed())
    }
}

struct Inner {
    entries: HashMap<String, Entry>,
    cold_bytes: u64,
}

/// Called with each removed media-segment key so availability can be
/// unadvertised.
pub type RemovalHook = Arc<dyn Fn(&str) + Send + Sync>;

pub struct SegmentCache {
    inner: Mutex<Inner>,
    strategy: Box<dyn EvictionStrategy>,
    cold_limit: u64,
    removal_hook: RwLock<Option<RemovalHook>>,
    time_index: RwLock<TimeIndex>,
}

impl SegmentCache {
    pub fn new(cold_limit: u64, strategy: Box<dyn EvictionStrategy>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                cold_bytes: 0,
            }),
            strategy,
            cold_limit,
            removal_hook: RwLock::new(None),
            time_index: RwLock::new(TimeIndex::new()),
        }
    }

    pub fn with_lru(cold_limit: u64) -> Self {
        Self::new(cold_limit, Box::new(LeastRecentlyUsed))
    }

    pub fn set_removal_hook(&self, hook: RemovalHook) {
        *self.removal_hook.write() = Some(hook);
    }

    fn notify_removed(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let hook = self.removal_hook.read().clone();
        if let Some(hook) = hook {
            for key in keys {
                if key.starts_with("segment:") {
                    hook(key);
                }
            }
        }
    }

    fn remove_locked(inner: &mut Inner, key: &str) -> Option<Entry> {
        let entry = inner.entries.remove(key)?;
        if !entry.hot {
            inner.cold_bytes = inner.cold_bytes.saturating_sub(entry.size);
        }
        Some(entry)
    }

    /// Insert an entry. Cold insertions evict strategy-selected victims
    /// until the entry fits; when nothing evictable remains the entry is
    /// silently not stored.
    pub fn set(&self, key: &str, data: Cached, ttl: Duration, hot: bool) {
        let size = data.size();
        let mut removed = Vec::new();
        {
            let mut inner = self.inner.lock();

            // Replacing an entry releases its accounting first.
            if Self::remove_locked(&mut inner, key).is_some() {
                trace!(key, "Replacing cache entry");
            }

            if !hot {
                if size > self.cold_limit {
                    debug!(key, size, limit = self.cold_limit, "Entry exceeds cold capacity; not stored");
                    self.notify_removed(&removed);
                    return;
                }
                while inner.cold_bytes + size > self.cold_limit {
                    let victim = {
                        let now = Instant::now();
                        let candidates: Vec<EvictionCandidate<'_>> = inner
                            .entries
                            .iter()
                            .filter(|(_, e)| !e.hot)
                            .map(|(k, e)| EvictionCandidate {
                                key: k.as_str(),
                                size: e.size,
                                age: now.duration_since(e.inserted_at),
                                ttl_remaining: e.ttl_remaining(),
                                access_count: e.access_count,
                                idle: now.duration_since(e.last_access),
                            })
                            .collect();
                        self.strategy.select_victim(&candidates)
                    };
                    let Some(victim) = victim else {
                        debug!(key, "No evictable candidate; entry not stored");
                        drop(inner);
                        self.notify_removed(&removed);
                        return;
                    };
                    if Self::remove_locked(&mut inner, &victim).is_some() {
                        trace!(victim = %victim, strategy = self.strategy.name(), "Evicted cold entry");
                        removed.push(victim);
                    } else {
                        break;
                    }
                }
            }

            let now = Instant::now();
            inner.entries.insert(
                key.to_string(),
                Entry {
                    data,
                    size,
                    inserted_at: now,
                    ttl,
                    access_count: 0,
                    last_access: now,
                    hot,
                },
            );
            if !hot {
                inner.cold_bytes += size;
            }
        }
        self.notify_removed(&removed);
    }

    /// Look up an entry. Expired entries are deleted on access and reported
    /// as a miss; hits refresh recency and access counts.
    pub fn get(&self, key: &str) -> Option<Cached> {
        let mut expired_key = None;
        let result = {
            let mut inner = self.inner.lock();
            match inner.entries.get_mut(key) {
                None => None,
                Some(entry) if entry.expired() => {
                    Self::remove_locked(&mut inner, key);
                    expired_key = Some(key.to_string());
                    None
                }
                Some(entry) => {
                    entry.access_count += 1;
                    entry.last_access = Instant::now();
                    Some(entry.data.clone())
                }
            }
        };
        if let Some(key) = expired_key {
            self.notify_removed(&[key]);
        }
        result
    }

    pub fn has(&self, key: &str) -> bool {
        let inner = self.inner.lock();
        inner.entries.get(key).is_some_and(|e| !e.expired())
    }

    pub fn delete(&self, key: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            Self::remove_locked(&mut inner, key).is_some()
        };
        if removed {
            self.notify_removed(&[key.to_string()]);
        }
        removed
    }

    pub fn clear(&self) {
        let keys: Vec<String> = {
            let mut inner = self.inner.lock();
            let keys = inner.entries.keys().cloned().collect();
            inner.entries.clear();
            inner.cold_bytes = 0;
            keys
        };
        self.time_index.write().clear();
        self.notify_removed(&keys);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current cold-byte usage (never exceeds the configured limit).
    pub fn cold_bytes(&self) -> u64 {
        self.inner.lock().cold_bytes
    }

    /// Remove TTL-expired cold entries. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let removed: Vec<String> = {
            let mut inner = self.inner.lock();
            let expired: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, e)| e.expired())
                .map(|(k, _)| k.clone())
                .collect();
            for key in &expired {
                Self::remove_locked(&mut inner, key);
            }
            expired
        };
        if !removed.is_empty() {
            debug!(count = removed.len(), "Swept expired cache entries");
        }
        self.notify_removed(&removed);
        removed.len()
    }

    /// Periodic expiry sweep bound to `token`.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        cache.sweep_expired();
                    }
                }
            }
        })
    }

    // --- Typed wrappers ---

    pub fn store_segment_bytes(
        &self,
        stream_id: &str,
        quality_id: &str,
        segment_id: &str,
        data: Bytes,
        ttl: Duration,
    ) {
        self.set(
            &keys::segment(stream_id, quality_id, segment_id),
            Cached::Bytes(data),
            ttl,
            false,
        );
    }

    pub fn segment_bytes(&self, stream_id: &str, quality_id: &str, segment_id: &str) -> Option<Bytes> {
        match self.get(&keys::segment(stream_id, quality_id, segment_id))? {
            Cached::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn has_segment(&self, stream_id: &str, quality_id: &str, segment_id: &str) -> bool {
        self.has(&keys::segment(stream_id, quality_id, segment_id))
    }

    pub fn store_init(&self, stream_id: &str, init: InitSegment, ttl: Duration) {
        self.set(
            &keys::init(stream_id, &init.quality_id),
            Cached::Init(init),
            ttl,
            true,
        );
    }

    pub fn init(&self, stream_id: &str, quality_id: &str) -> Option<InitSegment> {
        match self.get(&keys::init(stream_id, quality_id))? {
            Cached::Init(init) => Some(init),
            _ => None,
        }
    }

    pub fn store_master(&self, master: Arc<MasterPlaylist>, ttl: Duration) {
        self.set(
            &keys::master(&master.stream_id),
            Cached::Master(Arc::clone(&master)),
            ttl,
            true,
        );
    }

    pub fn master(&self, stream_id: &str) -> Option<Arc<MasterPlaylist>> {
        match self.get(&keys::master(stream_id))? {
            Cached::Master(m) => Some(m),
            _ => None,
        }
    }

    /// Store a variant playlist hot and install its time index.
    pub fn store_variant(&self, variant: Arc<VariantPlaylist>, ttl: Duration) {
        self.time_index.write().install(&variant);
        self.set(
            &keys::variant(&variant.stream_id, &variant.quality_id),
            Cached::Variant(Arc::clone(&variant)),
            ttl,
            true,
        );
    }

    pub fn variant(&self, stream_id: &str, quality_id: &str) -> Option<Arc<VariantPlaylist>> {
        match self.get(&keys::variant(stream_id, quality_id))? {
            Cached::Variant(v) => Some(v),
            _ => None,
        }
    }

    // --- Time index queries ---

    pub fn segment_at_time(
        &self,
        stream_id: &str,
        quality_id: &str,
        time: f64,
    ) -> Option<IndexedSegment> {
        self.time_index.read().find_at(stream_id, quality_id, time)
    }

    pub fn segments_in_range(
        &self,
        stream_id: &str,
        quality_id: &str,
        start: f64,
        end: f64,
    ) -> Vec<String> {
        self.time_index
            .read()
            .find_overlapping(stream_id, quality_id, start, end)
    }

    pub fn segment_window(
        &self,
        stream_id: &str,
        quality_id: &str,
        time: f64,
        before: usize,
        after: usize,
    ) -> Vec<String> {
        self.time_index
            .read()
            .window(stream_id, quality_id, time, before, after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SegmentDescriptor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TTL: Duration = Duration::from_secs(60);

    fn seg_bytes(n: usize) -> Bytes {
        Bytes::from(vec![0u8; n])
    }

    fn test_variant() -> Arc<VariantPlaylist> {
        let segments = (0..4)
            .map(|i| SegmentDescriptor {
                stream_id: "movie".into(),
                quality_id: "720p".into(),
                segment_id: format!("seg_{i:04}.m4s"),
                duration: 6.0,
                timestamp: i as f64 * 6.0,
            })
            .collect();
        Arc::new(VariantPlaylist {
            stream_id: "movie".into(),
            quality_id: "720p".into(),
            target_duration: 6.0,
            total_duration: 24.0,
            segments,
        })
    }

    #[test]
    fn get_miss_is_none_not_error() {
        let cache = SegmentCache::with_lru(1024);
        assert!(cache.get("segment:movie:720p:seg_0000.m4s").is_none());
    }

    #[test]
    fn lru_eviction_scenario() {
        // Cap fits exactly three 100-byte segments.
        let cache = SegmentCache::with_lru(300);
        cache.store_segment_bytes("m", "q", "a", seg_bytes(100), TTL);
        cache.store_segment_bytes("m", "q", "b", seg_bytes(100), TTL);
        cache.store_segment_bytes("m", "q", "c", seg_bytes(100), TTL);
        // Touch `a` so `b` becomes least recently used.
        assert!(cache.segment_bytes("m", "q", "a").is_some());
        cache.store_segment_bytes("m", "q", "d", seg_bytes(100), TTL);

        assert!(cache.has_segment("m", "q", "a"));
        assert!(!cache.has_segment("m", "q", "b"));
        assert!(cache.has_segment("m", "q", "c"));
        assert!(cache.has_segment("m", "q", "d"));
        assert!(cache.cold_bytes() <= 300);
    }

    #[test]
    fn hot_entries_survive_eviction_pressure() {
        let cache = SegmentCache::with_lru(300);
        cache.store_master(
            Arc::new(MasterPlaylist {
                stream_id: "movie".into(),
                qualities: vec![],
            }),
            TTL,
        );
        cache.store_variant(test_variant(), TTL);
        cache.store_init(
            "movie",
            InitSegment {
                quality_id: "720p".into(),
                data: seg_bytes(5_000).into(),
                url: "http://x/init.mp4".into(),
            },
            TTL,
        );
        for i in 0..20 {
            cache.store_segment_bytes("movie", "720p", &format!("seg_{i:04}.m4s"), seg_bytes(100), TTL);
        }
        assert!(cache.master("movie").is_some());
        assert!(cache.variant("movie", "720p").is_some());
        assert!(cache.init("movie", "720p").is_some());
        assert!(cache.cold_bytes() <= 300);
    }

    #[test]
    fn oversized_cold_entry_is_silently_dropped() {
        let cache = SegmentCache::with_lru(100);
        cache.store_segment_bytes("m", "q", "big", seg_bytes(500), TTL);
        assert!(!cache.has_segment("m", "q", "big"));
        assert_eq!(cache.cold_bytes(), 0);
    }

    #[test]
    fn expired_entry_is_miss_and_removed_on_access() {
        let cache = SegmentCache::with_lru(1024);
        cache.store_segment_bytes("m", "q", "a", seg_bytes(10), Duration::from_millis(0));
        assert!(cache.segment_bytes("m", "q", "a").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn sweep_removes_expired_cold_entries() {
        let cache = SegmentCache::with_lru(1024);
        cache.store_segment_bytes("m", "q", "a", seg_bytes(10), Duration::from_millis(0));
        cache.store_segment_bytes("m", "q", "b", seg_bytes(10), TTL);
        assert_eq!(cache.sweep_expired(), 1);
        assert!(cache.has_segment("m", "q", "b"));
    }

    #[test]
    fn removal_hook_fires_for_segment_keys_only() {
        let cache = SegmentCache::with_lru(150);
        let removed = Arc::new(AtomicUsize::new(0));
        let removed_clone = Arc::clone(&removed);
        cache.set_removal_hook(Arc::new(move |key| {
            assert!(key.starts_with("segment:"));
            removed_clone.fetch_add(1, Ordering::Relaxed);
        }));

        cache.store_variant(test_variant(), TTL);
        cache.store_segment_bytes("m", "q", "a", seg_bytes(100), TTL);
        // Evicts `a`.
        cache.store_segment_bytes("m", "q", "b", seg_bytes(100), TTL);
        // Explicit delete of `b`.
        cache.delete(&keys::segment("m", "q", "b"));
        // Variant deletion must not fire the hook.
        cache.delete(&keys::variant("movie", "720p"));

        assert_eq!(removed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn time_index_follows_variant_install() {
        let cache = SegmentCache::with_lru(1024);
        cache.store_variant(test_variant(), TTL);

        let seg = cache.segment_at_time("movie", "720p", 13.0).unwrap();
        assert_eq!(seg.segment_id, "seg_0002.m4s");
        assert_eq!(
            cache.segments_in_range("movie", "720p", 0.0, 12.5),
            vec!["seg_0000.m4s", "seg_0001.m4s", "seg_0002.m4s"]
        );
        assert_eq!(
            cache.segment_window("movie", "720p", 13.0, 1, 1),
            vec!["seg_0001.m4s", "seg_0002.m4s", "seg_0003.m4s"]
        );
    }

    #[test]
    fn parse_segment_key_round_trip() {
        let key = keys::segment("movie", "720p", "seg_0001.m4s");
        assert_eq!(
            keys::parse_segment(&key),
            Some(("movie", "720p", "seg_0001.m4s"))
        );
        assert_eq!(keys::parse_segment("init:movie:720p"), None);
    }
}
