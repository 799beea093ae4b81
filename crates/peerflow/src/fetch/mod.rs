// Fetch Arbiter: resolves segment requests through the strategy chain
// cache -> peer -> origin, with coalescing of concurrent requests for the
// same segment and an explicit peer bypass for critical fetches.

mod origin;

pub use origin::OriginFetcher;

use crate::cache::SegmentCache;
use crate::config::ConfigStore;
use crate::error::Result;
use crate::media::SegmentDescriptor;
use crate::metrics::EngineMetrics;
use crate::peer::PeerManager;
use crate::signaling::{SegmentSource, SignalingClient};
use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// How many candidate peers to consider per segment.
const PEER_CANDIDATES: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Skip the peer rung entirely; the buffer is too low to gamble on
    /// swarm latency.
    pub critical: bool,
    pub priority: i32,
    pub for_seek: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOrigin {
    Cache,
    Peer(String),
    Origin,
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub data: Bytes,
    pub source: FetchOrigin,
    pub latency_ms: u64,
}

type SharedFetch = Shared<BoxFuture<'static, Result<FetchResult>>>;

pub struct FetchArbiter {
    config: Arc<ConfigStore>,
    cache: Arc<SegmentCache>,
    peers: Arc<PeerManager>,
    origin: Arc<OriginFetcher>,
    signaling: Arc<SignalingClient>,
    metrics: Arc<EngineMetrics>,
    in_flight: Mutex<HashMap<String, SharedFetch>>,
}

impl FetchArbiter {
    pub fn new(
        config: Arc<ConfigStore>,
        cache: Arc<SegmentCache>,
        peers: Arc<PeerManager>,
        origin: Arc<OriginFetcher>,
        signaling: Arc<SignalingClient>,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            cache,
            peers,
            origin,
            signaling,
            metrics,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve a segment to bytes. Concurrent calls for the same segment
    /// share one underlying fetch.
    pub async fn fetch(
        self: &Arc<Self>,
        segment: &SegmentDescriptor,
        options: FetchOptions,
    ) -> Result<FetchResult> {
        // Cache rung: zero latency, no coalescing needed.
        if let Some(data) =
            self.cache
                .segment_bytes(&segment.stream_id, &segment.quality_id, &segment.segment_id)
        {
            self.metrics.record_cache_hit();
            trace!(segment = %segment.segment_id, "Fetch served from cache");
            return Ok(FetchResult {
                data,
                source: FetchOrigin::Cache,
                latency_ms: 0,
            });
        }

        let key = segment.key().to_string();
        let (fetch, owner) = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let arbiter = Arc::clone(self);
                    let segment = segment.clone();
                    let fetch: SharedFetch =
                        async move { arbiter.resolve(segment, options).await }
                            .boxed()
                            .shared();
                    in_flight.insert(key.clone(), fetch.clone());
                    (fetch, true)
                }
            }
        };
        if !owner {
            trace!(segment = %segment.segment_id, "Joining in-flight fetch");
        }

        let result = fetch.await;
        if owner {
            self.in_flight.lock().remove(&key);
        }
        result
    }

    /// The peer -> origin portion of the chain, run once per segment.
    async fn resolve(
        self: Arc<Self>,
        segment: SegmentDescriptor,
        options: FetchOptions,
    ) -> Result<FetchResult> {
        self.metrics.record_cache_miss();

        if !options.critical
            && let Some(result) = self.try_peers(&segment).await
        {
            return Ok(result);
        }

        self.fetch_from_origin(&segment).await
    }

    /// Peer rung: use the availability index, falling back to a who-has
    /// query; attempt the best connected holder.
    async fn try_peers(self: &Arc<Self>, segment: &SegmentDescriptor) -> Option<FetchResult> {
        let availability_key = segment.availability_key();
        let mut candidates = self.peers.best_peers(&availability_key, PEER_CANDIDATES);

        if candidates.is_empty() {
            match self
                .signaling
                .who_has(&segment.quality_id, &segment.segment_id)
                .await
            {
                Ok(reply) => {
                    let ids: Vec<String> =
                        reply.peers.iter().map(|p| p.peer_id.clone()).collect();
                    if ids.is_empty() {
                        return None;
                    }
                    self.peers.record_availability(&availability_key, &ids);
                    // Dial holders for future fetches; only already-connected
                    // peers can serve this one.
                    for peer_id in ids.iter().take(PEER_CANDIDATES) {
                        if let Err(e) = self.peers.connect_to_peer(peer_id).await {
                            debug!(peer = %peer_id, error = %e, "Peer dial failed");
                        }
                    }
                    candidates = self.peers.best_peers(&availability_key, PEER_CANDIDATES);
                }
                Err(e) => {
                    trace!(segment = %segment.segment_id, error = %e, "whoHas failed; origin fallback");
                    return None;
                }
            }
        }

        let top = candidates.first()?;
        let started = Instant::now();
        match self.peers.fetch_from_peer(&top.id, segment).await {
            Ok(data) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                self.metrics.record_peer_fetch(data.len() as u64);
                self.store_and_report(segment, &data, SegmentSource::Peer, latency_ms)
                    .await;
                Some(FetchResult {
                    data,
                    source: FetchOrigin::Peer(top.id.clone()),
                    latency_ms,
                })
            }
            Err(e) => {
                debug!(peer = %top.id, segment = %segment.segment_id, error = %e, "Peer fetch failed; origin fallback");
                None
            }
        }
    }

    async fn fetch_from_origin(&self, segment: &SegmentDescriptor) -> Result<FetchResult> {
        let started = Instant::now();
        let data = match self.origin.fetch_segment(segment).await {
            Ok(data) => data,
            Err(e) => {
                self.metrics.record_fetch_failure();
                warn!(segment = %segment.segment_id, error = %e, "Origin fetch failed");
                return Err(e);
            }
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        self.metrics.record_origin_fetch(data.len() as u64);
        self.store_and_report(segment, &data, SegmentSource::Server, latency_ms)
            .await;
        Ok(FetchResult {
            data,
            source: FetchOrigin::Origin,
            latency_ms,
        })
    }

    /// Cache the fetched bytes, advertise them to the swarm, and report the
    /// delivery source to signaling.
    async fn store_and_report(
        &self,
        segment: &SegmentDescriptor,
        data: &Bytes,
        source: SegmentSource,
        latency_ms: u64,
    ) {
        let ttl = self.config.read(|c| c.cache_segment_ttl());
        self.cache.store_segment_bytes(
            &segment.stream_id,
            &segment.quality_id,
            &segment.segment_id,
            data.clone(),
            ttl,
        );
        self.peers.announce_segment(&segment.availability_key()).await;

        let speed = if latency_ms > 0 {
            Some(data.len() as f64 * 8_000.0 / latency_ms as f64)
        } else {
            None
        };
        self.signaling.report_segment(
            &segment.quality_id,
            &segment.segment_id,
            source,
            Some(latency_ms),
            speed,
        );
    }

    /// Fetch many segments with bounded concurrency, preserving order.
    pub async fn fetch_batch(
        self: &Arc<Self>,
        segments: Vec<SegmentDescriptor>,
        options: FetchOptions,
    ) -> Vec<Result<FetchResult>> {
        let limit = self.config.read(|c| c.max_concurrent_fetches);
        stream::iter(segments.into_iter().map(|segment| {
            let arbiter = Arc::clone(self);
            async move { arbiter.fetch(&segment, options).await }
        }))
        .buffered(limit)
        .collect()
        .await
    }

    /// Abort an outstanding origin fetch. Peer waits expire on their own.
    pub fn cancel(&self, quality_id: &str, segment_id: &str) {
        self.origin.cancel(quality_id, segment_id);
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigPatch;
    use crate::error::EngineError;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn setup() -> (Arc<FetchArbiter>, Arc<SegmentCache>) {
        let config = Arc::new(ConfigStore::default());
        // Keep network paths fast-failing: unroutable origin, no retries.
        config
            .apply(&ConfigPatch {
                base_url: Some("http://127.0.0.1:1".into()),
                max_retries: Some(0),
                fetch_timeout_ms: Some(200),
                who_has_timeout_ms: Some(100),
                retry_delay_base_ms: Some(1),
                ..Default::default()
            })
            .unwrap();
        let cache = Arc::new(SegmentCache::with_lru(10 * 1024 * 1024));
        let signaling = Arc::new(SignalingClient::new(
            Arc::clone(&config),
            "client".into(),
            "movie".into(),
        ));
        let peers = PeerManager::new(
            Arc::clone(&config),
            Arc::clone(&signaling),
            Arc::clone(&cache),
            "movie".into(),
        );
        let origin = Arc::new(
            OriginFetcher::new(Arc::clone(&config), CancellationToken::new()).unwrap(),
        );
        let metrics = Arc::new(EngineMetrics::new());
        let arbiter = FetchArbiter::new(config, Arc::clone(&cache), peers, origin, signaling, metrics);
        (arbiter, cache)
    }

    fn segment(id: &str) -> SegmentDescriptor {
        SegmentDescriptor {
            stream_id: "movie".into(),
            quality_id: "720p".into(),
            segment_id: id.to_string(),
            duration: 6.0,
            timestamp: 0.0,
        }
    }

    #[tokio::test]
    async fn cache_hit_short_circuits_with_zero_latency() {
        let (arbiter, cache) = setup();
        cache.store_segment_bytes(
            "movie",
            "720p",
            "seg_0000.m4s",
            Bytes::from_static(b"cached"),
            Duration::from_secs(60),
        );
        let result = arbiter
            .fetch(&segment("seg_0000.m4s"), FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(result.source, FetchOrigin::Cache);
        assert_eq!(result.latency_ms, 0);
        assert_eq!(&result.data[..], b"cached");
    }

    #[tokio::test]
    async fn miss_with_no_peers_and_dead_origin_errors() {
        let (arbiter, _cache) = setup();
        let err = arbiter
            .fetch(&segment("seg_0001.m4s"), FetchOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable() || matches!(err, EngineError::Network { .. }));
    }

    #[tokio::test]
    async fn concurrent_fetches_coalesce() {
        let (arbiter, _cache) = setup();
        let seg = segment("seg_0002.m4s");
        // Critical skips the peer rung, so both callers race to the dead
        // origin; coalescing means a single underlying attempt.
        let options = FetchOptions {
            critical: true,
            ..Default::default()
        };
        let f1 = {
            let arbiter = Arc::clone(&arbiter);
            let seg = seg.clone();
            tokio::spawn(async move { arbiter.fetch(&seg, options).await })
        };
        let f2 = {
            let arbiter = Arc::clone(&arbiter);
            let seg = seg.clone();
            tokio::spawn(async move { arbiter.fetch(&seg, options).await })
        };
        let (r1, r2) = (f1.await.unwrap(), f2.await.unwrap());
        assert!(r1.is_err() && r2.is_err());
        assert_eq!(arbiter.in_flight_count(), 0);
        // Exactly one origin attempt despite two callers.
        assert_eq!(arbiter.metrics.snapshot().cache_misses, 1);
    }

    #[tokio::test]
    async fn critical_skips_who_has_entirely() {
        let (arbiter, _cache) = setup();
        let before = Instant::now();
        let _ = arbiter
            .fetch(
                &segment("seg_0003.m4s"),
                FetchOptions {
                    critical: true,
                    ..Default::default()
                },
            )
            .await;
        // No who-has wait baked into the latency: the whole call fails at
        // origin speed, well under the who-has deadline plus origin time.
        assert!(before.elapsed() < Duration::from_millis(2_000));
    }
}
