// ABR Controller: variant/init loading, bandwidth estimation, quality
// selection, and the prefetch window.

mod bandwidth;
mod quality;

pub use bandwidth::{Adaptive, BandwidthEstimator, Ewma, HarmonicMean, MovingAverage, Percentile};
pub use quality::{
    AggressiveSelector, BolaSelector, BufferBasedSelector, ConservativeSelector, HybridSelector,
    QualitySelector, SelectionContext, ThresholdSelector,
};

use crate::cache::SegmentCache;
use crate::config::ConfigStore;
use crate::error::{EngineError, Result};
use crate::events::{EventEmitter, SwitchReason};
use crate::fetch::{FetchArbiter, FetchOptions, FetchOrigin, FetchResult};
use crate::media::{InitSegment, MasterPlaylist, Quality, SegmentDescriptor, VariantPlaylist};
use crate::playlist;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// TTL for hot playlist/init entries; they are exempt from expiry, the
/// value only documents intent.
const HOT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub enum AbrEvent {
    QualityChanged {
        from: Option<String>,
        to: String,
        reason: SwitchReason,
    },
    PrefetchComplete {
        count: usize,
        quality_id: String,
    },
}

pub struct AbrController {
    config: Arc<ConfigStore>,
    arbiter: Arc<FetchArbiter>,
    origin: Arc<crate::fetch::OriginFetcher>,
    cache: Arc<SegmentCache>,
    stream_id: String,
    master: RwLock<Option<Arc<MasterPlaylist>>>,
    variants: RwLock<HashMap<String, Arc<VariantPlaylist>>>,
    inits: RwLock<HashMap<String, InitSegment>>,
    current_quality: RwLock<Option<String>>,
    switching: AtomicBool,
    estimator: Mutex<Box<dyn BandwidthEstimator>>,
    selector: Mutex<Box<dyn QualitySelector>>,
    prefetched: Mutex<HashSet<String>>,
    events: EventEmitter<AbrEvent>,
}

impl AbrController {
    pub fn new(
        config: Arc<ConfigStore>,
        arbiter: Arc<FetchArbiter>,
        origin: Arc<crate::fetch::OriginFetcher>,
        cache: Arc<SegmentCache>,
        stream_id: String,
    ) -> Self {
        let alpha = config.read(|c| c.abr_ewma_alpha);
        Self {
            config,
            arbiter,
            origin,
            cache,
            stream_id,
            master: RwLock::new(None),
            variants: RwLock::new(HashMap::new()),
            inits: RwLock::new(HashMap::new()),
            current_quality: RwLock::new(None),
            switching: AtomicBool::new(false),
            estimator: Mutex::new(Box::new(Ewma::new(alpha))),
            selector: Mutex::new(Box::new(ThresholdSelector)),
            prefetched: Mutex::new(HashSet::new()),
            events: EventEmitter::new(),
        }
    }

    pub fn on_event(&self, listener: impl Fn(&AbrEvent) + Send + Sync + 'static) {
        self.events.subscribe(listener);
    }

    pub fn set_estimator(&self, estimator: Box<dyn BandwidthEstimator>) {
        *self.estimator.lock() = estimator;
    }

    pub fn set_selector(&self, selector: Box<dyn QualitySelector>) {
        *self.selector.lock() = selector;
    }

    /// Load every variant playlist in parallel, install the default
    /// quality, and fetch its init segment. Returns the starting quality.
    pub async fn initialize(&self, master: Arc<MasterPlaylist>) -> Result<Quality> {
        *self.master.write() = Some(Arc::clone(&master));

        let loads = master.qualities.iter().map(|q| self.load_variant(&q.id));
        let variants = futures::future::try_join_all(loads).await?;
        {
            let mut map = self.variants.write();
            for variant in variants {
                map.insert(variant.quality_id.clone(), variant);
            }
        }

        let default = master
            .default_quality()
            .ok_or_else(|| EngineError::playlist("master playlist has no qualities"))?
            .clone();
        self.ensure_init(&default.id).await?;
        *self.current_quality.write() = Some(default.id.clone());
        info!(quality = %default.id, variants = master.qualities.len(), "ABR initialized");
        self.events.emit(&AbrEvent::QualityChanged {
            from: None,
            to: default.id.clone(),
            reason: SwitchReason::Initial,
        });
        Ok(default)
    }

    /// Variant playlist, cache-first then origin, stored hot with its time
    /// index installed.
    async fn load_variant(&self, quality_id: &str) -> Result<Arc<VariantPlaylist>> {
        if let Some(variant) = self.cache.variant(&self.stream_id, quality_id) {
            return Ok(variant);
        }
        let text = self
            .origin
            .fetch_variant_text(&self.stream_id, quality_id)
            .await?;
        let variant = Arc::new(playlist::parse_variant(&self.stream_id, quality_id, &text)?);
        self.cache.store_variant(Arc::clone(&variant), HOT_TTL);
        debug!(quality = quality_id, segments = variant.segments.len(), "Loaded variant playlist");
        Ok(variant)
    }

    pub fn master(&self) -> Option<Arc<MasterPlaylist>> {
        self.master.read().clone()
    }

    pub fn variant(&self, quality_id: &str) -> Option<Arc<VariantPlaylist>> {
        self.variants.read().get(quality_id).cloned()
    }

    pub fn current_quality_id(&self) -> Option<String> {
        self.current_quality.read().clone()
    }

    pub fn current_variant(&self) -> Option<Arc<VariantPlaylist>> {
        let quality_id = self.current_quality_id()?;
        self.variant(&quality_id)
    }

    pub fn quality(&self, quality_id: &str) -> Option<Quality> {
        self.master
            .read()
            .as_ref()
            .and_then(|m| m.quality(quality_id).cloned())
    }

    /// Init segment for a quality: memo, cache, then origin (hot-cached on
    /// arrival).
    pub async fn ensure_init(&self, quality_id: &str) -> Result<InitSegment> {
        if let Some(init) = self.inits.read().get(quality_id) {
            return Ok(init.clone());
        }
        if let Some(init) = self.cache.init(&self.stream_id, quality_id) {
            self.inits.write().insert(quality_id.to_string(), init.clone());
            return Ok(init);
        }
        let url = self.origin.init_url(&self.stream_id, quality_id);
        let data = self.origin.fetch_init(&self.stream_id, quality_id).await?;
        let init = InitSegment {
            quality_id: quality_id.to_string(),
            data,
            url,
        };
        self.cache.store_init(&self.stream_id, init.clone(), HOT_TTL);
        self.inits.write().insert(quality_id.to_string(), init.clone());
        debug!(quality = quality_id, "Fetched init segment");
        Ok(init)
    }

    /// Fetch one segment through the arbiter and feed the bandwidth
    /// estimator from non-cache deliveries.
    pub async fn fetch_segment(
        &self,
        segment: &SegmentDescriptor,
        options: FetchOptions,
    ) -> Result<FetchResult> {
        let result = self.arbiter.fetch(segment, options).await?;
        if result.source != FetchOrigin::Cache {
            self.record_bandwidth(result.data.len() as u64, result.latency_ms);
        }
        self.prefetched.lock().insert(segment.key().to_string());
        Ok(result)
    }

    pub fn record_bandwidth(&self, bytes: u64, latency_ms: u64) {
        self.estimator.lock().add_sample(bytes, latency_ms);
    }

    pub fn estimated_bandwidth_bps(&self) -> Option<f64> {
        self.estimator.lock().estimate_bps()
    }

    /// Run the selection strategy against the current buffer state.
    /// Returns the quality to switch to, or `None` to hold. Never
    /// re-enters while a switch is in progress.
    pub fn decide(&self, buffer_ahead: f64) -> Option<String> {
        if self.switching.load(Ordering::SeqCst) {
            return None;
        }
        let master = self.master()?;
        let current_id = self.current_quality_id()?;
        let current_index = master.qualities.iter().position(|q| q.id == current_id)?;

        let (target, up, down, min_buffer, max_buffer) = self.config.read(|c| {
            (
                c.buffer_target_duration,
                c.abr_switch_up_threshold,
                c.abr_switch_down_threshold,
                c.buffer_min_threshold,
                c.buffer_max_threshold,
            )
        });
        let ctx = SelectionContext {
            qualities: &master.qualities,
            current_index,
            bandwidth_bps: self.estimated_bandwidth_bps(),
            buffer_ahead,
            buffer_target: target,
            switch_up_threshold: up,
            switch_down_threshold: down,
            min_buffer,
            max_buffer,
        };
        let selected = self.selector.lock().select(&ctx);
        if selected == current_index {
            return None;
        }
        let quality_id = master.qualities.get(selected)?.id.clone();
        trace!(from = %current_id, to = %quality_id, buffer_ahead, "ABR proposes switch");
        Some(quality_id)
    }

    /// Switch to a quality: ensure its init is present, move the current
    /// pointer, and emit. A no-op when already current.
    pub async fn set_quality(
        &self,
        quality_id: &str,
        reason: SwitchReason,
    ) -> Result<Option<InitSegment>> {
        if self.current_quality_id().as_deref() == Some(quality_id) {
            return Ok(None);
        }
        let known = self
            .master()
            .is_some_and(|m| m.quality(quality_id).is_some());
        if !known {
            return Err(EngineError::config(format!("unknown quality `{quality_id}`")));
        }

        if self
            .switching
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(to = quality_id, "Quality switch already in progress");
            return Ok(None);
        }

        let result = self.ensure_init(quality_id).await;
        let init = match result {
            Ok(init) => init,
            Err(e) => {
                self.switching.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let from = self.current_quality.write().replace(quality_id.to_string());
        self.switching.store(false, Ordering::SeqCst);
        info!(from = ?from, to = quality_id, reason = reason.as_str(), "Quality switched");
        self.events.emit(&AbrEvent::QualityChanged {
            from,
            to: quality_id.to_string(),
            reason,
        });
        Ok(Some(init))
    }

    pub fn is_switching(&self) -> bool {
        self.switching.load(Ordering::SeqCst)
    }

    /// Resolve a seek target into its init segment and a symmetric window
    /// of descriptors around the seek time, fetched in parallel.
    pub async fn seek_segments(
        &self,
        time: f64,
    ) -> Result<(InitSegment, Vec<SegmentDescriptor>)> {
        let quality_id = self
            .current_quality_id()
            .ok_or_else(|| EngineError::internal("seek before initialization"))?;
        let init = self.ensure_init(&quality_id).await?;
        let variant = self
            .variant(&quality_id)
            .ok_or_else(|| EngineError::playlist(format!("no variant for `{quality_id}`")))?;

        let center = variant
            .index_at_time(time)
            .unwrap_or_else(|| variant.segments.len().saturating_sub(1));
        let (ahead_window, behind_window) = self.config.read(|c| {
            let per_segment = variant.target_duration.max(1.0);
            (
                (c.prefetch_window_ahead / per_segment).ceil() as usize,
                (c.prefetch_window_behind / per_segment).ceil() as usize,
            )
        });
        let start = center.saturating_sub(behind_window);
        let end = (center + ahead_window + 1).min(variant.segments.len());
        let window: Vec<SegmentDescriptor> = variant.segments[start..end].to_vec();

        let results = self
            .arbiter
            .fetch_batch(window.clone(), FetchOptions { for_seek: true, ..Default::default() })
            .await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            debug!(failed, "Some seek-window fetches failed");
        }
        Ok((init, window))
    }

    /// Prefetch segments following `segment_id`, bounded by the configured
    /// window. Fire-and-forget from the caller's perspective; completion
    /// emits `PrefetchComplete`.
    pub async fn prefetch_following(&self, segment_id: &str) {
        let Some(variant) = self.current_variant() else { return };
        let Some(position) = variant.segment_index(segment_id) else { return };

        let count = self.config.read(|c| {
            (c.prefetch_window_ahead / variant.target_duration.max(1.0)).ceil() as usize
        });
        let mut targets = Vec::new();
        {
            let prefetched = self.prefetched.lock();
            for segment in variant.segments.iter().skip(position + 1).take(count) {
                let key = segment.key().to_string();
                if prefetched.contains(&key)
                    || self.cache.has_segment(
                        &segment.stream_id,
                        &segment.quality_id,
                        &segment.segment_id,
                    )
                {
                    continue;
                }
                targets.push(segment.clone());
            }
        }
        if targets.is_empty() {
            return;
        }

        let fetched = targets.len();
        let results = self.arbiter.fetch_batch(targets.clone(), FetchOptions::default()).await;
        {
            let mut prefetched = self.prefetched.lock();
            for (segment, result) in targets.iter().zip(&results) {
                if result.is_ok() {
                    prefetched.insert(segment.key().to_string());
                }
            }
        }
        trace!(count = fetched, quality = %variant.quality_id, "Prefetch window complete");
        self.events.emit(&AbrEvent::PrefetchComplete {
            count: fetched,
            quality_id: variant.quality_id.clone(),
        });
    }
}
