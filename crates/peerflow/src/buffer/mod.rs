// Buffer Controller: watches the sink's buffered state, schedules
// critical/standard/seek prefetch, and drains the ordered append queue
// serially into the media sink.

mod append_queue;

pub use append_queue::{AppendQueue, AppendRequest};

use crate::config::ConfigStore;
use crate::error::Result;
use crate::events::{BufferLevel, EventEmitter};
use crate::fetch::{FetchOptions, FetchResult};
use crate::media::{BufferStatus, InitSegment, SegmentDescriptor, VariantPlaylist};
use crate::metrics::EngineMetrics;
use crate::sink::MediaSink;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Critical prefetch debounce.
const CRITICAL_DEBOUNCE: Duration = Duration::from_secs(1);
/// Segments fetched by a critical prefetch burst.
const CRITICAL_BURST: usize = 5;
/// Append priority of critical segments.
const CRITICAL_PRIORITY: i32 = 100;
/// Seek window: segments before/after the target.
const SEEK_WINDOW_BEHIND: usize = 5;
const SEEK_WINDOW_AHEAD: usize = 10;
/// Pause between serial appends.
const APPEND_PAUSE: Duration = Duration::from_millis(10);
/// Cleanup cadence for the appended-set history.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);
/// Extra history kept around the prefetch window before cleanup drops it.
const CLEANUP_SLACK: f64 = 120.0;

/// Callback the coordinator injects; resolves a segment to bytes through
/// the arbiter chain.
pub type FetchFn = Arc<
    dyn Fn(SegmentDescriptor, FetchOptions) -> BoxFuture<'static, Result<FetchResult>>
        + Send
        + Sync,
>;

#[derive(Debug, Clone)]
pub enum BufferEvent {
    /// Fired when the classified buffer level changes.
    LevelChanged {
        level: BufferLevel,
        buffered_ahead: f64,
    },
    /// A periodic signal for the ABR decision loop.
    Tick { buffered_ahead: f64 },
    SegmentAppended {
        segment: SegmentDescriptor,
        index: usize,
    },
    SeekComplete { time: f64 },
}

pub struct BufferController {
    config: Arc<ConfigStore>,
    sink: Arc<MediaSink>,
    fetch: FetchFn,
    metrics: Arc<EngineMetrics>,
    queue: Mutex<AppendQueue>,
    /// Segment keys with an outstanding fetch; suppresses duplicates.
    fetching: Mutex<HashSet<String>>,
    variant: RwLock<Option<Arc<VariantPlaylist>>>,
    appending: AtomicBool,
    critical_active: AtomicBool,
    last_critical: Mutex<Instant>,
    seeking: AtomicBool,
    last_level: Mutex<Option<BufferLevel>>,
    notify: Notify,
    events: EventEmitter<BufferEvent>,
    token: CancellationToken,
}

impl BufferController {
    pub fn new(
        config: Arc<ConfigStore>,
        sink: Arc<MediaSink>,
        fetch: FetchFn,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            sink,
            fetch,
            metrics,
            queue: Mutex::new(AppendQueue::new()),
            fetching: Mutex::new(HashSet::new()),
            variant: RwLock::new(None),
            appending: AtomicBool::new(false),
            critical_active: AtomicBool::new(false),
            last_critical: Mutex::new(Instant::now() - CRITICAL_DEBOUNCE * 2),
            seeking: AtomicBool::new(false),
            last_level: Mutex::new(None),
            notify: Notify::new(),
            events: EventEmitter::new(),
            token: CancellationToken::new(),
        })
    }

    pub fn on_event(&self, listener: impl Fn(&BufferEvent) + Send + Sync + 'static) {
        self.events.subscribe(listener);
    }

    /// Install the variant and start the monitor, processor and cleanup
    /// loops.
    pub fn start(self: &Arc<Self>, variant: Arc<VariantPlaylist>) {
        *self.variant.write() = Some(variant);
        self.queue.lock().reseat(0);

        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.monitor_loop().await });
        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.process_loop().await });
        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.cleanup_loop().await });
    }

    pub fn status(&self) -> BufferStatus {
        self.sink.buffer_status()
    }

    pub fn next_expected_index(&self) -> Option<usize> {
        self.queue.lock().next_expected()
    }

    pub fn is_appended(&self, key: &str) -> bool {
        self.queue.lock().is_appended(key)
    }

    fn current_variant(&self) -> Option<Arc<VariantPlaylist>> {
        self.variant.read().clone()
    }

    // --- Monitor ---

    async fn monitor_loop(self: Arc<Self>) {
        loop {
            let interval = self.config.read(|c| c.monitor_interval());
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.monitor_tick().await;
                }
            }
        }
        debug!("Buffer monitor stopped");
    }

    async fn monitor_tick(self: &Arc<Self>) {
        let status = self.status();
        let (min, target, max) = self.config.read(|c| {
            (
                c.buffer_min_threshold,
                c.buffer_target_duration,
                c.buffer_max_threshold,
            )
        });

        let at_end = self.no_unappended_remaining(&status);
        let ahead = status.buffered_ahead;
        let level = if ahead < min / 3.0 && !at_end {
            BufferLevel::Critical
        } else if ahead < min && !at_end {
            BufferLevel::Low
        } else if ahead < target {
            BufferLevel::Normal
        } else if ahead > max {
            BufferLevel::High
        } else {
            BufferLevel::Normal
        };

        let changed = {
            let mut last = self.last_level.lock();
            if *last != Some(level) {
                *last = Some(level);
                true
            } else {
                false
            }
        };
        if changed {
            trace!(?level, ahead, "Buffer level changed");
            if level == BufferLevel::Critical {
                self.metrics.record_rebuffer();
            }
            self.events.emit(&BufferEvent::LevelChanged {
                level,
                buffered_ahead: ahead,
            });
        }
        self.events.emit(&BufferEvent::Tick {
            buffered_ahead: ahead,
        });

        match level {
            BufferLevel::Critical => self.critical_prefetch(&status).await,
            BufferLevel::Low | BufferLevel::Normal => {
                if !at_end {
                    self.standard_prefetch(&status).await;
                }
            }
            BufferLevel::High => {}
        }
    }

    /// True when every segment at or after the playhead is already
    /// appended. Suppresses critical/low churn at the end of the stream.
    fn no_unappended_remaining(&self, status: &BufferStatus) -> bool {
        let Some(variant) = self.current_variant() else {
            return false;
        };
        let queue = self.queue.lock();
        !variant
            .segments
            .iter()
            .filter(|s| s.timestamp + s.duration > status.current_time)
            .any(|s| !queue.is_appended(&s.key().to_string()))
    }

    // --- Prefetch paths ---

    /// Fetch up to five segments from the playhead with the peer rung
    /// bypassed. Debounced; concurrent calls short-circuit.
    async fn critical_prefetch(self: &Arc<Self>, status: &BufferStatus) {
        if self.critical_active.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut last = self.last_critical.lock();
            if last.elapsed() < CRITICAL_DEBOUNCE {
                self.critical_active.store(false, Ordering::SeqCst);
                return;
            }
            *last = Instant::now();
        }

        let targets = self.unfetched_from_position(status.current_time, CRITICAL_BURST);
        if !targets.is_empty() {
            debug!(count = targets.len(), "Critical prefetch");
            let fetches = targets.into_iter().map(|(index, segment)| {
                let controller = Arc::clone(self);
                async move {
                    controller
                        .fetch_and_queue(
                            segment,
                            index,
                            FetchOptions {
                                critical: true,
                                priority: CRITICAL_PRIORITY,
                                for_seek: false,
                            },
                            CRITICAL_PRIORITY,
                            false,
                        )
                        .await;
                }
            });
            futures::future::join_all(fetches).await;
        }
        self.critical_active.store(false, Ordering::SeqCst);
    }

    /// The window-based prefetch: nearest un-appended segments around the
    /// playhead, closest first, priority decaying with distance.
    async fn standard_prefetch(self: &Arc<Self>, status: &BufferStatus) {
        let Some(variant) = self.current_variant() else { return };
        let (ahead_secs, behind_secs, limit) = self.config.read(|c| {
            (
                c.prefetch_window_ahead,
                c.prefetch_window_behind,
                c.max_concurrent_fetches,
            )
        });
        let current = status.current_time;

        let mut candidates: Vec<(usize, SegmentDescriptor, f64)> = {
            let queue = self.queue.lock();
            let fetching = self.fetching.lock();
            variant
                .segments
                .iter()
                .enumerate()
                .filter(|(_, s)| {
                    s.timestamp + s.duration > current - behind_secs
                        && s.timestamp < current + ahead_secs
                })
                .filter(|(_, s)| {
                    let key = s.key().to_string();
                    !queue.is_appended(&key) && !fetching.contains(&key)
                })
                .map(|(i, s)| {
                    let distance = (s.timestamp - current).abs();
                    (i, s.clone(), distance)
                })
                .collect()
        };
        if candidates.is_empty() {
            return;
        }
        candidates.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(limit);

        let fetches = candidates.into_iter().map(|(index, segment, distance)| {
            let controller = Arc::clone(self);
            let priority = 50 - distance as i32;
            async move {
                controller
                    .fetch_and_queue(
                        segment,
                        index,
                        FetchOptions {
                            priority,
                            ..Default::default()
                        },
                        priority,
                        false,
                    )
                    .await;
            }
        });
        futures::future::join_all(fetches).await;
    }

    /// Next `limit` unfetched segments starting at the playhead position.
    fn unfetched_from_position(
        &self,
        current_time: f64,
        limit: usize,
    ) -> Vec<(usize, SegmentDescriptor)> {
        let Some(variant) = self.current_variant() else {
            return Vec::new();
        };
        let start = variant.index_at_time(current_time).unwrap_or(0);
        let queue = self.queue.lock();
        let fetching = self.fetching.lock();
        variant
            .segments
            .iter()
            .enumerate()
            .skip(start)
            .filter(|(_, s)| {
                let key = s.key().to_string();
                !queue.is_appended(&key) && !fetching.contains(&key)
            })
            .take(limit)
            .map(|(i, s)| (i, s.clone()))
            .collect()
    }

    /// Fetch one segment (duplicate-suppressed) and queue it for append.
    async fn fetch_and_queue(
        self: &Arc<Self>,
        segment: SegmentDescriptor,
        index: usize,
        options: FetchOptions,
        priority: i32,
        for_seek: bool,
    ) {
        let key = segment.key().to_string();
        if !self.fetching.lock().insert(key.clone()) {
            return;
        }
        let result = (self.fetch)(segment.clone(), options).await;
        self.fetching.lock().remove(&key);

        match result {
            Ok(fetched) => {
                self.queue_segment_for_append(segment, fetched.data, priority, for_seek, index);
            }
            Err(e) => {
                // The next monitor tick retries naturally.
                warn!(segment = %key, error = %e, "Prefetch failed");
            }
        }
    }

    pub fn queue_segment_for_append(
        &self,
        segment: SegmentDescriptor,
        data: Bytes,
        priority: i32,
        for_seek: bool,
        index: usize,
    ) {
        let pushed = self
            .queue
            .lock()
            .push(segment, data, priority, for_seek, index);
        if pushed {
            self.notify.notify_one();
        }
    }

    // --- Serial append processor ---

    async fn process_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = self.notify.notified() => {}
            }
            self.drain_queue().await;
        }
        debug!("Append processor stopped");
    }

    async fn drain_queue(self: &Arc<Self>) {
        if self.appending.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            let buffer_empty = self.sink.buffered_ranges().is_empty();
            let item = self.queue.lock().take_next(buffer_empty);
            let Some(request) = item else { break };

            let key = request.segment.key().to_string();
            match self.sink.append_media(request.data).await {
                Ok(()) => {
                    self.queue.lock().mark_appended(key, request.index);
                    self.metrics.record_segment_appended();
                    if self.seeking.swap(false, Ordering::SeqCst) {
                        self.events.emit(&BufferEvent::SeekComplete {
                            time: request.segment.timestamp,
                        });
                    }
                    trace!(segment = %request.segment.segment_id, index = request.index, "Segment appended");
                    self.events.emit(&BufferEvent::SegmentAppended {
                        segment: request.segment,
                        index: request.index,
                    });
                    tokio::time::sleep(APPEND_PAUSE).await;
                }
                Err(crate::error::EngineError::Cancelled) => {
                    trace!(segment = %key, "Append dropped by quality switch");
                }
                Err(e) => {
                    warn!(segment = %key, error = %e, "Append failed");
                    break;
                }
            }
        }
        self.appending.store(false, Ordering::SeqCst);
    }

    // --- Seek ---

    /// `seeking` fired: queued data is for the old position, drop it.
    pub fn on_seeking(&self) {
        self.seeking.store(true, Ordering::SeqCst);
        self.queue.lock().clear();
        debug!("Seek started; append queue dropped");
    }

    /// `seeked` fired: reseat the sequence at the target and prefetch a
    /// symmetric window, closest segments first.
    pub async fn on_seeked(self: &Arc<Self>, time: f64) {
        let Some(variant) = self.current_variant() else { return };
        let center = variant
            .index_at_time(time)
            .unwrap_or_else(|| variant.segments.len().saturating_sub(1));
        self.queue.lock().reseat(center);

        let start = center.saturating_sub(SEEK_WINDOW_BEHIND);
        let end = (center + SEEK_WINDOW_AHEAD + 1).min(variant.segments.len());
        let mut window: Vec<(usize, SegmentDescriptor, usize)> = {
            let queue = self.queue.lock();
            let fetching = self.fetching.lock();
            (start..end)
                .map(|i| (i, variant.segments[i].clone(), center.abs_diff(i)))
                .filter(|(_, s, _)| {
                    let key = s.key().to_string();
                    !queue.is_appended(&key) && !fetching.contains(&key)
                })
                .collect()
        };
        window.sort_by_key(|(_, _, distance)| *distance);

        debug!(time, center, count = window.len(), "Seek prefetch");
        let fetches = window.into_iter().map(|(index, segment, distance)| {
            let controller = Arc::clone(self);
            let priority = 100 - 5 * distance as i32;
            async move {
                controller
                    .fetch_and_queue(
                        segment,
                        index,
                        FetchOptions {
                            priority,
                            for_seek: true,
                            ..Default::default()
                        },
                        priority,
                        true,
                    )
                    .await;
            }
        });
        futures::future::join_all(fetches).await;
    }

    // --- Quality switch ---

    /// Adopt the new variant: reseat past the playhead and warm the next
    /// three segments, the first marked critical.
    pub async fn on_quality_switch(
        self: &Arc<Self>,
        variant: Arc<VariantPlaylist>,
        init: &InitSegment,
        skip_init_append: bool,
    ) -> Result<()> {
        if !skip_init_append {
            self.sink.append_init(init).await?;
        }
        let current_time = self.sink.current_time();
        let resume = variant
            .segments
            .iter()
            .position(|s| s.timestamp > current_time)
            .unwrap_or(variant.segments.len().saturating_sub(1));

        {
            let mut queue = self.queue.lock();
            queue.clear();
            queue.reseat(resume);
        }
        debug!(quality = %variant.quality_id, resume, "Buffer controller switching variant");

        let targets: Vec<(usize, SegmentDescriptor)> = (resume
            ..(resume + 3).min(variant.segments.len()))
            .map(|i| (i, variant.segments[i].clone()))
            .collect();
        let fetches = targets.into_iter().enumerate().map(|(offset, (index, segment))| {
            let controller = Arc::clone(self);
            let critical = offset == 0;
            let priority = if critical { 120 } else { 90 - 10 * offset as i32 };
            async move {
                controller
                    .fetch_and_queue(
                        segment,
                        index,
                        FetchOptions {
                            critical,
                            priority,
                            for_seek: false,
                        },
                        priority,
                        false,
                    )
                    .await;
            }
        });
        futures::future::join_all(fetches).await;
        // Install the variant only after the warm-up fetches are queued so
        // the monitor's window prefetch cannot slip in ahead of them.
        *self.variant.write() = Some(variant);
        Ok(())
    }

    // --- Cleanup ---

    async fn cleanup_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(CLEANUP_INTERVAL) => self.cleanup_appended(),
            }
        }
    }

    /// Drop appended-set history far outside the prefetch window so long
    /// sessions stay bounded and seeks back can re-fetch.
    fn cleanup_appended(&self) {
        let Some(variant) = self.current_variant() else { return };
        let (ahead, behind) = self
            .config
            .read(|c| (c.prefetch_window_ahead, c.prefetch_window_behind));
        let current = self.sink.current_time();
        let low = current - (behind + CLEANUP_SLACK);
        let high = current + (ahead + CLEANUP_SLACK);

        let mut queue = self.queue.lock();
        let before = queue.appended_count();
        queue.retain_appended(|key| {
            let Some((_, segment_id)) = key.split_once(':') else {
                return false;
            };
            match variant.segments.iter().find(|s| s.segment_id == segment_id) {
                Some(s) => s.timestamp >= low && s.timestamp <= high,
                // Keys from other variants are stale history.
                None => false,
            }
        });
        let dropped = before - queue.appended_count();
        if dropped > 0 {
            trace!(dropped, "Pruned appended-set history");
        }
    }

    pub fn destroy(&self) {
        self.token.cancel();
        self.queue.lock().clear();
        self.fetching.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MediaSurface;
    use crate::sink::{SimulatedSurface, annotated_segment};
    use futures::FutureExt;

    fn variant(count: usize) -> Arc<VariantPlaylist> {
        Arc::new(VariantPlaylist {
            stream_id: "movie".into(),
            quality_id: "720p".into(),
            target_duration: 6.0,
            total_duration: count as f64 * 6.0,
            segments: (0..count)
                .map(|i| SegmentDescriptor {
                    stream_id: "movie".into(),
                    quality_id: "720p".into(),
                    segment_id: format!("seg_{i:04}.m4s"),
                    duration: 6.0,
                    timestamp: i as f64 * 6.0,
                })
                .collect(),
        })
    }

    /// Fetch callback producing simulated media bytes instantly.
    fn instant_fetch() -> (FetchFn, Arc<parking_lot::Mutex<Vec<(String, bool)>>>) {
        let log: Arc<parking_lot::Mutex<Vec<(String, bool)>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let fetch: FetchFn = Arc::new(move |segment, options| {
            log_clone
                .lock()
                .push((segment.segment_id.clone(), options.critical));
            let data = annotated_segment(segment.timestamp, segment.duration, 32);
            async move {
                Ok(FetchResult {
                    data,
                    source: crate::fetch::FetchOrigin::Origin,
                    latency_ms: 5,
                })
            }
            .boxed()
        });
        (fetch, log)
    }

    async fn controller_setup(
        segment_count: usize,
    ) -> (
        Arc<BufferController>,
        Arc<MediaSink>,
        Arc<SimulatedSurface>,
        Arc<parking_lot::Mutex<Vec<(String, bool)>>>,
    ) {
        let config = Arc::new(ConfigStore::default());
        let surface = Arc::new(SimulatedSurface::new(Duration::ZERO));
        let sink = Arc::new(MediaSink::new(Arc::clone(&surface) as Arc<dyn crate::sink::MediaSurface>));
        sink.initialize("video/mp4").await.unwrap();
        sink.append_init(&InitSegment {
            quality_id: "720p".into(),
            data: Bytes::from_static(b"init"),
            url: String::new(),
        })
        .await
        .unwrap();

        let (fetch, log) = instant_fetch();
        let controller = BufferController::new(
            config,
            Arc::clone(&sink),
            fetch,
            Arc::new(EngineMetrics::new()),
        );
        *controller.variant.write() = Some(variant(segment_count));
        controller.queue.lock().reseat(0);
        (controller, sink, surface, log)
    }

    #[tokio::test]
    async fn appends_drain_in_order() {
        let (controller, _sink, surface, _log) = controller_setup(10).await;
        // Queue out of order.
        for index in [2usize, 0, 1] {
            let segment = controller.current_variant().unwrap().segments[index].clone();
            let data = annotated_segment(segment.timestamp, segment.duration, 16);
            controller.queue_segment_for_append(segment, data, 50, false, index);
        }
        controller.drain_queue().await;
        let ranges = surface.buffered();
        assert_eq!(ranges.len(), 1);
        assert!((ranges[0].end - 18.0).abs() < 1e-9);
        assert_eq!(controller.next_expected_index(), Some(3));
    }

    #[tokio::test]
    async fn gap_blocks_until_filled() {
        let (controller, _sink, surface, _log) = controller_setup(10).await;
        let segments = controller.current_variant().unwrap().segments.clone();

        let push = |c: &Arc<BufferController>, i: usize| {
            let s = segments[i].clone();
            let data = annotated_segment(s.timestamp, s.duration, 16);
            c.queue_segment_for_append(s, data, 50, false, i);
        };
        push(&controller, 0);
        push(&controller, 2);
        controller.drain_queue().await;
        // Only segment 0 landed; 2 waits for 1.
        assert!((surface.buffered()[0].end - 6.0).abs() < 1e-9);

        push(&controller, 1);
        controller.drain_queue().await;
        assert!((surface.buffered()[0].end - 18.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn critical_prefetch_bypasses_peers_and_bursts_five() {
        let (controller, _sink, surface, log) = controller_setup(20).await;
        surface.set_time(0.0);
        let status = controller.status();
        controller.critical_prefetch(&status).await;

        let log = log.lock();
        assert_eq!(log.len(), CRITICAL_BURST);
        assert!(log.iter().all(|(_, critical)| *critical));
        assert_eq!(log[0].0, "seg_0000.m4s");
    }

    #[tokio::test]
    async fn critical_prefetch_debounces() {
        let (controller, _sink, _surface, log) = controller_setup(20).await;
        let status = controller.status();
        controller.critical_prefetch(&status).await;
        let first = log.lock().len();
        // Immediately again: inside the debounce window, and the appended
        // set now dedups anyway. Expect no new fetches.
        controller.critical_prefetch(&status).await;
        assert_eq!(log.lock().len(), first);
    }

    #[tokio::test]
    async fn seek_drains_queue_and_reseats() {
        let (controller, _sink, surface, log) = controller_setup(30).await;
        // Stale queued data from position 0.
        let segment = controller.current_variant().unwrap().segments[0].clone();
        let data = annotated_segment(segment.timestamp, segment.duration, 16);
        controller.queue_segment_for_append(segment, data, 50, false, 0);

        controller.on_seeking();
        assert!(controller.queue.lock().is_empty());

        surface.set_time(120.0);
        controller.on_seeked(120.0).await;
        // Reseated at the segment containing 120 s = index 20.
        controller.drain_queue().await;
        let appended: Vec<String> = log.lock().iter().map(|(id, _)| id.clone()).collect();
        assert!(appended.contains(&"seg_0020.m4s".to_string()));
        // First appended segment covers the seek target.
        let ranges = surface.buffered();
        assert!(ranges.iter().any(|r| r.contains(120.0)));
    }

    #[tokio::test]
    async fn quality_switch_reseats_after_playhead() {
        let (controller, _sink, surface, log) = controller_setup(30).await;
        surface.set_time(33.0);

        let new_variant = Arc::new(VariantPlaylist {
            quality_id: "1080p".into(),
            ..(*variant(30)).clone()
        });
        let init = InitSegment {
            quality_id: "1080p".into(),
            data: Bytes::from_static(b"init-hi"),
            url: String::new(),
        };
        controller
            .on_quality_switch(Arc::clone(&new_variant), &init, true)
            .await
            .unwrap();

        // First segment starting after 33 s is index 6 (36 s).
        assert_eq!(controller.next_expected_index(), Some(6));
        let log = log.lock();
        assert_eq!(log.len(), 3);
        assert!(log[0].1, "first post-switch fetch is critical");
        assert_eq!(log[0].0, "seg_0006.m4s");
    }

    #[tokio::test]
    async fn monitor_suppresses_critical_at_end_of_stream() {
        let (controller, _sink, surface, _log) = controller_setup(2).await;
        // Append both segments, playhead near the end with a thin buffer.
        for index in 0..2usize {
            let segment = controller.current_variant().unwrap().segments[index].clone();
            let data = annotated_segment(segment.timestamp, segment.duration, 16);
            controller.queue_segment_for_append(segment, data, 50, false, index);
        }
        controller.drain_queue().await;
        surface.set_time(11.5);
        let status = controller.status();
        assert!(status.buffered_ahead < 1.0);
        assert!(controller.no_unappended_remaining(&status));
    }

    #[tokio::test]
    async fn standard_prefetch_orders_by_distance_and_bounds_concurrency() {
        let (controller, _sink, surface, log) = controller_setup(30).await;
        surface.set_time(30.0);
        let status = controller.status();
        controller.standard_prefetch(&status).await;

        let log = log.lock();
        // Bounded by maxConcurrentFetches (default 4).
        assert_eq!(log.len(), 4);
        // Closest segment to t=30 is index 5 (30.0) then 4/6.
        assert_eq!(log[0].0, "seg_0005.m4s");
        assert!(!log[0].1);
    }
}
