// Media Sink Adapter: owns the media source attachment, serializes all
// buffer mutations, and derives the playback state machine.

mod simulated;
mod surface;

pub use simulated::{SimulatedSurface, annotated_segment};
pub use surface::{MediaSurface, SurfaceEvent};

use crate::error::{EngineError, Result};
use crate::events::EventEmitter;
use crate::media::{BufferStatus, InitSegment, Quality, TimeRange};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Seconds of already-buffered media kept in front of the playhead when a
/// quality switch truncates the buffer.
pub const SAFE_SWITCH_OFFSET: f64 = 0.5;

/// Playback state derived from the media element's events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Playing,
    Paused,
    Buffering,
    Ended,
}

/// Events emitted by the sink adapter.
#[derive(Debug, Clone)]
pub enum SinkEvent {
    StateChanged(PlaybackState),
    QualityChanged {
        from: Option<String>,
        to: String,
    },
    Error {
        message: String,
    },
}

pub struct MediaSink {
    surface: Arc<dyn MediaSurface>,
    /// Serializes every append/remove; callers queue behind the in-flight
    /// update and resolve after its update-end.
    op_lock: Mutex<()>,
    /// Bumped on quality switch and destroy; queued appends from an older
    /// epoch abort instead of landing stale bytes.
    epoch: AtomicU64,
    init_appended: AtomicBool,
    current_quality: RwLock<Option<String>>,
    state_tx: watch::Sender<PlaybackState>,
    events: Arc<EventEmitter<SinkEvent>>,
    event_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    token: CancellationToken,
}

impl MediaSink {
    pub fn new(surface: Arc<dyn MediaSurface>) -> Self {
        let (state_tx, _) = watch::channel(PlaybackState::Paused);
        Self {
            surface,
            op_lock: Mutex::new(()),
            epoch: AtomicU64::new(0),
            init_appended: AtomicBool::new(false),
            current_quality: RwLock::new(None),
            state_tx,
            events: Arc::new(EventEmitter::new()),
            event_task: parking_lot::Mutex::new(None),
            token: CancellationToken::new(),
        }
    }

    /// Attach the media source and start deriving playback state.
    pub async fn initialize(&self, mime: &str) -> Result<()> {
        self.surface.attach(mime).await?;
        let mut rx = self.surface.subscribe();
        let state_tx = self.state_tx.clone();
        let token = self.token.clone();
        let events = Arc::clone(&self.events);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => {
                        let Ok(event) = event else { break };
                        Self::apply_surface_event(&state_tx, &events, event);
                    }
                }
            }
        });
        *self.event_task.lock() = Some(task);
        debug!(mime, "Media sink initialized");
        Ok(())
    }

    fn apply_surface_event(
        state_tx: &watch::Sender<PlaybackState>,
        events: &EventEmitter<SinkEvent>,
        event: SurfaceEvent,
    ) {
        let current = *state_tx.borrow();
        let next = match &event {
            SurfaceEvent::Play => Some(PlaybackState::Playing),
            SurfaceEvent::Pause if current != PlaybackState::Ended => Some(PlaybackState::Paused),
            SurfaceEvent::Ended => Some(PlaybackState::Ended),
            SurfaceEvent::Waiting
                if current != PlaybackState::Paused && current != PlaybackState::Ended =>
            {
                Some(PlaybackState::Buffering)
            }
            SurfaceEvent::CanPlay
                if current != PlaybackState::Paused && current != PlaybackState::Ended =>
            {
                Some(PlaybackState::Playing)
            }
            SurfaceEvent::Error { message } => {
                events.emit(&SinkEvent::Error {
                    message: message.clone(),
                });
                None
            }
            _ => None,
        };
        if let Some(next) = next
            && next != current
        {
            trace!(?current, ?next, "Playback state transition");
            let _ = state_tx.send(next);
            events.emit(&SinkEvent::StateChanged(next));
        }
    }

    pub fn on_event(&self, listener: impl Fn(&SinkEvent) + Send + Sync + 'static) {
        self.events.subscribe(listener);
    }

    pub fn playback_state(&self) -> PlaybackState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlaybackState> {
        self.state_tx.subscribe()
    }

    pub fn current_quality(&self) -> Option<String> {
        self.current_quality.read().clone()
    }

    pub async fn set_duration(&self, seconds: f64) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.surface.set_duration(seconds).await
    }

    /// Append an init segment. Serial like every buffer mutation.
    pub async fn append_init(&self, init: &InitSegment) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.surface.append_buffer(init.data.clone()).await?;
        self.init_appended.store(true, Ordering::SeqCst);
        if self.current_quality.read().is_none() {
            *self.current_quality.write() = Some(init.quality_id.clone());
        }
        Ok(())
    }

    /// Append media bytes. Rejects when no init segment has been appended;
    /// aborts when a quality switch cleared the pending queue while this
    /// call was waiting its turn.
    pub async fn append_media(&self, data: Bytes) -> Result<()> {
        if !self.init_appended.load(Ordering::SeqCst) {
            return Err(EngineError::sink("append_media before init segment"));
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        let _guard = self.op_lock.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Err(EngineError::Cancelled);
        }
        self.surface.append_buffer(data).await
    }

    pub async fn remove_range(&self, start: f64, end: f64) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.surface.remove_range(start, end).await
    }

    /// Quality switch protocol: drain the in-flight update, drop queued
    /// appends, truncate buffered media past `current_time + 0.5 s`, then
    /// append the new init without touching the timeline offset.
    pub async fn switch_quality(&self, quality: &Quality, init: &InitSegment) -> Result<()> {
        // Invalidate queued appends before taking the lock so they abort
        // the moment the in-flight update drains.
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let _guard = self.op_lock.lock().await;

        let cut = self.surface.current_time() + SAFE_SWITCH_OFFSET;
        for range in self.surface.buffered() {
            if range.end > cut {
                self.surface.remove_range(cut.max(range.start), range.end).await?;
            }
        }

        self.surface.append_buffer(init.data.clone()).await?;
        self.init_appended.store(true, Ordering::SeqCst);

        let from = self.current_quality.read().clone();
        *self.current_quality.write() = Some(quality.id.clone());
        debug!(from = ?from, to = %quality.id, "Sink switched quality");
        self.events.emit(&SinkEvent::QualityChanged {
            from,
            to: quality.id.clone(),
        });
        Ok(())
    }

    /// Seek after letting the in-flight update complete. The serial
    /// contract forbids force-aborting an append mid-update.
    pub async fn seek(&self, time: f64) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.surface.seek(time).await
    }

    pub async fn play(&self) -> Result<()> {
        self.surface.play().await
    }

    pub async fn pause(&self) -> Result<()> {
        self.surface.pause().await
    }

    pub async fn end_of_stream(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.surface.end_of_stream().await
    }

    pub fn buffered_ranges(&self) -> Vec<TimeRange> {
        self.surface.buffered()
    }

    pub fn current_time(&self) -> f64 {
        self.surface.current_time()
    }

    /// Snapshot of buffered geometry around the playhead.
    pub fn buffer_status(&self) -> BufferStatus {
        BufferStatus::from_ranges(
            self.surface.buffered(),
            self.surface.current_time(),
            self.surface.duration(),
        )
    }

    /// Seconds buffered ahead of the playhead.
    pub fn buffered_ahead(&self) -> f64 {
        self.buffer_status().buffered_ahead
    }

    pub async fn destroy(&self) {
        self.token.cancel();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
        self.surface.detach().await;
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Quality;
    use std::time::Duration;

    fn quality(id: &str) -> Quality {
        Quality {
            id: id.to_string(),
            bandwidth: 2_500_000,
            width: 1280,
            height: 720,
            codecs: "avc1.64001f,mp4a.40.2".to_string(),
            frame_rate: None,
        }
    }

    fn init(id: &str) -> InitSegment {
        InitSegment {
            quality_id: id.to_string(),
            data: Bytes::from_static(b"init-bytes"),
            url: format!("http://seed/streams/movies/m/{id}/init.mp4"),
        }
    }

    async fn ready_sink(surface: Arc<SimulatedSurface>) -> MediaSink {
        let sink = MediaSink::new(surface);
        sink.initialize("video/mp4; codecs=\"avc1.64001f\"").await.unwrap();
        sink
    }

    #[tokio::test]
    async fn append_media_requires_init() {
        let surface = Arc::new(SimulatedSurface::new(Duration::ZERO));
        let sink = ready_sink(surface).await;
        let err = sink.append_media(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, EngineError::Sink { .. }));

        sink.append_init(&init("720p")).await.unwrap();
        sink.append_media(annotated_segment(0.0, 6.0, 64)).await.unwrap();
        assert_eq!(sink.buffered_ranges().len(), 1);
    }

    #[tokio::test]
    async fn appends_are_serialized() {
        let surface = Arc::new(SimulatedSurface::new(Duration::from_millis(10)));
        let sink = Arc::new(ready_sink(Arc::clone(&surface)).await);
        sink.append_init(&init("720p")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let sink = Arc::clone(&sink);
            handles.push(tokio::spawn(async move {
                sink.append_media(annotated_segment(i as f64 * 6.0, 6.0, 64))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        // Four contiguous segments merge into one range.
        let ranges = sink.buffered_ranges();
        assert_eq!(ranges.len(), 1);
        assert!((ranges[0].end - 24.0).abs() < 1e-9);
        assert_eq!(surface.max_concurrent_updates(), 1);
    }

    #[tokio::test]
    async fn quality_switch_truncates_after_safe_offset() {
        let surface = Arc::new(SimulatedSurface::new(Duration::ZERO));
        let sink = ready_sink(Arc::clone(&surface)).await;
        sink.append_init(&init("720p")).await.unwrap();
        for i in 0..5 {
            sink.append_media(annotated_segment(i as f64 * 6.0, 6.0, 64))
                .await
                .unwrap();
        }
        surface.set_time(10.0);

        sink.switch_quality(&quality("1080p"), &init("1080p")).await.unwrap();

        let ranges = sink.buffered_ranges();
        assert_eq!(ranges.len(), 1);
        assert!((ranges[0].end - 10.5).abs() < 1e-9);
        // Timeline origin untouched.
        assert!((ranges[0].start - 0.0).abs() < 1e-9);
        assert_eq!(sink.current_quality().as_deref(), Some("1080p"));
    }

    #[tokio::test]
    async fn playback_state_machine() {
        let surface = Arc::new(SimulatedSurface::new(Duration::ZERO));
        let sink = ready_sink(Arc::clone(&surface)).await;
        let mut state_rx = sink.subscribe_state();

        surface.emit(SurfaceEvent::Play);
        state_rx.changed().await.unwrap();
        assert_eq!(sink.playback_state(), PlaybackState::Playing);

        surface.emit(SurfaceEvent::Waiting);
        state_rx.changed().await.unwrap();
        assert_eq!(sink.playback_state(), PlaybackState::Buffering);

        surface.emit(SurfaceEvent::CanPlay);
        state_rx.changed().await.unwrap();
        assert_eq!(sink.playback_state(), PlaybackState::Playing);

        surface.emit(SurfaceEvent::Pause);
        state_rx.changed().await.unwrap();
        assert_eq!(sink.playback_state(), PlaybackState::Paused);

        // Waiting while paused does not enter buffering.
        surface.emit(SurfaceEvent::Waiting);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.playback_state(), PlaybackState::Paused);

        surface.emit(SurfaceEvent::Ended);
        state_rx.changed().await.unwrap();
        assert_eq!(sink.playback_state(), PlaybackState::Ended);
    }

    #[tokio::test]
    async fn buffer_status_reports_ahead() {
        let surface = Arc::new(SimulatedSurface::new(Duration::ZERO));
        let sink = ready_sink(Arc::clone(&surface)).await;
        sink.append_init(&init("720p")).await.unwrap();
        for i in 0..3 {
            sink.append_media(annotated_segment(i as f64 * 6.0, 6.0, 64))
                .await
                .unwrap();
        }
        surface.set_time(4.0);
        let status = sink.buffer_status();
        assert!((status.buffered_ahead - 14.0).abs() < 1e-9);
        assert!((status.buffered_behind - 4.0).abs() < 1e-9);
    }
}
