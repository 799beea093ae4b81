// Coordinator: constructs and wires the engine components, owns the
// initialization sequence, and routes runtime events between signaling,
// the swarm, ABR and the buffer pipeline.

use crate::abr::AbrController;
use crate::buffer::{BufferController, BufferEvent, FetchFn};
use crate::cache::SegmentCache;
use crate::config::{ConfigStore, PlayerConfig};
use crate::error::{EngineError, Result};
use crate::events::{PlayerEvent, SwitchReason};
use crate::fetch::{FetchArbiter, OriginFetcher};
use crate::media::Quality;
use crate::metrics::EngineMetrics;
use crate::peer::PeerManager;
use crate::playlist;
use crate::signaling::{SignalingClient, SignalingEvent};
use crate::sink::{MediaSink, MediaSurface, SinkEvent};
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Hot TTL for the master playlist entry.
const MASTER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Internal pump between sync event listeners and async handling.
enum Routed {
    Buffer(BufferEvent),
    Sink(SinkEvent),
}

pub struct PlayerCoordinator {
    config: Arc<ConfigStore>,
    cache: Arc<SegmentCache>,
    signaling: Arc<SignalingClient>,
    peers: Arc<PeerManager>,
    origin: Arc<OriginFetcher>,
    arbiter: Arc<FetchArbiter>,
    abr: Arc<AbrController>,
    sink: Arc<MediaSink>,
    buffer: Arc<BufferController>,
    metrics: Arc<EngineMetrics>,
    stream_id: String,
    manual_quality: AtomicBool,
    events_tx: mpsc::Sender<PlayerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<PlayerEvent>>>,
    routed_tx: mpsc::Sender<Routed>,
    routed_rx: Mutex<Option<mpsc::Receiver<Routed>>>,
    token: CancellationToken,
}

impl PlayerCoordinator {
    pub fn new(
        stream_id: impl Into<String>,
        surface: Arc<dyn MediaSurface>,
        config: PlayerConfig,
    ) -> Result<Arc<Self>> {
        let stream_id = stream_id.into();
        let config = Arc::new(ConfigStore::new(config)?);
        let client_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();

        let cache = Arc::new(SegmentCache::with_lru(
            config.read(|c| c.cache_size_limit),
        ));
        let signaling = Arc::new(SignalingClient::new(
            Arc::clone(&config),
            client_id,
            stream_id.clone(),
        ));
        let peers = PeerManager::new(
            Arc::clone(&config),
            Arc::clone(&signaling),
            Arc::clone(&cache),
            stream_id.clone(),
        );
        let origin = Arc::new(OriginFetcher::new(Arc::clone(&config), token.child_token())?);
        let metrics = Arc::new(EngineMetrics::new());
        let arbiter = FetchArbiter::new(
            Arc::clone(&config),
            Arc::clone(&cache),
            Arc::clone(&peers),
            Arc::clone(&origin),
            Arc::clone(&signaling),
            Arc::clone(&metrics),
        );
        let abr = Arc::new(AbrController::new(
            Arc::clone(&config),
            Arc::clone(&arbiter),
            Arc::clone(&origin),
            Arc::clone(&cache),
            stream_id.clone(),
        ));
        let sink = Arc::new(MediaSink::new(surface));

        // The buffer controller pulls segments through the arbiter chain.
        let fetch: FetchFn = {
            let arbiter = Arc::clone(&arbiter);
            Arc::new(move |segment, options| {
                let arbiter = Arc::clone(&arbiter);
                async move { arbiter.fetch(&segment, options).await }.boxed()
            })
        };
        let buffer = BufferController::new(
            Arc::clone(&config),
            Arc::clone(&sink),
            fetch,
            Arc::clone(&metrics),
        );

        let (events_tx, events_rx) = mpsc::channel(64);
        let (routed_tx, routed_rx) = mpsc::channel(256);

        Ok(Arc::new(Self {
            config,
            cache,
            signaling,
            peers,
            origin,
            arbiter,
            abr,
            sink,
            buffer,
            metrics,
            stream_id,
            manual_quality: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            routed_tx,
            routed_rx: Mutex::new(Some(routed_rx)),
            token,
        }))
    }

    /// Take the engine's event stream. Single consumer.
    pub fn events(&self) -> Option<mpsc::Receiver<PlayerEvent>> {
        self.events_rx.lock().take()
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn sink(&self) -> &Arc<MediaSink> {
        &self.sink
    }

    pub fn abr(&self) -> &Arc<AbrController> {
        &self.abr
    }

    pub fn arbiter(&self) -> &Arc<FetchArbiter> {
        &self.arbiter
    }

    pub fn cache(&self) -> &Arc<SegmentCache> {
        &self.cache
    }

    /// Bring the whole pipeline up: signaling, playlists, init segment,
    /// media sink, buffer loops. Emits `Ready` on success.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        if let Err(e) = self.run_initialization().await {
            let _ = self.events_tx.try_send(PlayerEvent::Error {
                message: e.to_string(),
                fatal: true,
            });
            return Err(e);
        }
        Ok(())
    }

    async fn run_initialization(self: &Arc<Self>) -> Result<()> {
        self.signaling.connect().await?;
        self.spawn_signaling_router();

        let master_text = self.origin.fetch_master_text(&self.stream_id).await?;
        let master = Arc::new(playlist::parse_master(&self.stream_id, &master_text)?);
        self.cache.store_master(Arc::clone(&master), MASTER_TTL);

        let initial_quality = self.abr.initialize(master).await?;
        let variant = self
            .abr
            .variant(&initial_quality.id)
            .ok_or_else(|| EngineError::internal("initial variant missing after load"))?;
        let init = self.abr.ensure_init(&initial_quality.id).await?;

        self.sink.initialize(&initial_quality.mime_type()).await?;
        self.sink.set_duration(variant.total_duration).await?;
        self.sink.append_init(&init).await?;

        let cleanup_interval =
            Duration::from_millis(self.config.read(|c| c.cache_cleanup_interval_ms));
        let _sweeper = self
            .cache
            .spawn_cleanup(cleanup_interval, self.token.child_token());

        self.peers.start();
        self.install_component_listeners();
        self.spawn_routed_pump();
        self.buffer.start(variant);

        info!(stream = %self.stream_id, quality = %initial_quality.id, "Player ready");
        let _ = self.events_tx.try_send(PlayerEvent::Ready {
            stream_id: self.stream_id.clone(),
            quality_id: initial_quality.id.clone(),
        });
        Ok(())
    }

    /// Bridge sync component emitters into the async routed pump.
    fn install_component_listeners(self: &Arc<Self>) {
        let routed = self.routed_tx.clone();
        self.buffer.on_event(move |event| {
            let _ = routed.try_send(Routed::Buffer(event.clone()));
        });
        let routed = self.routed_tx.clone();
        self.sink.on_event(move |event| {
            let _ = routed.try_send(Routed::Sink(event.clone()));
        });
    }

    fn spawn_routed_pump(self: &Arc<Self>) {
        let Some(mut routed_rx) = self.routed_rx.lock().take() else {
            return;
        };
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = coordinator.token.cancelled() => break,
                    event = routed_rx.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            Routed::Buffer(event) => coordinator.handle_buffer_event(event).await,
                            Routed::Sink(event) => coordinator.handle_sink_event(event),
                        }
                    }
                }
            }
        });
    }

    fn spawn_signaling_router(self: &Arc<Self>) {
        let Some(mut events) = self.signaling.events() else {
            warn!("Signaling events already consumed");
            return;
        };
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = coordinator.token.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        coordinator.handle_signaling_event(event).await;
                    }
                }
            }
        });
    }

    async fn handle_signaling_event(self: &Arc<Self>, event: SignalingEvent) {
        match event {
            SignalingEvent::RtcOffer { from, sdp } => {
                if let Err(e) = self.peers.handle_offer(&from, &sdp).await {
                    warn!(peer = %from, error = %e, "Offer handling failed");
                }
            }
            SignalingEvent::RtcAnswer { from, sdp } => {
                self.peers.handle_answer(&from, &sdp).await;
            }
            SignalingEvent::IceCandidate { from, candidate } => {
                self.peers.handle_ice_candidate(&from, candidate).await;
            }
            SignalingEvent::WhoHasReply(reply) => {
                // The reply names the segment; scope it to the quality we
                // are currently playing.
                if let Some(quality_id) = self.abr.current_quality_id() {
                    let key = format!("{}:{}:{}", self.stream_id, quality_id, reply.segment_id);
                    let ids: Vec<String> =
                        reply.peers.iter().map(|p| p.peer_id.clone()).collect();
                    self.peers.record_availability(&key, &ids);
                }
            }
            SignalingEvent::PeerList(ids) => {
                let target = self.config.read(|c| c.min_active_peers);
                for peer_id in ids.into_iter().take(target) {
                    if let Err(e) = self.peers.connect_to_peer(&peer_id).await {
                        debug!(peer = %peer_id, error = %e, "Swarm dial failed");
                    }
                }
            }
            SignalingEvent::Connected => debug!("Signaling connected"),
            SignalingEvent::Disconnected => debug!("Signaling disconnected"),
            SignalingEvent::ServerError { message } => {
                let _ = self.events_tx.try_send(PlayerEvent::Error {
                    message,
                    fatal: false,
                });
            }
        }
    }

    async fn handle_buffer_event(self: &Arc<Self>, event: BufferEvent) {
        match event {
            BufferEvent::Tick { buffered_ahead } => {
                // The ABR decision loop; manual mode latches it off.
                if !self.manual_quality.load(Ordering::SeqCst)
                    && let Some(target) = self.abr.decide(buffered_ahead)
                    && let Err(e) = self.switch_quality(&target, SwitchReason::Abr).await
                {
                    warn!(to = %target, error = %e, "ABR switch failed");
                }
            }
            BufferEvent::LevelChanged {
                level,
                buffered_ahead,
            } => {
                let _ = self.events_tx.try_send(PlayerEvent::BufferLevel {
                    level,
                    buffered_ahead,
                });
            }
            BufferEvent::SegmentAppended { segment, index } => {
                let _ = self.events_tx.try_send(PlayerEvent::SegmentAppended {
                    quality_id: segment.quality_id.clone(),
                    segment_id: segment.segment_id.clone(),
                    index,
                });
                // ABR-side lookahead runs fire-and-forget; the arbiter's
                // in-flight table keeps it from duplicating buffer-side
                // prefetch work.
                let abr = Arc::clone(&self.abr);
                let segment_id = segment.segment_id.clone();
                tokio::spawn(async move {
                    abr.prefetch_following(&segment_id).await;
                });
            }
            BufferEvent::SeekComplete { time } => {
                debug!(time, "Seek landed");
            }
        }
    }

    fn handle_sink_event(self: &Arc<Self>, event: SinkEvent) {
        match event {
            SinkEvent::Error { message } => {
                // Media source failures are fatal for the session.
                let _ = self.events_tx.try_send(PlayerEvent::Error {
                    message,
                    fatal: true,
                });
            }
            SinkEvent::StateChanged(state) => {
                debug!(?state, "Playback state");
            }
            SinkEvent::QualityChanged { .. } => {}
        }
    }

    /// Full quality switch: ABR prepares (init included), the sink runs its
    /// truncate-and-reinit protocol, the buffer controller adopts the new
    /// variant.
    pub async fn switch_quality(
        self: &Arc<Self>,
        quality_id: &str,
        reason: SwitchReason,
    ) -> Result<()> {
        let from = self.abr.current_quality_id();
        let Some(init) = self.abr.set_quality(quality_id, reason).await? else {
            return Ok(());
        };
        let quality: Quality = self
            .abr
            .quality(quality_id)
            .ok_or_else(|| EngineError::config(format!("unknown quality `{quality_id}`")))?;

        self.sink.switch_quality(&quality, &init).await?;

        let variant = match self.abr.variant(quality_id) {
            Some(variant) => variant,
            None => {
                return Err(EngineError::playlist(format!(
                    "variant `{quality_id}` unavailable after switch"
                )));
            }
        };
        self.buffer
            .on_quality_switch(variant, &init, true)
            .await?;

        let _ = self.events_tx.try_send(PlayerEvent::QualityChanged {
            from,
            to: quality_id.to_string(),
            reason,
        });
        Ok(())
    }

    /// Pin a quality, disabling the ABR loop.
    pub async fn set_manual_quality(self: &Arc<Self>, quality_id: &str) -> Result<()> {
        self.manual_quality.store(true, Ordering::SeqCst);
        self.switch_quality(quality_id, SwitchReason::Manual).await
    }

    /// Re-enable automatic quality selection.
    pub fn set_auto_quality(&self) {
        self.manual_quality.store(false, Ordering::SeqCst);
        debug!("ABR re-enabled");
    }

    pub fn is_manual_quality(&self) -> bool {
        self.manual_quality.load(Ordering::SeqCst)
    }

    /// Seek: drop queued appends, move the sink, announce the landing
    /// window, then let the buffer controller prefetch around the target.
    pub async fn seek(self: &Arc<Self>, time: f64) -> Result<()> {
        self.buffer.on_seeking();
        self.sink.seek(time).await?;

        if let Some(quality_id) = self.abr.current_quality_id()
            && let Some(target) = self.cache.segment_at_time(&self.stream_id, &quality_id, time)
        {
            debug!(time, segment = %target.segment_id, "Seek target");
        }
        self.buffer.on_seeked(time).await;
        Ok(())
    }

    pub async fn play(&self) -> Result<()> {
        self.sink.play().await
    }

    pub async fn pause(&self) -> Result<()> {
        self.sink.pause().await
    }

    /// Tear the whole session down and log delivery statistics.
    pub async fn destroy(&self) {
        self.token.cancel();
        self.buffer.destroy();
        self.peers.destroy().await;
        self.signaling.destroy().await;
        self.sink.destroy().await;
        self.metrics.log_summary();
        info!(stream = %self.stream_id, "Player destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SimulatedSurface;

    fn coordinator() -> Arc<PlayerCoordinator> {
        let surface = Arc::new(SimulatedSurface::new(Duration::ZERO));
        PlayerCoordinator::new("movie-1", surface, PlayerConfig::default()).unwrap()
    }

    #[test]
    fn construction_wires_components() {
        let c = coordinator();
        assert!(c.events().is_some());
        // The event stream is single-consumer.
        assert!(c.events().is_none());
        assert!(!c.is_manual_quality());
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let surface = Arc::new(SimulatedSurface::new(Duration::ZERO));
        let config = PlayerConfig {
            cache_size_limit: 0,
            ..Default::default()
        };
        assert!(PlayerCoordinator::new("movie-1", surface, config).is_err());
    }

    #[tokio::test]
    async fn manual_quality_latch_toggles() {
        let c = coordinator();
        c.manual_quality.store(true, Ordering::SeqCst);
        assert!(c.is_manual_quality());
        c.set_auto_quality();
        assert!(!c.is_manual_quality());
    }
}
