// Peer Manager: swarm lifecycle, the data-channel segment protocol,
// scoring, and the segment availability index.

mod connection;
mod protocol;
mod scoring;

pub use connection::{ChannelMessage, ChannelPayload, ConnectionPhase, PeerConnection};
pub use protocol::PeerMessage;
pub use scoring::PeerMetrics;

use crate::cache::SegmentCache;
use crate::config::ConfigStore;
use crate::error::{EngineError, Result};
use crate::events::EventEmitter;
use crate::media::SegmentDescriptor;
use crate::signaling::{IceCandidatePayload, SignalingClient};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use peerwire::{ChunkAssembler, Frame, REQUEST_ID_STRIDE};
use rand::RngExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Duplicate inbound offers inside this window are ignored.
const OFFER_DEBOUNCE: Duration = Duration::from_millis(500);
/// A peer idle this long after its last transfer is disconnected.
const IDLE_DISCONNECT: Duration = Duration::from_secs(30);
/// Peers with at least this many observations are subject to score-based
/// disconnection.
const MIN_OBSERVATIONS_FOR_SCORING: u64 = 5;
/// Payload bytes per data-channel message; larger responses are chunked.
const CHUNK_PAYLOAD_SIZE: usize = 15 * 1024;
/// How many candidate peers a segment lookup returns.
const BEST_PEER_COUNT: usize = 3;

/// Peer lifecycle notifications.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Connected { peer_id: String },
    Disconnected { peer_id: String, reason: String },
}

pub struct PeerRecord {
    pub id: String,
    connection: PeerConnection,
    score: RwLock<f64>,
    metrics: Mutex<PeerMetrics>,
    availability: RwLock<HashSet<String>>,
    last_active: Mutex<Instant>,
    idle_epoch: AtomicU64,
    assembler: Mutex<ChunkAssembler>,
}

impl PeerRecord {
    fn new(id: String, connection: PeerConnection) -> Self {
        Self {
            id,
            connection,
            // Neutral starting score until transfers say otherwise.
            score: RwLock::new(0.5),
            metrics: Mutex::new(PeerMetrics::new()),
            availability: RwLock::new(HashSet::new()),
            last_active: Mutex::new(Instant::now()),
            idle_epoch: AtomicU64::new(0),
            assembler: Mutex::new(ChunkAssembler::new()),
        }
    }

    pub fn score(&self) -> f64 {
        *self.score.read()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.connection.phase()
    }

    fn avg_latency_ms(&self) -> f64 {
        self.metrics.lock().avg_latency_ms
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }
}

struct PendingRequest {
    tx: oneshot::Sender<std::result::Result<Bytes, EngineError>>,
}

pub struct PeerManager {
    config: Arc<ConfigStore>,
    signaling: Arc<SignalingClient>,
    cache: Arc<SegmentCache>,
    stream_id: String,
    peers: RwLock<HashMap<String, Arc<PeerRecord>>>,
    /// Availability key -> peer ids believed to hold the segment.
    availability: RwLock<HashMap<String, HashSet<String>>>,
    pending: Mutex<HashMap<u32, PendingRequest>>,
    next_request_id: AtomicU32,
    last_stagger: Mutex<Instant>,
    recent_offers: Mutex<HashMap<String, Instant>>,
    /// Availability keys this client has announced to the swarm.
    announced: Mutex<HashSet<String>>,
    inbound_tx: mpsc::Sender<ChannelMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<ChannelMessage>>>,
    events: EventEmitter<PeerEvent>,
    token: CancellationToken,
}

impl PeerManager {
    pub fn new(
        config: Arc<ConfigStore>,
        signaling: Arc<SignalingClient>,
        cache: Arc<SegmentCache>,
        stream_id: String,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let manager = Arc::new(Self {
            config,
            signaling,
            cache,
            stream_id,
            peers: RwLock::new(HashMap::new()),
            availability: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU32::new(REQUEST_ID_STRIDE),
            last_stagger: Mutex::new(Instant::now() - Duration::from_secs(60)),
            recent_offers: Mutex::new(HashMap::new()),
            announced: Mutex::new(HashSet::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            events: EventEmitter::new(),
            token: CancellationToken::new(),
        });

        // Cache evictions unadvertise the segment to the swarm. Weak
        // reference: the cache must not keep the manager alive.
        let weak = Arc::downgrade(&manager);
        manager.cache.set_removal_hook(Arc::new(move |key| {
            if let Some(manager) = weak.upgrade()
                && let Some((stream, quality, segment)) = crate::cache::keys::parse_segment(key)
            {
                let availability_key = format!("{stream}:{quality}:{segment}");
                manager.unannounce_segment(&availability_key);
                // Push the shrunk set to connected peers when a runtime is
                // available (the hook itself must stay synchronous).
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let manager = Arc::clone(&manager);
                    handle.spawn(async move {
                        manager.broadcast_availability().await;
                    });
                }
            }
        }));

        manager
    }

    /// Start the inbound channel pump.
    pub fn start(self: &Arc<Self>) {
        let Some(mut inbound_rx) = self.inbound_rx.lock().take() else {
            return;
        };
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.token.cancelled() => break,
                    message = inbound_rx.recv() => {
                        let Some(message) = message else { break };
                        manager.handle_channel_message(message).await;
                    }
                }
            }
            debug!("Peer manager inbound pump stopped");
        });
    }

    pub fn on_event(&self, listener: impl Fn(&PeerEvent) + Send + Sync + 'static) {
        self.events.subscribe(listener);
    }

    fn alloc_request_id(&self) -> u32 {
        self.next_request_id
            .fetch_add(REQUEST_ID_STRIDE, Ordering::Relaxed)
    }

    pub fn peer(&self, peer_id: &str) -> Option<Arc<PeerRecord>> {
        self.peers.read().get(peer_id).cloned()
    }

    pub fn active_peer_count(&self) -> usize {
        self.peers
            .read()
            .values()
            .filter(|r| r.phase().is_usable())
            .count()
    }

    pub fn connected_peer_count(&self) -> usize {
        self.peers
            .read()
            .values()
            .filter(|r| r.phase() == ConnectionPhase::Connected)
            .count()
    }

    /// The lowest-scored currently connected peer.
    fn lowest_scored_connected(&self) -> Option<Arc<PeerRecord>> {
        self.peers
            .read()
            .values()
            .filter(|r| r.phase() == ConnectionPhase::Connected)
            .min_by(|a, b| {
                a.score()
                    .partial_cmp(&b.score())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    async fn enforce_peer_cap(&self) {
        let cap = self.config.read(|c| c.max_active_peers);
        while self.active_peer_count() >= cap {
            let Some(victim) = self.lowest_scored_connected() else {
                break;
            };
            info!(peer = %victim.id, score = victim.score(), "Evicting lowest-scored peer for capacity");
            self.disconnect_peer(&victim.id, "capacity").await;
        }
    }

    fn ice_sink_for(self: &Arc<Self>, peer_id: &str) -> Arc<dyn Fn(IceCandidatePayload) + Send + Sync> {
        let signaling = Arc::clone(&self.signaling);
        let to = peer_id.to_string();
        Arc::new(move |candidate| {
            signaling.send_ice_candidate(&to, candidate);
        })
    }

    /// Dial a remote peer. Reuses an existing usable record; at capacity the
    /// lowest-scored connected peer is evicted first.
    pub async fn connect_to_peer(self: &Arc<Self>, peer_id: &str) -> Result<()> {
        if let Some(existing) = self.peer(peer_id) {
            if existing.phase().is_usable() {
                trace!(peer = peer_id, "Reusing existing peer record");
                return Ok(());
            }
            self.disconnect_peer(peer_id, "stale record").await;
        }

        self.enforce_peer_cap().await;
        let cap = self.config.read(|c| c.max_active_peers);
        if self.active_peer_count() >= cap {
            // Everyone at the cap is still negotiating; nothing evictable.
            return Err(EngineError::peer(format!(
                "peer capacity {cap} reached with no evictable connection"
            )));
        }

        let connection = PeerConnection::new(
            peer_id.to_string(),
            Vec::new(),
            self.inbound_tx.clone(),
            self.ice_sink_for(peer_id),
        )
        .await?;
        let offer = connection.create_offer().await?;
        let record = Arc::new(PeerRecord::new(peer_id.to_string(), connection));
        self.peers.write().insert(peer_id.to_string(), Arc::clone(&record));
        self.spawn_establishment_guard(&record);

        self.signaling.send_offer(peer_id, &offer);
        debug!(peer = peer_id, "Sent offer");
        self.events.emit(&PeerEvent::Connected {
            peer_id: peer_id.to_string(),
        });
        Ok(())
    }

    /// Bound connection establishment: a peer whose data channel has not
    /// opened within `peerConnectionTimeout` is torn down, as is one whose
    /// connection reaches a terminal phase first. Without this, a dial
    /// whose answer never arrives would sit in `New` forever and pin a
    /// capacity slot.
    fn spawn_establishment_guard(self: &Arc<Self>, record: &Arc<PeerRecord>) {
        let deadline = self.config.read(|c| c.peer_connection_timeout());
        let manager = Arc::clone(self);
        let record = Arc::clone(record);
        tokio::spawn(async move {
            let mut phase_rx = record.connection.subscribe_phase();
            let terminal = async {
                loop {
                    if !phase_rx.borrow().is_usable() {
                        return;
                    }
                    if phase_rx.changed().await.is_err() {
                        return;
                    }
                }
            };
            tokio::select! {
                _ = manager.token.cancelled() => {}
                _ = terminal => {
                    debug!(peer = %record.id, "Connection failed before establishment");
                    manager.disconnect_peer(&record.id, "establishment failed").await;
                }
                opened = record.connection.wait_channel_open(deadline) => {
                    if let Err(e) = opened {
                        debug!(peer = %record.id, error = %e, "Establishment deadline missed");
                        manager.disconnect_peer(&record.id, "establishment timeout").await;
                    }
                }
            }
        });
    }

    /// Whether an inbound offer from `from` falls inside the debounce
    /// window. Records the offer time as a side effect.
    fn offer_debounced(&self, from: &str) -> bool {
        let mut recent = self.recent_offers.lock();
        let now = Instant::now();
        recent.retain(|_, t| now.duration_since(*t) < OFFER_DEBOUNCE * 4);
        match recent.get(from) {
            Some(t) if now.duration_since(*t) < OFFER_DEBOUNCE => true,
            _ => {
                recent.insert(from.to_string(), now);
                false
            }
        }
    }

    /// Accept an inbound offer and answer it.
    pub async fn handle_offer(self: &Arc<Self>, from: &str, sdp: &str) -> Result<()> {
        if self.offer_debounced(from) {
            debug!(peer = from, "Duplicate offer ignored (debounce)");
            return Ok(());
        }
        let cap = self.config.read(|c| c.max_active_peers);
        let has_existing = self.peer(from).is_some();
        if !has_existing && self.active_peer_count() >= cap {
            warn!(peer = from, cap, "Rejecting inbound offer at peer capacity");
            return Ok(());
        }
        // A fresh offer supersedes any existing record for this identity.
        if has_existing {
            self.disconnect_peer(from, "superseded by new offer").await;
        }

        let connection = PeerConnection::new(
            from.to_string(),
            Vec::new(),
            self.inbound_tx.clone(),
            self.ice_sink_for(from),
        )
        .await?;
        let answer = connection.accept_offer(sdp).await?;
        let record = Arc::new(PeerRecord::new(from.to_string(), connection));
        self.peers.write().insert(from.to_string(), Arc::clone(&record));
        self.spawn_establishment_guard(&record);

        self.signaling.send_answer(from, &answer);
        debug!(peer = from, "Answered offer");
        self.events.emit(&PeerEvent::Connected {
            peer_id: from.to_string(),
        });
        Ok(())
    }

    pub async fn handle_answer(&self, from: &str, sdp: &str) {
        let Some(record) = self.peer(from) else {
            warn!(peer = from, "Answer for unknown peer ignored");
            return;
        };
        match record.connection.apply_answer(sdp).await {
            Ok(true) => trace!(peer = from, "Applied answer"),
            Ok(false) => {}
            Err(e) => warn!(peer = from, error = %e, "Failed to apply answer"),
        }
    }

    pub async fn handle_ice_candidate(&self, from: &str, candidate: IceCandidatePayload) {
        let Some(record) = self.peer(from) else {
            warn!(peer = from, "ICE candidate for unknown peer ignored");
            return;
        };
        if let Err(e) = record.connection.add_remote_candidate(candidate).await {
            warn!(peer = from, error = %e, "Failed to apply ICE candidate");
        }
    }

    /// Merge a who-has result into the availability index.
    pub fn record_availability(&self, availability_key: &str, peer_ids: &[String]) {
        let mut index = self.availability.write();
        let entry = index.entry(availability_key.to_string()).or_default();
        for peer_id in peer_ids {
            entry.insert(peer_id.clone());
        }
        drop(index);

        let peers = self.peers.read();
        for peer_id in peer_ids {
            if let Some(record) = peers.get(peer_id) {
                record.availability.write().insert(availability_key.to_string());
            }
        }
    }

    /// Connected holders of a segment, best first (score desc, latency asc).
    pub fn best_peers(&self, availability_key: &str, limit: usize) -> Vec<Arc<PeerRecord>> {
        let holder_ids: Vec<String> = self
            .availability
            .read()
            .get(availability_key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();

        let peers = self.peers.read();
        let mut candidates: Vec<Arc<PeerRecord>> = holder_ids
            .iter()
            .filter_map(|id| peers.get(id))
            .filter(|r| {
                r.phase() == ConnectionPhase::Connected
                    && r.availability.read().contains(availability_key)
            })
            .cloned()
            .collect();
        drop(peers);

        candidates.sort_by(|a, b| rank_order(a.score(), a.avg_latency_ms(), b.score(), b.avg_latency_ms()));
        candidates.truncate(limit.max(1).min(BEST_PEER_COUNT));
        candidates
    }

    /// Jittered pre-request delay: 50-150 % of the configured base, scaled
    /// by 1.5 when requests come faster than one base interval apart.
    async fn staggered_delay(&self) {
        let base_ms = self.config.read(|c| c.staggered_request_delay_ms);
        if base_ms == 0 {
            return;
        }
        let jitter = rand::rng().random_range(0.5..1.5);
        let mut delay_ms = base_ms as f64 * jitter;
        {
            let mut last = self.last_stagger.lock();
            if last.elapsed() < Duration::from_millis(base_ms) {
                delay_ms *= 1.5;
            }
            *last = Instant::now();
        }
        tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
    }

    /// Request a segment from one peer with the bounded-wait protocol.
    /// Origin fallback is the arbiter's job, not ours.
    pub async fn fetch_from_peer(
        self: &Arc<Self>,
        peer_id: &str,
        segment: &SegmentDescriptor,
    ) -> Result<Bytes> {
        let record = self
            .peer(peer_id)
            .ok_or_else(|| EngineError::peer(format!("unknown peer {peer_id}")))?;
        if !record.connection.channel_ready() {
            return Err(EngineError::peer_channel(format!("channel to {peer_id} not ready")));
        }

        self.staggered_delay().await;

        // The channel may have closed while we were staggering.
        if !record.connection.channel_ready() {
            self.note_failure(&record).await;
            return Err(EngineError::peer_channel(format!("channel to {peer_id} closed")));
        }

        let (wait, retry_base) = self.config.read(|c| {
            let wait = c
                .segment_request_wait_max_ms
                .min(c.fetch_timeout_ms)
                .max(c.segment_request_wait_min_ms);
            (Duration::from_millis(wait), c.retry_delay_base())
        });

        let mut attempt: u32 = 0;
        loop {
            let request_id = self.alloc_request_id();
            let request = PeerMessage::SegmentRequest {
                request_id,
                segment_id: segment.segment_id.clone(),
                quality_id: segment.quality_id.clone(),
            };
            let json = serde_json::to_string(&request)
                .map_err(|e| EngineError::internal(format!("peer request serialization: {e}")))?;

            let (tx, rx) = oneshot::channel();
            self.pending.lock().insert(request_id, PendingRequest { tx });

            let started = Instant::now();
            if let Err(e) = record.connection.send_text(json).await {
                self.pending.lock().remove(&request_id);
                self.note_failure(&record).await;
                // Channel transport errors bypass the retry path.
                return Err(e);
            }

            let outcome = tokio::time::timeout(wait, rx).await;
            self.pending.lock().remove(&request_id);

            let err = match outcome {
                Ok(Ok(Ok(bytes))) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    self.note_success(&record, latency_ms, bytes.len() as u64);
                    self.schedule_idle_disconnect(&record);
                    trace!(peer = peer_id, segment = %segment.segment_id, latency_ms, "Peer fetch succeeded");
                    return Ok(bytes);
                }
                Ok(Ok(Err(e))) => e,
                Ok(Err(_)) => EngineError::internal("pending request dropped"),
                Err(_) => EngineError::timeout(format!(
                    "peer {peer_id} response for {}",
                    segment.segment_id
                )),
            };

            self.note_failure(&record).await;
            let channel_error = matches!(err, EngineError::Peer { channel: true, .. });
            if channel_error || attempt >= 1 {
                return Err(err);
            }
            // One retry with exponential backoff.
            let delay = retry_base * 2u32.pow(attempt);
            debug!(peer = peer_id, error = %err, delay_ms = delay.as_millis() as u64, "Retrying peer fetch");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn note_success(&self, record: &Arc<PeerRecord>, latency_ms: u64, bytes: u64) {
        let score = {
            let mut metrics = record.metrics.lock();
            metrics.record_success(latency_ms, bytes);
            metrics.score()
        };
        *record.score.write() = score;
        record.touch();
    }

    async fn note_failure(&self, record: &Arc<PeerRecord>) {
        let (score, observations) = {
            let mut metrics = record.metrics.lock();
            metrics.record_failure();
            (metrics.score(), metrics.total_requests())
        };
        *record.score.write() = score;

        let threshold = self.config.read(|c| c.peer_score_threshold);
        if observations >= MIN_OBSERVATIONS_FOR_SCORING && score < threshold {
            info!(peer = %record.id, score, threshold, "Disconnecting low-scoring peer");
            self.disconnect_peer(&record.id, "low score").await;
        }
    }

    /// Disconnect a peer that stays idle after its last transfer.
    fn schedule_idle_disconnect(self: &Arc<Self>, record: &Arc<PeerRecord>) {
        let epoch = record.idle_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let manager = Arc::clone(self);
        let record = Arc::clone(record);
        tokio::spawn(async move {
            tokio::select! {
                _ = manager.token.cancelled() => {}
                _ = tokio::time::sleep(IDLE_DISCONNECT) => {
                    if record.idle_epoch.load(Ordering::SeqCst) == epoch
                        && record.last_active.lock().elapsed() >= IDLE_DISCONNECT
                    {
                        debug!(peer = %record.id, "Disconnecting idle peer");
                        manager.disconnect_peer(&record.id, "idle").await;
                    }
                }
            }
        });
    }

    pub async fn disconnect_peer(&self, peer_id: &str, reason: &str) {
        let record = self.peers.write().remove(peer_id);
        let Some(record) = record else { return };
        record.connection.close().await;

        let mut index = self.availability.write();
        for holders in index.values_mut() {
            holders.remove(peer_id);
        }
        index.retain(|_, holders| !holders.is_empty());
        drop(index);

        debug!(peer = peer_id, reason, "Peer disconnected");
        self.events.emit(&PeerEvent::Disconnected {
            peer_id: peer_id.to_string(),
            reason: reason.to_string(),
        });
    }

    // --- Inbound protocol ---

    async fn handle_channel_message(self: &Arc<Self>, message: ChannelMessage) {
        match message.payload {
            ChannelPayload::Text(text) => match serde_json::from_str::<PeerMessage>(&text) {
                Ok(control) => self.handle_control(&message.peer_id, control).await,
                Err(e) => {
                    warn!(peer = %message.peer_id, error = %e, "Discarding unparseable control message");
                }
            },
            ChannelPayload::Binary(data) => match peerwire::decode(data) {
                Ok(frame) => self.handle_frame(&message.peer_id, frame).await,
                Err(e) => {
                    warn!(peer = %message.peer_id, error = %e, "Discarding undecodable frame");
                }
            },
        }
    }

    async fn handle_control(self: &Arc<Self>, peer_id: &str, message: PeerMessage) {
        match message {
            PeerMessage::SegmentRequest {
                request_id,
                segment_id,
                quality_id,
            } => {
                self.serve_segment(peer_id, request_id, &quality_id, &segment_id).await;
            }
            PeerMessage::SegmentAvailability { segments } => {
                if let Some(record) = self.peer(peer_id) {
                    let mut index = self.availability.write();
                    let mut set = record.availability.write();
                    for key in segments {
                        index.entry(key.clone()).or_default().insert(peer_id.to_string());
                        set.insert(key);
                    }
                    record.touch();
                }
            }
            PeerMessage::Error { request_id, error } => {
                self.fail_pending(request_id, EngineError::peer(format!("remote: {error}")));
            }
        }
    }

    async fn handle_frame(self: &Arc<Self>, peer_id: &str, frame: Frame) {
        match frame {
            Frame::Response { request_id, payload } => {
                self.resolve_pending(request_id, payload);
            }
            chunk @ (Frame::Chunk { .. } | Frame::Done { .. }) => {
                let Some(record) = self.peer(peer_id) else { return };
                let completed = {
                    let mut assembler = record.assembler.lock();
                    match assembler.push(chunk) {
                        Ok(done) => done,
                        Err(e) => {
                            warn!(peer = peer_id, error = %e, "Chunk reassembly error");
                            None
                        }
                    }
                };
                if let Some((transfer_id, payload)) = completed {
                    match transfer_id.parse::<u32>() {
                        Ok(request_id) => self.resolve_pending(request_id, payload),
                        Err(_) => {
                            warn!(peer = peer_id, id = %transfer_id, "Completed transfer with non-numeric id");
                        }
                    }
                }
            }
            Frame::Request { id } => {
                // Pull by availability key, the minimal-loader style.
                self.serve_pull(peer_id, &id).await;
            }
        }
    }

    /// Serve a JSON segment request from the local cache.
    async fn serve_segment(&self, peer_id: &str, request_id: u32, quality_id: &str, segment_id: &str) {
        let Some(record) = self.peer(peer_id) else { return };
        record.touch();
        match self.cache.segment_bytes(&self.stream_id, quality_id, segment_id) {
            Some(bytes) => {
                trace!(peer = peer_id, segment = segment_id, size = bytes.len(), "Serving segment to peer");
                self.send_response(&record, request_id, bytes).await;
            }
            None => {
                let error = PeerMessage::Error {
                    request_id,
                    error: format!("segment {segment_id} not cached"),
                };
                if let Ok(json) = serde_json::to_string(&error) {
                    let _ = record.connection.send_text(json).await;
                }
            }
        }
    }

    /// Serve a peerwire `Request` pull keyed `{stream}:{quality}:{segment}`.
    async fn serve_pull(&self, peer_id: &str, availability_key: &str) {
        let Some(record) = self.peer(peer_id) else { return };
        let mut parts = availability_key.splitn(3, ':');
        let (Some(stream), Some(quality), Some(segment)) = (parts.next(), parts.next(), parts.next())
        else {
            warn!(peer = peer_id, key = availability_key, "Malformed pull request key");
            return;
        };
        if stream != self.stream_id {
            return;
        }
        let Some(bytes) = self.cache.segment_bytes(stream, quality, segment) else {
            return;
        };
        match peerwire::chunk_payload(availability_key, bytes, CHUNK_PAYLOAD_SIZE) {
            Ok(frames) => {
                for frame in frames {
                    let Ok(encoded) = peerwire::encode(&frame) else { continue };
                    if record.connection.send_bytes(&encoded).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => warn!(peer = peer_id, error = %e, "Failed to chunk pull response"),
        }
    }

    /// Respond to `request_id`: single frame for small payloads, chunked
    /// frames above the channel message budget.
    async fn send_response(&self, record: &Arc<PeerRecord>, request_id: u32, bytes: Bytes) {
        if bytes.len() <= CHUNK_PAYLOAD_SIZE {
            let frame = Frame::Response {
                request_id,
                payload: bytes,
            };
            match peerwire::encode(&frame) {
                Ok(encoded) => {
                    let _ = record.connection.send_bytes(&encoded).await;
                }
                Err(e) => warn!(error = %e, "Failed to encode response frame"),
            }
            return;
        }
        let transfer_id = request_id.to_string();
        match peerwire::chunk_payload(&transfer_id, bytes, CHUNK_PAYLOAD_SIZE) {
            Ok(frames) => {
                for frame in frames {
                    let Ok(encoded) = peerwire::encode(&frame) else { continue };
                    if record.connection.send_bytes(&encoded).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to chunk response"),
        }
    }

    fn resolve_pending(&self, request_id: u32, payload: Bytes) {
        if let Some(pending) = self.pending.lock().remove(&request_id) {
            let _ = pending.tx.send(Ok(payload));
        } else {
            trace!(request_id, "Response for unknown or expired request");
        }
    }

    fn fail_pending(&self, request_id: u32, error: EngineError) {
        if let Some(pending) = self.pending.lock().remove(&request_id) {
            let _ = pending.tx.send(Err(error));
        }
    }

    // --- Own availability announcements ---

    /// Advertise a newly cached segment to every connected peer.
    pub async fn announce_segment(&self, availability_key: &str) {
        {
            let mut announced = self.announced.lock();
            if !announced.insert(availability_key.to_string()) {
                return;
            }
        }
        self.broadcast_availability().await;
    }

    fn unannounce_segment(&self, availability_key: &str) {
        let removed = self.announced.lock().remove(availability_key);
        if removed && !self.token.is_cancelled() {
            trace!(key = availability_key, "Unadvertising evicted segment");
        }
    }

    async fn broadcast_availability(&self) {
        let segments: Vec<String> = self.announced.lock().iter().cloned().collect();
        let message = PeerMessage::SegmentAvailability { segments };
        let Ok(json) = serde_json::to_string(&message) else { return };

        let connected: Vec<Arc<PeerRecord>> = self
            .peers
            .read()
            .values()
            .filter(|r| r.phase() == ConnectionPhase::Connected)
            .cloned()
            .collect();
        for record in connected {
            let _ = record.connection.send_text(json.clone()).await;
        }
    }

    pub async fn destroy(&self) {
        self.token.cancel();
        self.pending.lock().clear();
        let records: Vec<Arc<PeerRecord>> = self.peers.write().drain().map(|(_, r)| r).collect();
        for record in records {
            record.connection.close().await;
        }
        self.availability.write().clear();
        info!("Peer manager destroyed");
    }
}

/// Ordering for peer candidates: score descending, then latency ascending.
fn rank_order(score_a: f64, latency_a: f64, score_b: f64, latency_b: f64) -> std::cmp::Ordering {
    score_b
        .partial_cmp(&score_a)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then(
            latency_a
                .partial_cmp(&latency_b)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
}
