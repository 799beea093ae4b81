// Signaling Client: the persistent full-duplex channel to the tracker.
//
// Handles connect-with-timeout, typed message dispatch, who-has request
// correlation with per-request deadlines, a short-TTL reply cache, the
// heartbeat, and a single reconnect attempt per socket close.

mod messages;

pub use messages::{
    ClientMessage, IceCandidatePayload, PeerInfo, SegmentSource, ServerMessage, WhoHasReply,
};

use crate::config::ConfigStore;
use crate::error::{EngineError, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Signaling connect deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// TTL of the who-has reply cache.
const REPLY_CACHE_TTL: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound happenings routed to the coordinator.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Connected,
    Disconnected,
    PeerList(Vec<String>),
    WhoHasReply(WhoHasReply),
    RtcOffer {
        from: String,
        sdp: String,
    },
    RtcAnswer {
        from: String,
        sdp: String,
    },
    IceCandidate {
        from: String,
        candidate: IceCandidatePayload,
    },
    ServerError {
        message: String,
    },
}

struct PendingWhoHas {
    quality_id: String,
    waiters: Vec<oneshot::Sender<WhoHasReply>>,
}

pub struct SignalingClient {
    config: Arc<ConfigStore>,
    client_id: String,
    movie_id: String,
    outbound_tx: mpsc::Sender<String>,
    outbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
    pending: Arc<Mutex<HashMap<String, PendingWhoHas>>>,
    reply_cache: moka::sync::Cache<String, WhoHasReply>,
    events_tx: mpsc::Sender<SignalingEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SignalingEvent>>>,
    connected: Arc<AtomicBool>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    pub fn new(config: Arc<ConfigStore>, client_id: String, movie_id: String) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            config,
            client_id,
            movie_id,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            reply_cache: moka::sync::Cache::builder()
                .max_capacity(4_096)
                .time_to_live(REPLY_CACHE_TTL)
                .build(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            connected: Arc::new(AtomicBool::new(false)),
            token: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Take the inbound event stream. Single consumer.
    pub fn events(&self) -> Option<mpsc::Receiver<SignalingEvent>> {
        self.events_rx.lock().take()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn endpoint_url(&self) -> Result<url::Url> {
        let base = self.config.read(|c| c.signaling_url.clone());
        let mut url = url::Url::parse(&base).map_err(|e| EngineError::InvalidUrl {
            input: base.clone(),
            reason: e.to_string(),
        })?;
        url.query_pairs_mut()
            .append_pair("clientId", &self.client_id)
            .append_pair("movieId", &self.movie_id);
        Ok(url)
    }

    async fn establish(&self) -> Result<WsStream> {
        let url = self.endpoint_url()?;
        debug!(url = %url, "Connecting to signaling service");
        let connect = connect_async(url.as_str());
        match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(e)) => Err(EngineError::signaling(format!("connect failed: {e}"))),
            Err(_) => Err(EngineError::timeout("signaling connect")),
        }
    }

    /// Connect and start the socket task. The first connection attempt is
    /// awaited; later reconnects happen in the background.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let stream = self.establish().await?;
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events_tx.try_send(SignalingEvent::Connected);

        let Some(outbound_rx) = self.outbound_rx.lock().take() else {
            return Err(EngineError::signaling("signaling client already started"));
        };
        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            client.run(stream, outbound_rx).await;
        });
        *self.task.lock() = Some(task);
        info!(client = %self.client_id, movie = %self.movie_id, "Signaling connected");
        Ok(())
    }

    async fn run(self: Arc<Self>, mut stream: WsStream, mut outbound_rx: mpsc::Receiver<String>) {
        loop {
            let clean_shutdown = self.run_stream(&mut stream, &mut outbound_rx).await;
            self.connected.store(false, Ordering::SeqCst);
            let _ = self.events_tx.try_send(SignalingEvent::Disconnected);
            if clean_shutdown || self.token.is_cancelled() {
                break;
            }

            // One reconnect attempt per socket loss.
            let delay = Duration::from_millis(self.config.read(|c| c.reconnect_interval_ms));
            warn!(delay_ms = delay.as_millis() as u64, "Signaling lost; scheduling reconnect");
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.establish().await {
                Ok(new_stream) => {
                    stream = new_stream;
                    self.connected.store(true, Ordering::SeqCst);
                    let _ = self.events_tx.try_send(SignalingEvent::Connected);
                    info!("Signaling reconnected");
                }
                Err(e) => {
                    warn!(error = %e, "Signaling reconnect failed; giving up");
                    break;
                }
            }
        }
        debug!("Signaling task stopped");
    }

    /// Pump one socket's lifetime. Returns true on deliberate shutdown.
    async fn run_stream(
        &self,
        stream: &mut WsStream,
        outbound_rx: &mut mpsc::Receiver<String>,
    ) -> bool {
        let heartbeat_ms = self.config.read(|c| c.heartbeat_interval_ms);
        let heartbeat_enabled = heartbeat_ms > 0;
        let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_ms.max(1)));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    let _ = stream.close(None).await;
                    return true;
                }

                _ = heartbeat.tick(), if heartbeat_enabled => {
                    let ping = ClientMessage::Ping {
                        client_id: self.client_id.clone(),
                        movie_id: self.movie_id.clone(),
                        timestamp: unix_millis(),
                    };
                    if let Ok(json) = serde_json::to_string(&ping)
                        && stream.send(Message::text(json)).await.is_err()
                    {
                        return false;
                    }
                    trace!("Sent signaling heartbeat");
                }

                payload = outbound_rx.recv() => {
                    let Some(payload) = payload else { return true };
                    if let Err(e) = stream.send(Message::text(payload)).await {
                        warn!(error = %e, "Signaling send failed");
                        return false;
                    }
                }

                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()),
                        Some(Ok(Message::Close(_))) | None => return false,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "Signaling socket error");
                            return false;
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&self, raw: &str) {
        let message: ServerMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, raw = raw.chars().take(120).collect::<String>(), "Discarding unparseable signaling message");
                return;
            }
        };
        match message {
            ServerMessage::WhoHasReply { segment_id, peers } => {
                let reply = WhoHasReply {
                    segment_id: segment_id.clone(),
                    peers,
                };
                let waiters = {
                    let mut pending = self.pending.lock();
                    pending.remove(&segment_id)
                };
                if let Some(entry) = waiters {
                    let cache_key =
                        reply_cache_key(&self.movie_id, &entry.quality_id, &segment_id);
                    self.reply_cache.insert(cache_key, reply.clone());
                    for waiter in entry.waiters {
                        let _ = waiter.send(reply.clone());
                    }
                } else {
                    trace!(segment = %segment_id, "Unsolicited whoHas reply");
                }
                let _ = self.events_tx.try_send(SignalingEvent::WhoHasReply(reply));
            }
            ServerMessage::PeerList { peers } => {
                let _ = self.events_tx.try_send(SignalingEvent::PeerList(peers));
            }
            ServerMessage::ReportAck => trace!("Segment report acknowledged"),
            ServerMessage::RtcOffer { from, sdp } => {
                let _ = self.events_tx.try_send(SignalingEvent::RtcOffer { from, sdp });
            }
            ServerMessage::RtcAnswer { from, sdp } => {
                let _ = self.events_tx.try_send(SignalingEvent::RtcAnswer { from, sdp });
            }
            ServerMessage::IceCandidate { from, candidate } => {
                let _ = self
                    .events_tx
                    .try_send(SignalingEvent::IceCandidate { from, candidate });
            }
            ServerMessage::Error { message } => {
                warn!(message = %message, "Signaling service error");
                let _ = self.events_tx.try_send(SignalingEvent::ServerError { message });
            }
        }
    }

    fn send_message(&self, message: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(message)
            .map_err(|e| EngineError::internal(format!("message serialization: {e}")))?;
        self.outbound_tx
            .try_send(json)
            .map_err(|_| EngineError::signaling("outbound queue full or closed"))
    }

    /// Ask the swarm who holds a segment. Repeated queries within the reply
    /// cache TTL coalesce; concurrent queries share one round trip. Times
    /// out after the configured who-has deadline.
    pub async fn who_has(&self, quality_id: &str, segment_id: &str) -> Result<WhoHasReply> {
        let cache_key = reply_cache_key(&self.movie_id, quality_id, segment_id);
        if let Some(reply) = self.reply_cache.get(&cache_key) {
            trace!(segment = segment_id, "whoHas served from reply cache");
            return Ok(reply);
        }

        let (tx, rx) = oneshot::channel();
        let send_query = {
            let mut pending = self.pending.lock();
            let entry = pending
                .entry(segment_id.to_string())
                .or_insert_with(|| PendingWhoHas {
                    quality_id: quality_id.to_string(),
                    waiters: Vec::new(),
                });
            let first = entry.waiters.is_empty();
            entry.waiters.push(tx);
            first
        };
        if send_query {
            self.send_message(&ClientMessage::WhoHas {
                movie_id: self.movie_id.clone(),
                quality_id: quality_id.to_string(),
                segment_id: segment_id.to_string(),
            })?;
        }

        let deadline = self.config.read(|c| c.who_has_timeout());
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(EngineError::signaling("signaling client shut down")),
            Err(_) => {
                // Drop waiters whose callers have gone away.
                let mut pending = self.pending.lock();
                if let Some(entry) = pending.get_mut(segment_id) {
                    entry.waiters.retain(|w| !w.is_closed());
                    if entry.waiters.is_empty() {
                        pending.remove(segment_id);
                    }
                }
                Err(EngineError::timeout(format!("whoHas for {segment_id}")))
            }
        }
    }

    /// Advertise where a segment was fetched from. Fire-and-forget.
    pub fn report_segment(
        &self,
        quality_id: &str,
        segment_id: &str,
        source: SegmentSource,
        latency_ms: Option<u64>,
        speed_bps: Option<f64>,
    ) {
        let message = ClientMessage::ReportSegment {
            movie_id: self.movie_id.clone(),
            quality_id: quality_id.to_string(),
            segment_id: segment_id.to_string(),
            source,
            latency: latency_ms,
            speed: speed_bps,
        };
        if let Err(e) = self.send_message(&message) {
            debug!(error = %e, "Dropped segment report");
        }
    }

    pub fn send_offer(&self, to: &str, sdp: &str) {
        let _ = self.send_message(&ClientMessage::RtcOffer {
            to: to.to_string(),
            stream_id: self.movie_id.clone(),
            sdp: sdp.to_string(),
        });
    }

    pub fn send_answer(&self, to: &str, sdp: &str) {
        let _ = self.send_message(&ClientMessage::RtcAnswer {
            to: to.to_string(),
            stream_id: self.movie_id.clone(),
            sdp: sdp.to_string(),
        });
    }

    pub fn send_ice_candidate(&self, to: &str, candidate: IceCandidatePayload) {
        let _ = self.send_message(&ClientMessage::IceCandidate {
            to: to.to_string(),
            stream_id: self.movie_id.clone(),
            candidate,
        });
    }

    /// Reject all pending requests and close the socket.
    pub async fn destroy(&self) {
        self.token.cancel();
        self.pending.lock().clear();
        self.connected.store(false, Ordering::SeqCst);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

fn reply_cache_key(movie_id: &str, quality_id: &str, segment_id: &str) -> String {
    format!("{movie_id}_{quality_id}_{segment_id}")
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Arc<SignalingClient> {
        Arc::new(SignalingClient::new(
            Arc::new(ConfigStore::default()),
            "client-1".into(),
            "movie-1".into(),
        ))
    }

    #[test]
    fn endpoint_url_carries_identities() {
        let client = client();
        let url = client.endpoint_url().unwrap();
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(query.contains(&("clientId".into(), "client-1".into())));
        assert!(query.contains(&("movieId".into(), "movie-1".into())));
    }

    #[tokio::test]
    async fn who_has_times_out_without_reply() {
        let client = client();
        client
            .config
            .apply(&crate::config::ConfigPatch {
                who_has_timeout_ms: Some(30),
                ..Default::default()
            })
            .unwrap();
        let err = client.who_has("720p", "seg_0002.m4s").await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
    }

    #[tokio::test]
    async fn concurrent_who_has_coalesces_into_one_query() {
        let client = client();
        client
            .config
            .apply(&crate::config::ConfigPatch {
                who_has_timeout_ms: Some(5_000),
                ..Default::default()
            })
            .unwrap();

        let c1 = Arc::clone(&client);
        let c2 = Arc::clone(&client);
        let f1 = tokio::spawn(async move { c1.who_has("720p", "seg_0002.m4s").await });
        let f2 = tokio::spawn(async move { c2.who_has("720p", "seg_0002.m4s").await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Exactly one whoHas query went out.
        let mut outbound = client.outbound_rx.lock().take().unwrap();
        let first = outbound.try_recv().unwrap();
        assert!(first.contains("\"whoHas\""));
        assert!(outbound.try_recv().is_err());

        // A reply resolves both waiters.
        client.dispatch(r#"{"type":"whoHasReply","segmentId":"seg_0002.m4s","peers":[{"peerId":"P"}]}"#);
        let r1 = f1.await.unwrap().unwrap();
        let r2 = f2.await.unwrap().unwrap();
        assert_eq!(r1.peers[0].peer_id, "P");
        assert_eq!(r2, r1);
    }

    #[tokio::test]
    async fn reply_cache_short_circuits_repeat_queries() {
        let client = client();
        let waiter = {
            let c = Arc::clone(&client);
            tokio::spawn(async move { c.who_has("720p", "seg_0003.m4s").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.dispatch(r#"{"type":"whoHasReply","segmentId":"seg_0003.m4s","peers":[]}"#);
        waiter.await.unwrap().unwrap();

        // Second call resolves from cache without a pending entry.
        let reply = client.who_has("720p", "seg_0003.m4s").await.unwrap();
        assert!(reply.peers.is_empty());
        assert!(client.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn malformed_messages_are_discarded() {
        let client = client();
        client.dispatch("not json at all");
        client.dispatch(r#"{"type":"unknownKind"}"#);
        // Missing fields: logged, not matched.
        client.dispatch(r#"{"type":"rtcOffer","sdp":"x"}"#);
    }

    #[tokio::test]
    async fn inbound_rtc_messages_surface_as_events() {
        let client = client();
        let mut events = client.events().unwrap();
        client.dispatch(r#"{"type":"rtcOffer","from":"P","sdp":"v=0"}"#);
        match events.recv().await.unwrap() {
            SignalingEvent::RtcOffer { from, sdp } => {
                assert_eq!(from, "P");
                assert_eq!(sdp, "v=0");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
