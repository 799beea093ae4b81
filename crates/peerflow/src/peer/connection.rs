// One remote peer's RTCPeerConnection and its ordered data channel.

use crate::error::{EngineError, Result};
use crate::signaling::IceCandidatePayload;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

/// Label of the segment transfer channel.
const CHANNEL_LABEL: &str = "segments";
/// Ordered delivery with bounded retransmits, per the swarm protocol.
const MAX_RETRANSMITS: u16 = 3;

/// Connection phase as tracked by the peer manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionPhase {
    /// Whether a record in this phase can still serve or become usable.
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            ConnectionPhase::New | ConnectionPhase::Connecting | ConnectionPhase::Connected
        )
    }
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionPhase {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => ConnectionPhase::New,
        RTCPeerConnectionState::Connecting => ConnectionPhase::Connecting,
        RTCPeerConnectionState::Connected => ConnectionPhase::Connected,
        RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
            ConnectionPhase::Disconnected
        }
        RTCPeerConnectionState::Failed => ConnectionPhase::Failed,
    }
}

/// Payload arriving on a peer's data channel.
#[derive(Debug, Clone)]
pub enum ChannelPayload {
    Text(String),
    Binary(Bytes),
}

/// An inbound channel message tagged with its peer.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub peer_id: String,
    pub payload: ChannelPayload,
}

type IceSink = Arc<dyn Fn(IceCandidatePayload) + Send + Sync>;
type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

/// Register the message/open/close/error handlers on a freshly created or
/// adopted data channel and park it in the shared slot.
fn wire_channel(
    dc: Arc<RTCDataChannel>,
    peer_id: &str,
    inbound_tx: &mpsc::Sender<ChannelMessage>,
    channel_open_tx: &watch::Sender<bool>,
    slot: &ChannelSlot,
) {
    let id = peer_id.to_string();
    let inbound = inbound_tx.clone();
    dc.on_message(Box::new(move |msg| {
        let payload = if msg.is_string {
            match std::str::from_utf8(&msg.data) {
                Ok(text) => ChannelPayload::Text(text.to_string()),
                Err(_) => {
                    warn!(peer = %id, "Discarding non-UTF-8 text frame");
                    return Box::pin(async {});
                }
            }
        } else {
            ChannelPayload::Binary(msg.data.clone())
        };
        if inbound
            .try_send(ChannelMessage {
                peer_id: id.clone(),
                payload,
            })
            .is_err()
        {
            warn!(peer = %id, "Inbound queue full; dropping channel frame");
        }
        Box::pin(async {})
    }));

    let open_tx = channel_open_tx.clone();
    let id = peer_id.to_string();
    dc.on_open(Box::new(move || {
        debug!(peer = %id, "Data channel open");
        let _ = open_tx.send(true);
        Box::pin(async {})
    }));

    let open_tx = channel_open_tx.clone();
    let id = peer_id.to_string();
    dc.on_close(Box::new(move || {
        debug!(peer = %id, "Data channel closed");
        let _ = open_tx.send(false);
        Box::pin(async {})
    }));

    let id = peer_id.to_string();
    dc.on_error(Box::new(move |e| {
        warn!(peer = %id, error = %e, "Data channel error");
        Box::pin(async {})
    }));

    *slot.lock() = Some(dc);
}

pub struct PeerConnection {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    channel: ChannelSlot,
    phase_tx: watch::Sender<ConnectionPhase>,
    channel_open_tx: watch::Sender<bool>,
    inbound_tx: mpsc::Sender<ChannelMessage>,
}

impl PeerConnection {
    /// Build the underlying RTCPeerConnection. `ice_sink` receives local ICE
    /// candidates for relaying over signaling.
    pub async fn new(
        peer_id: String,
        stun_servers: Vec<String>,
        inbound_tx: mpsc::Sender<ChannelMessage>,
        ice_sink: IceSink,
    ) -> Result<Self> {
        let api = APIBuilder::new().build();
        let ice_servers = if stun_servers.is_empty() {
            vec![RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                ..Default::default()
            }]
        } else {
            vec![RTCIceServer {
                urls: stun_servers,
                ..Default::default()
            }]
        };
        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| EngineError::peer(format!("peer connection setup: {e}")))?;
        let pc = Arc::new(pc);

        let (phase_tx, _) = watch::channel(ConnectionPhase::New);
        let (channel_open_tx, _) = watch::channel(false);

        let connection = Self {
            peer_id,
            pc,
            channel: Arc::new(Mutex::new(None)),
            phase_tx,
            channel_open_tx,
            inbound_tx,
        };
        connection.install_callbacks(ice_sink);
        Ok(connection)
    }

    fn install_callbacks(&self, ice_sink: IceSink) {
        let phase_tx = self.phase_tx.clone();
        let peer_id = self.peer_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state| {
                let phase = map_state(state);
                trace!(peer = %peer_id, ?phase, "Peer connection state changed");
                let _ = phase_tx.send(phase);
                Box::pin(async {})
            }));

        let peer_id = self.peer_id.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => ice_sink(IceCandidatePayload {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }),
                    Err(e) => {
                        warn!(peer = %peer_id, error = %e, "Dropping unserializable ICE candidate")
                    }
                }
            }
            Box::pin(async {})
        }));

        // Adopt the remote's channel when we are the answering side.
        let peer_id = self.peer_id.clone();
        let inbound_tx = self.inbound_tx.clone();
        let channel_open_tx = self.channel_open_tx.clone();
        let slot = Arc::clone(&self.channel);
        self.pc.on_data_channel(Box::new(move |dc| {
            if dc.label() != CHANNEL_LABEL {
                debug!(peer = %peer_id, label = dc.label(), "Ignoring unexpected data channel");
            } else {
                wire_channel(dc, &peer_id, &inbound_tx, &channel_open_tx, &slot);
            }
            Box::pin(async {})
        }));
    }

    /// Initiator path: create the channel, produce an SDP offer.
    pub async fn create_offer(&self) -> Result<String> {
        let dc = self
            .pc
            .create_data_channel(
                CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    max_retransmits: Some(MAX_RETRANSMITS),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| EngineError::peer(format!("data channel create: {e}")))?;
        wire_channel(
            dc,
            &self.peer_id,
            &self.inbound_tx,
            &self.channel_open_tx,
            &self.channel,
        );

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| EngineError::peer(format!("create offer: {e}")))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| EngineError::peer(format!("set local offer: {e}")))?;
        Ok(sdp)
    }

    /// Responder path: accept a remote offer and produce the answer. The
    /// initiator owns the data channel; `on_data_channel` adopts it.
    pub async fn accept_offer(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| EngineError::peer(format!("parse offer: {e}")))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| EngineError::peer(format!("set remote offer: {e}")))?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| EngineError::peer(format!("create answer: {e}")))?;
        let sdp_out = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| EngineError::peer(format!("set local answer: {e}")))?;
        Ok(sdp_out)
    }

    /// Apply a remote answer. Ignored with a warning when the connection is
    /// not expecting one.
    pub async fn apply_answer(&self, sdp: &str) -> Result<bool> {
        if self.pc.signaling_state() != RTCSignalingState::HaveLocalOffer {
            warn!(
                peer = %self.peer_id,
                state = ?self.pc.signaling_state(),
                "Ignoring answer in incompatible signaling state"
            );
            return Ok(false);
        }
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| EngineError::peer(format!("parse answer: {e}")))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| EngineError::peer(format!("set remote answer: {e}")))?;
        Ok(true)
    }

    /// Apply a remote ICE candidate. Ignored with a warning before the
    /// remote description is set.
    pub async fn add_remote_candidate(&self, payload: IceCandidatePayload) -> Result<bool> {
        if self.pc.remote_description().await.is_none() {
            warn!(peer = %self.peer_id, "Ignoring ICE candidate before remote description");
            return Ok(false);
        }
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: payload.candidate,
                sdp_mid: payload.sdp_mid,
                sdp_mline_index: payload.sdp_mline_index,
                ..Default::default()
            })
            .await
            .map_err(|e| EngineError::peer(format!("add ICE candidate: {e}")))?;
        Ok(true)
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.phase_tx.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase_tx.subscribe()
    }

    pub fn channel_ready(&self) -> bool {
        self.channel
            .lock()
            .as_ref()
            .is_some_and(|dc| dc.ready_state() == RTCDataChannelState::Open)
    }

    /// Wait until the data channel opens, bounded by `timeout`.
    pub async fn wait_channel_open(&self, timeout: Duration) -> Result<()> {
        if self.channel_ready() {
            return Ok(());
        }
        let mut rx = self.channel_open_tx.subscribe();
        let wait = async {
            loop {
                if *rx.borrow() {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(EngineError::peer_channel("connection dropped"));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| EngineError::timeout(format!("peer {} channel open", self.peer_id)))?
    }

    fn open_channel(&self) -> Result<Arc<RTCDataChannel>> {
        let channel = self.channel.lock().clone();
        match channel {
            Some(dc) if dc.ready_state() == RTCDataChannelState::Open => Ok(dc),
            _ => Err(EngineError::peer_channel(format!(
                "data channel to {} not ready",
                self.peer_id
            ))),
        }
    }

    pub async fn send_text(&self, text: String) -> Result<()> {
        let dc = self.open_channel()?;
        dc.send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| EngineError::peer_channel(format!("send_text: {e}")))
    }

    pub async fn send_bytes(&self, data: &Bytes) -> Result<()> {
        let dc = self.open_channel()?;
        dc.send(data)
            .await
            .map(|_| ())
            .map_err(|e| EngineError::peer_channel(format!("send: {e}")))
    }

    /// Null the callbacks, then close. Silences events during teardown.
    pub async fn close(&self) {
        self.pc
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc.on_data_channel(Box::new(|_| Box::pin(async {})));
        if let Some(dc) = self.channel.lock().take() {
            dc.on_message(Box::new(|_| Box::pin(async {})));
            dc.on_close(Box::new(|| Box::pin(async {})));
            dc.on_error(Box::new(|_| Box::pin(async {})));
        }
        if let Err(e) = self.pc.close().await {
            debug!(peer = %self.peer_id, error = %e, "Peer close reported an error");
        }
        let _ = self.phase_tx.send(ConnectionPhase::Disconnected);
        let _ = self.channel_open_tx.send(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_usability() {
        assert!(ConnectionPhase::New.is_usable());
        assert!(ConnectionPhase::Connecting.is_usable());
        assert!(ConnectionPhase::Connected.is_usable());
        assert!(!ConnectionPhase::Disconnected.is_usable());
        assert!(!ConnectionPhase::Failed.is_usable());
    }

    #[test]
    fn state_mapping_covers_terminal_states() {
        assert_eq!(
            map_state(RTCPeerConnectionState::Closed),
            ConnectionPhase::Disconnected
        );
        assert_eq!(map_state(RTCPeerConnectionState::Failed), ConnectionPhase::Failed);
        assert_eq!(
            map_state(RTCPeerConnectionState::Connected),
            ConnectionPhase::Connected
        );
    }

    #[tokio::test]
    async fn offer_answer_between_two_connections() {
        let (tx, _rx) = mpsc::channel(16);
        let sink: IceSink = Arc::new(|_| {});
        let a = PeerConnection::new("a".into(), vec![], tx.clone(), Arc::clone(&sink))
            .await
            .unwrap();
        let b = PeerConnection::new("b".into(), vec![], tx, sink).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        assert!(offer.contains("v=0"));
        let answer = b.accept_offer(&offer).await.unwrap();
        assert!(a.apply_answer(&answer).await.unwrap());

        // A second answer arrives in a stable state and is ignored.
        assert!(!a.apply_answer(&answer).await.unwrap());

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn ice_before_remote_description_is_ignored() {
        let (tx, _rx) = mpsc::channel(16);
        let sink: IceSink = Arc::new(|_| {});
        let a = PeerConnection::new("a".into(), vec![], tx, sink).await.unwrap();
        let applied = a
            .add_remote_candidate(IceCandidatePayload {
                candidate: "candidate:0 1 UDP 1 127.0.0.1 9 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            })
            .await
            .unwrap();
        assert!(!applied);
        a.close().await;
    }
}
