// Signaling wire messages: JSON objects discriminated by a `type` field,
// lowerCamelCase keys, segment ids carrying their extension.

use serde::{Deserialize, Serialize};

/// Where segment bytes were obtained, as reported to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentSource {
    Peer,
    Server,
}

impl SegmentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentSource::Peer => "peer",
            SegmentSource::Server => "server",
        }
    }
}

/// ICE candidate payload in the standard browser JSON shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Messages sent to the signaling service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    WhoHas {
        movie_id: String,
        quality_id: String,
        segment_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ReportSegment {
        movie_id: String,
        quality_id: String,
        segment_id: String,
        source: SegmentSource,
        #[serde(skip_serializing_if = "Option::is_none")]
        latency: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    RtcOffer {
        to: String,
        stream_id: String,
        sdp: String,
    },
    #[serde(rename_all = "camelCase")]
    RtcAnswer {
        to: String,
        stream_id: String,
        sdp: String,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        to: String,
        stream_id: String,
        candidate: IceCandidatePayload,
    },
    #[serde(rename_all = "camelCase")]
    Ping {
        client_id: String,
        movie_id: String,
        timestamp: u64,
    },
}

/// A peer entry in a who-has reply. Unknown extra fields are tolerated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: String,
}

/// Resolved availability for one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct WhoHasReply {
    pub segment_id: String,
    pub peers: Vec<PeerInfo>,
}

/// Messages received from the signaling service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    WhoHasReply {
        segment_id: String,
        #[serde(default)]
        peers: Vec<PeerInfo>,
    },
    #[serde(rename_all = "camelCase")]
    PeerList {
        #[serde(default)]
        peers: Vec<String>,
    },
    ReportAck,
    #[serde(rename_all = "camelCase")]
    RtcOffer { from: String, sdp: String },
    #[serde(rename_all = "camelCase")]
    RtcAnswer { from: String, sdp: String },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        from: String,
        candidate: IceCandidatePayload,
    },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn who_has_serializes_with_type_tag() {
        let msg = ClientMessage::WhoHas {
            movie_id: "movie-1".into(),
            quality_id: "720p".into(),
            segment_id: "seg_0002.m4s".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "whoHas");
        assert_eq!(json["movieId"], "movie-1");
        assert_eq!(json["segmentId"], "seg_0002.m4s");
    }

    #[test]
    fn report_segment_omits_absent_latency() {
        let msg = ClientMessage::ReportSegment {
            movie_id: "movie-1".into(),
            quality_id: "720p".into(),
            segment_id: "seg_0002.m4s".into(),
            source: SegmentSource::Peer,
            latency: None,
            speed: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "reportSegment");
        assert_eq!(json["source"], "peer");
        assert!(json.get("latency").is_none());
    }

    #[test]
    fn who_has_reply_parses() {
        let raw = r#"{"type":"whoHasReply","segmentId":"seg_0002.m4s","peers":[{"peerId":"P","score":0.9}]}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ServerMessage::WhoHasReply { segment_id, peers } => {
                assert_eq!(segment_id, "seg_0002.m4s");
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].peer_id, "P");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn ice_candidate_uses_browser_field_names() {
        let msg = ClientMessage::IceCandidate {
            to: "P".into(),
            stream_id: "movie-1".into(),
            candidate: IceCandidatePayload {
                candidate: "candidate:1 1 UDP ...".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["candidate"]["sdpMid"], "0");
        assert_eq!(json["candidate"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn unknown_type_fails_parse() {
        let raw = r#"{"type":"bogus","x":1}"#;
        assert!(serde_json::from_str::<ServerMessage>(raw).is_err());
    }

    #[test]
    fn report_ack_parses_as_unit() {
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"reportAck"}"#).unwrap();
        assert_eq!(msg, ServerMessage::ReportAck);
    }
}
