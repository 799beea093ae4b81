// JSON control messages exchanged over the peer data channel. Binary
// segment payloads travel as peerwire frames alongside these.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PeerMessage {
    /// Ask the remote for one segment.
    #[serde(rename_all = "camelCase")]
    SegmentRequest {
        request_id: u32,
        segment_id: String,
        quality_id: String,
    },
    /// Replace the remote's knowledge of which segments we hold.
    #[serde(rename_all = "camelCase")]
    SegmentAvailability { segments: Vec<String> },
    /// Fail a specific outstanding request.
    #[serde(rename_all = "camelCase")]
    Error { request_id: u32, error: String },
}
