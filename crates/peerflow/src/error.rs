use reqwest::StatusCode;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine-wide error taxonomy.
///
/// Errors are `Clone` because coalesced in-flight fetches broadcast one
/// outcome to every waiter; foreign error sources are held behind `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("engine destroyed")]
    Destroyed,

    #[error("configuration error: {reason}")]
    Config { reason: String },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network { source: Arc<reqwest::Error> },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("segment fetch error: {reason}")]
    SegmentFetch { reason: String, retryable: bool },

    #[error("cache error: {reason}")]
    Cache { reason: String },

    #[error("signaling error: {reason}")]
    Signaling { reason: String },

    #[error("peer error: {reason}")]
    Peer {
        reason: String,
        /// Data-channel transport failures bypass the peer retry path.
        channel: bool,
    },

    #[error("media sink error: {reason}")]
    Sink { reason: String },

    #[error("protocol violation: {reason}")]
    Protocol { reason: String },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("all sources failed for `{segment}`: {reason}")]
    SourceExhausted { segment: String, reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl EngineError {
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn signaling(reason: impl Into<String>) -> Self {
        Self::Signaling {
            reason: reason.into(),
        }
    }

    pub fn peer(reason: impl Into<String>) -> Self {
        Self::Peer {
            reason: reason.into(),
            channel: false,
        }
    }

    pub fn peer_channel(reason: impl Into<String>) -> Self {
        Self::Peer {
            reason: reason.into(),
            channel: true,
        }
    }

    pub fn sink(reason: impl Into<String>) -> Self {
        Self::Sink {
            reason: reason.into(),
        }
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::Timeout {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>, operation: &'static str) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled | Self::Destroyed => false,
            Self::Config { .. }
            | Self::InvalidUrl { .. }
            | Self::Playlist { .. }
            | Self::Protocol { .. }
            | Self::Sink { .. }
            | Self::Internal { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::SegmentFetch { retryable, .. } => *retryable,
            Self::Peer { channel, .. } => !channel,
            Self::Network { .. }
            | Self::Cache { .. }
            | Self::Signaling { .. }
            | Self::Timeout { .. }
            | Self::SourceExhausted { .. } => true,
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            source: Arc::new(err),
        }
    }
}

/// Classify a reqwest error as retryable.
///
/// Connect, timeout, request and body errors are transient; builder and
/// redirect errors are not.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_peer_errors_are_not_retryable() {
        assert!(!EngineError::peer_channel("data channel closed").is_retryable());
        assert!(EngineError::peer("peer timeout").is_retryable());
    }

    #[test]
    fn http_status_retryability() {
        let server = EngineError::http_status(StatusCode::BAD_GATEWAY, "http://x", "segment");
        let client = EngineError::http_status(StatusCode::NOT_FOUND, "http://x", "segment");
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
    }
}
