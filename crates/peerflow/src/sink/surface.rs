// The media-element + media-source attachment seam.
//
// The engine drives playback through this trait; the embedder supplies the
// real binding (an MSE-backed element, a native player). Append and remove
// resolve only when the underlying update completes, which is what lets the
// adapter enforce strictly serial buffer mutations.

use crate::error::Result;
use crate::media::TimeRange;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

/// Playback-relevant events surfaced by the media element.
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceEvent {
    Play,
    Pause,
    Ended,
    Waiting,
    CanPlay,
    Seeking { time: f64 },
    Seeked { time: f64 },
    Error { message: String },
}

#[async_trait]
pub trait MediaSurface: Send + Sync {
    /// Create the media source attachment with the given MIME/codec string.
    async fn attach(&self, mime: &str) -> Result<()>;

    /// Tear down the attachment and release the element's source.
    async fn detach(&self);

    async fn set_duration(&self, seconds: f64) -> Result<()>;

    /// Append bytes to the append buffer; resolves at update-end.
    async fn append_buffer(&self, data: Bytes) -> Result<()>;

    /// Remove `[start, end)` from the buffer; resolves at update-end.
    async fn remove_range(&self, start: f64, end: f64) -> Result<()>;

    async fn end_of_stream(&self) -> Result<()>;

    fn buffered(&self) -> Vec<TimeRange>;

    fn current_time(&self) -> f64;

    fn duration(&self) -> f64;

    async fn seek(&self, time: f64) -> Result<()>;

    async fn play(&self) -> Result<()>;

    async fn pause(&self) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<SurfaceEvent>;
}
