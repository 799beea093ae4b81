//! peerflow: a hybrid HLS/fMP4 streaming engine that augments origin HTTP
//! delivery with a WebRTC peer swarm.
//!
//! The engine sits between a media sink (the [`sink::MediaSurface`] seam)
//! and three external collaborators: the origin/seeder HTTP service, a
//! WebSocket signaling service, and remote peers speaking a small binary
//! framing protocol over ordered data channels.
//!
//! [`coordinator::PlayerCoordinator`] wires the components together:
//! segments flow from the [`buffer::BufferController`]'s prefetch windows
//! through the [`fetch::FetchArbiter`]'s cache -> peer -> origin chain into
//! the ordered append queue, and from there serially into the sink. The
//! [`abr::AbrController`] runs alongside, switching renditions from
//! bandwidth and buffer signals.

pub mod abr;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod fetch;
pub mod media;
pub mod metrics;
pub mod peer;
pub mod playlist;
pub mod retry;
pub mod signaling;
pub mod sink;

pub use config::{ConfigPatch, ConfigStore, PerformanceProfile, PlayerConfig, Preset};
pub use coordinator::PlayerCoordinator;
pub use error::{EngineError, Result};
pub use events::{BufferLevel, PlayerEvent, SwitchReason};
pub use media::{
    BufferStatus, InitSegment, MasterPlaylist, Quality, SegmentDescriptor, SegmentKey, TimeRange,
    VariantPlaylist,
};
