// Core data model: qualities, segments, playlists, buffer geometry.

use bytes::Bytes;
use std::fmt;

/// One rendition advertised by the master playlist. Immutable once derived.
#[derive(Debug, Clone, PartialEq)]
pub struct Quality {
    pub id: String,
    /// Target bandwidth in bits per second.
    pub bandwidth: u64,
    pub width: u32,
    pub height: u32,
    pub codecs: String,
    pub frame_rate: Option<f64>,
}

impl Quality {
    /// MIME string for the media source attachment.
    pub fn mime_type(&self) -> String {
        format!("video/mp4; codecs=\"{}\"", self.codecs)
    }
}

/// The enumeration of available qualities for one stream.
#[derive(Debug, Clone)]
pub struct MasterPlaylist {
    pub stream_id: String,
    /// Sorted by bandwidth ascending.
    pub qualities: Vec<Quality>,
}

impl MasterPlaylist {
    pub fn quality(&self, id: &str) -> Option<&Quality> {
        self.qualities.iter().find(|q| q.id == id)
    }

    /// The startup rendition: the lowest-bandwidth quality.
    pub fn default_quality(&self) -> Option<&Quality> {
        self.qualities.first()
    }
}

/// A single media segment within a variant. Stable for the playlist's life.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentDescriptor {
    pub stream_id: String,
    pub quality_id: String,
    /// Opaque identifier: the filename including extension.
    pub segment_id: String,
    /// Duration in seconds.
    pub duration: f64,
    /// Start timestamp in seconds relative to the timeline origin.
    pub timestamp: f64,
}

impl SegmentDescriptor {
    pub fn key(&self) -> SegmentKey {
        SegmentKey {
            quality_id: self.quality_id.clone(),
            segment_id: self.segment_id.clone(),
        }
    }

    /// Half-open interval `[timestamp, timestamp + duration)`.
    pub fn contains(&self, time: f64) -> bool {
        time >= self.timestamp && time < self.timestamp + self.duration
    }

    /// Availability/announcement key shared with the swarm.
    pub fn availability_key(&self) -> String {
        format!("{}:{}:{}", self.stream_id, self.quality_id, self.segment_id)
    }
}

/// `qualityId:segmentId` identity used by the append pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentKey {
    pub quality_id: String,
    pub segment_id: String,
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.quality_id, self.segment_id)
    }
}

/// The ordered segment sequence of one quality. Immutable per load.
#[derive(Debug, Clone)]
pub struct VariantPlaylist {
    pub stream_id: String,
    pub quality_id: String,
    pub target_duration: f64,
    pub total_duration: f64,
    pub segments: Vec<SegmentDescriptor>,
}

impl VariantPlaylist {
    pub fn segment_index(&self, segment_id: &str) -> Option<usize> {
        self.segments.iter().position(|s| s.segment_id == segment_id)
    }

    /// Index of the segment whose interval contains `time`.
    pub fn index_at_time(&self, time: f64) -> Option<usize> {
        self.segments.iter().position(|s| s.contains(time))
    }
}

/// The fMP4 movie-box prefix required before media of its quality.
#[derive(Debug, Clone)]
pub struct InitSegment {
    pub quality_id: String,
    pub data: Bytes,
    pub url: String,
}

/// A contiguous buffered interval in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }
}

/// Snapshot of the sink's buffered state around the playhead.
#[derive(Debug, Clone, Default)]
pub struct BufferStatus {
    pub ranges: Vec<TimeRange>,
    pub current_time: f64,
    pub duration: f64,
    /// Seconds buffered ahead of the playhead within its containing range.
    pub buffered_ahead: f64,
    /// Seconds buffered behind the playhead within its containing range.
    pub buffered_behind: f64,
}

impl BufferStatus {
    /// Derive ahead/behind from ranges and the playhead position.
    pub fn from_ranges(ranges: Vec<TimeRange>, current_time: f64, duration: f64) -> Self {
        let mut buffered_ahead = 0.0;
        let mut buffered_behind = 0.0;
        for range in &ranges {
            if range.contains(current_time) || (current_time - range.end).abs() < f64::EPSILON {
                buffered_ahead = (range.end - current_time).max(0.0);
                buffered_behind = (current_time - range.start).max(0.0);
                break;
            }
        }
        Self {
            ranges,
            current_time,
            duration,
            buffered_ahead,
            buffered_behind,
        }
    }
}
