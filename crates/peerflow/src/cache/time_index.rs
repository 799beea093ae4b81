// Time-to-segment index: answers "which segment covers second T" per
// (stream, quality) without walking the playlist.

use crate::media::VariantPlaylist;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexedSegment {
    pub segment_id: String,
    pub timestamp: f64,
    pub duration: f64,
}

impl IndexedSegment {
    fn end(&self) -> f64 {
        self.timestamp + self.duration
    }

    fn contains(&self, time: f64) -> bool {
        time >= self.timestamp && time < self.end()
    }
}

/// Per-(stream, quality) sorted segment intervals.
#[derive(Debug, Default)]
pub struct TimeIndex {
    entries: HashMap<(String, String), Vec<IndexedSegment>>,
}

impl TimeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the index for a variant.
    pub fn install(&mut self, variant: &VariantPlaylist) {
        let segments = variant
            .segments
            .iter()
            .map(|s| IndexedSegment {
                segment_id: s.segment_id.clone(),
                timestamp: s.timestamp,
                duration: s.duration,
            })
            .collect();
        self.entries.insert(
            (variant.stream_id.clone(), variant.quality_id.clone()),
            segments,
        );
    }

    pub fn remove(&mut self, stream_id: &str, quality_id: &str) {
        self.entries
            .remove(&(stream_id.to_string(), quality_id.to_string()));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn segments(&self, stream_id: &str, quality_id: &str) -> Option<&[IndexedSegment]> {
        self.entries
            .get(&(stream_id.to_string(), quality_id.to_string()))
            .map(Vec::as_slice)
    }

    /// Index of the segment whose half-open interval contains `time`.
    fn position_at(segments: &[IndexedSegment], time: f64) -> Option<usize> {
        if segments.is_empty() || time < 0.0 {
            return None;
        }
        // Timestamps are sorted; binary search for the last segment starting
        // at or before `time`, then confirm coverage.
        let idx = segments.partition_point(|s| s.timestamp <= time);
        if idx == 0 {
            return None;
        }
        let candidate = &segments[idx - 1];
        candidate.contains(time).then_some(idx - 1)
    }

    /// The segment covering `time`, if any.
    pub fn find_at(&self, stream_id: &str, quality_id: &str, time: f64) -> Option<IndexedSegment> {
        let segments = self.segments(stream_id, quality_id)?;
        Self::position_at(segments, time).map(|i| segments[i].clone())
    }

    /// All segment ids overlapping `[start, end)`.
    pub fn find_overlapping(
        &self,
        stream_id: &str,
        quality_id: &str,
        start: f64,
        end: f64,
    ) -> Vec<String> {
        let Some(segments) = self.segments(stream_id, quality_id) else {
            return Vec::new();
        };
        segments
            .iter()
            .filter(|s| s.timestamp < end && s.end() > start)
            .map(|s| s.segment_id.clone())
            .collect()
    }

    /// A symmetric window around the segment covering `time`: up to `before`
    /// predecessors and `after` successors, in playlist order, including the
    /// covering segment itself.
    pub fn window(
        &self,
        stream_id: &str,
        quality_id: &str,
        time: f64,
        before: usize,
        after: usize,
    ) -> Vec<String> {
        let Some(segments) = self.segments(stream_id, quality_id) else {
            return Vec::new();
        };
        let Some(center) = Self::position_at(segments, time) else {
            return Vec::new();
        };
        let start = center.saturating_sub(before);
        let end = (center + after + 1).min(segments.len());
        segments[start..end]
            .iter()
            .map(|s| s.segment_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SegmentDescriptor;

    fn variant(count: usize, duration: f64) -> VariantPlaylist {
        let segments = (0..count)
            .map(|i| SegmentDescriptor {
                stream_id: "movie".into(),
                quality_id: "720p".into(),
                segment_id: format!("seg_{i:04}.m4s"),
                duration,
                timestamp: i as f64 * duration,
            })
            .collect();
        VariantPlaylist {
            stream_id: "movie".into(),
            quality_id: "720p".into(),
            target_duration: duration,
            total_duration: count as f64 * duration,
            segments,
        }
    }

    #[test]
    fn point_lookup_covers_boundaries() {
        let mut index = TimeIndex::new();
        index.install(&variant(10, 6.0));

        // Every segment's start and last-instant resolve to itself; its end
        // resolves to the successor.
        for i in 0..10usize {
            let start = i as f64 * 6.0;
            let at_start = index.find_at("movie", "720p", start).unwrap();
            assert_eq!(at_start.segment_id, format!("seg_{i:04}.m4s"));
            let near_end = index.find_at("movie", "720p", start + 6.0 - 1e-6).unwrap();
            assert_eq!(near_end.segment_id, format!("seg_{i:04}.m4s"));
            if i + 1 < 10 {
                let successor = index.find_at("movie", "720p", start + 6.0).unwrap();
                assert_eq!(successor.segment_id, format!("seg_{:04}.m4s", i + 1));
            }
        }
        assert!(index.find_at("movie", "720p", 60.0).is_none());
        assert!(index.find_at("movie", "720p", -1.0).is_none());
    }

    #[test]
    fn overlap_query_returns_touching_segments() {
        let mut index = TimeIndex::new();
        index.install(&variant(10, 6.0));

        let ids = index.find_overlapping("movie", "720p", 5.0, 13.0);
        assert_eq!(
            ids,
            vec!["seg_0000.m4s", "seg_0001.m4s", "seg_0002.m4s"]
        );
        // Half-open: a range ending exactly at a segment start excludes it.
        let ids = index.find_overlapping("movie", "720p", 0.0, 6.0);
        assert_eq!(ids, vec!["seg_0000.m4s"]);
    }

    #[test]
    fn window_clamps_at_playlist_edges() {
        let mut index = TimeIndex::new();
        index.install(&variant(10, 6.0));

        let ids = index.window("movie", "720p", 1.0, 5, 2);
        assert_eq!(ids, vec!["seg_0000.m4s", "seg_0001.m4s", "seg_0002.m4s"]);

        let ids = index.window("movie", "720p", 57.0, 2, 5);
        assert_eq!(ids, vec!["seg_0007.m4s", "seg_0008.m4s", "seg_0009.m4s"]);
    }

    #[test]
    fn unknown_variant_is_empty() {
        let index = TimeIndex::new();
        assert!(index.find_at("movie", "4k", 0.0).is_none());
        assert!(index.window("movie", "4k", 0.0, 1, 1).is_empty());
    }
}
