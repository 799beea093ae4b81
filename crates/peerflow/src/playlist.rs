// Playlist parsing: maps m3u8 master/variant playlists onto the engine's
// immutable data model.

use crate::error::EngineError;
use crate::media::{MasterPlaylist, Quality, SegmentDescriptor, VariantPlaylist};
use tracing::{debug, warn};

/// Validate a playlist entry filename against the `seg_<digits>.<ext>` form
/// and return the numeric index. Identity stays the full filename; the index
/// is only used for ordering sanity.
pub fn parse_segment_filename(name: &str) -> Option<u64> {
    let rest = name.strip_prefix("seg_")?;
    let dot = rest.find('.')?;
    let (digits, ext) = rest.split_at(dot);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Require a non-empty extension after the dot.
    if ext.len() < 2 {
        return None;
    }
    digits.parse().ok()
}

/// Derive the quality identity from a variant URI (`{quality}/playlist.m3u8`
/// or an absolute URL ending the same way).
fn quality_id_from_uri(uri: &str) -> Option<String> {
    let trimmed = uri.trim_end_matches('/');
    let mut parts = trimmed.rsplit('/');
    let last = parts.next()?;
    if last.ends_with(".m3u8") {
        parts.next().map(|s| s.to_string())
    } else {
        Some(last.to_string())
    }
}

/// Parse a master playlist into the set of advertised qualities, sorted by
/// bandwidth ascending.
pub fn parse_master(stream_id: &str, text: &str) -> Result<MasterPlaylist, EngineError> {
    let parsed = m3u8_rs::parse_playlist_res(text.as_bytes()).map_err(|e| {
        EngineError::playlist(format!("failed to parse master playlist: {e}"))
    })?;
    let master = match parsed {
        m3u8_rs::Playlist::MasterPlaylist(pl) => pl,
        m3u8_rs::Playlist::MediaPlaylist(_) => {
            return Err(EngineError::playlist(
                "expected a master playlist, got a media playlist",
            ));
        }
    };

    let mut qualities = Vec::new();
    for variant in &master.variants {
        if variant.is_i_frame {
            continue;
        }
        let Some(id) = quality_id_from_uri(&variant.uri) else {
            warn!(uri = %variant.uri, "Skipping variant with unrecognizable URI");
            continue;
        };
        let (width, height) = variant
            .resolution
            .map(|r| (r.width as u32, r.height as u32))
            .unwrap_or((0, 0));
        qualities.push(Quality {
            id,
            bandwidth: variant.bandwidth,
            width,
            height,
            codecs: variant.codecs.clone().unwrap_or_default(),
            frame_rate: variant.frame_rate,
        });
    }

    if qualities.is_empty() {
        return Err(EngineError::playlist(format!(
            "master playlist for `{stream_id}` advertises no usable variants"
        )));
    }
    qualities.sort_by_key(|q| q.bandwidth);
    debug!(
        stream = stream_id,
        count = qualities.len(),
        "Parsed master playlist"
    );

    Ok(MasterPlaylist {
        stream_id: stream_id.to_string(),
        qualities,
    })
}

/// Parse a variant playlist into an ordered segment sequence with cumulative
/// timestamps. A filename outside the expected pattern is fatal for the
/// whole playlist.
pub fn parse_variant(
    stream_id: &str,
    quality_id: &str,
    text: &str,
) -> Result<VariantPlaylist, EngineError> {
    let parsed = m3u8_rs::parse_playlist_res(text.as_bytes()).map_err(|e| {
        EngineError::playlist(format!("failed to parse variant playlist: {e}"))
    })?;
    let media = match parsed {
        m3u8_rs::Playlist::MediaPlaylist(pl) => pl,
        m3u8_rs::Playlist::MasterPlaylist(_) => {
            return Err(EngineError::playlist(
                "expected a media playlist, got a master playlist",
            ));
        }
    };

    let mut segments = Vec::with_capacity(media.segments.len());
    let mut timestamp = 0.0_f64;
    for segment in &media.segments {
        let name = segment
            .uri
            .rsplit('/')
            .next()
            .unwrap_or(segment.uri.as_str());
        if parse_segment_filename(name).is_none() {
            return Err(EngineError::playlist(format!(
                "segment `{}` in `{stream_id}/{quality_id}` does not match the expected naming pattern",
                segment.uri
            )));
        }
        let duration = segment.duration as f64;
        segments.push(SegmentDescriptor {
            stream_id: stream_id.to_string(),
            quality_id: quality_id.to_string(),
            segment_id: name.to_string(),
            duration,
            timestamp,
        });
        timestamp += duration;
    }

    Ok(VariantPlaylist {
        stream_id: stream_id.to_string(),
        quality_id: quality_id.to_string(),
        target_duration: media.target_duration as f64,
        total_duration: timestamp,
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080,CODECS=\"avc1.640028,mp4a.40.2\",FRAME-RATE=29.970\n\
1080p/playlist.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720,CODECS=\"avc1.64001f,mp4a.40.2\"\n\
720p/playlist.m3u8\n";

    const VARIANT: &str = "#EXTM3U\n\
#EXT-X-VERSION:7\n\
#EXT-X-TARGETDURATION:6\n\
#EXT-X-MAP:URI=\"init.mp4\"\n\
#EXTINF:6.0,\n\
seg_0000.m4s\n\
#EXTINF:6.0,\n\
seg_0001.m4s\n\
#EXTINF:4.5,\n\
seg_0002.m4s\n\
#EXT-X-ENDLIST\n";

    #[test]
    fn master_sorted_by_bandwidth() {
        let master = parse_master("movie", MASTER).unwrap();
        assert_eq!(master.qualities.len(), 2);
        assert_eq!(master.qualities[0].id, "720p");
        assert_eq!(master.qualities[0].bandwidth, 2_500_000);
        assert_eq!(master.qualities[1].id, "1080p");
        assert_eq!(master.qualities[1].width, 1920);
        assert_eq!(master.default_quality().unwrap().id, "720p");
    }

    #[test]
    fn master_frame_rate_carried() {
        let master = parse_master("movie", MASTER).unwrap();
        let hi = master.quality("1080p").unwrap();
        assert!(hi.frame_rate.is_some());
        assert_eq!(master.quality("720p").unwrap().frame_rate, None);
    }

    #[test]
    fn variant_cumulative_timestamps() {
        let variant = parse_variant("movie", "720p", VARIANT).unwrap();
        assert_eq!(variant.segments.len(), 3);
        assert_eq!(variant.target_duration, 6.0);
        assert_eq!(variant.segments[0].timestamp, 0.0);
        assert_eq!(variant.segments[1].timestamp, 6.0);
        assert_eq!(variant.segments[2].timestamp, 12.0);
        assert!((variant.total_duration - 16.5).abs() < 1e-9);
        assert_eq!(variant.segments[2].segment_id, "seg_0002.m4s");
    }

    #[test]
    fn variant_rejects_foreign_filenames() {
        let bad = VARIANT.replace("seg_0001.m4s", "chunk-1.m4s");
        let err = parse_variant("movie", "720p", &bad).unwrap_err();
        assert!(matches!(err, EngineError::Playlist { .. }));
    }

    #[test]
    fn segment_filename_pattern() {
        assert_eq!(parse_segment_filename("seg_0042.m4s"), Some(42));
        assert_eq!(parse_segment_filename("seg_0.ts"), Some(0));
        assert_eq!(parse_segment_filename("segment_0042.m4s"), None);
        assert_eq!(parse_segment_filename("seg_00x2.m4s"), None);
        assert_eq!(parse_segment_filename("seg_0042"), None);
        assert_eq!(parse_segment_filename("seg_0042."), None);
    }

    #[test]
    fn index_at_time_matches_half_open_intervals() {
        let variant = parse_variant("movie", "720p", VARIANT).unwrap();
        assert_eq!(variant.index_at_time(0.0), Some(0));
        assert_eq!(variant.index_at_time(5.999), Some(0));
        assert_eq!(variant.index_at_time(6.0), Some(1));
        assert_eq!(variant.index_at_time(16.4), Some(2));
        assert_eq!(variant.index_at_time(16.5), None);
    }
}
