// Frame layout and encode/decode for the peer data-channel protocol.

use crate::error::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Tag byte for a `Chunk` frame.
const TAG_CHUNK: u8 = 0x01;
/// Tag byte for a `Done` frame.
const TAG_DONE: u8 = 0x02;
/// Tag byte for a `Request` frame.
const TAG_REQUEST: u8 = 0x03;

/// Maximum length of a transfer id (the id length is a single byte).
pub const MAX_ID_LEN: usize = 255;

/// Request identifiers are allocated in steps of this stride so the low
/// byte of a little-endian `Response` frame never collides with a tag byte.
pub const REQUEST_ID_STRIDE: u32 = 4;

/// A single frame on the peer data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A pull request for the transfer identified by `id`.
    Request { id: String },
    /// One slice of a chunked transfer. `index` is zero-based; the transfer
    /// completes when all `total` chunks have arrived.
    Chunk {
        id: String,
        index: u16,
        total: u16,
        payload: Bytes,
    },
    /// End-of-transfer marker for `id`.
    Done { id: String },
    /// A complete single-frame response: request id followed by payload.
    Response { request_id: u32, payload: Bytes },
}

impl Frame {
    /// The transfer id for tagged frames, `None` for `Response`.
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            Frame::Request { id } | Frame::Done { id } | Frame::Chunk { id, .. } => Some(id),
            Frame::Response { .. } => None,
        }
    }
}

fn check_id(id: &str) -> Result<(), FrameError> {
    if id.len() > MAX_ID_LEN {
        return Err(FrameError::IdTooLong {
            len: id.len(),
            max: MAX_ID_LEN,
        });
    }
    Ok(())
}

fn put_id(dst: &mut BytesMut, id: &str) {
    dst.put_u8(id.len() as u8);
    dst.put_slice(id.as_bytes());
}

/// Encode a frame into a single channel message.
pub fn encode(frame: &Frame) -> Result<Bytes, FrameError> {
    let mut dst = BytesMut::new();
    match frame {
        Frame::Request { id } => {
            check_id(id)?;
            dst.reserve(2 + id.len());
            dst.put_u8(TAG_REQUEST);
            put_id(&mut dst, id);
        }
        Frame::Done { id } => {
            check_id(id)?;
            dst.reserve(2 + id.len());
            dst.put_u8(TAG_DONE);
            put_id(&mut dst, id);
        }
        Frame::Chunk {
            id,
            index,
            total,
            payload,
        } => {
            check_id(id)?;
            if *total == 0 || index >= total {
                return Err(FrameError::ChunkOutOfRange {
                    index: *index,
                    total: *total,
                });
            }
            dst.reserve(2 + id.len() + 4 + payload.len());
            dst.put_u8(TAG_CHUNK);
            put_id(&mut dst, id);
            dst.put_u16(*index);
            dst.put_u16(*total);
            dst.put_slice(payload);
        }
        Frame::Response {
            request_id,
            payload,
        } => {
            if request_id % REQUEST_ID_STRIDE != 0 {
                return Err(FrameError::UnalignedRequestId { id: *request_id });
            }
            dst.reserve(4 + payload.len());
            dst.put_u32_le(*request_id);
            dst.put_slice(payload);
        }
    }
    Ok(dst.freeze())
}

fn read_id(src: &mut Bytes) -> Result<String, FrameError> {
    if src.remaining() < 1 {
        return Err(FrameError::Truncated {
            needed: 1,
            available: 0,
        });
    }
    let len = src.get_u8() as usize;
    if src.remaining() < len {
        return Err(FrameError::Truncated {
            needed: len,
            available: src.remaining(),
        });
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| FrameError::InvalidId)
}

/// Decode one channel message into a frame.
///
/// Tag bytes 0x01-0x03 select the tagged family; anything else is a
/// `Response` frame (request ids are stride-aligned, so their low byte is
/// never a tag value).
pub fn decode(message: Bytes) -> Result<Frame, FrameError> {
    let mut src = message;
    if src.remaining() < 1 {
        return Err(FrameError::Truncated {
            needed: 1,
            available: 0,
        });
    }
    match src[0] {
        TAG_REQUEST => {
            src.advance(1);
            Ok(Frame::Request { id: read_id(&mut src)? })
        }
        TAG_DONE => {
            src.advance(1);
            Ok(Frame::Done { id: read_id(&mut src)? })
        }
        TAG_CHUNK => {
            src.advance(1);
            let id = read_id(&mut src)?;
            if src.remaining() < 4 {
                return Err(FrameError::Truncated {
                    needed: 4,
                    available: src.remaining(),
                });
            }
            let index = src.get_u16();
            let total = src.get_u16();
            if total == 0 || index >= total {
                return Err(FrameError::ChunkOutOfRange { index, total });
            }
            Ok(Frame::Chunk {
                id,
                index,
                total,
                payload: src,
            })
        }
        _ => {
            if src.remaining() < 4 {
                return Err(FrameError::Truncated {
                    needed: 4,
                    available: src.remaining(),
                });
            }
            let request_id = src.get_u32_le();
            Ok(Frame::Response {
                request_id,
                payload: src,
            })
        }
    }
}

/// Split `payload` into `Chunk` frames of at most `max_chunk` payload bytes,
/// followed by a `Done` frame. An empty payload still produces one chunk so
/// the receiver observes a complete transfer.
pub fn chunk_payload(id: &str, payload: Bytes, max_chunk: usize) -> Result<Vec<Frame>, FrameError> {
    check_id(id)?;
    let max_chunk = max_chunk.max(1);
    let total = payload.len().div_ceil(max_chunk).max(1);
    if total > u16::MAX as usize {
        return Err(FrameError::ChunkOutOfRange {
            index: u16::MAX,
            total: u16::MAX,
        });
    }
    let total = total as u16;

    let mut frames = Vec::with_capacity(total as usize + 1);
    for index in 0..total {
        let start = index as usize * max_chunk;
        let end = (start + max_chunk).min(payload.len());
        frames.push(Frame::Chunk {
            id: id.to_string(),
            index,
            total,
            payload: payload.slice(start..end),
        });
    }
    frames.push(Frame::Done { id: id.to_string() });
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let frame = Frame::Request {
            id: "seg_0042.m4s".to_string(),
        };
        let encoded = encode(&frame).unwrap();
        assert_eq!(decode(encoded).unwrap(), frame);
    }

    #[test]
    fn chunk_round_trip() {
        let frame = Frame::Chunk {
            id: "1024".to_string(),
            index: 2,
            total: 7,
            payload: Bytes::from_static(b"abcdef"),
        };
        let encoded = encode(&frame).unwrap();
        assert_eq!(decode(encoded).unwrap(), frame);
    }

    #[test]
    fn response_round_trip() {
        let frame = Frame::Response {
            request_id: 512,
            payload: Bytes::from_static(&[9, 8, 7]),
        };
        let encoded = encode(&frame).unwrap();
        assert_eq!(decode(encoded).unwrap(), frame);
    }

    #[test]
    fn response_rejects_unaligned_id() {
        let frame = Frame::Response {
            request_id: 7,
            payload: Bytes::new(),
        };
        assert_eq!(
            encode(&frame),
            Err(FrameError::UnalignedRequestId { id: 7 })
        );
    }

    #[test]
    fn response_low_byte_never_collides_with_tags() {
        // Stride-aligned ids have a low byte that is a multiple of 4.
        for id in (0..1024u32).step_by(REQUEST_ID_STRIDE as usize) {
            let low = (id & 0xff) as u8;
            assert!(low % 4 == 0);
            assert!(low != TAG_CHUNK && low != TAG_DONE && low != TAG_REQUEST);
        }
    }

    #[test]
    fn decode_truncated_response() {
        let err = decode(Bytes::from_static(&[0x04, 0x00])).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { .. }));
    }

    #[test]
    fn chunk_rejects_index_past_total() {
        let frame = Frame::Chunk {
            id: "x".to_string(),
            index: 3,
            total: 3,
            payload: Bytes::new(),
        };
        assert!(matches!(
            encode(&frame),
            Err(FrameError::ChunkOutOfRange { index: 3, total: 3 })
        ));
    }

    #[test]
    fn chunk_payload_splits_and_terminates() {
        let payload = Bytes::from(vec![0u8; 2500]);
        let frames = chunk_payload("44", payload, 1000).unwrap();
        // 3 chunks + done
        assert_eq!(frames.len(), 4);
        assert!(matches!(&frames[3], Frame::Done { id } if id == "44"));
        let sizes: Vec<usize> = frames[..3]
            .iter()
            .map(|f| match f {
                Frame::Chunk { payload, .. } => payload.len(),
                _ => panic!("expected chunk"),
            })
            .collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
    }

    #[test]
    fn chunk_payload_empty_still_completes() {
        let frames = chunk_payload("44", Bytes::new(), 1000).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(matches!(
            &frames[0],
            Frame::Chunk { index: 0, total: 1, payload, .. } if payload.is_empty()
        ));
    }
}
