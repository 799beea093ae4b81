// Reassembles chunked transfers by (id, total).

use crate::error::FrameError;
use crate::frame::Frame;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default age after which a partial transfer is dropped by [`ChunkAssembler::sweep`].
const STALE_AFTER: Duration = Duration::from_secs(30);

struct PartialTransfer {
    total: u16,
    received: HashMap<u16, Bytes>,
    started_at: Instant,
}

impl PartialTransfer {
    fn is_complete(&self) -> bool {
        self.received.len() == self.total as usize
    }

    fn assemble(mut self) -> Bytes {
        let mut out = BytesMut::new();
        for index in 0..self.total {
            if let Some(chunk) = self.received.remove(&index) {
                out.extend_from_slice(&chunk);
            }
        }
        out.freeze()
    }
}

/// Collects `Chunk` frames and emits the assembled payload once every chunk
/// of a transfer has arrived. Duplicate chunks are ignored; a chunk carrying
/// a different `total` than previously seen for the same id is a protocol
/// error and resets that transfer.
#[derive(Default)]
pub struct ChunkAssembler {
    transfers: HashMap<String, PartialTransfer>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame. Returns the completed payload when the final chunk
    /// of a transfer arrives, `None` otherwise. `Done` frames drop any
    /// leftover partial state for the id; `Request`/`Response` frames are
    /// not the assembler's concern and return `None`.
    pub fn push(&mut self, frame: Frame) -> Result<Option<(String, Bytes)>, FrameError> {
        match frame {
            Frame::Chunk {
                id,
                index,
                total,
                payload,
            } => {
                let entry = self
                    .transfers
                    .entry(id.clone())
                    .or_insert_with(|| PartialTransfer {
                        total,
                        received: HashMap::with_capacity(total as usize),
                        started_at: Instant::now(),
                    });
                if entry.total != total {
                    let previous = entry.total;
                    self.transfers.remove(&id);
                    return Err(FrameError::TotalMismatch {
                        id,
                        previous,
                        current: total,
                    });
                }
                entry.received.entry(index).or_insert(payload);
                if entry.is_complete() {
                    let done = self.transfers.remove(&id).map(PartialTransfer::assemble);
                    return Ok(done.map(|payload| (id, payload)));
                }
                Ok(None)
            }
            Frame::Done { id } => {
                // A Done after completion is a no-op; a Done with chunks
                // still missing abandons the transfer.
                self.transfers.remove(&id);
                Ok(None)
            }
            Frame::Request { .. } | Frame::Response { .. } => Ok(None),
        }
    }

    /// Number of transfers currently in flight.
    pub fn pending(&self) -> usize {
        self.transfers.len()
    }

    /// Drop partial transfers older than `max_age` (defaults to 30 s when
    /// `None`). Returns the number of transfers dropped.
    pub fn sweep(&mut self, max_age: Option<Duration>) -> usize {
        let max_age = max_age.unwrap_or(STALE_AFTER);
        let before = self.transfers.len();
        self.transfers
            .retain(|_, transfer| transfer.started_at.elapsed() < max_age);
        before - self.transfers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::chunk_payload;

    fn chunk(id: &str, index: u16, total: u16, payload: &'static [u8]) -> Frame {
        Frame::Chunk {
            id: id.to_string(),
            index,
            total,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn assembles_in_order() {
        let mut asm = ChunkAssembler::new();
        assert_eq!(asm.push(chunk("a", 0, 2, b"he")).unwrap(), None);
        let (id, payload) = asm.push(chunk("a", 1, 2, b"llo")).unwrap().unwrap();
        assert_eq!(id, "a");
        assert_eq!(&payload[..], b"hello");
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn assembles_out_of_order() {
        let mut asm = ChunkAssembler::new();
        assert_eq!(asm.push(chunk("a", 2, 3, b"c")).unwrap(), None);
        assert_eq!(asm.push(chunk("a", 0, 3, b"a")).unwrap(), None);
        let (_, payload) = asm.push(chunk("a", 1, 3, b"b")).unwrap().unwrap();
        assert_eq!(&payload[..], b"abc");
    }

    #[test]
    fn duplicate_chunks_are_ignored() {
        let mut asm = ChunkAssembler::new();
        assert_eq!(asm.push(chunk("a", 0, 2, b"x")).unwrap(), None);
        assert_eq!(asm.push(chunk("a", 0, 2, b"y")).unwrap(), None);
        let (_, payload) = asm.push(chunk("a", 1, 2, b"z")).unwrap().unwrap();
        // First write wins.
        assert_eq!(&payload[..], b"xz");
    }

    #[test]
    fn interleaved_transfers() {
        let mut asm = ChunkAssembler::new();
        assert_eq!(asm.push(chunk("a", 0, 2, b"a0")).unwrap(), None);
        assert_eq!(asm.push(chunk("b", 0, 2, b"b0")).unwrap(), None);
        let (id, _) = asm.push(chunk("b", 1, 2, b"b1")).unwrap().unwrap();
        assert_eq!(id, "b");
        let (id, _) = asm.push(chunk("a", 1, 2, b"a1")).unwrap().unwrap();
        assert_eq!(id, "a");
    }

    #[test]
    fn total_mismatch_resets_transfer() {
        let mut asm = ChunkAssembler::new();
        assert_eq!(asm.push(chunk("a", 0, 2, b"x")).unwrap(), None);
        let err = asm.push(chunk("a", 0, 3, b"x")).unwrap_err();
        assert!(matches!(err, FrameError::TotalMismatch { .. }));
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn done_abandons_partial_transfer() {
        let mut asm = ChunkAssembler::new();
        assert_eq!(asm.push(chunk("a", 0, 2, b"x")).unwrap(), None);
        assert_eq!(
            asm.push(Frame::Done { id: "a".to_string() }).unwrap(),
            None
        );
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn round_trip_through_chunker() {
        let payload = Bytes::from((0u8..=255).cycle().take(70_000).collect::<Vec<_>>());
        let frames = chunk_payload("seg", payload.clone(), 16 * 1024).unwrap();
        let mut asm = ChunkAssembler::new();
        let mut result = None;
        for frame in frames {
            if let Some(done) = asm.push(frame).unwrap() {
                result = Some(done);
            }
        }
        let (id, assembled) = result.unwrap();
        assert_eq!(id, "seg");
        assert_eq!(assembled, payload);
    }
}
