// Binary frame codec for the peerflow peer data-channel protocol.
//
// Two frame families share one ordered channel:
//
// * `Response` frames carry segment bytes for a single request: a 4-byte
//   little-endian request identifier followed by the payload.
// * Tagged frames (`Request`, `Chunk`, `Done`) carry a one-byte tag, a
//   length-prefixed transfer id, and for `Chunk` a big-endian index/total
//   pair plus the chunk payload. Large payloads are split into `Chunk`
//   frames and reassembled by `(id, total)`.
//
// The two families are distinguishable because request identifiers are
// allocated in steps of [`REQUEST_ID_STRIDE`]: the low byte of a `Response`
// frame is always a multiple of four and therefore never equals a frame tag.

pub mod assembler;
pub mod error;
pub mod frame;

pub use crate::{
    assembler::ChunkAssembler,
    error::FrameError,
    frame::{Frame, MAX_ID_LEN, REQUEST_ID_STRIDE, chunk_payload, decode, encode},
};
