#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },

    #[error("transfer id exceeds {max} bytes: {len}")]
    IdTooLong { len: usize, max: usize },

    #[error("transfer id is not valid UTF-8")]
    InvalidId,

    #[error("chunk index {index} out of range for total {total}")]
    ChunkOutOfRange { index: u16, total: u16 },

    #[error("chunk total changed mid-transfer for `{id}`: {previous} -> {current}")]
    TotalMismatch {
        id: String,
        previous: u16,
        current: u16,
    },

    #[error("request id {id} is not stride-aligned")]
    UnalignedRequestId { id: u32 },
}
