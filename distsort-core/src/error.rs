use std::time::Duration;

use thiserror::Error;

use crate::comm::Tag;

/// Failures of the message-passing layer.
///
/// Every variant is fatal for the sort in progress: the bitonic network has
/// already mutated local state by the time a rendezvous fails, so a stage
/// cannot be retried in isolation.
#[derive(Error, Debug)]
pub enum CommError {
    #[error("rank {rank} is outside a group of size {size}")]
    RankOutOfRange { rank: usize, size: usize },
    #[error("rank {partner} disconnected before the exchange completed")]
    Disconnected { partner: usize },
    #[error("expected a message tagged {expected:?} from rank {partner}, got {found:?}")]
    TagMismatch {
        partner: usize,
        expected: Tag,
        found: Tag,
    },
    #[error("rank {partner} declared {declared} elements but sent {received}")]
    SizeMismatch {
        partner: usize,
        declared: u64,
        received: usize,
    },
    #[error("exchange with rank {partner} timed out after {after:?}")]
    Timeout { partner: usize, after: Duration },
    #[error("sort aborted by world rank {rank}: {reason}")]
    Aborted { rank: usize, reason: String },
    #[error("inconsistent communicator split: {0}")]
    InconsistentSplit(String),
    #[error("frame of {bytes} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { bytes: usize, limit: usize },
    #[error("connection setup failed: {0}")]
    Connect(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Errors surfaced by the distributed sort.
#[derive(Error, Debug)]
pub enum SortError {
    #[error("invalid topology: {0}")]
    Topology(String),
    #[error("empty local partition on rank(s) {ranks:?}")]
    EmptyPartition { ranks: Vec<usize> },
    #[error("worker task failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Comm(#[from] CommError),
}

impl SortError {
    /// True when this worker only failed because another worker gave up first.
    pub fn is_remote_abort(&self) -> bool {
        matches!(self, SortError::Comm(CommError::Aborted { .. }))
    }
}

/// Errors from reading or writing stored partitions.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("partition {0} not found")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}
