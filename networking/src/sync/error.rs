use containers::{Bytes32, Slot};
use thiserror::Error;

use super::{batch::BatchId, chain::ChainId};

/// Failure of a block range request. Always recovered as a failed download
/// attempt of the batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("request timed out")]
    Timeout,
    #[error("peer disconnected during the request")]
    Disconnected,
    #[error("malformed response: {0}")]
    InvalidResponse(String),
    #[error("rpc error: {0}")]
    Rpc(String),
}

/// Failure reported by the block processing pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("invalid block at slot {slot}: {reason}")]
    InvalidBlock { slot: Slot, reason: String },
    #[error("block at slot {slot} has unknown parent {parent_root}")]
    UnknownParent { slot: Slot, parent_root: Bytes32 },
    #[error("state transition rejected block at slot {slot}: {reason}")]
    StateTransition { slot: Slot, reason: String },
    #[error("processing pipeline unavailable: {0}")]
    Unavailable(String),
}

impl ProcessingError {
    /// Whether the blocks served by the peer are at fault: an invalid block, a
    /// broken parent link or a rejected state transition. An unavailable
    /// pipeline is a local problem.
    pub fn blames_peer(&self) -> bool {
        !matches!(self, ProcessingError::Unavailable(_))
    }

    /// Slot of the first block the pipeline rejected.
    pub fn failed_slot(&self) -> Option<Slot> {
        match self {
            ProcessingError::InvalidBlock { slot, .. }
            | ProcessingError::UnknownParent { slot, .. }
            | ProcessingError::StateTransition { slot, .. } => Some(*slot),
            ProcessingError::Unavailable(_) => None,
        }
    }
}

/// Events that do not match the engine's state. Logged and dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("event for unknown chain {0}")]
    UnknownChain(ChainId),
    #[error("event for unknown batch {batch_id} of chain {chain_id}")]
    UnknownBatch { chain_id: ChainId, batch_id: BatchId },
}
