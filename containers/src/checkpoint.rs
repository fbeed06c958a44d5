use crate::{Bytes32, Epoch, Slot};
use serde::{Deserialize, Serialize};

/// Represents a checkpoint in the chain's history.
///
/// A checkpoint pairs an epoch with the root of the block at the start of
/// that epoch. Finality is tracked in checkpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The root hash of the checkpoint's block.
    pub root: Bytes32,
    /// The epoch of the checkpoint.
    pub epoch: Epoch,
}

impl Checkpoint {
    pub fn new(epoch: Epoch, root: Bytes32) -> Self {
        Self { root, epoch }
    }

    /// Return the genesis checkpoint with zero root and epoch 0.
    pub fn genesis() -> Self {
        Self {
            root: Bytes32::zero(),
            epoch: Epoch(0),
        }
    }

    /// Slot at which the checkpoint block is expected.
    pub fn slot(&self) -> Slot {
        self.epoch.start_slot()
    }
}
