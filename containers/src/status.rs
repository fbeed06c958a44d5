use crate::{Bytes32, Checkpoint, Slot};
use serde::{Deserialize, Serialize};

/// Head block a peer reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct HeadInfo {
    pub root: Bytes32,
    pub slot: Slot,
}

impl HeadInfo {
    pub fn new(slot: Slot, root: Bytes32) -> Self {
        Self { root, slot }
    }
}

/// Chain status exchanged with peers on connect and on request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Status {
    pub finalized: Checkpoint,
    pub head: HeadInfo,
}

impl Status {
    pub fn new(finalized: Checkpoint, head: HeadInfo) -> Self {
        Self { finalized, head }
    }
}
