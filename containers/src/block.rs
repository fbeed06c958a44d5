use crate::{Bytes32, Slot, ValidatorIndex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub slot: Slot,
    pub proposer_index: ValidatorIndex,
    pub parent_root: Bytes32,
    pub state_root: Bytes32,
    pub body_root: Bytes32,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignedBlock {
    pub message: Block,
    pub signature: Vec<u8>,
}

impl Block {
    /// Block identifier: SHA-256 over the header fields.
    pub fn root(&self) -> Bytes32 {
        let mut hasher = Sha256::new();
        hasher.update(self.slot.0.to_le_bytes());
        hasher.update(self.proposer_index.0.to_le_bytes());
        hasher.update(self.parent_root.as_bytes());
        hasher.update(self.state_root.as_bytes());
        hasher.update(self.body_root.as_bytes());
        let mut root = [0u8; 32];
        root.copy_from_slice(&hasher.finalize());
        Bytes32::from(root)
    }
}

impl SignedBlock {
    pub fn slot(&self) -> Slot {
        self.message.slot
    }

    pub fn parent_root(&self) -> Bytes32 {
        self.message.parent_root
    }

    pub fn root(&self) -> Bytes32 {
        self.message.root()
    }
}
