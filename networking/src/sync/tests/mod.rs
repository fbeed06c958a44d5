mod chain_tests;
mod peer_manager_tests;

use containers::{
    Block, Bytes32, Checkpoint, Epoch, HeadInfo, SignedBlock, Slot, Status, ValidatorIndex,
};

use crate::sync::SlotRange;

pub(super) fn root(byte: u8) -> Bytes32 {
    Bytes32::from([byte; 32])
}

pub(super) fn checkpoint(epoch: u64, root_byte: u8) -> Checkpoint {
    Checkpoint::new(Epoch(epoch), root(root_byte))
}

pub(super) fn head(slot: u64, root_byte: u8) -> HeadInfo {
    HeadInfo::new(Slot(slot), root(root_byte))
}

pub(super) fn status(
    finalized_epoch: u64,
    finalized_root: u8,
    head_slot: u64,
    head_root: u8,
) -> Status {
    Status::new(
        checkpoint(finalized_epoch, finalized_root),
        head(head_slot, head_root),
    )
}

pub(super) fn create_test_block(slot: u64, parent_root: Bytes32) -> SignedBlock {
    SignedBlock {
        message: Block {
            slot: Slot(slot),
            proposer_index: ValidatorIndex(slot % 8),
            parent_root,
            state_root: Bytes32::default(),
            body_root: Bytes32::default(),
        },
        signature: Vec::new(),
    }
}

/// One block per slot of `range`, each linked to the previous one.
pub(super) fn blocks_for(range: SlotRange) -> Vec<SignedBlock> {
    let mut parent = Bytes32::default();
    (range.start.0..range.end.0)
        .map(|slot| {
            let block = create_test_block(slot, parent);
            parent = block.root();
            block
        })
        .collect()
}
