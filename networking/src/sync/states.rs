use containers::Slot;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::serde_utils::quoted_u64;

/// Range sync state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// No useful peers are connected.
    ///
    /// Initial state. Entered whenever the peer pool has no peer with a known
    /// status and left as soon as one connects.
    #[default]
    Stalled,

    /// Long-range sync towards a finalized checkpoint advertised by peers.
    ///
    /// Has priority over head sync: head chains are paused while a finalized
    /// chain is incomplete.
    SyncingFinalized,

    /// Long-range sync towards one or more peer heads.
    SyncingHead,

    /// Up to date with all known peers.
    Synced,
}

impl SyncState {
    pub const ALL: [SyncState; 4] = [
        SyncState::Stalled,
        SyncState::SyncingFinalized,
        SyncState::SyncingHead,
        SyncState::Synced,
    ];

    pub fn is_syncing(&self) -> bool {
        matches!(self, SyncState::SyncingFinalized | SyncState::SyncingHead)
    }

    pub fn is_synced(&self) -> bool {
        matches!(self, SyncState::Synced)
    }

    /// Lowercase label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Stalled => "stalled",
            SyncState::SyncingFinalized => "syncing_finalized",
            SyncState::SyncingHead => "syncing_head",
            SyncState::Synced => "synced",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the node's sync progress, as consumed by gossip admission and
/// the node API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    /// Best known head slot: the highest of the local head and any peer head.
    #[serde(with = "quoted_u64")]
    pub head_slot: u64,
    /// Slots between the local head and `head_slot`.
    #[serde(with = "quoted_u64")]
    pub sync_distance: u64,
}

impl SyncStatus {
    pub fn new(state: SyncState, local_head: Slot, network_head: Slot) -> Self {
        let head_slot = local_head.max(network_head);
        Self {
            state,
            head_slot: head_slot.0,
            sync_distance: head_slot.saturating_sub(local_head),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.state.is_syncing()
    }

    pub fn is_synced(&self) -> bool {
        self.state.is_synced()
    }
}
