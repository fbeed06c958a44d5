/// Range sync for the lean Ethereum consensus client.
///
/// Catches the local chain up with the network by downloading historical
/// blocks from peers in slot ranges. It includes:
///
/// - **Batch**: A slot range downloaded and processed as a unit, with retries
/// - **Chain**: Ordered batches pursuing one target, backed by a set of peers
/// - **Peer Manager**: Tracks peer chain status and request load
/// - **Range Sync**: Owns the finalized chain and the head chains and derives the sync state
/// - **Sync Service**: Actor executing the engine's actions against the network
///   and the block pipeline
///
/// ## Architecture
///
/// The engine is a pure state machine:
/// 1. Peer status arrives and peers are grouped by the targets they advertise
/// 2. A finalized chain is created for the best supported finalized checkpoint
/// 3. With nothing left to finalize, up to `PARALLEL_HEAD_CHAINS` head chains follow peer heads
/// 4. Chains request batches from their peers and process them strictly in slot order
/// 5. Every result is fed back as an event and answered with new actions
///
/// ## State Machine
///
/// - **STALLED**: No useful peers
/// - **SYNCING_FINALIZED**: Syncing towards a finalized checkpoint
/// - **SYNCING_HEAD**: Syncing towards peer heads
/// - **SYNCED**: Up to date with all known peers
pub mod actions;
pub mod batch;
pub mod chain;
pub mod config;
pub mod error;
pub mod peer_manager;
pub mod range_sync;
pub mod service;
pub mod states;

pub use actions::{PeerFault, RemovalReason, SyncAction};
pub use batch::{Batch, BatchId, BatchState, RequestId, SlotRange};
pub use chain::{ChainId, SyncChainType, SyncTarget, SyncingChain};
pub use config::*;
pub use error::{NetworkError, ProcessingError, SyncError};
pub use peer_manager::{PeerManager, SyncPeer};
pub use range_sync::{LocalChainInfo, RangeSync};
pub use service::{
    BlockProcessor, BlockRangeRequester, ChainStore, NoopPeerReporter, PeerReporter,
    SyncMessage, SyncService, SyncStatusHandle,
};
pub use states::{SyncState, SyncStatus};

#[cfg(test)]
mod tests;
