use std::{fmt, sync::Arc};

use containers::SignedBlock;
use libp2p_identity::PeerId;

use super::{
    batch::{BatchId, RequestId, SlotRange},
    chain::{ChainId, SyncChainType},
};

/// Why a peer is reported to the peer scoring collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerFault {
    /// Served blocks outside the requested range or out of order.
    InvalidResponse,
    /// Served blocks the processing pipeline rejected.
    InvalidBlocks,
    /// Supported a chain that had to be abandoned.
    FaultyChain,
}

impl PeerFault {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerFault::InvalidResponse => "invalid_response",
            PeerFault::InvalidBlocks => "invalid_blocks",
            PeerFault::FaultyChain => "faulty_chain",
        }
    }
}

/// Why a chain was dropped by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalReason {
    /// Reached its target.
    Completed,
    /// A batch exhausted its attempts.
    Faulty,
    /// The local chain moved past the target.
    Obsolete,
    /// A better supported finalized target took over.
    Replaced,
    /// Lost all its peers while other peers are connected.
    Peerless,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalReason::Completed => "completed",
            RemovalReason::Faulty => "faulty",
            RemovalReason::Obsolete => "obsolete",
            RemovalReason::Replaced => "replaced",
            RemovalReason::Peerless => "peerless",
        }
    }
}

/// Outbound work produced by the range sync engine.
///
/// The engine never performs I/O itself: every entry point returns the
/// actions the caller must carry out, and results flow back as events.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    /// Request `range` from `peer_id`. The result must be reported with the
    /// same chain, batch and request ids.
    RequestBlocks {
        chain_id: ChainId,
        batch_id: BatchId,
        request_id: RequestId,
        peer_id: PeerId,
        range: SlotRange,
    },
    /// Hand the blocks of a batch to the processing pipeline.
    ProcessBatch {
        chain_id: ChainId,
        batch_id: BatchId,
        blocks: Arc<Vec<SignedBlock>>,
    },
    /// The chain was removed: abort its outstanding requests.
    CancelChain {
        chain_id: ChainId,
        chain_type: SyncChainType,
        reason: RemovalReason,
    },
    /// Penalize a peer.
    ReportPeer { peer_id: PeerId, fault: PeerFault },
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncAction::RequestBlocks {
                chain_id,
                batch_id,
                peer_id,
                range,
                ..
            } => write!(
                f,
                "RequestBlocks(chain={chain_id}, batch={batch_id}, range={range}, peer={peer_id})"
            ),
            SyncAction::ProcessBatch {
                chain_id,
                batch_id,
                blocks,
            } => write!(
                f,
                "ProcessBatch(chain={chain_id}, batch={batch_id}, blocks={})",
                blocks.len()
            ),
            SyncAction::CancelChain {
                chain_id,
                chain_type,
                reason,
            } => write!(
                f,
                "CancelChain(chain={chain_id}, kind={}, reason={})",
                chain_type.as_str(),
                reason.as_str()
            ),
            SyncAction::ReportPeer { peer_id, fault } => {
                write!(f, "ReportPeer(peer={peer_id}, fault={})", fault.as_str())
            }
        }
    }
}
