//! A syncing chain pursues one sync target with the peers that advertise it.
//!
//! The chain splits `[start_slot, target_slot]` into batches, downloads up to
//! `batch_buffer_size` of them at a time from its peers and hands them to the
//! processing pipeline strictly in slot order.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
};

use containers::{Bytes32, Checkpoint, HeadInfo, SignedBlock, Slot};
use libp2p_identity::PeerId;
use tracing::{debug, info, warn};

use super::{
    actions::{PeerFault, SyncAction},
    batch::{Batch, BatchId, BatchOperationOutcome, BatchState, RequestId, SlotRange},
    config::SyncConfig,
    error::{NetworkError, ProcessingError, SyncError},
    peer_manager::PeerManager,
};

/// Chain ids are allocated by the engine and never reused.
pub type ChainId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncChainType {
    Finalized,
    Head,
}

impl SyncChainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncChainType::Finalized => "finalized",
            SyncChainType::Head => "head",
        }
    }
}

/// What a chain syncs towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTarget {
    /// A finalized checkpoint; the chain ends at the checkpoint's slot.
    Finalized(Checkpoint),
    /// A peer head block.
    Head(HeadInfo),
}

impl SyncTarget {
    pub fn chain_type(&self) -> SyncChainType {
        match self {
            SyncTarget::Finalized(_) => SyncChainType::Finalized,
            SyncTarget::Head(_) => SyncChainType::Head,
        }
    }

    /// Last slot the chain covers.
    pub fn slot(&self) -> Slot {
        match self {
            SyncTarget::Finalized(checkpoint) => checkpoint.slot(),
            SyncTarget::Head(head) => head.slot,
        }
    }

    pub fn root(&self) -> Bytes32 {
        match self {
            SyncTarget::Finalized(checkpoint) => checkpoint.root,
            SyncTarget::Head(head) => head.root,
        }
    }
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTarget::Finalized(checkpoint) => {
                write!(f, "finalized(epoch={}, root={})", checkpoint.epoch, checkpoint.root)
            }
            SyncTarget::Head(head) => write!(f, "head(slot={}, root={})", head.slot, head.root),
        }
    }
}

/// Result of feeding an event into a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    Continue,
    /// The processed cursor passed the target.
    Complete,
    /// A batch exhausted its attempts; the chain must be removed.
    Faulty { batch_id: BatchId },
}

#[derive(Debug, Clone)]
pub struct SyncingChain {
    id: ChainId,
    target: SyncTarget,
    start_slot: Slot,
    /// Exclusive end of the covered range: `target.slot() + 1`.
    end_slot: Slot,
    peers: HashSet<PeerId>,
    batches: BTreeMap<BatchId, Batch>,
    /// Start of the next batch to create.
    to_be_downloaded: Slot,
    /// Start of the next batch to process. Everything before it is done.
    processed_cursor: Slot,
    validated_epochs: u64,
    /// Last block processed by this chain.
    processed_head: Option<HeadInfo>,
    syncing: bool,
    next_request_id: RequestId,
    config: SyncConfig,
}

impl SyncingChain {
    pub fn new(id: ChainId, target: SyncTarget, start_slot: Slot, config: SyncConfig) -> Self {
        let end_slot = target.slot() + 1;
        debug_assert!(start_slot < end_slot, "chain must cover at least one slot");

        Self {
            id,
            target,
            start_slot,
            end_slot,
            peers: HashSet::new(),
            batches: BTreeMap::new(),
            to_be_downloaded: start_slot,
            processed_cursor: start_slot,
            validated_epochs: 0,
            processed_head: None,
            syncing: false,
            next_request_id: 0,
            config,
        }
    }

    pub fn id(&self) -> ChainId {
        self.id
    }

    pub fn target(&self) -> &SyncTarget {
        &self.target
    }

    pub fn chain_type(&self) -> SyncChainType {
        self.target.chain_type()
    }

    pub fn start_slot(&self) -> Slot {
        self.start_slot
    }

    pub fn end_slot(&self) -> Slot {
        self.end_slot
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.iter()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.contains(peer_id)
    }

    pub fn batches(&self) -> impl Iterator<Item = &Batch> {
        self.batches.values()
    }

    pub fn batch(&self, batch_id: &BatchId) -> Option<&Batch> {
        self.batches.get(batch_id)
    }

    pub fn processed_cursor(&self) -> Slot {
        self.processed_cursor
    }

    pub fn processed_head(&self) -> Option<HeadInfo> {
        self.processed_head
    }

    pub fn validated_epochs(&self) -> u64 {
        self.validated_epochs
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    pub fn is_complete(&self) -> bool {
        self.processed_cursor >= self.end_slot
    }

    /// Batches created but not processed yet.
    pub fn pending_batches(&self) -> usize {
        self.batches.values().filter(|batch| !batch.is_done()).count()
    }

    /// Peers with a request of this chain in flight, one entry per request.
    pub fn downloading_peers(&self) -> Vec<PeerId> {
        self.batches
            .values()
            .filter_map(|batch| match batch.state() {
                BatchState::Downloading { peer, .. } => Some(*peer),
                _ => None,
            })
            .collect()
    }

    pub fn add_peer(&mut self, peer_id: PeerId) -> bool {
        let added = self.peers.insert(peer_id);
        if added {
            debug!(chain_id = self.id, peer = %peer_id, "Peer added to chain");
        }
        added
    }

    /// Removes a peer and requeues the batches it was downloading without
    /// counting a failed attempt. Returns the number of requeued batches.
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> usize {
        if !self.peers.remove(peer_id) {
            return 0;
        }

        let requeued = self
            .batches
            .values_mut()
            .map(|batch| batch.requeue_download(peer_id))
            .filter(|requeued| *requeued)
            .count();

        debug!(
            chain_id = self.id,
            peer = %peer_id,
            requeued,
            remaining_peers = self.peers.len(),
            "Peer removed from chain"
        );

        if self.peers.is_empty() {
            info!(chain_id = self.id, target = %self.target, "Chain paused, no peers left");
        }

        requeued
    }

    pub fn start_syncing(&mut self, pool: &mut PeerManager, actions: &mut Vec<SyncAction>) {
        if !self.syncing {
            info!(
                chain_id = self.id,
                target = %self.target,
                start_slot = self.start_slot.0,
                peers = self.peers.len(),
                "Chain started syncing"
            );
            self.syncing = true;
        }
        self.advance(pool, actions);
    }

    /// Pauses the chain. Batches are kept; in-flight downloads may still
    /// complete but nothing new is started.
    pub fn stop_syncing(&mut self) {
        if self.syncing {
            debug!(chain_id = self.id, target = %self.target, "Chain stopped syncing");
            self.syncing = false;
        }
    }

    /// Sends requeued batches, creates new ones while the buffer allows and
    /// starts processing the next batch when ordering permits.
    pub fn advance(&mut self, pool: &mut PeerManager, actions: &mut Vec<SyncAction>) {
        if !self.syncing || self.is_complete() {
            return;
        }

        if !self.peers.is_empty() {
            let awaiting: Vec<BatchId> = self
                .batches
                .iter()
                .filter(|(_, batch)| matches!(batch.state(), BatchState::AwaitingDownload))
                .map(|(batch_id, _)| *batch_id)
                .collect();

            let mut peers_available = true;
            for batch_id in awaiting {
                if !self.send_batch(batch_id, pool, actions) {
                    peers_available = false;
                    break;
                }
            }

            while peers_available
                && self.to_be_downloaded < self.end_slot
                && self.pending_batches() < self.config.batch_buffer_size
            {
                let start = self.to_be_downloaded;
                let end = (start + self.config.batch_size()).min(self.end_slot);
                let batch = Batch::new(
                    SlotRange::new(start, end),
                    self.config.max_batch_download_attempts,
                    self.config.max_batch_processing_attempts,
                );
                self.batches.insert(start, batch);
                self.to_be_downloaded = end;
                peers_available = self.send_batch(start, pool, actions);
            }
        }

        self.try_process(actions);
    }

    /// Least loaded available chain peer, preferring peers that have not
    /// failed this batch before.
    fn select_peer(&self, failed: &HashSet<PeerId>, pool: &PeerManager) -> Option<PeerId> {
        self.peers
            .iter()
            .filter(|peer_id| {
                pool.get_peer(peer_id)
                    .is_some_and(|peer| peer.is_available())
            })
            .min_by_key(|peer_id| {
                (
                    failed.contains(*peer_id),
                    pool.requests_in_flight(peer_id),
                    **peer_id,
                )
            })
            .copied()
    }

    fn send_batch(
        &mut self,
        batch_id: BatchId,
        pool: &mut PeerManager,
        actions: &mut Vec<SyncAction>,
    ) -> bool {
        let Some(batch) = self.batches.get(&batch_id) else {
            return false;
        };
        let Some(peer_id) = self.select_peer(batch.failed_peers(), pool) else {
            debug!(chain_id = self.id, batch_id = batch_id.0, "No available peer for batch");
            return false;
        };

        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let Some(batch) = self.batches.get_mut(&batch_id) else {
            return false;
        };
        if let Err(err) = batch.start_downloading(peer_id, request_id) {
            warn!(chain_id = self.id, error = %err, "Could not start batch download");
            return false;
        }

        pool.on_request_start(&peer_id);
        debug!(
            chain_id = self.id,
            batch_id = batch_id.0,
            range = %batch.range(),
            peer = %peer_id,
            attempt = batch.download_attempts() + 1,
            "Requesting batch"
        );
        actions.push(SyncAction::RequestBlocks {
            chain_id: self.id,
            batch_id,
            request_id,
            peer_id,
            range: batch.range(),
        });
        true
    }

    fn try_process(&mut self, actions: &mut Vec<SyncAction>) {
        let processing = self
            .batches
            .values()
            .any(|batch| matches!(batch.state(), BatchState::Processing { .. }));
        if processing {
            return;
        }

        let batch_id = self.processed_cursor;
        let Some(batch) = self.batches.get_mut(&batch_id) else {
            return;
        };
        if !matches!(batch.state(), BatchState::AwaitingProcessing { .. }) {
            return;
        }

        match batch.start_processing() {
            Ok(blocks) => {
                debug!(
                    chain_id = self.id,
                    batch_id = batch_id.0,
                    blocks = blocks.len(),
                    "Processing batch"
                );
                actions.push(SyncAction::ProcessBatch {
                    chain_id: self.id,
                    batch_id,
                    blocks,
                });
            }
            Err(err) => warn!(chain_id = self.id, error = %err, "Could not start batch processing"),
        }
    }

    /// Handles the result of a block range request.
    pub fn on_block_response(
        &mut self,
        batch_id: BatchId,
        request_id: RequestId,
        result: Result<Vec<SignedBlock>, NetworkError>,
        pool: &mut PeerManager,
        actions: &mut Vec<SyncAction>,
    ) -> Result<ChainOutcome, SyncError> {
        let chain_id = self.id;
        let batch = self
            .batches
            .get_mut(&batch_id)
            .ok_or(SyncError::UnknownBatch { chain_id, batch_id })?;

        let Some(peer_id) = batch.downloading_peer(request_id) else {
            debug!(
                chain_id,
                batch_id = batch_id.0,
                request_id,
                state = batch.state().name(),
                "Ignoring stale block response"
            );
            return Ok(ChainOutcome::Continue);
        };
        pool.on_request_complete(&peer_id);

        let failure = match result {
            Ok(blocks) => match batch.validate_response(&blocks) {
                Ok(()) => {
                    let count = blocks.len();
                    match batch.on_download_success(request_id, blocks) {
                        Ok(()) => {
                            debug!(
                                chain_id,
                                batch_id = batch_id.0,
                                blocks = count,
                                peer = %peer_id,
                                "Batch downloaded"
                            );
                            None
                        }
                        Err(err) => Some(err.to_string()),
                    }
                }
                Err(err) => {
                    warn!(
                        chain_id,
                        batch_id = batch_id.0,
                        peer = %peer_id,
                        error = %err,
                        "Invalid block range response"
                    );
                    actions.push(SyncAction::ReportPeer {
                        peer_id,
                        fault: PeerFault::InvalidResponse,
                    });
                    Some(err.to_string())
                }
            },
            Err(err) => Some(err.to_string()),
        };

        if let Some(reason) = failure {
            match batch.on_download_failure(request_id) {
                Ok(BatchOperationOutcome::Failed) => {
                    warn!(
                        chain_id,
                        batch_id = batch_id.0,
                        attempts = batch.download_attempts(),
                        %reason,
                        "Batch download attempts exhausted"
                    );
                    return Ok(ChainOutcome::Faulty { batch_id });
                }
                Ok(BatchOperationOutcome::Continue) => debug!(
                    chain_id,
                    batch_id = batch_id.0,
                    peer = %peer_id,
                    attempts = batch.download_attempts(),
                    %reason,
                    "Batch download failed, retrying"
                ),
                Err(err) => warn!(chain_id, error = %err, "Could not record download failure"),
            }
        }

        self.advance(pool, actions);
        Ok(ChainOutcome::Continue)
    }

    /// Handles the result of processing a batch.
    pub fn on_processing_result(
        &mut self,
        batch_id: BatchId,
        result: Result<(), ProcessingError>,
        pool: &mut PeerManager,
        actions: &mut Vec<SyncAction>,
    ) -> Result<ChainOutcome, SyncError> {
        let chain_id = self.id;
        let batch = self
            .batches
            .get_mut(&batch_id)
            .ok_or(SyncError::UnknownBatch { chain_id, batch_id })?;

        let last_block = match batch.state() {
            BatchState::Processing { blocks, .. } => blocks
                .last()
                .map(|block| HeadInfo::new(block.slot(), block.root())),
            state => {
                debug!(
                    chain_id,
                    batch_id = batch_id.0,
                    state = state.name(),
                    "Ignoring stale processing result"
                );
                return Ok(ChainOutcome::Continue);
            }
        };

        match result {
            Ok(()) => {
                if let Err(err) = batch.on_processing_success() {
                    warn!(chain_id, error = %err, "Could not record processing success");
                    return Ok(ChainOutcome::Continue);
                }
                let range = batch.range();
                if last_block.is_some() {
                    self.processed_head = last_block;
                }
                self.on_batch_done(range);

                if self.is_complete() {
                    info!(
                        chain_id,
                        target = %self.target,
                        validated_epochs = self.validated_epochs,
                        "Chain completed"
                    );
                    return Ok(ChainOutcome::Complete);
                }
            }
            Err(err) => {
                let peer = batch.peer();
                let blame_peer = err.blames_peer();
                let failed_slot = err.failed_slot().map(|slot| slot.0);
                let outcome = match batch.on_processing_failure(blame_peer) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!(chain_id, error = %err, "Could not record processing failure");
                        return Ok(ChainOutcome::Continue);
                    }
                };

                if let (true, Some(peer_id)) = (blame_peer, peer) {
                    actions.push(SyncAction::ReportPeer {
                        peer_id,
                        fault: PeerFault::InvalidBlocks,
                    });
                }

                if outcome == BatchOperationOutcome::Failed {
                    warn!(
                        chain_id,
                        batch_id = batch_id.0,
                        attempts = batch.processing_attempts(),
                        ?failed_slot,
                        error = %err,
                        "Batch processing attempts exhausted"
                    );
                    return Ok(ChainOutcome::Faulty { batch_id });
                }

                debug!(
                    chain_id,
                    batch_id = batch_id.0,
                    attempts = batch.processing_attempts(),
                    redownload = blame_peer,
                    ?failed_slot,
                    error = %err,
                    "Batch processing failed, retrying"
                );
            }
        }

        self.advance(pool, actions);
        Ok(ChainOutcome::Continue)
    }

    fn on_batch_done(&mut self, range: SlotRange) {
        let previous = self.processed_cursor;
        self.processed_cursor = range.end;

        if self.chain_type() == SyncChainType::Finalized {
            self.validated_epochs += range.end.epoch().0.saturating_sub(previous.epoch().0);
        }

        debug!(
            chain_id = self.id,
            processed_cursor = self.processed_cursor.0,
            validated_epochs = self.validated_epochs,
            "Batch processed"
        );
    }
}
