//! A batch is a contiguous slot range downloaded from one peer and processed
//! as a unit. It is the unit of retry of range sync.

use std::{collections::HashSet, fmt, sync::Arc};

use containers::{SignedBlock, Slot};
use libp2p_identity::PeerId;
use thiserror::Error;

/// Batches are identified by the first slot they cover.
pub type BatchId = Slot;

/// Identifier of one download attempt, used to discard stale responses.
pub type RequestId = u64;

/// Half-open slot range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotRange {
    pub start: Slot,
    pub end: Slot,
}

impl SlotRange {
    pub fn new(start: Slot, end: Slot) -> Self {
        debug_assert!(end > start, "slot range must not be empty");
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, slot: Slot) -> bool {
        self.start <= slot && slot < self.end
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start.0, self.end.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch {batch_id} in state {actual} cannot {operation}")]
    WrongState {
        batch_id: BatchId,
        operation: &'static str,
        actual: &'static str,
    },
    #[error("batch {batch_id} received response for stale request {request_id}")]
    StaleRequest {
        batch_id: BatchId,
        request_id: RequestId,
    },
}

/// Reasons a downloaded response does not fit the batch it was requested for.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ResponseError {
    #[error("block at slot {slot} outside of requested range {range}")]
    OutOfRange { slot: Slot, range: SlotRange },
    #[error("block at slot {slot} does not follow previous block at slot {previous}")]
    NotAscending { slot: Slot, previous: Slot },
}

/// Whether a batch can still make progress after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOperationOutcome {
    Continue,
    Failed,
}

#[derive(Debug, Clone)]
pub enum BatchState {
    /// Waiting for a peer to download from.
    AwaitingDownload,
    /// A block range request is in flight.
    Downloading { peer: PeerId, request_id: RequestId },
    /// Downloaded, waiting for earlier batches to be processed.
    AwaitingProcessing {
        peer: PeerId,
        blocks: Arc<Vec<SignedBlock>>,
    },
    /// Handed to the processing pipeline.
    Processing {
        peer: PeerId,
        blocks: Arc<Vec<SignedBlock>>,
    },
    /// Processed successfully.
    Done,
    /// Exhausted its download or processing attempts.
    Faulty,
}

impl BatchState {
    pub fn name(&self) -> &'static str {
        match self {
            BatchState::AwaitingDownload => "awaiting_download",
            BatchState::Downloading { .. } => "downloading",
            BatchState::AwaitingProcessing { .. } => "awaiting_processing",
            BatchState::Processing { .. } => "processing",
            BatchState::Done => "done",
            BatchState::Faulty => "faulty",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Batch {
    id: BatchId,
    range: SlotRange,
    state: BatchState,
    download_attempts: u8,
    processing_attempts: u8,
    max_download_attempts: u8,
    max_processing_attempts: u8,
    /// Peers that failed to serve or served invalid blocks for this batch.
    failed_peers: HashSet<PeerId>,
}

impl Batch {
    pub fn new(range: SlotRange, max_download_attempts: u8, max_processing_attempts: u8) -> Self {
        Self {
            id: range.start,
            range,
            state: BatchState::AwaitingDownload,
            download_attempts: 0,
            processing_attempts: 0,
            max_download_attempts,
            max_processing_attempts,
            failed_peers: HashSet::new(),
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn range(&self) -> SlotRange {
        self.range
    }

    pub fn state(&self) -> &BatchState {
        &self.state
    }

    pub fn download_attempts(&self) -> u8 {
        self.download_attempts
    }

    pub fn processing_attempts(&self) -> u8 {
        self.processing_attempts
    }

    pub fn failed_peers(&self) -> &HashSet<PeerId> {
        &self.failed_peers
    }

    /// Peer currently responsible for the batch, if any.
    pub fn peer(&self) -> Option<PeerId> {
        match &self.state {
            BatchState::Downloading { peer, .. }
            | BatchState::AwaitingProcessing { peer, .. }
            | BatchState::Processing { peer, .. } => Some(*peer),
            _ => None,
        }
    }

    /// Downloading, downloaded or processing.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self.state,
            BatchState::Downloading { .. }
                | BatchState::AwaitingProcessing { .. }
                | BatchState::Processing { .. }
        )
    }

    pub fn is_downloading_from(&self, peer_id: &PeerId) -> bool {
        matches!(&self.state, BatchState::Downloading { peer, .. } if peer == peer_id)
    }

    /// Peer serving the in-flight request `request_id`, or `None` if that
    /// request is not the one the batch is waiting for.
    pub fn downloading_peer(&self, request_id: RequestId) -> Option<PeerId> {
        match &self.state {
            BatchState::Downloading {
                peer,
                request_id: expected,
            } if *expected == request_id => Some(*peer),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, BatchState::Done)
    }

    pub fn is_faulty(&self) -> bool {
        matches!(self.state, BatchState::Faulty)
    }

    fn wrong_state(&self, operation: &'static str) -> BatchError {
        BatchError::WrongState {
            batch_id: self.id,
            operation,
            actual: self.state.name(),
        }
    }

    /// Checks that a response only holds blocks of this batch, in ascending
    /// slot order. Parent chaining is left to the processing pipeline.
    pub fn validate_response(&self, blocks: &[SignedBlock]) -> Result<(), ResponseError> {
        let mut previous: Option<Slot> = None;
        for block in blocks {
            let slot = block.slot();
            if !self.range.contains(slot) {
                return Err(ResponseError::OutOfRange {
                    slot,
                    range: self.range,
                });
            }
            if let Some(previous) = previous {
                if slot <= previous {
                    return Err(ResponseError::NotAscending { slot, previous });
                }
            }
            previous = Some(slot);
        }
        Ok(())
    }

    pub fn start_downloading(
        &mut self,
        peer: PeerId,
        request_id: RequestId,
    ) -> Result<(), BatchError> {
        match self.state {
            BatchState::AwaitingDownload => {
                self.state = BatchState::Downloading { peer, request_id };
                Ok(())
            }
            _ => Err(self.wrong_state("start downloading")),
        }
    }

    fn check_request(
        &self,
        request_id: RequestId,
        operation: &'static str,
    ) -> Result<PeerId, BatchError> {
        match &self.state {
            BatchState::Downloading {
                peer,
                request_id: expected,
            } => {
                if *expected == request_id {
                    Ok(*peer)
                } else {
                    Err(BatchError::StaleRequest {
                        batch_id: self.id,
                        request_id,
                    })
                }
            }
            _ => Err(self.wrong_state(operation)),
        }
    }

    /// Stores the downloaded blocks. The response must have been checked with
    /// [`Batch::validate_response`].
    pub fn on_download_success(
        &mut self,
        request_id: RequestId,
        blocks: Vec<SignedBlock>,
    ) -> Result<(), BatchError> {
        let peer = self.check_request(request_id, "complete download")?;
        self.state = BatchState::AwaitingProcessing {
            peer,
            blocks: Arc::new(blocks),
        };
        Ok(())
    }

    /// Counts a failed download attempt.
    pub fn on_download_failure(
        &mut self,
        request_id: RequestId,
    ) -> Result<BatchOperationOutcome, BatchError> {
        let peer = self.check_request(request_id, "fail download")?;
        self.failed_peers.insert(peer);
        self.download_attempts = self.download_attempts.saturating_add(1);
        if self.download_attempts >= self.max_download_attempts {
            self.state = BatchState::Faulty;
            Ok(BatchOperationOutcome::Failed)
        } else {
            self.state = BatchState::AwaitingDownload;
            Ok(BatchOperationOutcome::Continue)
        }
    }

    /// The peer serving this batch went away. Not the batch's fault, so no
    /// attempt is counted. Returns whether the batch was requeued.
    pub fn requeue_download(&mut self, peer_id: &PeerId) -> bool {
        if self.is_downloading_from(peer_id) {
            self.state = BatchState::AwaitingDownload;
            true
        } else {
            false
        }
    }

    /// Moves the batch to processing and returns the blocks to hand over.
    pub fn start_processing(&mut self) -> Result<Arc<Vec<SignedBlock>>, BatchError> {
        match std::mem::replace(&mut self.state, BatchState::Faulty) {
            BatchState::AwaitingProcessing { peer, blocks } => {
                self.state = BatchState::Processing {
                    peer,
                    blocks: blocks.clone(),
                };
                Ok(blocks)
            }
            other => {
                self.state = other;
                Err(self.wrong_state("start processing"))
            }
        }
    }

    pub fn on_processing_success(&mut self) -> Result<(), BatchError> {
        match self.state {
            BatchState::Processing { .. } => {
                self.state = BatchState::Done;
                Ok(())
            }
            _ => Err(self.wrong_state("complete processing")),
        }
    }

    /// Counts a failed processing attempt.
    ///
    /// When the failure is attributable to the blocks the peer served, they
    /// are dropped and the batch is downloaded again from another peer.
    /// Otherwise the same blocks are processed again.
    pub fn on_processing_failure(
        &mut self,
        blame_peer: bool,
    ) -> Result<BatchOperationOutcome, BatchError> {
        let (peer, blocks) = match std::mem::replace(&mut self.state, BatchState::Faulty) {
            BatchState::Processing { peer, blocks } => (peer, blocks),
            other => {
                self.state = other;
                return Err(self.wrong_state("fail processing"));
            }
        };

        self.processing_attempts = self.processing_attempts.saturating_add(1);
        if self.processing_attempts >= self.max_processing_attempts {
            // state already Faulty
            return Ok(BatchOperationOutcome::Failed);
        }

        self.state = if blame_peer {
            self.failed_peers.insert(peer);
            BatchState::AwaitingDownload
        } else {
            BatchState::AwaitingProcessing { peer, blocks }
        };
        Ok(BatchOperationOutcome::Continue)
    }
}
