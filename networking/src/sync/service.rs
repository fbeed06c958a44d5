use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use containers::{Checkpoint, HeadInfo, SignedBlock, Status};
use libp2p_identity::PeerId;
use metrics::Metrics;
use parking_lot::RwLock;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
/// Sync service driving the range sync engine.
///
/// The service is an actor: a single task owns the [`RangeSync`] engine and
/// receives [`SyncMessage`]s over a channel. Block range requests and batch
/// processing run as spawned tasks whose results are posted back to the same
/// channel, so the engine only ever sees one event at a time.
use tracing::{debug, info, warn};

use super::{
    actions::{PeerFault, SyncAction},
    batch::{BatchId, RequestId, SlotRange},
    chain::ChainId,
    config::{SYNC_CHANNEL_CAPACITY, SyncConfig},
    error::{NetworkError, ProcessingError},
    range_sync::RangeSync,
    states::{SyncState, SyncStatus},
};

/// Network side of range sync: fetches blocks by slot range from a peer.
#[async_trait]
pub trait BlockRangeRequester: Send + Sync {
    /// Blocks of `range` known to the peer, in ascending slot order. Empty
    /// slots are simply missing from the response.
    async fn request_blocks_by_range(
        &self,
        peer_id: PeerId,
        range: SlotRange,
    ) -> Result<Vec<SignedBlock>, NetworkError>;
}

/// Block import pipeline.
#[async_trait]
pub trait BlockProcessor: Send + Sync {
    /// Imports the blocks of one batch in order. Blocks already known must be
    /// accepted.
    async fn process_blocks(&self, blocks: Arc<Vec<SignedBlock>>) -> Result<(), ProcessingError>;
}

/// Read access to local chain progress.
pub trait ChainStore: Send + Sync {
    fn finalized_checkpoint(&self) -> Checkpoint;
    fn head(&self) -> HeadInfo;
}

/// Peer scoring collaborator.
pub trait PeerReporter: Send + Sync {
    fn report_peer(&self, peer_id: &PeerId, fault: PeerFault) {
        debug!(peer = %peer_id, fault = fault.as_str(), "Peer reported");
    }
}

/// Reporter that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPeerReporter;

impl PeerReporter for NoopPeerReporter {}

/// Events consumed by the sync service.
#[derive(Debug)]
pub enum SyncMessage {
    PeerConnected {
        peer_id: PeerId,
        status: Status,
    },
    PeerStatus {
        peer_id: PeerId,
        status: Status,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
    BatchDownloaded {
        chain_id: ChainId,
        batch_id: BatchId,
        request_id: RequestId,
        result: Result<Vec<SignedBlock>, NetworkError>,
    },
    BatchProcessed {
        chain_id: ChainId,
        batch_id: BatchId,
        result: Result<(), ProcessingError>,
        elapsed: Duration,
    },
    Shutdown,
}

/// Shared read handle on the current sync status.
#[derive(Debug, Clone, Default)]
pub struct SyncStatusHandle {
    inner: Arc<RwLock<SyncStatus>>,
}

impl SyncStatusHandle {
    pub fn status(&self) -> SyncStatus {
        *self.inner.read()
    }

    pub fn is_synced(&self) -> bool {
        self.inner.read().is_synced()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.read().is_syncing()
    }

    fn set(&self, status: SyncStatus) {
        *self.inner.write() = status;
    }
}

pub struct SyncService {
    engine: RangeSync,
    network: Arc<dyn BlockRangeRequester>,
    processor: Arc<dyn BlockProcessor>,
    store: Arc<dyn ChainStore>,
    reporter: Arc<dyn PeerReporter>,
    sender: mpsc::Sender<SyncMessage>,
    receiver: mpsc::Receiver<SyncMessage>,
    /// Outstanding downloads per chain, aborted when the chain is removed.
    downloads: HashMap<ChainId, Vec<JoinHandle<()>>>,
    status: SyncStatusHandle,
    metrics: Option<Arc<Metrics>>,
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        network: Arc<dyn BlockRangeRequester>,
        processor: Arc<dyn BlockProcessor>,
        store: Arc<dyn ChainStore>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(SYNC_CHANNEL_CAPACITY);
        let engine = RangeSync::new(config, store.finalized_checkpoint(), store.head());

        let service = Self {
            engine,
            network,
            processor,
            store,
            reporter: Arc::new(NoopPeerReporter),
            sender,
            receiver,
            downloads: HashMap::new(),
            status: SyncStatusHandle::default(),
            metrics: None,
        };
        service.publish_status();
        service
    }

    pub fn with_peer_reporter(mut self, reporter: Arc<dyn PeerReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self.publish_status();
        self
    }

    /// Sender for peer events. Dropping every clone does not stop the service;
    /// send [`SyncMessage::Shutdown`] instead.
    pub fn sender(&self) -> mpsc::Sender<SyncMessage> {
        self.sender.clone()
    }

    pub fn status_handle(&self) -> SyncStatusHandle {
        self.status.clone()
    }

    pub fn engine(&self) -> &RangeSync {
        &self.engine
    }

    pub async fn run(mut self) -> Result<()> {
        info!(
            finalized_epoch = self.engine.local_chain().finalized.epoch.0,
            head_slot = self.engine.local_chain().head.slot.0,
            "Sync service started"
        );

        while let Some(message) = self.receiver.recv().await {
            if matches!(message, SyncMessage::Shutdown) {
                break;
            }
            self.handle_message(message);
        }

        for handle in self.downloads.drain().flat_map(|(_, handles)| handles) {
            handle.abort();
        }
        info!(state = %self.engine.state(), "Sync service stopped");
        Ok(())
    }

    /// Feeds one event into the engine and executes the resulting actions.
    pub fn handle_message(&mut self, message: SyncMessage) {
        let actions = match message {
            SyncMessage::PeerConnected { peer_id, status } => {
                self.engine.on_peer_connected(peer_id, status)
            }
            SyncMessage::PeerStatus { peer_id, status } => {
                self.engine.on_peer_status_updated(peer_id, status)
            }
            SyncMessage::PeerDisconnected { peer_id } => self.engine.on_peer_disconnected(&peer_id),
            SyncMessage::BatchDownloaded {
                chain_id,
                batch_id,
                request_id,
                result,
            } => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_batch_download(if result.is_ok() { "success" } else { "failure" });
                }
                self.engine
                    .on_batch_downloaded(chain_id, batch_id, request_id, result)
            }
            SyncMessage::BatchProcessed {
                chain_id,
                batch_id,
                result,
                elapsed,
            } => {
                if let Some(metrics) = &self.metrics {
                    let outcome = if result.is_ok() { "success" } else { "failure" };
                    metrics.inc_batch_processing(outcome);
                    metrics.observe_batch_processing_time(elapsed.as_secs_f64());
                }
                let mut actions = self.engine.on_batch_processed(chain_id, batch_id, result);
                actions.extend(
                    self.engine
                        .update_local_chain(self.store.finalized_checkpoint(), self.store.head()),
                );
                actions
            }
            SyncMessage::Shutdown => Vec::new(),
        };

        self.execute(actions);
        self.publish_status();
    }

    fn execute(&mut self, actions: Vec<SyncAction>) {
        for action in actions {
            debug!(%action, "Executing sync action");
            match action {
                SyncAction::RequestBlocks {
                    chain_id,
                    batch_id,
                    request_id,
                    peer_id,
                    range,
                } => {
                    let network = self.network.clone();
                    let sender = self.sender.clone();
                    let handle = tokio::spawn(async move {
                        let result = network.request_blocks_by_range(peer_id, range).await;
                        let message = SyncMessage::BatchDownloaded {
                            chain_id,
                            batch_id,
                            request_id,
                            result,
                        };
                        if sender.send(message).await.is_err() {
                            debug!(
                                chain_id,
                                batch_id = batch_id.0,
                                "Sync service gone, dropping download"
                            );
                        }
                    });

                    let handles = self.downloads.entry(chain_id).or_default();
                    handles.retain(|handle| !handle.is_finished());
                    handles.push(handle);
                }
                SyncAction::ProcessBatch {
                    chain_id,
                    batch_id,
                    blocks,
                } => {
                    // processing is never aborted, the pipeline owns its writes
                    let processor = self.processor.clone();
                    let sender = self.sender.clone();
                    tokio::spawn(async move {
                        let started = Instant::now();
                        let result = processor.process_blocks(blocks).await;
                        let message = SyncMessage::BatchProcessed {
                            chain_id,
                            batch_id,
                            result,
                            elapsed: started.elapsed(),
                        };
                        if sender.send(message).await.is_err() {
                            debug!(
                                chain_id,
                                batch_id = batch_id.0,
                                "Sync service gone, dropping processing result"
                            );
                        }
                    });
                }
                SyncAction::CancelChain {
                    chain_id,
                    chain_type,
                    reason,
                } => {
                    if let Some(handles) = self.downloads.remove(&chain_id) {
                        for handle in handles {
                            handle.abort();
                        }
                    }
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_chain_removed(chain_type.as_str(), reason.as_str());
                    }
                }
                SyncAction::ReportPeer { peer_id, fault } => {
                    warn!(peer = %peer_id, fault = fault.as_str(), "Reporting peer");
                    self.reporter.report_peer(&peer_id, fault);
                }
            }
        }
    }

    fn publish_status(&self) {
        let status = self.engine.sync_status();

        if let Some(metrics) = &self.metrics {
            let local = self.engine.local_chain();
            metrics.set_peers(self.engine.peers().peer_count().connected as i64);
            let all_states = SyncState::ALL.map(|state| state.as_str());
            metrics.set_sync_state(status.state.as_str(), &all_states);
            metrics.set_local_head_slot(local.head.slot.0 as i64);
            metrics.set_local_finalized_epoch(local.finalized.epoch.0 as i64);
            for (kind, count) in self.engine.chain_counts() {
                metrics.set_sync_chains(kind.as_str(), count as i64);
            }
        }

        self.status.set(status);
    }
}
