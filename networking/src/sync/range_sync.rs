//! Range sync engine.
//!
//! Owns at most one finalized chain and a bounded set of head chains, routes
//! peer and batch events to them and derives the node's [`SyncState`]. The
//! engine performs no I/O: every entry point returns the [`SyncAction`]s the
//! caller has to execute.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    time::Instant,
};

use containers::{Bytes32, Checkpoint, HeadInfo, SignedBlock, Status};
use libp2p_identity::PeerId;
use tracing::{debug, info, warn};

use super::{
    actions::{PeerFault, RemovalReason, SyncAction},
    batch::{BatchId, RequestId},
    chain::{ChainId, ChainOutcome, SyncChainType, SyncTarget, SyncingChain},
    config::SyncConfig,
    error::{NetworkError, ProcessingError, SyncError},
    peer_manager::{PeerManager, SyncPeer, TargetCandidate},
    states::{SyncState, SyncStatus},
};

/// Local chain progress as last reported by the store or advanced by
/// completed chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalChainInfo {
    pub finalized: Checkpoint,
    pub head: HeadInfo,
}

pub struct RangeSync {
    config: SyncConfig,
    local: LocalChainInfo,
    peers: PeerManager,
    finalized_chain: Option<SyncingChain>,
    head_chains: BTreeMap<ChainId, SyncingChain>,
    /// Roots of recently faulted targets and when they failed.
    failed_targets: HashMap<Bytes32, Instant>,
    state: SyncState,
    next_chain_id: ChainId,
}

impl RangeSync {
    pub fn new(config: SyncConfig, finalized: Checkpoint, head: HeadInfo) -> Self {
        Self {
            config,
            local: LocalChainInfo { finalized, head },
            peers: PeerManager::new(),
            finalized_chain: None,
            head_chains: BTreeMap::new(),
            failed_targets: HashMap::new(),
            state: SyncState::default(),
            next_chain_id: 0,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn local_chain(&self) -> LocalChainInfo {
        self.local
    }

    pub fn peers(&self) -> &PeerManager {
        &self.peers
    }

    pub fn finalized_chain(&self) -> Option<&SyncingChain> {
        self.finalized_chain.as_ref()
    }

    pub fn head_chains(&self) -> impl Iterator<Item = &SyncingChain> {
        self.head_chains.values()
    }

    pub fn chain(&self, chain_id: ChainId) -> Option<&SyncingChain> {
        match &self.finalized_chain {
            Some(chain) if chain.id() == chain_id => Some(chain),
            _ => self.head_chains.get(&chain_id),
        }
    }

    pub fn is_failed_target(&self, root: &Bytes32) -> bool {
        self.failed_targets.contains_key(root)
    }

    pub fn sync_status(&self) -> SyncStatus {
        let local_head = self.local.head.slot;
        let network_head = self.peers.best_head_slot().unwrap_or(local_head);
        SyncStatus::new(self.state, local_head, network_head)
    }

    pub fn is_synced(&self) -> bool {
        self.state.is_synced()
    }

    pub fn is_syncing(&self) -> bool {
        self.state.is_syncing()
    }

    pub fn on_peer_connected(&mut self, peer_id: PeerId, status: Status) -> Vec<SyncAction> {
        info!(
            peer = %peer_id,
            finalized_epoch = status.finalized.epoch.0,
            head_slot = status.head.slot.0,
            "Peer connected"
        );
        self.peers.on_connect(peer_id, status);

        let mut actions = Vec::new();
        self.update(&mut actions);
        actions
    }

    pub fn on_peer_status_updated(&mut self, peer_id: PeerId, status: Status) -> Vec<SyncAction> {
        let previous = self.peers.on_status_update(peer_id, status);
        if previous == Some(status) {
            return Vec::new();
        }
        debug!(
            peer = %peer_id,
            finalized_epoch = status.finalized.epoch.0,
            head_slot = status.head.slot.0,
            "Peer status updated"
        );

        let mut actions = Vec::new();
        self.update(&mut actions);
        actions
    }

    pub fn on_peer_disconnected(&mut self, peer_id: &PeerId) -> Vec<SyncAction> {
        if self.peers.on_disconnect(peer_id).is_none() {
            return Vec::new();
        }
        info!(peer = %peer_id, "Peer disconnected");

        let mut actions = Vec::new();
        self.update(&mut actions);
        actions
    }

    /// Result of a [`SyncAction::RequestBlocks`].
    pub fn on_batch_downloaded(
        &mut self,
        chain_id: ChainId,
        batch_id: BatchId,
        request_id: RequestId,
        result: Result<Vec<SignedBlock>, NetworkError>,
    ) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        let outcome = match self.chain_and_pool(chain_id) {
            Some((chain, pool)) => {
                chain.on_block_response(batch_id, request_id, result, pool, &mut actions)
            }
            None => Err(SyncError::UnknownChain(chain_id)),
        };
        self.on_chain_outcome(chain_id, outcome, &mut actions);
        self.update(&mut actions);
        actions
    }

    /// Result of a [`SyncAction::ProcessBatch`].
    pub fn on_batch_processed(
        &mut self,
        chain_id: ChainId,
        batch_id: BatchId,
        result: Result<(), ProcessingError>,
    ) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        let outcome = match self.chain_and_pool(chain_id) {
            Some((chain, pool)) => chain.on_processing_result(batch_id, result, pool, &mut actions),
            None => Err(SyncError::UnknownChain(chain_id)),
        };
        self.on_chain_outcome(chain_id, outcome, &mut actions);
        self.update(&mut actions);
        actions
    }

    /// Refreshes local progress from the store. Never moves backwards.
    pub fn update_local_chain(&mut self, finalized: Checkpoint, head: HeadInfo) -> Vec<SyncAction> {
        if finalized.epoch > self.local.finalized.epoch {
            self.local.finalized = finalized;
        }
        if head.slot > self.local.head.slot {
            self.local.head = head;
        }

        let mut actions = Vec::new();
        self.update(&mut actions);
        actions
    }

    fn chain_and_pool(
        &mut self,
        chain_id: ChainId,
    ) -> Option<(&mut SyncingChain, &mut PeerManager)> {
        let chain = match &mut self.finalized_chain {
            Some(chain) if chain.id() == chain_id => Some(chain),
            _ => self.head_chains.get_mut(&chain_id),
        }?;
        Some((chain, &mut self.peers))
    }

    fn on_chain_outcome(
        &mut self,
        chain_id: ChainId,
        outcome: Result<ChainOutcome, SyncError>,
        actions: &mut Vec<SyncAction>,
    ) {
        match outcome {
            Ok(ChainOutcome::Continue) => {}
            Ok(ChainOutcome::Complete) => self.on_chain_complete(chain_id, actions),
            Ok(ChainOutcome::Faulty { batch_id }) => {
                self.on_chain_faulty(chain_id, batch_id, actions)
            }
            // results of removed chains keep arriving until their tasks are aborted
            Err(SyncError::UnknownChain(id)) if id < self.next_chain_id => {
                debug!(chain_id = id, "Dropping event for removed chain");
            }
            Err(err) => warn!(error = %err, "Dropping sync event"),
        }
    }

    fn on_chain_complete(&mut self, chain_id: ChainId, actions: &mut Vec<SyncAction>) {
        let Some(chain) = self.remove_chain(chain_id, RemovalReason::Completed, actions) else {
            return;
        };

        let target = *chain.target();
        let reached = chain
            .processed_head()
            .unwrap_or_else(|| HeadInfo::new(target.slot(), target.root()));

        if let SyncTarget::Finalized(checkpoint) = target {
            if checkpoint.epoch > self.local.finalized.epoch {
                self.local.finalized = checkpoint;
            }
        }
        if reached.slot > self.local.head.slot {
            self.local.head = reached;
        }

        info!(
            chain_id,
            target = %target,
            finalized_epoch = self.local.finalized.epoch.0,
            head_slot = self.local.head.slot.0,
            "Local chain advanced"
        );
    }

    fn on_chain_faulty(
        &mut self,
        chain_id: ChainId,
        batch_id: BatchId,
        actions: &mut Vec<SyncAction>,
    ) {
        let Some(chain) = self.remove_chain(chain_id, RemovalReason::Faulty, actions) else {
            return;
        };

        let root = chain.target().root();
        self.failed_targets.insert(root, Instant::now());
        warn!(
            chain_id,
            batch_id = batch_id.0,
            target = %chain.target(),
            peers = chain.peer_count(),
            "Chain failed, ignoring its target"
        );

        actions.extend(chain.peers().map(|peer_id| SyncAction::ReportPeer {
            peer_id: *peer_id,
            fault: PeerFault::FaultyChain,
        }));
    }

    /// Detaches a chain, releases its in-flight requests and asks the caller
    /// to cancel them.
    fn remove_chain(
        &mut self,
        chain_id: ChainId,
        reason: RemovalReason,
        actions: &mut Vec<SyncAction>,
    ) -> Option<SyncingChain> {
        let chain = match self.finalized_chain.take_if(|chain| chain.id() == chain_id) {
            Some(chain) => chain,
            None => self.head_chains.remove(&chain_id)?,
        };

        for peer_id in chain.downloading_peers() {
            self.peers.on_request_complete(&peer_id);
        }

        info!(
            chain_id,
            kind = chain.chain_type().as_str(),
            target = %chain.target(),
            reason = reason.as_str(),
            "Removing chain"
        );
        actions.push(SyncAction::CancelChain {
            chain_id,
            chain_type: chain.chain_type(),
            reason,
        });
        Some(chain)
    }

    fn create_chain(&mut self, target: SyncTarget, peers: &[PeerId]) -> Option<SyncingChain> {
        let start_slot = self.local.finalized.epoch.start_slot();
        if start_slot > target.slot() {
            debug!(
                target = %target,
                start_slot = start_slot.0,
                "Target behind local finalized slot"
            );
            return None;
        }

        let id = self.next_chain_id;
        self.next_chain_id += 1;

        let mut chain = SyncingChain::new(id, target, start_slot, self.config.clone());
        for peer_id in peers {
            chain.add_peer(*peer_id);
        }

        info!(
            chain_id = id,
            kind = target.chain_type().as_str(),
            target = %target,
            start_slot = start_slot.0,
            peers = peers.len(),
            "New syncing chain"
        );
        Some(chain)
    }

    /// Connected peers with a status whose targets have not failed recently.
    fn has_useful_peers(&self) -> bool {
        self.peers
            .peers_with_status()
            .any(|(_, status)| !self.is_ignored_status(status))
    }

    fn is_ignored_status(&self, status: &Status) -> bool {
        self.is_failed_target(&status.finalized.root) || self.is_failed_target(&status.head.root)
    }

    fn purge_failed_targets(&mut self, now: Instant) {
        let ttl = self.config.failed_chain_ttl();
        self.failed_targets.retain(|root, failed_at| {
            let keep = now.saturating_duration_since(*failed_at) < ttl;
            if !keep {
                debug!(root = %root, "Forgetting failed target");
            }
            keep
        });
    }

    /// Re-evaluates chains and the sync state. Runs after every event.
    fn update(&mut self, actions: &mut Vec<SyncAction>) {
        self.purge_failed_targets(Instant::now());
        self.update_finalized_chain(actions);

        if let Some(chain) = self.finalized_chain.as_mut() {
            // paused head chains still release departed peers and their requests
            for head_chain in self.head_chains.values_mut() {
                if let SyncTarget::Head(target) = *head_chain.target() {
                    refresh_chain_peers(head_chain, &mut self.peers, |peer| {
                        peer.supports_head(&target)
                    });
                }
                head_chain.stop_syncing();
            }
            chain.start_syncing(&mut self.peers, actions);
        } else {
            self.update_head_chains(actions);
        }

        self.update_state();
    }

    fn update_finalized_chain(&mut self, actions: &mut Vec<SyncAction>) {
        let local_epoch = self.local.finalized.epoch;

        if let Some(chain) = &self.finalized_chain {
            if let SyncTarget::Finalized(target) = chain.target() {
                if target.epoch <= local_epoch {
                    let chain_id = chain.id();
                    self.remove_chain(chain_id, RemovalReason::Obsolete, actions);
                }
            }
        }

        if let Some(chain) = self.finalized_chain.as_mut() {
            if let SyncTarget::Finalized(target) = *chain.target() {
                refresh_chain_peers(chain, &mut self.peers, |peer| {
                    peer.supports_finalized(local_epoch, &target)
                });
            }
        }

        let useful_peers = self.has_useful_peers();
        if let Some(chain) = &self.finalized_chain {
            if chain.peer_count() == 0 && useful_peers {
                let chain_id = chain.id();
                self.remove_chain(chain_id, RemovalReason::Peerless, actions);
            }
        }

        let Some(best) = self
            .peers
            .finalized_candidates(local_epoch, |root| self.is_failed_target(root))
            .into_iter()
            .next()
        else {
            return;
        };

        if let Some(current) = &self.finalized_chain {
            if current.target().root() == best.target.root {
                return;
            }
            if !self.should_replace(current, &best) {
                debug!(
                    current = %current.target(),
                    candidate_epoch = best.target.epoch.0,
                    candidate_peers = best.peers.len(),
                    "Keeping current finalized chain"
                );
                return;
            }
            let chain_id = current.id();
            self.remove_chain(chain_id, RemovalReason::Replaced, actions);
        }

        let target = SyncTarget::Finalized(best.target);
        if let Some(mut chain) = self.create_chain(target, &best.peers) {
            refresh_chain_peers(&mut chain, &mut self.peers, |peer| {
                peer.supports_finalized(local_epoch, &best.target)
            });
            self.finalized_chain = Some(chain);
        }
    }

    /// A finalized chain gives way only to a target backed by more peers, and
    /// only while it has no validated work or when the new target is far
    /// enough ahead.
    fn should_replace(&self, current: &SyncingChain, best: &TargetCandidate<Checkpoint>) -> bool {
        if best.peers.len() <= current.peer_count() {
            return false;
        }
        let SyncTarget::Finalized(current_target) = current.target() else {
            return true;
        };
        current.validated_epochs() == 0
            || best.target.epoch
                >= current_target.epoch + self.config.min_finalized_chain_validated_epochs
    }

    fn update_head_chains(&mut self, actions: &mut Vec<SyncAction>) {
        let local_head = self.local.head;
        let useful_peers = self.has_useful_peers();

        let mut removals = Vec::new();
        for (chain_id, chain) in &mut self.head_chains {
            let SyncTarget::Head(target) = *chain.target() else {
                continue;
            };
            refresh_chain_peers(chain, &mut self.peers, |peer| peer.supports_head(&target));

            if target.slot <= local_head.slot || target.root == local_head.root {
                removals.push((*chain_id, RemovalReason::Obsolete));
            } else if chain.peer_count() == 0 && useful_peers {
                removals.push((*chain_id, RemovalReason::Peerless));
            }
        }
        for (chain_id, reason) in removals {
            self.remove_chain(chain_id, reason, actions);
        }

        let capacity = self
            .config
            .parallel_head_chains
            .saturating_sub(self.head_chains.len());
        if capacity > 0 {
            let served: HashSet<Bytes32> = self
                .head_chains
                .values()
                .map(|chain| chain.target().root())
                .collect();
            let candidates = self.peers.head_candidates(&local_head, |_, status| {
                served.contains(&status.head.root) || self.is_ignored_status(status)
            });

            for candidate in candidates.into_iter().take(capacity) {
                let target = SyncTarget::Head(candidate.target);
                if let Some(chain) = self.create_chain(target, &candidate.peers) {
                    self.head_chains.insert(chain.id(), chain);
                }
            }
        }

        for chain in self.head_chains.values_mut() {
            chain.start_syncing(&mut self.peers, actions);
        }
    }

    fn update_state(&mut self) {
        let next = if !self.has_useful_peers() {
            SyncState::Stalled
        } else if self.finalized_chain.is_some() {
            SyncState::SyncingFinalized
        } else if !self.head_chains.is_empty() {
            SyncState::SyncingHead
        } else {
            SyncState::Synced
        };

        if next != self.state {
            info!(
                from = %self.state,
                to = %next,
                local_head = self.local.head.slot.0,
                local_finalized = self.local.finalized.epoch.0,
                head_chains = self.head_chains.len(),
                "Sync state changed"
            );
            self.state = next;
        }
    }

    /// Number of chains of each kind.
    pub fn chain_counts(&self) -> [(SyncChainType, usize); 2] {
        [
            (SyncChainType::Finalized, usize::from(self.finalized_chain.is_some())),
            (SyncChainType::Head, self.head_chains.len()),
        ]
    }
}

/// Drops chain peers that no longer support the target and adds the pool
/// peers that do. Requests in flight to a dropped peer are released.
fn refresh_chain_peers(
    chain: &mut SyncingChain,
    pool: &mut PeerManager,
    supports: impl Fn(&SyncPeer) -> bool,
) {
    let leaving: Vec<PeerId> = chain
        .peers()
        .filter(|peer_id| !pool.get_peer(peer_id).is_some_and(&supports))
        .copied()
        .collect();
    for peer_id in leaving {
        let requeued = chain.remove_peer(&peer_id);
        for _ in 0..requeued {
            pool.on_request_complete(&peer_id);
        }
    }

    let joining: Vec<PeerId> = pool
        .get_all_peers()
        .filter(|peer| !chain.has_peer(&peer.peer_id) && supports(*peer))
        .map(|peer| peer.peer_id)
        .collect();
    for peer_id in joining {
        chain.add_peer(peer_id);
    }
}
