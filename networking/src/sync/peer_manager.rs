use super::config::MAX_CONCURRENT_REQUESTS;
use crate::types::PeerCount;
use containers::{Bytes32, Checkpoint, Epoch, HeadInfo, Slot, Status};
use libp2p_identity::PeerId;
/// Peer manager for sync operations.
///
/// Tracks peer chain status, groups peers by the targets they advertise and
/// tracks requests in flight per peer.
use std::collections::HashMap;

/// A connected peer as seen by range sync: its last status and requests in
/// flight. Records are dropped on disconnect.
#[derive(Debug, Clone)]
pub struct SyncPeer {
    pub peer_id: PeerId,
    pub status: Option<Status>,
    pub requests_in_flight: usize,
}

impl SyncPeer {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            status: None,
            requests_in_flight: 0,
        }
    }

    pub fn has_status(&self) -> bool {
        self.status.is_some()
    }

    /// Below [`MAX_CONCURRENT_REQUESTS`].
    pub fn is_available(&self) -> bool {
        self.requests_in_flight < MAX_CONCURRENT_REQUESTS
    }

    /// Whether the peer can serve a finalized chain towards `target`.
    ///
    /// The peer must have finalized past our local finalized epoch and either
    /// agree with the target checkpoint or have finalized beyond it.
    pub fn supports_finalized(&self, local_finalized: Epoch, target: &Checkpoint) -> bool {
        match &self.status {
            Some(status) => {
                status.finalized.epoch > local_finalized
                    && (status.finalized == *target || status.finalized.epoch > target.epoch)
            }
            None => false,
        }
    }

    /// Whether the peer advertises exactly `target` as its head.
    pub fn supports_head(&self, target: &HeadInfo) -> bool {
        self.status
            .is_some_and(|status| status.head.root == target.root)
    }

    pub fn on_request_start(&mut self) {
        self.requests_in_flight += 1;
    }

    pub fn on_request_complete(&mut self) {
        self.requests_in_flight = self.requests_in_flight.saturating_sub(1);
    }
}

/// A sync target advertised by a group of peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetCandidate<T> {
    pub target: T,
    pub peers: Vec<PeerId>,
}

/// Pool of peers known to range sync, keyed by peer id.
#[derive(Debug, Default, Clone)]
pub struct PeerManager {
    peers: HashMap<PeerId, SyncPeer>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&mut self, peer_id: PeerId) -> &mut SyncPeer {
        self.peers
            .entry(peer_id)
            .or_insert_with(|| SyncPeer::new(peer_id))
    }

    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<SyncPeer> {
        self.peers.remove(peer_id)
    }

    pub fn get_peer(&self, peer_id: &PeerId) -> Option<&SyncPeer> {
        self.peers.get(peer_id)
    }

    /// A peer connected and sent its status.
    pub fn on_connect(&mut self, peer_id: PeerId, status: Status) {
        self.add_peer(peer_id).status = Some(status);
    }

    /// A peer sent a new status. Unknown peers are treated as newly connected.
    ///
    /// Returns the previous status, if any.
    pub fn on_status_update(&mut self, peer_id: PeerId, status: Status) -> Option<Status> {
        match self.peers.get_mut(&peer_id) {
            Some(peer) => peer.status.replace(status),
            None => {
                self.on_connect(peer_id, status);
                None
            }
        }
    }

    /// A peer disconnected. Its record is dropped.
    pub fn on_disconnect(&mut self, peer_id: &PeerId) -> Option<SyncPeer> {
        self.remove_peer(peer_id)
    }

    /// Requests in flight to a peer; unknown peers count as saturated.
    pub fn requests_in_flight(&self, peer_id: &PeerId) -> usize {
        self.peers
            .get(peer_id)
            .map_or(usize::MAX, |peer| peer.requests_in_flight)
    }

    /// Peers that have sent a status.
    pub fn peers_with_status(&self) -> impl Iterator<Item = (&PeerId, &Status)> {
        self.peers
            .values()
            .filter_map(|peer| peer.status.as_ref().map(|status| (&peer.peer_id, status)))
    }

    /// Highest head slot advertised by any connected peer.
    pub fn best_head_slot(&self) -> Option<Slot> {
        self.peers_with_status()
            .map(|(_, status)| status.head.slot)
            .max()
    }

    /// Finalized checkpoints ahead of `local_finalized`, with the peers
    /// advertising each one, best first.
    ///
    /// Candidates are ranked by the number of peers advertising them, ties
    /// broken by the higher epoch. Checkpoints whose root is in `ignored` are
    /// skipped.
    pub fn finalized_candidates(
        &self,
        local_finalized: Epoch,
        ignored: impl Fn(&Bytes32) -> bool,
    ) -> Vec<TargetCandidate<Checkpoint>> {
        let mut groups: HashMap<Checkpoint, Vec<PeerId>> = HashMap::new();
        for (peer_id, status) in self.peers_with_status() {
            if status.finalized.epoch > local_finalized && !ignored(&status.finalized.root) {
                groups.entry(status.finalized).or_default().push(*peer_id);
            }
        }
        rank_candidates(groups, |checkpoint| checkpoint.epoch.0)
    }

    /// Heads ahead of `local_head`, with the peers advertising each one, best
    /// first.
    ///
    /// Peers are grouped by exact head root. Candidates are ranked by peer
    /// count, ties broken by the higher head slot.
    pub fn head_candidates(
        &self,
        local_head: &HeadInfo,
        ignored: impl Fn(&PeerId, &Status) -> bool,
    ) -> Vec<TargetCandidate<HeadInfo>> {
        let mut groups: HashMap<HeadInfo, Vec<PeerId>> = HashMap::new();
        for (peer_id, status) in self.peers_with_status() {
            if status.head.slot > local_head.slot
                && status.head.root != local_head.root
                && !ignored(peer_id, status)
            {
                groups.entry(status.head).or_default().push(*peer_id);
            }
        }
        rank_candidates(groups, |head| head.slot.0)
    }

    /// Unknown peers are ignored by both request counters.
    pub fn on_request_start(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.on_request_start();
        }
    }

    pub fn on_request_complete(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.on_request_complete();
        }
    }

    pub fn get_all_peers(&self) -> impl Iterator<Item = &SyncPeer> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> PeerCount {
        PeerCount::new(self.peers.values())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

fn rank_candidates<T: Copy>(
    groups: HashMap<T, Vec<PeerId>>,
    height: impl Fn(&T) -> u64,
) -> Vec<TargetCandidate<T>> {
    let mut candidates: Vec<TargetCandidate<T>> = groups
        .into_iter()
        .map(|(target, mut peers)| {
            peers.sort();
            TargetCandidate { target, peers }
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.peers
            .len()
            .cmp(&a.peers.len())
            .then_with(|| height(&b.target).cmp(&height(&a.target)))
            // deterministic order for equal candidates
            .then_with(|| a.peers.first().cmp(&b.peers.first()))
    });
    candidates
}
