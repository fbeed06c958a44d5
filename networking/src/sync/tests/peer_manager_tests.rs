use crate::sync::config::MAX_CONCURRENT_REQUESTS;
use crate::sync::{PeerManager, SyncPeer};
use containers::{Epoch, Slot};
use libp2p_identity::PeerId;
use pretty_assertions::assert_eq;

use super::{checkpoint, head, root, status};

#[test]
fn test_sync_peer_is_available() {
    let mut peer = SyncPeer::new(PeerId::random());
    assert!(peer.is_available());

    peer.requests_in_flight = MAX_CONCURRENT_REQUESTS;
    assert!(!peer.is_available());

    peer.on_request_complete();
    assert!(peer.is_available());
}

#[test]
fn test_peer_without_status_supports_nothing() {
    let peer = SyncPeer::new(PeerId::random());
    assert!(peer.is_available());
    assert!(!peer.has_status());
    assert!(!peer.supports_finalized(Epoch(0), &checkpoint(1, 1)));
    assert!(!peer.supports_head(&head(10, 1)));
}

#[test]
fn test_peer_manager_connect_and_get() {
    let mut manager = PeerManager::new();
    let peer_id = PeerId::random();

    manager.on_connect(peer_id, status(3, 1, 100, 2));

    let peer = manager.get_peer(&peer_id).unwrap();
    assert!(peer.has_status());
    assert_eq!(peer.status.unwrap().finalized.epoch, Epoch(3));
    assert_eq!(manager.len(), 1);
    assert_eq!(manager.peer_count().connected, 1);
}

#[test]
fn test_status_update_of_unknown_peer_connects_it() {
    let mut manager = PeerManager::new();
    let peer_id = PeerId::random();

    assert_eq!(manager.on_status_update(peer_id, status(1, 1, 40, 1)), None);
    assert!(manager.get_peer(&peer_id).is_some());

    let previous = manager.on_status_update(peer_id, status(2, 2, 80, 2));
    assert_eq!(previous, Some(status(1, 1, 40, 1)));
}

#[test]
fn test_disconnect_drops_record() {
    let mut manager = PeerManager::new();
    let peer_id = PeerId::random();
    manager.on_connect(peer_id, status(1, 1, 40, 1));

    assert!(manager.on_disconnect(&peer_id).is_some());
    assert!(manager.is_empty());
    assert!(manager.on_disconnect(&peer_id).is_none());
    assert_eq!(manager.requests_in_flight(&peer_id), usize::MAX);
}

#[test]
fn test_request_tracking() {
    let mut manager = PeerManager::new();
    let peer_id = PeerId::random();
    manager.on_connect(peer_id, status(1, 1, 40, 1));

    manager.on_request_start(&peer_id);
    manager.on_request_start(&peer_id);
    assert_eq!(manager.requests_in_flight(&peer_id), 2);
    assert!(!manager.get_peer(&peer_id).unwrap().is_available());

    assert_eq!(manager.peer_count().saturated, 1);

    manager.on_request_complete(&peer_id);
    manager.on_request_complete(&peer_id);
    manager.on_request_complete(&peer_id);
    assert_eq!(manager.requests_in_flight(&peer_id), 0);
    assert_eq!(manager.peer_count().saturated, 0);
}

#[test]
fn test_peer_count_json() {
    let mut manager = PeerManager::new();
    manager.on_connect(PeerId::random(), status(1, 1, 40, 1));

    assert_eq!(
        serde_json::to_value(manager.peer_count()).unwrap(),
        serde_json::json!({"connected": "1", "with_status": "1", "saturated": "0"})
    );
}

#[test]
fn test_best_head_slot() {
    let mut manager = PeerManager::new();
    assert_eq!(manager.best_head_slot(), None);

    manager.on_connect(PeerId::random(), status(1, 1, 40, 1));
    manager.on_connect(PeerId::random(), status(1, 1, 90, 2));
    assert_eq!(manager.best_head_slot(), Some(Slot(90)));
}

#[test]
fn test_supports_finalized() {
    let mut peer = SyncPeer::new(PeerId::random());
    let target = checkpoint(10, 1);
    assert!(!peer.supports_finalized(Epoch(5), &target));

    peer.status = Some(status(10, 1, 400, 9));
    assert!(peer.supports_finalized(Epoch(5), &target));
    assert!(!peer.supports_finalized(Epoch(10), &target));

    // a conflicting checkpoint at the same epoch does not support the target
    peer.status = Some(status(10, 2, 400, 9));
    assert!(!peer.supports_finalized(Epoch(5), &target));

    // finalized beyond the target
    peer.status = Some(status(12, 3, 400, 9));
    assert!(peer.supports_finalized(Epoch(5), &target));
}

#[test]
fn test_supports_head_requires_exact_root() {
    let mut peer = SyncPeer::new(PeerId::random());
    peer.status = Some(status(1, 1, 100, 7));

    assert!(peer.supports_head(&head(100, 7)));
    assert!(!peer.supports_head(&head(100, 8)));
}

#[test]
fn test_finalized_candidates_ranked_by_peer_count() {
    let mut manager = PeerManager::new();
    for _ in 0..2 {
        manager.on_connect(PeerId::random(), status(8, 1, 300, 1));
    }
    manager.on_connect(PeerId::random(), status(20, 2, 700, 2));
    // not ahead of local finality
    manager.on_connect(PeerId::random(), status(4, 3, 150, 3));

    let candidates = manager.finalized_candidates(Epoch(4), |_| false);
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].target, checkpoint(8, 1));
    assert_eq!(candidates[0].peers.len(), 2);
    assert_eq!(candidates[1].target, checkpoint(20, 2));
}

#[test]
fn test_finalized_candidates_tie_broken_by_epoch() {
    let mut manager = PeerManager::new();
    manager.on_connect(PeerId::random(), status(8, 1, 300, 1));
    manager.on_connect(PeerId::random(), status(9, 2, 300, 1));

    let candidates = manager.finalized_candidates(Epoch(0), |_| false);
    assert_eq!(candidates[0].target, checkpoint(9, 2));
}

#[test]
fn test_finalized_candidates_skip_ignored_roots() {
    let mut manager = PeerManager::new();
    manager.on_connect(PeerId::random(), status(8, 1, 300, 1));

    let ignored = root(1);
    assert!(manager.finalized_candidates(Epoch(0), |r| *r == ignored).is_empty());
}

#[test]
fn test_head_candidates() {
    let mut manager = PeerManager::new();
    let local_head = head(100, 0);
    manager.on_connect(PeerId::random(), status(3, 1, 120, 5));
    manager.on_connect(PeerId::random(), status(3, 1, 120, 5));
    manager.on_connect(PeerId::random(), status(3, 1, 130, 6));
    // behind the local head
    manager.on_connect(PeerId::random(), status(3, 1, 90, 7));

    let candidates = manager.head_candidates(&local_head, |_, _| false);
    let targets: Vec<_> = candidates.iter().map(|candidate| candidate.target).collect();
    assert_eq!(targets, vec![head(120, 5), head(130, 6)]);

    let filtered = manager.head_candidates(&local_head, |_, status| status.head.root == root(5));
    assert_eq!(filtered.len(), 1);
}
