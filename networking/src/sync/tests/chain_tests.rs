use crate::sync::{
    actions::{PeerFault, SyncAction},
    batch::{BatchId, BatchState, RequestId, SlotRange},
    chain::{ChainOutcome, SyncChainType, SyncTarget, SyncingChain},
    config::SyncConfig,
    error::{NetworkError, ProcessingError, SyncError},
    peer_manager::PeerManager,
};
use containers::{Bytes32, HeadInfo, Slot};
use libp2p_identity::PeerId;
use pretty_assertions::assert_eq;
use rstest::rstest;

use super::{blocks_for, checkpoint, create_test_block, head, status};

/// Finalized chain towards epoch 4: batches 0..64, 64..128 and 128..129.
fn finalized_chain() -> SyncingChain {
    SyncingChain::new(
        1,
        SyncTarget::Finalized(checkpoint(4, 1)),
        Slot(0),
        SyncConfig::default(),
    )
}

/// Head chain towards slot 10: a single batch 0..11.
fn short_head_chain() -> SyncingChain {
    SyncingChain::new(2, SyncTarget::Head(head(10, 2)), Slot(0), SyncConfig::default())
}

/// Connects `count` peers, sorted by id, and adds them to `chain`.
fn connect_peers(chain: &mut SyncingChain, pool: &mut PeerManager, count: usize) -> Vec<PeerId> {
    let mut peers: Vec<PeerId> = (0..count).map(|_| PeerId::random()).collect();
    peers.sort();
    for peer_id in &peers {
        pool.on_connect(*peer_id, status(4, 1, 130, 2));
        chain.add_peer(*peer_id);
    }
    peers
}

fn requests(actions: &[SyncAction]) -> Vec<(BatchId, RequestId, PeerId, SlotRange)> {
    actions
        .iter()
        .filter_map(|action| match action {
            SyncAction::RequestBlocks {
                batch_id,
                request_id,
                peer_id,
                range,
                ..
            } => Some((*batch_id, *request_id, *peer_id, *range)),
            _ => None,
        })
        .collect()
}

fn processed(actions: &[SyncAction]) -> Vec<BatchId> {
    actions
        .iter()
        .filter_map(|action| match action {
            SyncAction::ProcessBatch { batch_id, .. } => Some(*batch_id),
            _ => None,
        })
        .collect()
}

fn request_for(actions: &[SyncAction], batch: u64) -> (RequestId, PeerId, SlotRange) {
    requests(actions)
        .into_iter()
        .find(|(batch_id, ..)| *batch_id == Slot(batch))
        .map(|(_, request_id, peer_id, range)| (request_id, peer_id, range))
        .expect("batch was requested")
}

#[test]
fn test_target_accessors() {
    let finalized = SyncTarget::Finalized(checkpoint(4, 1));
    assert_eq!(finalized.slot(), Slot(128));
    assert_eq!(finalized.chain_type(), SyncChainType::Finalized);

    let head_target = SyncTarget::Head(head(77, 3));
    assert_eq!(head_target.slot(), Slot(77));
    assert_eq!(head_target.root(), super::root(3));
    assert_eq!(head_target.chain_type(), SyncChainType::Head);
}

#[test]
fn test_chain_covers_target_slot() {
    let chain = finalized_chain();
    assert_eq!(chain.start_slot(), Slot(0));
    assert_eq!(chain.end_slot(), Slot(129));
    assert!(!chain.is_complete());
}

#[test]
fn test_stopped_chain_does_not_request() {
    let mut pool = PeerManager::new();
    let mut chain = finalized_chain();
    connect_peers(&mut chain, &mut pool, 1);

    let mut actions = Vec::new();
    chain.advance(&mut pool, &mut actions);
    assert!(actions.is_empty());
    assert_eq!(chain.batches().count(), 0);
}

#[test]
fn test_requests_limited_by_peer_capacity() {
    let mut pool = PeerManager::new();
    let mut chain = finalized_chain();
    let peers = connect_peers(&mut chain, &mut pool, 1);

    let mut actions = Vec::new();
    chain.start_syncing(&mut pool, &mut actions);

    let sent = requests(&actions);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].3, SlotRange::new(Slot(0), Slot(64)));
    assert_eq!(sent[1].3, SlotRange::new(Slot(64), Slot(128)));
    assert!(sent.iter().all(|(_, _, peer, _)| *peer == peers[0]));
    assert_eq!(pool.requests_in_flight(&peers[0]), 2);
    assert_eq!(chain.downloading_peers().len(), 2);
}

#[test]
fn test_final_batch_is_shorter() {
    let mut pool = PeerManager::new();
    let mut chain = finalized_chain();
    connect_peers(&mut chain, &mut pool, 2);

    let mut actions = Vec::new();
    chain.start_syncing(&mut pool, &mut actions);

    let (_, _, range) = request_for(&actions, 128);
    assert_eq!(range, SlotRange::new(Slot(128), Slot(129)));
    assert_eq!(chain.pending_batches(), 3);
}

#[test]
fn test_processing_is_strictly_ordered() {
    let mut pool = PeerManager::new();
    let mut chain = finalized_chain();
    connect_peers(&mut chain, &mut pool, 2);

    let mut actions = Vec::new();
    chain.start_syncing(&mut pool, &mut actions);
    let (req0, ..) = request_for(&actions, 0);
    let (req64, ..) = request_for(&actions, 64);
    let (req128, ..) = request_for(&actions, 128);

    // second batch first: nothing can be processed yet
    let mut actions = Vec::new();
    let outcome = chain
        .on_block_response(
            Slot(64),
            req64,
            Ok(blocks_for(SlotRange::new(Slot(64), Slot(128)))),
            &mut pool,
            &mut actions,
        )
        .unwrap();
    assert_eq!(outcome, ChainOutcome::Continue);
    assert!(processed(&actions).is_empty());

    let mut actions = Vec::new();
    chain
        .on_block_response(
            Slot(0),
            req0,
            Ok(blocks_for(SlotRange::new(Slot(0), Slot(64)))),
            &mut pool,
            &mut actions,
        )
        .unwrap();
    assert_eq!(processed(&actions), vec![Slot(0)]);

    // the last batch arrives while batch 0 is processing
    let mut actions = Vec::new();
    chain
        .on_block_response(
            Slot(128),
            req128,
            Ok(blocks_for(SlotRange::new(Slot(128), Slot(129)))),
            &mut pool,
            &mut actions,
        )
        .unwrap();
    assert!(processed(&actions).is_empty());

    let mut actions = Vec::new();
    let outcome = chain.on_processing_result(Slot(0), Ok(()), &mut pool, &mut actions).unwrap();
    assert_eq!(outcome, ChainOutcome::Continue);
    assert_eq!(processed(&actions), vec![Slot(64)]);
    assert_eq!(chain.processed_cursor(), Slot(64));
    assert_eq!(chain.validated_epochs(), 2);

    let mut actions = Vec::new();
    chain.on_processing_result(Slot(64), Ok(()), &mut pool, &mut actions).unwrap();
    assert_eq!(processed(&actions), vec![Slot(128)]);

    let mut actions = Vec::new();
    let outcome = chain.on_processing_result(Slot(128), Ok(()), &mut pool, &mut actions).unwrap();
    assert_eq!(outcome, ChainOutcome::Complete);
    assert!(chain.is_complete());
    assert_eq!(chain.validated_epochs(), 4);

    let last = create_test_block(128, Bytes32::default());
    assert_eq!(chain.processed_head(), Some(HeadInfo::new(Slot(128), last.root())));
}

#[test]
fn test_done_batches_form_a_prefix() {
    let mut pool = PeerManager::new();
    let mut chain = finalized_chain();
    connect_peers(&mut chain, &mut pool, 2);

    let mut actions = Vec::new();
    chain.start_syncing(&mut pool, &mut actions);
    for batch in [0u64, 64] {
        let (request_id, _, range) = request_for(&actions, batch);
        let mut ignored = Vec::new();
        chain
            .on_block_response(
                Slot(batch),
                request_id,
                Ok(blocks_for(range)),
                &mut pool,
                &mut ignored,
            )
            .unwrap();
    }
    let mut ignored = Vec::new();
    chain.on_processing_result(Slot(0), Ok(()), &mut pool, &mut ignored).unwrap();

    let states: Vec<bool> = chain.batches().map(|batch| batch.is_done()).collect();
    assert_eq!(states, vec![true, false, false]);
    assert!(
        chain
            .batches()
            .filter(|batch| matches!(batch.state(), BatchState::Processing { .. }))
            .count()
            <= 1
    );
}

#[test]
fn test_stale_response_is_ignored() {
    let mut pool = PeerManager::new();
    let mut chain = short_head_chain();
    let peers = connect_peers(&mut chain, &mut pool, 1);

    let mut actions = Vec::new();
    chain.start_syncing(&mut pool, &mut actions);
    let (request_id, ..) = request_for(&actions, 0);

    let mut actions = Vec::new();
    let outcome = chain
        .on_block_response(Slot(0), request_id + 100, Ok(Vec::new()), &mut pool, &mut actions)
        .unwrap();
    assert_eq!(outcome, ChainOutcome::Continue);
    assert!(actions.is_empty());
    assert_eq!(pool.requests_in_flight(&peers[0]), 1);

    // replaying an applied response is a no-op as well
    chain
        .on_block_response(Slot(0), request_id, Ok(Vec::new()), &mut pool, &mut actions)
        .unwrap();
    let mut replay = Vec::new();
    let outcome = chain
        .on_block_response(Slot(0), request_id, Ok(Vec::new()), &mut pool, &mut replay)
        .unwrap();
    assert_eq!(outcome, ChainOutcome::Continue);
    assert!(replay.is_empty());
}

#[test]
fn test_unknown_batch_is_an_error() {
    let mut pool = PeerManager::new();
    let mut chain = short_head_chain();

    let mut actions = Vec::new();
    let err = chain
        .on_block_response(Slot(640), 0, Ok(Vec::new()), &mut pool, &mut actions)
        .unwrap_err();
    assert_eq!(
        err,
        SyncError::UnknownBatch {
            chain_id: 2,
            batch_id: Slot(640)
        }
    );
}

#[test]
fn test_download_failure_retries_on_another_peer() {
    let mut pool = PeerManager::new();
    let mut chain = short_head_chain();
    let peers = connect_peers(&mut chain, &mut pool, 2);

    let mut actions = Vec::new();
    chain.start_syncing(&mut pool, &mut actions);
    let (request_id, first_peer, _) = request_for(&actions, 0);

    let mut actions = Vec::new();
    chain
        .on_block_response(Slot(0), request_id, Err(NetworkError::Timeout), &mut pool, &mut actions)
        .unwrap();

    let (_, retry_peer, _) = request_for(&actions, 0);
    assert_ne!(retry_peer, first_peer);
    assert!(peers.contains(&retry_peer));
    assert_eq!(chain.batch(&Slot(0)).unwrap().download_attempts(), 1);
}

#[test]
fn test_download_attempts_exhausted() {
    let mut pool = PeerManager::new();
    let mut chain = short_head_chain();
    connect_peers(&mut chain, &mut pool, 1);

    let mut actions = Vec::new();
    chain.start_syncing(&mut pool, &mut actions);

    for attempt in 1..=5 {
        let (request_id, ..) = request_for(&actions, 0);
        actions.clear();
        let outcome = chain
            .on_block_response(
                Slot(0),
                request_id,
                Err(NetworkError::Disconnected),
                &mut pool,
                &mut actions,
            )
            .unwrap();
        if attempt < 5 {
            assert_eq!(outcome, ChainOutcome::Continue);
        } else {
            assert_eq!(outcome, ChainOutcome::Faulty { batch_id: Slot(0) });
        }
    }
    assert!(chain.batch(&Slot(0)).unwrap().is_faulty());
}

#[test]
fn test_invalid_response_reports_peer() {
    let mut pool = PeerManager::new();
    let mut chain = short_head_chain();
    let peers = connect_peers(&mut chain, &mut pool, 1);

    let mut actions = Vec::new();
    chain.start_syncing(&mut pool, &mut actions);
    let (request_id, ..) = request_for(&actions, 0);

    let mut actions = Vec::new();
    let out_of_range = vec![create_test_block(50, Bytes32::default())];
    chain
        .on_block_response(Slot(0), request_id, Ok(out_of_range), &mut pool, &mut actions)
        .unwrap();

    assert!(actions.contains(&SyncAction::ReportPeer {
        peer_id: peers[0],
        fault: PeerFault::InvalidResponse,
    }));
    assert_eq!(chain.batch(&Slot(0)).unwrap().download_attempts(), 1);
    assert_eq!(requests(&actions).len(), 1);
}

#[rstest]
#[case::invalid_block(ProcessingError::InvalidBlock {
    slot: Slot(3),
    reason: "bad signature".to_string(),
})]
#[case::unknown_parent(ProcessingError::UnknownParent {
    slot: Slot(0),
    parent_root: Bytes32::from([0xee; 32]),
})]
#[case::state_transition(ProcessingError::StateTransition {
    slot: Slot(5),
    reason: "wrong state root".to_string(),
})]
fn test_processing_failure_blaming_peer_redownloads_elsewhere(#[case] error: ProcessingError) {
    assert!(error.blames_peer());
    let mut pool = PeerManager::new();
    let mut chain = short_head_chain();
    connect_peers(&mut chain, &mut pool, 2);

    let mut actions = Vec::new();
    chain.start_syncing(&mut pool, &mut actions);
    let (request_id, served_by, range) = request_for(&actions, 0);

    let mut actions = Vec::new();
    chain
        .on_block_response(Slot(0), request_id, Ok(blocks_for(range)), &mut pool, &mut actions)
        .unwrap();
    assert_eq!(processed(&actions), vec![Slot(0)]);

    let mut actions = Vec::new();
    let outcome = chain
        .on_processing_result(Slot(0), Err(error), &mut pool, &mut actions)
        .unwrap();
    assert_eq!(outcome, ChainOutcome::Continue);
    assert!(actions.contains(&SyncAction::ReportPeer {
        peer_id: served_by,
        fault: PeerFault::InvalidBlocks,
    }));

    let (_, retry_peer, _) = request_for(&actions, 0);
    assert_ne!(retry_peer, served_by);
}

#[test]
fn test_processing_failure_not_blaming_peer_reprocesses() {
    let mut pool = PeerManager::new();
    let mut chain = short_head_chain();
    connect_peers(&mut chain, &mut pool, 1);

    let mut actions = Vec::new();
    chain.start_syncing(&mut pool, &mut actions);
    let (request_id, _, range) = request_for(&actions, 0);
    chain
        .on_block_response(Slot(0), request_id, Ok(blocks_for(range)), &mut pool, &mut actions)
        .unwrap();

    let mut actions = Vec::new();
    chain
        .on_processing_result(
            Slot(0),
            Err(ProcessingError::Unavailable("busy".to_string())),
            &mut pool,
            &mut actions,
        )
        .unwrap();

    assert_eq!(processed(&actions), vec![Slot(0)]);
    assert!(requests(&actions).is_empty());
    assert!(!actions.iter().any(|action| matches!(action, SyncAction::ReportPeer { .. })));
}

#[test]
fn test_remove_peer_requeues_without_penalty() {
    let mut pool = PeerManager::new();
    let mut chain = finalized_chain();
    let peers = connect_peers(&mut chain, &mut pool, 2);

    let mut actions = Vec::new();
    chain.start_syncing(&mut pool, &mut actions);
    let lowest_load: Vec<_> = requests(&actions)
        .into_iter()
        .filter(|(_, _, peer, _)| *peer == peers[0])
        .collect();
    assert_eq!(lowest_load.len(), 2);

    let requeued = chain.remove_peer(&peers[0]);
    assert_eq!(requeued, 2);
    assert!(!chain.has_peer(&peers[0]));

    let mut actions = Vec::new();
    chain.advance(&mut pool, &mut actions);
    let resent = requests(&actions);
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].2, peers[1]);
    assert!(chain.batches().all(|batch| batch.download_attempts() == 0));
}

#[test]
fn test_peerless_chain_pauses() {
    let mut pool = PeerManager::new();
    let mut chain = short_head_chain();
    let peers = connect_peers(&mut chain, &mut pool, 1);

    let mut actions = Vec::new();
    chain.start_syncing(&mut pool, &mut actions);
    chain.remove_peer(&peers[0]);

    let mut actions = Vec::new();
    chain.advance(&mut pool, &mut actions);
    assert!(actions.is_empty());
    assert!(matches!(
        chain.batch(&Slot(0)).unwrap().state(),
        BatchState::AwaitingDownload
    ));
}
