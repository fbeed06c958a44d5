//! In-memory network, store and block pipeline used to exercise range sync
//! without a p2p stack.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use containers::{
    Block, Bytes32, Checkpoint, Epoch, HeadInfo, SignedBlock, Slot, Status, ValidatorIndex,
};
use libp2p_identity::PeerId;
use networking::sync::{
    BlockProcessor, BlockRangeRequester, ChainStore, NetworkError, PeerFault, PeerReporter,
    ProcessingError, SlotRange,
};
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info};

/// Validators proposing in round robin.
const VALIDATOR_COUNT: u64 = 64;

/// Probability that a request times out.
const TIMEOUT_RATE: f64 = 0.02;

/// A canonical chain with a few empty slots.
pub struct SimulatedChain {
    blocks: Vec<SignedBlock>,
    by_slot: HashMap<Slot, usize>,
}

impl SimulatedChain {
    pub fn generate(head_slot: u64) -> Self {
        let mut blocks = Vec::new();
        let mut by_slot = HashMap::new();
        let mut parent_root = Bytes32::zero();

        for slot in (0..=head_slot).map(Slot) {
            if !slot.is_epoch_start() && slot.0 % 7 == 3 && slot.0 != head_slot {
                continue;
            }
            let block = SignedBlock {
                message: Block {
                    slot,
                    proposer_index: ValidatorIndex(slot.0 % VALIDATOR_COUNT),
                    parent_root,
                    state_root: Bytes32::from([(slot.0 % 251) as u8; 32]),
                    body_root: Bytes32::zero(),
                },
                signature: vec![0; 96],
            };
            parent_root = block.root();
            by_slot.insert(slot, blocks.len());
            blocks.push(block);
        }

        Self { blocks, by_slot }
    }

    pub fn genesis(&self) -> &SignedBlock {
        &self.blocks[0]
    }

    /// Latest block at or before `slot`.
    pub fn head_at(&self, slot: Slot) -> HeadInfo {
        self.blocks
            .iter()
            .rev()
            .find(|block| block.slot() <= slot)
            .map(|block| HeadInfo::new(block.slot(), block.root()))
            .unwrap_or_default()
    }

    /// Checkpoint of `epoch`. Epoch start slots are never empty.
    pub fn checkpoint(&self, epoch: Epoch) -> Checkpoint {
        let root = self
            .by_slot
            .get(&epoch.start_slot())
            .map(|index| self.blocks[*index].root())
            .unwrap_or_default();
        Checkpoint::new(epoch, root)
    }

    /// Status of a peer whose head is at `head_slot` and which finalized two
    /// epochs behind it.
    pub fn status_at(&self, head_slot: Slot) -> Status {
        let finalized_epoch = Epoch(head_slot.epoch().0.saturating_sub(2));
        Status::new(self.checkpoint(finalized_epoch), self.head_at(head_slot))
    }

    fn blocks_in(&self, range: SlotRange, limit: Slot) -> Vec<SignedBlock> {
        self.blocks
            .iter()
            .filter(|block| range.contains(block.slot()) && block.slot() <= limit)
            .cloned()
            .collect()
    }
}

struct SimulatedPeer {
    head_slot: Slot,
    faulty: bool,
}

/// Serves the simulated chain up to each peer's head, with random latency
/// and occasional timeouts. Faulty peers serve blocks with broken parents.
pub struct SimulatedNetwork {
    chain: Arc<SimulatedChain>,
    peers: RwLock<HashMap<PeerId, SimulatedPeer>>,
}

impl SimulatedNetwork {
    pub fn new(chain: Arc<SimulatedChain>) -> Self {
        Self {
            chain,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_peer(&self, peer_id: PeerId, head_slot: Slot, faulty: bool) {
        self.peers
            .write()
            .insert(peer_id, SimulatedPeer { head_slot, faulty });
    }
}

#[async_trait]
impl BlockRangeRequester for SimulatedNetwork {
    async fn request_blocks_by_range(
        &self,
        peer_id: PeerId,
        range: SlotRange,
    ) -> Result<Vec<SignedBlock>, NetworkError> {
        let (latency, timed_out) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(1..20), rng.gen_bool(TIMEOUT_RATE))
        };
        tokio::time::sleep(Duration::from_millis(latency)).await;

        if timed_out {
            return Err(NetworkError::Timeout);
        }

        let (head_slot, faulty) = match self.peers.read().get(&peer_id) {
            Some(peer) => (peer.head_slot, peer.faulty),
            None => return Err(NetworkError::Disconnected),
        };

        let mut blocks = self.chain.blocks_in(range, head_slot);
        if faulty {
            for block in &mut blocks {
                block.message.parent_root = Bytes32::from([0xee; 32]);
            }
        }
        Ok(blocks)
    }
}

#[derive(Default)]
struct StoreState {
    finalized: Checkpoint,
    head: HeadInfo,
    blocks: HashSet<Bytes32>,
    checkpoints: BTreeMap<Epoch, Bytes32>,
}

/// Local chain store.
pub struct SimulatedStore {
    state: RwLock<StoreState>,
}

impl SimulatedStore {
    pub fn new(chain: &SimulatedChain) -> Self {
        let genesis = chain.genesis();
        let root = genesis.root();
        let mut blocks = HashSet::new();
        blocks.insert(root);

        Self {
            state: RwLock::new(StoreState {
                finalized: Checkpoint::new(Epoch(0), root),
                head: HeadInfo::new(genesis.slot(), root),
                blocks,
                checkpoints: BTreeMap::from([(Epoch(0), root)]),
            }),
        }
    }
}

impl ChainStore for SimulatedStore {
    fn finalized_checkpoint(&self) -> Checkpoint {
        self.state.read().finalized
    }

    fn head(&self) -> HeadInfo {
        self.state.read().head
    }
}

/// Imports blocks whose parent is known and finalizes epoch checkpoints two
/// epochs behind the head.
pub struct SimulatedProcessor {
    store: Arc<SimulatedStore>,
}

impl SimulatedProcessor {
    pub fn new(store: Arc<SimulatedStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BlockProcessor for SimulatedProcessor {
    async fn process_blocks(&self, blocks: Arc<Vec<SignedBlock>>) -> Result<(), ProcessingError> {
        let mut state = self.store.state.write();

        for block in blocks.iter() {
            let root = block.root();
            if state.blocks.contains(&root) {
                continue;
            }
            if !state.blocks.contains(&block.parent_root()) {
                return Err(ProcessingError::UnknownParent {
                    slot: block.slot(),
                    parent_root: block.parent_root(),
                });
            }

            state.blocks.insert(root);
            if block.slot().is_epoch_start() {
                state.checkpoints.insert(block.slot().epoch(), root);
            }
            if block.slot() > state.head.slot {
                state.head = HeadInfo::new(block.slot(), root);
            }
        }

        let finalizable = Epoch(state.head.slot.epoch().0.saturating_sub(2));
        let latest = state
            .checkpoints
            .range(..=finalizable)
            .next_back()
            .map(|(epoch, root)| Checkpoint::new(*epoch, *root));
        let finalized_epoch = state.finalized.epoch;
        if let Some(checkpoint) = latest.filter(|checkpoint| checkpoint.epoch > finalized_epoch) {
            debug!(epoch = checkpoint.epoch.0, "Finalized checkpoint");
            state.finalized = checkpoint;
        }

        Ok(())
    }
}

/// Counts reports per peer.
#[derive(Default)]
pub struct SimulatedReporter {
    reports: RwLock<HashMap<PeerId, Vec<PeerFault>>>,
}

impl SimulatedReporter {
    pub fn summary(&self) -> Vec<(PeerId, usize)> {
        self.reports
            .read()
            .iter()
            .map(|(peer_id, faults)| (*peer_id, faults.len()))
            .collect()
    }
}

impl PeerReporter for SimulatedReporter {
    fn report_peer(&self, peer_id: &PeerId, fault: PeerFault) {
        info!(peer = %peer_id, fault = fault.as_str(), "Peer penalized");
        self.reports.write().entry(*peer_id).or_default().push(fault);
    }
}
