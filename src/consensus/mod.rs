// src/consensus/mod.rs
//
// Leader side of one FBFT round: announce a candidate block, collect prepare
// shares, broadcast the prepare aggregate, collect commit shares, attach both
// aggregates to the header and publish the finalized block.
//
// A `Consensus` value is externally synchronized: the dispatcher and the
// block feed share it behind one `Arc<Mutex<_>>`, so every mutation of round
// state happens under that single mutex.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use tracing::{debug, error, info, warn};

use crate::codec::{block_bytes, block_hash, decode_block};
use crate::crypto::bls::{BlsSignatureBytes, BlsSigner, SignerBitmap};
use crate::membership::{Peer, ValidatorView};
use crate::message::{
    check_message, frame, multisig_payload, unframe_consensus, ConsensusMessage, MessageCategory,
    MsgKind, ACTION_CONSENSUS,
};
use crate::metrics::{self, DropCounters, DropReason};
use crate::net::Broadcaster;
use crate::quorum::{AddOutcome, SigPool};
use crate::types::{Block, Hash, ValidatorId};

pub mod feed;

/// Depth of the best-effort finalized-block queue; overflow drops with a log.
pub const VERIFIED_QUEUE_DEPTH: usize = 16;
/// Depth of the reliable ready-for-next-block queue; the feed side must
/// always keep a reader on it.
pub const READY_QUEUE_DEPTH: usize = 1;

/// Progress of the round under way. Later phases compare greater; `Finished`
/// doubles as "no round in progress".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RoundState {
    Finished,
    AnnounceDone,
    PreparedDone,
    CommittedDone,
}

#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub shard_id: u32,
    /// The leader's own id; must name an entry of the committee.
    pub node_id: ValidatorId,
    pub min_peers: usize,
    /// Heights divisible by this sit on an epoch boundary; 0 disables epochs.
    pub epoch_len: u64,
    /// A round older than this is abandoned (reset without consuming its
    /// consensus id) the next time the feed looks at it.
    pub phase_timeout: Duration,
}

/// Where finalized blocks go besides the verified-block queue.
pub trait BlockStore: Send {
    fn persist(&mut self, block: &Block, consensus_id: u32);
}

/// In-memory store, enough for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct MemoryBlockStore {
    blocks: std::sync::Arc<std::sync::Mutex<Vec<(u32, Block)>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks(&self) -> Vec<(u32, Block)> {
        self.blocks.lock().unwrap().clone()
    }
}

impl BlockStore for MemoryBlockStore {
    fn persist(&mut self, block: &Block, consensus_id: u32) {
        self.blocks.lock().unwrap().push((consensus_id, block.clone()));
    }
}

/// Receiving ends of the leader's outbound queues.
pub struct ConsensusChannels {
    /// Finalized blocks, best-effort.
    pub verified_rx: Receiver<Block>,
    /// One signal per finished round, reliable.
    pub ready_rx: Receiver<()>,
}

pub struct Consensus<N: Broadcaster> {
    state: RoundState,
    consensus_id: u32,
    shard_id: u32,
    node_id: ValidatorId,
    signer: BlsSigner,
    pub view: ValidatorView,
    prepare_pool: SigPool,
    commit_pool: SigPool,
    agg_prepare: Option<(BlsSignatureBytes, SignerBitmap)>,
    agg_commit: Option<(BlsSignatureBytes, SignerBitmap)>,
    /// Encoded candidate block, kept until finalization.
    block: Vec<u8>,
    block_hash: Hash,
    net: N,
    store: Box<dyn BlockStore>,
    on_consensus_done: Option<Box<dyn FnMut(&Block) + Send>>,
    verified_tx: SyncSender<Block>,
    ready_tx: SyncSender<()>,
    drops: DropCounters,
    round_started_at: Option<Instant>,
    epoch_len: u64,
    phase_timeout: Duration,
    stalled_rounds: u64,
}

impl<N: Broadcaster> Consensus<N> {
    pub fn new(
        cfg: ConsensusConfig,
        leader_sk: &[u8; 32],
        committee: Vec<Peer>,
        net: N,
        store: Box<dyn BlockStore>,
    ) -> Result<(Self, ConsensusChannels)> {
        let signer = BlsSigner::from_sk_bytes(leader_sk)
            .ok_or_else(|| anyhow!("invalid leader BLS secret key"))?;
        let view = ValidatorView::new(committee, cfg.min_peers)?;
        let Some((_, me)) = view.peer_by_id(cfg.node_id) else {
            bail!("leader id {} not in committee", cfg.node_id);
        };
        if me.pubkey != signer.public_key_bytes() {
            bail!("leader key does not match committee entry for id {}", cfg.node_id);
        }

        let n = view.len();
        let (verified_tx, verified_rx) = sync_channel(VERIFIED_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = sync_channel(READY_QUEUE_DEPTH);
        let consensus = Self {
            state: RoundState::Finished,
            consensus_id: 0,
            shard_id: cfg.shard_id,
            node_id: cfg.node_id,
            signer,
            view,
            prepare_pool: SigPool::new(n),
            commit_pool: SigPool::new(n),
            agg_prepare: None,
            agg_commit: None,
            block: Vec::new(),
            block_hash: [0u8; 32],
            net,
            store,
            on_consensus_done: None,
            verified_tx,
            ready_tx,
            drops: DropCounters::default(),
            round_started_at: None,
            epoch_len: cfg.epoch_len,
            phase_timeout: cfg.phase_timeout,
            stalled_rounds: 0,
        };
        Ok((consensus, ConsensusChannels { verified_rx, ready_rx }))
    }

    /// Hook invoked with each finalized block just before the round resets.
    pub fn set_on_consensus_done(&mut self, f: impl FnMut(&Block) + Send + 'static) {
        self.on_consensus_done = Some(Box::new(f));
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn consensus_id(&self) -> u32 {
        self.consensus_id
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn node_id(&self) -> ValidatorId {
        self.node_id
    }

    pub fn epoch_len(&self) -> u64 {
        self.epoch_len
    }

    pub fn current_block_hash(&self) -> Hash {
        self.block_hash
    }

    pub fn prepare_count(&self) -> usize {
        self.prepare_pool.count()
    }

    pub fn commit_count(&self) -> usize {
        self.commit_pool.count()
    }

    pub fn has_prepare_from(&self, id: ValidatorId) -> bool {
        self.prepare_pool.contains(id)
    }

    pub fn has_commit_from(&self, id: ValidatorId) -> bool {
        self.commit_pool.contains(id)
    }

    pub fn prepare_bitmap(&self) -> &SignerBitmap {
        self.prepare_pool.bitmap()
    }

    pub fn drops(&self) -> &DropCounters {
        &self.drops
    }

    pub fn stalled_rounds(&self) -> u64 {
        self.stalled_rounds
    }

    /// The exact bytes a commit-phase share signs (prepare aggregate plus its
    /// bitmap). `None` before the prepare quorum.
    pub fn prepared_payload(&self) -> Option<Vec<u8>> {
        self.agg_prepare.as_ref().map(|(agg, bitmap)| multisig_payload(agg, bitmap))
    }

    // --- round lifecycle ---

    /// Open a round on `candidate`: hash and encode it, announce to the
    /// committee, and contribute the leader's own prepare share. On encoding
    /// failure the round is aborted and the state stays `Finished`.
    pub fn start_consensus(&mut self, candidate: &Block) {
        if candidate.header.shard_id != self.shard_id {
            error!(
                "candidate block for shard {} offered to shard {} leader; dropping",
                candidate.header.shard_id, self.shard_id
            );
            return;
        }
        self.block_hash = block_hash(candidate);
        let encoded = match block_bytes(candidate) {
            Ok(b) => b,
            Err(e) => {
                error!("failed to encode candidate block: {:?}; aborting round", e);
                self.block_hash = [0u8; 32];
                return;
            }
        };
        self.block = encoded;
        self.round_started_at = Some(Instant::now());

        let announce = ConsensusMessage::new_signed(
            MsgKind::Announce,
            self.consensus_id,
            self.node_id,
            self.block_hash,
            self.block.clone(),
            &self.signer,
        );
        self.state = RoundState::AnnounceDone;

        // the leader is just another signer of the block hash
        self.add_own_prepare_share();

        let sent = self.fan_out(&announce);
        debug!(
            "announced block at height {} to {} validators (consensus_id={})",
            candidate.header.height, sent, self.consensus_id
        );
    }

    fn add_own_prepare_share(&mut self) {
        let Some(idx) = self.view.index_of(self.node_id) else {
            warn!("leader id {} missing from its own committee view", self.node_id);
            return;
        };
        let pk = self.signer.public_key_bytes();
        let own = self.signer.sign(&self.block_hash);
        let block_hash = self.block_hash;
        let outcome = self.prepare_pool.add(self.node_id, idx, &pk, &own, &block_hash);
        if !matches!(outcome, AddOutcome::Added(_)) {
            warn!("could not record own prepare share: {:?}", outcome);
        }
    }

    /// Tear the round down to `Finished`: both pools, both aggregates, and
    /// the block under agreement are cleared. Does not touch `consensus_id`.
    pub fn reset_state(&mut self) {
        let n = self.view.len();
        self.state = RoundState::Finished;
        self.prepare_pool.reset(n);
        self.commit_pool.reset(n);
        self.agg_prepare = None;
        self.agg_commit = None;
        self.block.clear();
        self.block_hash = [0u8; 32];
        self.round_started_at = None;
    }

    /// Abandon the round if it has been running longer than the phase
    /// timeout. The consensus id is NOT consumed by an abandoned round.
    /// Returns true when a stall was detected.
    pub fn check_round_timeout(&mut self, now: Instant) -> bool {
        if self.state == RoundState::Finished {
            return false;
        }
        let Some(started) = self.round_started_at else {
            return false;
        };
        if now.duration_since(started) < self.phase_timeout {
            return false;
        }
        warn!(
            "round stalled in {:?} after {:?} (consensus_id={}, prepares={}, commits={}); abandoning",
            self.state,
            now.duration_since(started),
            self.consensus_id,
            self.prepare_pool.count(),
            self.commit_pool.count(),
        );
        self.stalled_rounds += 1;
        self.reset_state();
        true
    }

    /// Drop peers marked offline since the previous round and resize both
    /// pools for the new committee. Only safe between rounds.
    pub fn evict_offline_peers(&mut self) -> usize {
        let offline = self.view.offline_peers();
        if offline.is_empty() {
            return 0;
        }
        let removed = self.view.remove_peers(&offline);
        if removed > 0 {
            let n = self.view.len();
            self.prepare_pool.reset(n);
            self.commit_pool.reset(n);
        }
        removed
    }

    // --- inbound path ---

    /// Entry point for framed bytes handed up by the transport.
    pub fn handle_inbound(&mut self, framed: &[u8]) {
        let envelope = match unframe_consensus(framed) {
            Ok(p) => p,
            Err(e) => {
                debug!("unparseable frame: {:?}", e);
                self.drops.bump(DropReason::Malformed);
                return;
            }
        };
        self.process_message(envelope);
    }

    /// Dispatch one decoded envelope. The leader consumes PREPARE and COMMIT;
    /// everything else (its own echoes included) is dropped.
    pub fn process_message(&mut self, wire: &[u8]) {
        let msg = match ConsensusMessage::decode(wire) {
            Ok(m) => m,
            Err(e) => {
                error!("failed to decode consensus message: {:?}", e);
                self.drops.bump(DropReason::Malformed);
                return;
            }
        };
        match msg.kind {
            MsgKind::Prepare => self.process_prepare(msg),
            MsgKind::Commit => self.process_commit(msg),
            other => {
                debug!("unexpected message kind {:?} at the leader", other);
                self.drops.bump(DropReason::UnexpectedKind);
            }
        }
    }

    fn process_prepare(&mut self, msg: ConsensusMessage) {
        let sender = msg.sender_id;
        let Some((idx, peer)) = self.view.peer_by_id(sender) else {
            debug!("prepare from unknown validator {}", sender);
            self.drops.bump(DropReason::UnknownSender);
            return;
        };
        let pk = peer.pubkey;

        if let Err(e) = check_message(&msg, self.consensus_id, &self.block_hash, &pk) {
            debug!("failed to check prepare from validator {}: {:?}", sender, e);
            self.drops.bump(e.into());
            return;
        }

        // payload must be a signature share over the block hash
        let Some(sig) = BlsSignatureBytes::from_slice(&msg.payload) else {
            error!("malformed prepare share from validator {}", sender);
            self.drops.bump(DropReason::BadPayloadSig);
            return;
        };

        let block_hash = self.block_hash;
        match self.prepare_pool.add(sender, idx, &pk, &sig, &block_hash) {
            AddOutcome::Added(count) => {
                debug!(
                    "new prepare share from validator {} ({}/{} toward quorum)",
                    sender,
                    count,
                    self.prepare_pool.quorum()
                );
            }
            AddOutcome::Duplicate => {
                debug!("already received prepare from validator {}", sender);
                self.drops.bump(DropReason::DuplicateSignature);
                return;
            }
            AddOutcome::QuorumAlreadyReached => {
                debug!("late prepare from validator {}", sender);
                self.drops.bump(DropReason::QuorumAlreadyReached);
                return;
            }
            AddOutcome::Invalid => {
                error!("invalid prepare share from validator {}", sender);
                self.drops.bump(DropReason::BadPayloadSig);
                return;
            }
        }

        if self.prepare_pool.has_quorum() && self.state < RoundState::PreparedDone {
            self.enter_prepared();
        }
    }

    /// Quorum-crossing action of the prepare phase; runs at most once per
    /// round thanks to the `state < PreparedDone` gate at the call site.
    fn enter_prepared(&mut self) {
        let Some((agg, bitmap)) = self.prepare_pool.aggregate() else {
            error!("prepare pool empty at quorum; cannot aggregate");
            return;
        };
        info!(
            "prepare quorum reached with {} shares (consensus_id={})",
            self.prepare_pool.count(),
            self.consensus_id
        );

        let payload = multisig_payload(&agg, &bitmap);
        let prepared = ConsensusMessage::new_signed(
            MsgKind::Prepared,
            self.consensus_id,
            self.node_id,
            self.block_hash,
            payload.clone(),
            &self.signer,
        );
        self.agg_prepare = Some((agg, bitmap));
        self.state = RoundState::PreparedDone;

        // leader's commit share covers the exact prepared payload bytes
        if let Some(idx) = self.view.index_of(self.node_id) {
            let pk = self.signer.public_key_bytes();
            let own = self.signer.sign(&payload);
            let outcome = self.commit_pool.add(self.node_id, idx, &pk, &own, &payload);
            if !matches!(outcome, AddOutcome::Added(_)) {
                warn!("could not record own commit share: {:?}", outcome);
            }
        }

        self.fan_out(&prepared);
    }

    fn process_commit(&mut self, msg: ConsensusMessage) {
        let sender = msg.sender_id;
        let Some((idx, peer)) = self.view.peer_by_id(sender) else {
            debug!("commit from unknown validator {}", sender);
            self.drops.bump(DropReason::UnknownSender);
            return;
        };
        let pk = peer.pubkey;

        if let Err(e) = check_message(&msg, self.consensus_id, &self.block_hash, &pk) {
            debug!("failed to check commit from validator {}: {:?}", sender, e);
            self.drops.bump(e.into());
            return;
        }

        // commits are only collected once the prepare aggregate exists
        let Some(commit_msg) = self.prepared_payload() else {
            debug!("commit from validator {} before the prepare quorum", sender);
            self.drops.bump(DropReason::WrongPhase);
            return;
        };
        if self.state != RoundState::PreparedDone {
            debug!("commit from validator {} outside the collection window", sender);
            self.drops.bump(DropReason::WrongPhase);
            return;
        }

        let Some(sig) = BlsSignatureBytes::from_slice(&msg.payload) else {
            error!("malformed commit share from validator {}", sender);
            self.drops.bump(DropReason::BadPayloadSig);
            return;
        };

        match self.commit_pool.add(sender, idx, &pk, &sig, &commit_msg) {
            AddOutcome::Added(count) => {
                debug!(
                    "new commit share from validator {} ({}/{} toward quorum)",
                    sender,
                    count,
                    self.commit_pool.quorum()
                );
            }
            AddOutcome::Duplicate => {
                debug!("already received commit from validator {}", sender);
                self.drops.bump(DropReason::DuplicateSignature);
                return;
            }
            AddOutcome::QuorumAlreadyReached => {
                debug!("late commit from validator {}", sender);
                self.drops.bump(DropReason::QuorumAlreadyReached);
                return;
            }
            AddOutcome::Invalid => {
                error!("invalid commit share from validator {}", sender);
                self.drops.bump(DropReason::BadPayloadSig);
                return;
            }
        }

        if self.commit_pool.has_quorum() && self.state != RoundState::CommittedDone {
            self.finalize();
        }
    }

    /// Quorum-crossing action of the commit phase: broadcast COMMITTED,
    /// attach the four proof fields, publish and persist the block, then
    /// consume the consensus id and reset for the next round.
    fn finalize(&mut self) {
        let Some((agg_commit, commit_bitmap)) = self.commit_pool.aggregate() else {
            error!("commit pool empty at quorum; cannot aggregate");
            return;
        };
        info!(
            "commit quorum reached with {} shares (consensus_id={})",
            self.commit_pool.count(),
            self.consensus_id
        );

        let payload = multisig_payload(&agg_commit, &commit_bitmap);
        let committed = ConsensusMessage::new_signed(
            MsgKind::Committed,
            self.consensus_id,
            self.node_id,
            self.block_hash,
            payload,
            &self.signer,
        );
        self.agg_commit = Some((agg_commit, commit_bitmap));
        self.state = RoundState::CommittedDone;
        self.fan_out(&committed);

        match decode_block(&self.block) {
            Ok(mut block) => {
                if let (Some((psig, pbm)), Some((csig, cbm))) =
                    (self.agg_prepare.as_ref(), self.agg_commit.as_ref())
                {
                    block.header.prepare_signature = Some(*psig);
                    block.header.prepare_bitmap = pbm.clone();
                    block.header.commit_signature = Some(*csig);
                    block.header.commit_bitmap = cbm.clone();
                }

                // best-effort publish; a slow consumer must not stall the round
                match self.verified_tx.try_send(block.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        info!("verified-block queue full; dropping finalized block")
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        info!("verified-block queue closed; dropping finalized block")
                    }
                }

                if let Some(started) = self.round_started_at {
                    metrics::report_round(
                        &block,
                        &self.block_hash,
                        started.elapsed(),
                        self.view.len(),
                        self.consensus_id,
                    );
                }
                self.store.persist(&block, self.consensus_id);
                if let Some(cb) = self.on_consensus_done.as_mut() {
                    cb(&block);
                }
            }
            Err(e) => {
                // COMMITTED already went out; the committee finalizes without us
                // publishing locally
                error!("failed to decode block at finalization: {:?}", e);
            }
        }

        self.reset_state();
        self.consensus_id += 1;
        // reliable by contract: the feed side always keeps a reader alive
        if self.ready_tx.send(()).is_err() {
            warn!("ready-signal receiver gone; next round will not be requested");
        }
    }

    fn fan_out(&self, msg: &ConsensusMessage) -> usize {
        let wire = frame(MessageCategory::Committee, ACTION_CONSENSUS, &msg.encode());
        let recipients = self.view.broadcast_targets(self.node_id);
        self.net.broadcast(&recipients, &wire)
    }

    // --- test scaffolding ---

    /// Pin the hash under agreement without announcing (for testing).
    pub fn set_block_hash_for_test(&mut self, h: Hash) {
        self.block_hash = h;
    }

    /// Install an encoded candidate block and its hash (for testing).
    pub fn set_block_for_test(&mut self, block: &Block) {
        self.block = block_bytes(block).unwrap();
        self.block_hash = block_hash(block);
    }

    /// Drive the round straight into commit collection with only the
    /// leader's own shares present (for testing).
    pub fn force_prepared_for_test(&mut self) {
        let idx = self.view.index_of(self.node_id).unwrap();
        let pk = self.signer.public_key_bytes();
        let block_hash = self.block_hash;
        let own = self.signer.sign(&block_hash);
        self.prepare_pool.add(self.node_id, idx, &pk, &own, &block_hash);

        let (agg, bitmap) = self.prepare_pool.aggregate().unwrap();
        let payload = multisig_payload(&agg, &bitmap);
        self.agg_prepare = Some((agg, bitmap));
        self.state = RoundState::PreparedDone;
        self.round_started_at = Some(Instant::now());

        let own_commit = self.signer.sign(&payload);
        self.commit_pool.add(self.node_id, idx, &pk, &own_commit, &payload);
    }
}
