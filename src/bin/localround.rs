// src/bin/localround.rs
//
// Dev harness: one leader plus three in-process validators running full
// rounds over channel-backed transport. Each validator answers ANNOUNCE with
// a PREPARE and PREPARED with a COMMIT, so blocks finalize at wire speed.

use std::sync::mpsc::{channel, sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use shard_fbft::codec::{block_hash, decode_block, tx_bytes};
use shard_fbft::consensus::feed::{spawn_block_feed, spawn_dispatcher};
use shard_fbft::consensus::{Consensus, ConsensusConfig, MemoryBlockStore};
use shard_fbft::crypto::bls::BlsSigner;
use shard_fbft::crypto::txs_root;
use shard_fbft::membership::Peer;
use shard_fbft::message::{
    frame, split_multisig_payload, unframe_consensus, ConsensusMessage, MessageCategory, MsgKind,
    ACTION_CONSENSUS,
};
use shard_fbft::net::{DirectNetwork, OUTBOX_CAPACITY};
use shard_fbft::types::{Block, BlockHeader, Hash, Transaction, ValidatorId};

const SHARD: u32 = 0;
const LEADER_ID: ValidatorId = 0;
const NUM_VALIDATORS: u32 = 3;
const NUM_BLOCKS: u64 = 3;

fn send_to_leader(leader_inbox: &SyncSender<Vec<u8>>, msg: &ConsensusMessage) {
    let wire = frame(MessageCategory::Committee, ACTION_CONSENSUS, &msg.encode());
    let _ = leader_inbox.try_send(wire);
}

/// A validator that follows the leader: prepare on announce, commit on the
/// prepare aggregate.
fn run_validator(
    id: ValidatorId,
    signer: BlsSigner,
    inbox: Receiver<Vec<u8>>,
    leader_inbox: SyncSender<Vec<u8>>,
) {
    while let Ok(framed) = inbox.recv() {
        let Ok(envelope) = unframe_consensus(&framed) else { continue };
        let Ok(msg) = ConsensusMessage::decode(envelope) else { continue };
        match msg.kind {
            MsgKind::Announce => {
                let Ok(block) = decode_block(&msg.payload) else { continue };
                if block_hash(&block) != msg.block_hash {
                    continue;
                }
                let share = signer.sign(&msg.block_hash);
                let prepare = ConsensusMessage::new_signed(
                    MsgKind::Prepare,
                    msg.consensus_id,
                    id,
                    msg.block_hash,
                    share.0.to_vec(),
                    &signer,
                );
                send_to_leader(&leader_inbox, &prepare);
            }
            MsgKind::Prepared => {
                if split_multisig_payload(&msg.payload).is_none() {
                    continue;
                }
                // commit share covers the prepared payload bytes verbatim
                let share = signer.sign(&msg.payload);
                let commit = ConsensusMessage::new_signed(
                    MsgKind::Commit,
                    msg.consensus_id,
                    id,
                    msg.block_hash,
                    share.0.to_vec(),
                    &signer,
                );
                send_to_leader(&leader_inbox, &commit);
            }
            MsgKind::Committed => {
                println!("validator {} saw block {} committed", id, hex::encode(msg.block_hash));
            }
            _ => {}
        }
    }
}

fn candidate_block(height: u64, parent: Hash) -> Block {
    let txs = vec![
        Transaction::new("alice", "bob", height * 10, height),
        Transaction::new("bob", "carol", height * 3, height),
    ];
    let encodings: Vec<Vec<u8>> = txs.iter().map(|t| tx_bytes(t).unwrap()).collect();
    let root = txs_root(&encodings);
    Block::new(BlockHeader::new(parent, height, root, 1_700_000_000 + height, SHARD), txs)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // committee keys: leader is id 0, validators 1..=3
    let signers: Vec<BlsSigner> = (0..=NUM_VALIDATORS)
        .map(|i| BlsSigner::from_sk_bytes(&[i as u8 + 1; 32]).unwrap())
        .collect();
    let committee: Vec<Peer> = signers
        .iter()
        .enumerate()
        .map(|(i, s)| Peer { id: i as ValidatorId, pubkey: s.public_key_bytes() })
        .collect();

    let net = DirectNetwork::new();
    let store = MemoryBlockStore::new();
    let cfg = ConsensusConfig {
        shard_id: SHARD,
        node_id: LEADER_ID,
        min_peers: committee.len(),
        epoch_len: 0,
        phase_timeout: Duration::from_secs(10),
    };
    let (consensus, chans) =
        Consensus::new(cfg, &[1u8; 32], committee, net.clone(), Box::new(store.clone()))?;
    let shared = Arc::new(Mutex::new(consensus));

    // leader inbound wire queue
    let (leader_inbox_tx, leader_inbox_rx) = sync_channel::<Vec<u8>>(OUTBOX_CAPACITY);
    spawn_dispatcher(shared.clone(), leader_inbox_rx);

    // validators on their own threads
    for i in 1..=NUM_VALIDATORS {
        let (tx, rx) = sync_channel::<Vec<u8>>(OUTBOX_CAPACITY);
        net.register(i, tx);
        let signer = signers[i as usize].clone();
        let to_leader = leader_inbox_tx.clone();
        thread::spawn(move || run_validator(i, signer, rx, to_leader));
    }

    // feed coordinator
    let (block_tx, block_rx) = sync_channel::<Block>(8);
    let (_prnd_tx, prnd_rx) = sync_channel(1);
    let (stop_tx, stop_rx) = channel();
    let (stopped_tx, stopped_rx) = channel();
    spawn_block_feed(shared.clone(), block_rx, prnd_rx, stop_rx, stopped_tx);

    // drive a few blocks through, chaining on the finalized hash
    let mut parent: Hash = [0u8; 32];
    for height in 1..=NUM_BLOCKS {
        let block = candidate_block(height, parent);
        block_tx.send(block)?;
        let finalized = chans.verified_rx.recv_timeout(Duration::from_secs(5))?;
        parent = block_hash(&finalized);
        println!(
            "height {} finalized: {} prepare signers, {} commit signers",
            finalized.header.height,
            finalized.header.prepare_bitmap.count_ones(),
            finalized.header.commit_bitmap.count_ones(),
        );
        chans.ready_rx.recv_timeout(Duration::from_secs(5))?;
    }

    stop_tx.send(())?;
    stopped_rx.recv_timeout(Duration::from_secs(5))?;
    println!("persisted {} blocks", store.blocks().len());
    Ok(())
}
