// tests/block_feed.rs
//
// The feed coordinator: the minimum-validator gate, the epoch randomness
// barrier, stop/stopped signalling, and the inbound dispatcher.

use std::sync::mpsc::{channel, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use shard_fbft::codec::tx_bytes;
use shard_fbft::consensus::feed::{spawn_block_feed, spawn_dispatcher, PRndBundle};
use shard_fbft::consensus::{Consensus, ConsensusConfig, MemoryBlockStore, RoundState};
use shard_fbft::crypto::bls::BlsSigner;
use shard_fbft::crypto::{hash_bytes_sha256, txs_root};
use shard_fbft::membership::Peer;
use shard_fbft::message::{frame, ConsensusMessage, MessageCategory, MsgKind, ACTION_CONSENSUS};
use shard_fbft::net::Broadcaster;
use shard_fbft::types::{Block, BlockHeader, Transaction, ValidatorId};

#[derive(Clone, Default)]
struct RecordingNet {
    sent: Arc<Mutex<Vec<(ValidatorId, Vec<u8>)>>>,
}

impl RecordingNet {
    fn sends(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Broadcaster for RecordingNet {
    fn broadcast(&self, recipients: &[ValidatorId], wire: &[u8]) -> usize {
        let mut sent = self.sent.lock().unwrap();
        for id in recipients {
            sent.push((*id, wire.to_vec()));
        }
        recipients.len()
    }
}

fn committee(n: u32) -> (Vec<BlsSigner>, Vec<Peer>) {
    let signers: Vec<BlsSigner> =
        (0..n).map(|i| BlsSigner::from_sk_bytes(&[i as u8 + 1; 32]).unwrap()).collect();
    let peers = signers
        .iter()
        .enumerate()
        .map(|(i, s)| Peer { id: i as ValidatorId, pubkey: s.public_key_bytes() })
        .collect();
    (signers, peers)
}

fn new_shared_leader(
    n: u32,
    min_peers: usize,
    epoch_len: u64,
) -> (Arc<Mutex<Consensus<RecordingNet>>>, RecordingNet) {
    let (_signers, peers) = committee(n);
    let net = RecordingNet::default();
    let cfg = ConsensusConfig {
        shard_id: 0,
        node_id: 0,
        min_peers,
        epoch_len,
        phase_timeout: Duration::from_secs(10),
    };
    let (leader, _chans) =
        Consensus::new(cfg, &[1u8; 32], peers, net.clone(), Box::new(MemoryBlockStore::new()))
            .unwrap();
    (Arc::new(Mutex::new(leader)), net)
}

fn candidate_block(height: u64) -> Block {
    let txs = vec![Transaction::new("alice", "bob", 1, height)];
    let encodings: Vec<Vec<u8>> = txs.iter().map(|t| tx_bytes(t).unwrap()).collect();
    let root = txs_root(&encodings);
    Block::new(BlockHeader::new([0u8; 32], height, root, 1_700_000_000, 0), txs)
}

fn wait_for<F: FnMut() -> bool>(mut cond: F, budget: Duration) -> bool {
    let step = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while waited < budget {
        if cond() {
            return true;
        }
        thread::sleep(step);
        waited += step;
    }
    cond()
}

#[test]
fn feed_waits_for_enough_validators() {
    // committee of 3 against a minimum of 10: no round may start
    let (shared, net) = new_shared_leader(3, 10, 0);
    let (block_tx, block_rx) = sync_channel(4);
    let (_prnd_tx, prnd_rx) = sync_channel::<PRndBundle>(1);
    let (stop_tx, stop_rx) = channel();
    let (stopped_tx, stopped_rx) = channel();
    let handle = spawn_block_feed(shared.clone(), block_rx, prnd_rx, stop_rx, stopped_tx);

    block_tx.send(candidate_block(1)).unwrap();
    thread::sleep(Duration::from_millis(400));
    {
        let c = shared.lock().unwrap();
        assert_eq!(c.state(), RoundState::Finished);
        assert_eq!(c.consensus_id(), 0);
    }
    assert_eq!(net.sends(), 0);

    // grow the committee past the gate; the pending block then starts a round
    {
        let mut c = shared.lock().unwrap();
        for id in 3..10u32 {
            c.view.add_peer(Peer { id, pubkey: [id as u8; 48] }).unwrap();
        }
    }
    assert!(wait_for(
        || shared.lock().unwrap().state() == RoundState::AnnounceDone,
        Duration::from_secs(5),
    ));
    assert!(net.sends() > 0);

    stop_tx.send(()).unwrap();
    stopped_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    handle.join().unwrap();
}

#[test]
fn feed_barriers_on_randomness_at_epoch_heights() {
    let (shared, _net) = new_shared_leader(4, 4, 5);
    let (block_tx, block_rx) = sync_channel(4);
    let (prnd_tx, prnd_rx) = sync_channel::<PRndBundle>(1);
    let (stop_tx, stop_rx) = channel();
    let (stopped_tx, stopped_rx) = channel();
    let handle = spawn_block_feed(shared.clone(), block_rx, prnd_rx, stop_rx, stopped_tx);

    // height 5 is an epoch boundary with epoch_len = 5
    block_tx.send(candidate_block(5)).unwrap();
    thread::sleep(Duration::from_millis(400));
    assert_eq!(shared.lock().unwrap().state(), RoundState::Finished);

    // one seed-and-mask bundle releases the barrier (mask width = 4 slots)
    prnd_tx.send(PRndBundle { seed: [7u8; 32], mask: vec![0b0000_1110] }).unwrap();
    assert!(wait_for(
        || shared.lock().unwrap().state() == RoundState::AnnounceDone,
        Duration::from_secs(5),
    ));

    stop_tx.send(()).unwrap();
    stopped_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    handle.join().unwrap();
}

#[test]
fn dispatcher_drains_inbound_frames() {
    let (signers, peers) = committee(4);
    let net = RecordingNet::default();
    let cfg = ConsensusConfig {
        shard_id: 0,
        node_id: 0,
        min_peers: 4,
        epoch_len: 0,
        phase_timeout: Duration::from_secs(10),
    };
    let (mut leader, _chans) =
        Consensus::new(cfg, &[1u8; 32], peers, net, Box::new(MemoryBlockStore::new())).unwrap();
    let h = hash_bytes_sha256(b"test");
    leader.set_block_hash_for_test(h);
    let shared = Arc::new(Mutex::new(leader));

    let (inbox_tx, inbox_rx) = sync_channel(16);
    let handle = spawn_dispatcher(shared.clone(), inbox_rx);

    let share = signers[1].sign(&h);
    let msg = ConsensusMessage::new_signed(MsgKind::Prepare, 0, 1, h, share.0.to_vec(), &signers[1]);
    inbox_tx.send(frame(MessageCategory::Committee, ACTION_CONSENSUS, &msg.encode())).unwrap();

    assert!(wait_for(
        || shared.lock().unwrap().prepare_count() == 1,
        Duration::from_secs(2),
    ));

    // garbage frames are counted, never fatal
    inbox_tx.send(vec![0xde, 0xad, 0xbe, 0xef]).unwrap();
    assert!(wait_for(
        || shared.lock().unwrap().drops().malformed == 1,
        Duration::from_secs(2),
    ));

    drop(inbox_tx); // transport hangs up; the dispatcher exits
    handle.join().unwrap();
}

#[test]
fn dropping_the_stop_sender_terminates_the_feed() {
    let (shared, _net) = new_shared_leader(4, 4, 0);
    let (_block_tx, block_rx) = sync_channel::<Block>(1);
    let (_prnd_tx, prnd_rx) = sync_channel::<PRndBundle>(1);
    let (stop_tx, stop_rx) = channel::<()>();
    let (stopped_tx, stopped_rx) = channel();
    let handle = spawn_block_feed(shared, block_rx, prnd_rx, stop_rx, stopped_tx);

    drop(stop_tx);
    stopped_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    handle.join().unwrap();
}
