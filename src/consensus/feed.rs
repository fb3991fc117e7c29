// src/consensus/feed.rs
//
// The block-feed coordinator: one thread that takes candidate blocks off a
// queue and opens a round for each, gated on committee size and on the
// previous round having drained. A second small thread drains the inbound
// wire queue into the shared consensus state.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::consensus::{Consensus, RoundState};
use crate::crypto::bls::bitmap_from_bytes;
use crate::net::Broadcaster;
use crate::types::{is_epoch_block, Block};

/// How long to sleep between committee-size polls.
pub const WAIT_FOR_VALIDATORS: Duration = Duration::from_millis(1000);
/// How long to sleep while the previous round drains.
pub const ROUND_DRAIN_POLL: Duration = Duration::from_millis(500);
/// Granularity of the stop check while idle on the block queue.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// One pseudo-randomness bundle, consumed per epoch block. The seed and the
/// contributor mask are reserved for the randomness protocol; this core only
/// barriers on their arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PRndBundle {
    pub seed: [u8; 32],
    pub mask: Vec<u8>,
}

impl PRndBundle {
    /// Split a raw `seed || mask` wire blob.
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 32 {
            return None;
        }
        let seed: [u8; 32] = bytes[..32].try_into().unwrap();
        Some(Self { seed, mask: bytes[32..].to_vec() })
    }
}

fn stop_requested(stop_rx: &Receiver<()>) -> bool {
    // a dropped sender counts as a stop, mirroring a closed channel
    matches!(stop_rx.try_recv(), Ok(()) | Err(TryRecvError::Disconnected))
}

/// Spawn the feed coordinator. It terminates when `stop_rx`'s sender signals
/// or hangs up, and reports termination on `stopped_tx`.
pub fn spawn_block_feed<N>(
    shared: Arc<Mutex<Consensus<N>>>,
    block_rx: Receiver<Block>,
    prnd_rx: Receiver<PRndBundle>,
    stop_rx: Receiver<()>,
    stopped_tx: Sender<()>,
) -> thread::JoinHandle<()>
where
    N: Broadcaster + 'static,
{
    thread::spawn(move || {
        'outer: loop {
            let block = match block_rx.recv_timeout(IDLE_POLL) {
                Ok(b) => b,
                Err(RecvTimeoutError::Timeout) => {
                    if stop_requested(&stop_rx) {
                        break 'outer;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break 'outer,
            };
            debug!("feed received candidate block at height {}", block.header.height);

            // peers that went dark last round leave the committee now,
            // before bitmap indexing is fixed for the new round
            let epoch_len = {
                let mut c = shared.lock().unwrap();
                let removed = c.evict_offline_peers();
                if removed > 0 {
                    debug!("evicted {} offline peers", removed);
                }
                c.epoch_len()
            };

            // gate: the shard must hold enough validators to run a round
            loop {
                let (enough, n) = {
                    let c = shared.lock().unwrap();
                    (c.view.has_enough_validators(), c.view.len())
                };
                if enough {
                    break;
                }
                debug!("not enough validators to start a round ({} present)", n);
                if stop_requested(&stop_rx) {
                    break 'outer;
                }
                thread::sleep(WAIT_FOR_VALIDATORS);
            }

            // epoch boundary: barrier on one randomness bundle
            if is_epoch_block(block.header.height, epoch_len) {
                debug!("waiting for randomness bundle at epoch height {}", block.header.height);
                match prnd_rx.recv() {
                    Ok(bundle) => {
                        let n = shared.lock().unwrap().view.len();
                        if bitmap_from_bytes(&bundle.mask, n).is_none() {
                            warn!("randomness bundle mask does not fit a committee of {}", n);
                        }
                        info!("got randomness bundle (seed={})", hex::encode(bundle.seed));
                    }
                    Err(_) => break 'outer,
                }
            }

            // wait for the previous round to drain, abandoning it if stalled
            loop {
                if stop_requested(&stop_rx) {
                    break 'outer;
                }
                let mut c = shared.lock().unwrap();
                if c.check_round_timeout(Instant::now()) {
                    warn!("previous round abandoned as stalled");
                }
                if c.state() == RoundState::Finished {
                    c.reset_state();
                    c.start_consensus(&block);
                    break;
                }
                drop(c);
                thread::sleep(ROUND_DRAIN_POLL);
            }
        }
        let _ = stopped_tx.send(());
    })
}

/// Spawn the inbound dispatcher: drains framed wire messages into the shared
/// consensus state until the transport hangs up.
pub fn spawn_dispatcher<N>(
    shared: Arc<Mutex<Consensus<N>>>,
    inbox: Receiver<Vec<u8>>,
) -> thread::JoinHandle<()>
where
    N: Broadcaster + 'static,
{
    thread::spawn(move || {
        while let Ok(wire) = inbox.recv() {
            shared.lock().unwrap().handle_inbound(&wire);
        }
        debug!("inbound queue closed; dispatcher exiting");
    })
}
