// src/net.rs
//
// Outbound side of the transport seam. The leader only ever needs one
// capability: fan a framed message out to the current recipients. Two wire
// strategies exist in deployments, so the capability is a trait and the mode
// is picked at construction time:
//
//   - DirectNetwork: one unicast per recipient (per-validator outboxes)
//   - GossipNetwork: a single publish on the shard's group channel
//
// Inbound delivery is a plain channel of framed bytes drained by the
// dispatcher thread; the transport behind it is out of scope here.

use std::collections::HashMap;
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::types::ValidatorId;

/// Outbox depth per peer / group channel. Sends are best-effort: a slow peer
/// loses messages rather than stalling the round.
pub const OUTBOX_CAPACITY: usize = 1024;

pub trait Broadcaster: Send {
    /// Deliver `wire` to every validator in `recipients` (or to the group
    /// channel, in gossip mode). Returns the number of transport sends made.
    fn broadcast(&self, recipients: &[ValidatorId], wire: &[u8]) -> usize;
}

/// Unicast fan-out over per-validator outboxes.
#[derive(Clone, Default)]
pub struct DirectNetwork {
    outboxes: Arc<Mutex<HashMap<ValidatorId, SyncSender<Vec<u8>>>>>,
}

impl DirectNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a validator's inbound queue.
    pub fn register(&self, id: ValidatorId, tx: SyncSender<Vec<u8>>) {
        self.outboxes.lock().unwrap().insert(id, tx);
    }

    pub fn unregister(&self, id: ValidatorId) {
        self.outboxes.lock().unwrap().remove(&id);
    }
}

impl Broadcaster for DirectNetwork {
    fn broadcast(&self, recipients: &[ValidatorId], wire: &[u8]) -> usize {
        let outboxes = self.outboxes.lock().unwrap();
        let mut sent = 0;
        for id in recipients {
            let Some(tx) = outboxes.get(id) else {
                warn!("no outbox for validator {}", id);
                continue;
            };
            match tx.try_send(wire.to_vec()) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("outbox full for validator {}; dropping message", id)
                }
                Err(TrySendError::Disconnected(_)) => {
                    warn!("validator {} hung up; dropping message", id)
                }
            }
        }
        sent
    }
}

/// Single publish on the shard's group channel; subscribers fan out below
/// this seam.
#[derive(Clone)]
pub struct GossipNetwork {
    group_tx: SyncSender<Vec<u8>>,
}

impl GossipNetwork {
    pub fn new(group_tx: SyncSender<Vec<u8>>) -> Self {
        Self { group_tx }
    }
}

impl Broadcaster for GossipNetwork {
    fn broadcast(&self, _recipients: &[ValidatorId], wire: &[u8]) -> usize {
        match self.group_tx.try_send(wire.to_vec()) {
            Ok(()) => 1,
            Err(TrySendError::Full(_)) => {
                warn!("group channel full; dropping message");
                0
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("group channel closed; dropping message");
                0
            }
        }
    }
}
