// src/membership.rs
//
// The leader's view of the shard committee. The order of `peers` is the
// canonical committee order: it defines bitmap indexing and must be identical
// on every validator.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};

use crate::crypto::bls::BlsPublicKeyBytes;
use crate::types::ValidatorId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: ValidatorId,
    pub pubkey: BlsPublicKeyBytes,
}

#[derive(Debug, Clone)]
pub struct ValidatorView {
    peers: Vec<Peer>,
    /// id -> canonical index, rebuilt on every membership change.
    by_id: HashMap<ValidatorId, usize>,
    /// Peers excluded from broadcasts and evicted before the next round.
    offline: HashSet<ValidatorId>,
    min_peers: usize,
}

impl ValidatorView {
    /// Build a view from the committee in canonical order. Ids must be unique.
    pub fn new(peers: Vec<Peer>, min_peers: usize) -> Result<Self> {
        let mut by_id = HashMap::with_capacity(peers.len());
        for (idx, p) in peers.iter().enumerate() {
            if by_id.insert(p.id, idx).is_some() {
                bail!("duplicate validator id {} in committee", p.id);
            }
        }
        Ok(Self { peers, by_id, offline: HashSet::new(), min_peers })
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn min_peers(&self) -> usize {
        self.min_peers
    }

    /// Whether the shard holds enough validators to run a round.
    pub fn has_enough_validators(&self) -> bool {
        self.peers.len() >= self.min_peers
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn peer_by_id(&self, id: ValidatorId) -> Option<(usize, &Peer)> {
        let idx = *self.by_id.get(&id)?;
        Some((idx, &self.peers[idx]))
    }

    pub fn index_of(&self, id: ValidatorId) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    /// Committee public keys in canonical order (bitmap order).
    pub fn pubkeys(&self) -> Vec<BlsPublicKeyBytes> {
        self.peers.iter().map(|p| p.pubkey).collect()
    }

    /// Append a newly joined validator at the end of the canonical order.
    pub fn add_peer(&mut self, peer: Peer) -> Result<()> {
        if self.by_id.contains_key(&peer.id) {
            bail!("validator id {} already in committee", peer.id);
        }
        self.by_id.insert(peer.id, self.peers.len());
        self.peers.push(peer);
        Ok(())
    }

    pub fn mark_offline(&mut self, id: ValidatorId) {
        self.offline.insert(id);
    }

    pub fn is_offline(&self, id: ValidatorId) -> bool {
        self.offline.contains(&id)
    }

    pub fn offline_peers(&self) -> Vec<ValidatorId> {
        self.offline.iter().copied().collect()
    }

    /// Remove the given validators from the committee; returns how many were
    /// actually present. Only call between rounds: indices shift.
    pub fn remove_peers(&mut self, ids: &[ValidatorId]) -> usize {
        let doomed: HashSet<ValidatorId> = ids.iter().copied().collect();
        let before = self.peers.len();
        self.peers.retain(|p| !doomed.contains(&p.id));
        let removed = before - self.peers.len();
        if removed > 0 {
            self.reindex();
        }
        for id in ids {
            self.offline.remove(id);
        }
        removed
    }

    /// Broadcast recipients: every peer that is neither offline nor `me`.
    pub fn broadcast_targets(&self, me: ValidatorId) -> Vec<ValidatorId> {
        self.peers
            .iter()
            .filter(|p| p.id != me && !self.offline.contains(&p.id))
            .map(|p| p.id)
            .collect()
    }

    fn reindex(&mut self) {
        self.by_id.clear();
        for (idx, p) in self.peers.iter().enumerate() {
            self.by_id.insert(p.id, idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: ValidatorId) -> Peer {
        Peer { id, pubkey: [id as u8; 48] }
    }

    fn view(n: u32, min_peers: usize) -> ValidatorView {
        ValidatorView::new((0..n).map(peer).collect(), min_peers).unwrap()
    }

    #[test]
    fn rejects_duplicate_ids() {
        assert!(ValidatorView::new(vec![peer(1), peer(1)], 1).is_err());
    }

    #[test]
    fn min_peer_gate() {
        let mut v = view(3, 4);
        assert!(!v.has_enough_validators());
        v.add_peer(peer(9)).unwrap();
        assert!(v.has_enough_validators());
    }

    #[test]
    fn eviction_reindexes_the_committee() {
        let mut v = view(5, 1);
        assert_eq!(v.index_of(4), Some(4));
        assert_eq!(v.remove_peers(&[1, 3, 77]), 2);
        assert_eq!(v.len(), 3);
        assert_eq!(v.index_of(4), Some(2));
        assert_eq!(v.peer_by_id(1), None);
    }

    #[test]
    fn offline_peers_are_skipped_by_broadcast() {
        let mut v = view(4, 1);
        v.mark_offline(2);
        assert_eq!(v.broadcast_targets(0), vec![1, 3]);
        // eviction consumes the offline mark
        v.remove_peers(&[2]);
        assert!(!v.is_offline(2));
    }
}
