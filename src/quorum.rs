// src/quorum.rs
//
// Per-phase signature pool: individually verified BLS shares keyed by
// validator id, plus the participation bitmap in canonical committee order.
// One pool per phase; both are torn down on round reset.

use std::collections::HashMap;

use crate::crypto::bls::{
    bitmap_for, quorum_threshold, verify_sig, BlsAggregate, BlsPublicKeyBytes, BlsSignatureBytes,
    SignerBitmap,
};
use crate::types::ValidatorId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Inserted; carries the new share count.
    Added(usize),
    /// This validator id already contributed to the phase.
    Duplicate,
    /// The phase already holds a quorum; late shares are not accepted.
    QuorumAlreadyReached,
    /// Bad committee index or a share that fails BLS verification.
    Invalid,
}

#[derive(Debug, Clone)]
pub struct SigPool {
    sigs: HashMap<ValidatorId, BlsSignatureBytes>,
    bitmap: SignerBitmap,
    quorum: usize,
}

/// BLS verification of one share; false on any decode or pairing failure.
pub fn verify_individual(pk: &BlsPublicKeyBytes, sig: &BlsSignatureBytes, msg: &[u8]) -> bool {
    verify_sig(pk, msg, sig)
}

impl SigPool {
    /// Empty pool for a committee of `n` validators, leader included.
    pub fn new(n: usize) -> Self {
        Self { sigs: HashMap::new(), bitmap: bitmap_for(n), quorum: quorum_threshold(n) }
    }

    /// Verify and insert one share. Duplicate and late checks run before the
    /// (expensive) pairing so replays never cost a verification.
    pub fn add(
        &mut self,
        id: ValidatorId,
        index: usize,
        pk: &BlsPublicKeyBytes,
        sig: &BlsSignatureBytes,
        msg: &[u8],
    ) -> AddOutcome {
        if self.sigs.contains_key(&id) {
            return AddOutcome::Duplicate;
        }
        if self.sigs.len() >= self.quorum {
            return AddOutcome::QuorumAlreadyReached;
        }
        if index >= self.bitmap.len() || !verify_individual(pk, sig, msg) {
            return AddOutcome::Invalid;
        }
        self.sigs.insert(id, *sig);
        self.bitmap.set(index, true);
        AddOutcome::Added(self.sigs.len())
    }

    pub fn contains(&self, id: ValidatorId) -> bool {
        self.sigs.contains_key(&id)
    }

    pub fn count(&self) -> usize {
        self.sigs.len()
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn has_quorum(&self) -> bool {
        self.sigs.len() >= self.quorum
    }

    pub fn bitmap(&self) -> &SignerBitmap {
        &self.bitmap
    }

    /// Aggregate everything collected so far into one multi-signature plus a
    /// copy of the participation mask. `None` while empty.
    pub fn aggregate(&self) -> Option<(BlsSignatureBytes, SignerBitmap)> {
        let mut agg = BlsAggregate::new();
        for sig in self.sigs.values() {
            agg.push(&sig.0);
        }
        agg.finalize().map(|a| (a, self.bitmap.clone()))
    }

    /// Clear shares and resize the mask for the (possibly changed) committee.
    pub fn reset(&mut self, n: usize) {
        self.sigs.clear();
        self.bitmap = bitmap_for(n);
        self.quorum = quorum_threshold(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::bls::{fast_aggregate_verify, BlsSigner};

    fn committee(n: usize) -> (Vec<BlsSigner>, Vec<BlsPublicKeyBytes>) {
        let signers: Vec<BlsSigner> =
            (0..n).map(|i| BlsSigner::from_sk_bytes(&[i as u8 + 1; 32]).unwrap()).collect();
        let pks = signers.iter().map(|s| s.public_key_bytes()).collect();
        (signers, pks)
    }

    #[test]
    fn threshold_matches_committee_size() {
        assert_eq!(SigPool::new(4).quorum(), 3);
        assert_eq!(SigPool::new(3).quorum(), 3);
        assert_eq!(SigPool::new(10).quorum(), 7);
    }

    #[test]
    fn duplicate_then_late_then_invalid() {
        let (signers, pks) = committee(4);
        let msg = b"block hash stand-in";
        let mut pool = SigPool::new(4);

        assert_eq!(pool.add(0, 0, &pks[0], &signers[0].sign(msg), msg), AddOutcome::Added(1));
        assert_eq!(pool.add(0, 0, &pks[0], &signers[0].sign(msg), msg), AddOutcome::Duplicate);

        // a share by the wrong key is rejected without touching state
        assert_eq!(pool.add(1, 1, &pks[1], &signers[2].sign(msg), msg), AddOutcome::Invalid);
        assert_eq!(pool.count(), 1);

        assert_eq!(pool.add(1, 1, &pks[1], &signers[1].sign(msg), msg), AddOutcome::Added(2));
        assert_eq!(pool.add(2, 2, &pks[2], &signers[2].sign(msg), msg), AddOutcome::Added(3));
        assert!(pool.has_quorum());

        // quorum refuses further shares before verifying them
        assert_eq!(
            pool.add(3, 3, &pks[3], &signers[3].sign(msg), msg),
            AddOutcome::QuorumAlreadyReached
        );
        assert_eq!(pool.count(), 3);
    }

    #[test]
    fn aggregate_verifies_under_bitmap_keys() {
        let (signers, pks) = committee(5);
        let msg = b"same message for every signer";
        let mut pool = SigPool::new(5);
        for i in [4usize, 0, 2, 1] {
            pool.add(i as ValidatorId, i, &pks[i], &signers[i].sign(msg), msg);
        }
        let (agg, bitmap) = pool.aggregate().unwrap();
        let signer_pks: Vec<_> =
            bitmap.iter_ones().map(|i| pks[i]).collect();
        assert_eq!(signer_pks.len(), 4);
        assert!(fast_aggregate_verify(&agg, msg, &signer_pks));
    }

    #[test]
    fn reset_clears_and_resizes() {
        let (signers, pks) = committee(4);
        let msg = b"m";
        let mut pool = SigPool::new(4);
        pool.add(0, 0, &pks[0], &signers[0].sign(msg), msg);
        pool.reset(7);
        assert_eq!(pool.count(), 0);
        assert_eq!(pool.bitmap().count_ones(), 0);
        assert_eq!(pool.bitmap().len(), 7);
        assert_eq!(pool.quorum(), 5);
    }
}
