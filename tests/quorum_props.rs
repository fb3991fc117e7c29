// tests/quorum_props.rs
//
// Property test: the per-phase pool keeps count, bitmap and quorum cap in
// lockstep under arbitrary arrival orders, replays and corrupt shares, and
// whatever it aggregates verifies under exactly the bitmap's keys.
// Run: `cargo test --test quorum_props`

use proptest::prelude::*;

use shard_fbft::crypto::bls::{verify_multisig, BlsPublicKeyBytes, BlsSigner};
use shard_fbft::quorum::{AddOutcome, SigPool};
use shard_fbft::types::ValidatorId;

fn committee(n: usize) -> (Vec<BlsSigner>, Vec<BlsPublicKeyBytes>) {
    let signers: Vec<BlsSigner> =
        (0..n).map(|i| BlsSigner::from_sk_bytes(&[i as u8 + 1; 32]).unwrap()).collect();
    let pks = signers.iter().map(|s| s.public_key_bytes()).collect();
    (signers, pks)
}

proptest! {
    // BLS pairings are slow; a handful of cases already walks many interleavings
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn pool_invariants_hold_for_any_arrival_order(
        n in 4usize..8,
        events in prop::collection::vec((0usize..8, prop::bool::weighted(0.8)), 1..20),
    ) {
        let (signers, pks) = committee(n);
        let msg = b"one message per phase";
        let mut pool = SigPool::new(n);

        for (who, honest) in events {
            let i = who % n;
            // a dishonest share is signed by a neighbouring key
            let sig = if honest { signers[i].sign(msg) } else { signers[(i + 1) % n].sign(msg) };
            let before = pool.count();
            let outcome = pool.add(i as ValidatorId, i, &pks[i], &sig, msg);

            prop_assert_eq!(pool.count(), pool.bitmap().count_ones());
            prop_assert!(pool.count() <= pool.quorum());
            match outcome {
                AddOutcome::Added(c) => prop_assert_eq!(c, before + 1),
                _ => prop_assert_eq!(pool.count(), before),
            }
        }

        if pool.has_quorum() {
            let (agg, bitmap) = pool.aggregate().unwrap();
            prop_assert!(verify_multisig(msg, &agg, &bitmap, &pks).is_ok());
        }
    }
}
