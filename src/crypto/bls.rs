//! BLS helpers for the two-phase (prepare/commit) leader protocol.
//!
//! - Uses blst::min_pk (PK=48B G1, SIG=96B G2).
//! - Per-phase multi-signatures travel as compressed signature bytes plus a
//!   signer bitmap indexed by the committee's canonical key order.
//! - The leader aggregates collected partials in one shot at quorum via
//!   `AggregateSignature::aggregate_serialized`.
//! - Every signer of a phase MUST sign the same message bytes: the block hash
//!   in the prepare phase, the prepare multi-sig concatenated with its bitmap
//!   in the commit phase.

use blst::min_pk as mpk;
use blst::BLST_ERROR;
use bitvec::order::Lsb0;
use bitvec::vec::BitVec;
use serde_with::serde_as;

/// Domain separation tag for all consensus BLS signatures (<=255 bytes).
/// Change only with a network upgrade.
pub const BLS_DST: &[u8] = b"SHARD-FBFT-BLS-v1";

pub const PUBLIC_KEY_BYTES: usize = 48;
pub const SIGNATURE_BYTES: usize = 96;

/// Compressed BLS public key (min_pk: G1 = 48 bytes), canonical committee form.
pub type BlsPublicKeyBytes = [u8; PUBLIC_KEY_BYTES];

/// Compressed BLS signature bytes (min_pk: G2 = 96 bytes).
#[serde_as]
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlsSignatureBytes(#[serde_as(as = "[_; 96]")] pub [u8; SIGNATURE_BYTES]);

impl BlsSignatureBytes {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; SIGNATURE_BYTES] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

/// Signer participation mask. Bit *i* is set iff the validator at canonical
/// committee index *i* contributed. Little-endian bit order within each byte;
/// the wire form carries no length prefix (receivers know N).
pub type SignerBitmap = BitVec<u8, Lsb0>;

pub fn bitmap_for(n: usize) -> SignerBitmap {
    SignerBitmap::repeat(false, n)
}

pub fn bitmap_bytes(bitmap: &SignerBitmap) -> Vec<u8> {
    bitmap.as_raw_slice().to_vec()
}

/// Rebuild an N-slot bitmap from raw mask bytes. `None` if the byte count
/// does not match a width-N mask.
pub fn bitmap_from_bytes(bytes: &[u8], n: usize) -> Option<SignerBitmap> {
    if bytes.len() != n.div_ceil(8) {
        return None;
    }
    let mut bitmap = SignerBitmap::from_slice(bytes);
    bitmap.truncate(n);
    Some(bitmap)
}

/// Quorum threshold for a committee of `n` validators (leader included):
/// floor(2n/3) + 1 signers.
pub fn quorum_threshold(n: usize) -> usize {
    (2 * n) / 3 + 1
}

// -----------------------------------------------------------------------------
// Leader-side aggregation (not serialized)
// -----------------------------------------------------------------------------

/// Collects partial 96-byte signatures and builds a BLST aggregate at finalize().
#[derive(Clone, Debug, Default)]
pub struct BlsAggregate {
    sigs: Vec<[u8; SIGNATURE_BYTES]>,
}

impl BlsAggregate {
    pub fn new() -> Self {
        Self { sigs: Vec::new() }
    }

    pub fn push(&mut self, sig_bytes: &[u8; SIGNATURE_BYTES]) {
        self.sigs.push(*sig_bytes);
    }

    /// Finalize into a compressed aggregate suitable for a PREPARED/COMMITTED
    /// payload or a header proof field. `None` when empty or on bad partials.
    pub fn finalize(&self) -> Option<BlsSignatureBytes> {
        if self.sigs.is_empty() {
            return None;
        }
        let sig_refs: Vec<&[u8]> = self.sigs.iter().map(|s| &s[..]).collect();

        // Aggregate all serialized signatures at once (groupcheck true).
        let agg = match mpk::AggregateSignature::aggregate_serialized(&sig_refs, true).ok() {
            Some(a) => a,
            None => return None,
        };

        Some(BlsSignatureBytes(agg.to_signature().to_bytes()))
    }

    pub fn clear(&mut self) {
        self.sigs.clear();
    }

    pub fn len(&self) -> usize {
        self.sigs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sigs.is_empty()
    }
}

// -----------------------------------------------------------------------------
// Signer
// -----------------------------------------------------------------------------

/// BLS signer (keeps the secret key in memory). Used by the leader for its
/// own phase shares and envelope signatures; do NOT serialize or ship it.
#[derive(Clone)]
pub struct BlsSigner(mpk::SecretKey);

impl BlsSigner {
    /// Create from 32-byte secret key material.
    pub fn from_sk_bytes(sk: &[u8; 32]) -> Option<Self> {
        mpk::SecretKey::from_bytes(sk).map(Self).ok()
    }

    pub fn public_key_bytes(&self) -> BlsPublicKeyBytes {
        self.0.sk_to_pk().to_bytes()
    }

    /// Sign raw message bytes; blst hashes to the curve internally under
    /// `BLS_DST`, so callers pass canonical bytes, never a digest.
    pub fn sign(&self, msg: &[u8]) -> BlsSignatureBytes {
        let sig = self.0.sign(msg, BLS_DST, &[]);
        BlsSignatureBytes(sig.to_bytes())
    }
}

// -----------------------------------------------------------------------------
// Verification
// -----------------------------------------------------------------------------

/// Verify a single signature against one public key on `msg`.
/// False on any decode or pairing failure.
pub fn verify_sig(pk_bytes: &BlsPublicKeyBytes, msg: &[u8], sig: &BlsSignatureBytes) -> bool {
    let pk = match mpk::PublicKey::from_bytes(pk_bytes).ok() {
        Some(pk) => pk,
        None => return false,
    };
    let sig = match mpk::Signature::from_bytes(&sig.0).ok() {
        Some(sig) => sig,
        None => return false,
    };

    // verify(sig_groupcheck, msg, dst, aug, &pk, pk_validate)
    sig.verify(true, msg, BLS_DST, &[], &pk, true) == BLST_ERROR::BLST_SUCCESS
}

/// Verify an aggregated signature where all signers signed the SAME `msg`
/// (both phases of this protocol do).
pub fn fast_aggregate_verify(
    sig: &BlsSignatureBytes,
    msg: &[u8],
    signer_pks: &[BlsPublicKeyBytes],
) -> bool {
    let sig = match mpk::Signature::from_bytes(&sig.0).ok() {
        Some(sig) => sig,
        None => return false,
    };

    let mut pks = Vec::with_capacity(signer_pks.len());
    for pkb in signer_pks {
        match mpk::PublicKey::from_bytes(pkb).ok() {
            Some(pk) => pks.push(pk),
            None => return false,
        }
    }
    let pk_refs: Vec<&mpk::PublicKey> = pks.iter().collect();

    sig.fast_aggregate_verify(true, msg, BLS_DST, &pk_refs) == BLST_ERROR::BLST_SUCCESS
}

/// Collect the pubkeys of all signers set in `bitmap`, using `all_pks` as the
/// canonical committee order. `None` if the widths disagree.
pub fn collect_signer_pks_from_bitmap(
    all_pks: &[BlsPublicKeyBytes],
    bitmap: &SignerBitmap,
) -> Option<Vec<BlsPublicKeyBytes>> {
    if bitmap.len() != all_pks.len() {
        return None;
    }
    let mut out = Vec::with_capacity(bitmap.count_ones());
    for (i, bit) in bitmap.iter().by_vals().enumerate() {
        if bit {
            out.push(all_pks[i]);
        }
    }
    Some(out)
}

/// Verification errors for a phase multi-signature.
#[derive(Debug)]
pub enum MultiSigError {
    BitmapLength { bitmap: usize, pks: usize },
    EmptyBitmap,
    QuorumNotMet { have: usize, need: usize },
    PublicKeyDecode { index: usize },
    AggregateVerifyFailed,
}

/// Verify a phase multi-signature (aggregate + bitmap) over `msg` against the
/// committee's BLS pubkeys in canonical index order.
pub fn verify_multisig(
    msg: &[u8],
    agg_sig: &BlsSignatureBytes,
    bitmap: &SignerBitmap,
    all_pks: &[BlsPublicKeyBytes],
) -> Result<(), MultiSigError> {
    if bitmap.len() != all_pks.len() {
        return Err(MultiSigError::BitmapLength { bitmap: bitmap.len(), pks: all_pks.len() });
    }

    let signers = bitmap.count_ones();
    if signers == 0 {
        return Err(MultiSigError::EmptyBitmap);
    }
    let need = quorum_threshold(all_pks.len());
    if signers < need {
        return Err(MultiSigError::QuorumNotMet { have: signers, need });
    }

    // Validate key bytes early so the error names the offending index.
    let mut signer_pks: Vec<BlsPublicKeyBytes> = Vec::with_capacity(signers);
    for (i, bit) in bitmap.iter().by_vals().enumerate() {
        if bit {
            if mpk::PublicKey::from_bytes(&all_pks[i]).ok().is_none() {
                return Err(MultiSigError::PublicKeyDecode { index: i });
            }
            signer_pks.push(all_pks[i]);
        }
    }

    if !fast_aggregate_verify(agg_sig, msg, &signer_pks) {
        return Err(MultiSigError::AggregateVerifyFailed);
    }
    Ok(())
}
