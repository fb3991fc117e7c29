//src/crypto.rs

use sha2::{Digest, Sha256};
use crate::types::Hash;

pub mod bls;

const TXS_ROOT_DOMAIN: &[u8] = b"SHARD_FBFT_TXS_V1";

pub fn hash_bytes_sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    result.into()
}

/// Digest over the ordered transaction encodings of a block body.
pub fn txs_root(tx_encodings: &[Vec<u8>]) -> Hash {
    let mut buf = Vec::with_capacity(TXS_ROOT_DOMAIN.len() + tx_encodings.len() * 32);
    buf.extend_from_slice(TXS_ROOT_DOMAIN);
    for enc in tx_encodings {
        buf.extend_from_slice(&hash_bytes_sha256(enc));
    }
    hash_bytes_sha256(&buf)
}
