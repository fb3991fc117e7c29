// src/types.rs

use crate::crypto::bls::{BlsSignatureBytes, SignerBitmap};

pub type Hash = [u8; 32];

/// Identifier of a validator within the shard committee. The leader is a
/// validator like any other and owns one of these ids.
pub type ValidatorId = u32;

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub from: String,
    pub to: String,
    pub amount: u64,
    pub nonce: u64,
}

impl Transaction {
    pub fn new(from: impl Into<String>, to: impl Into<String>, amount: u64, nonce: u64) -> Self {
        Self { from: from.into(), to: to.into(), amount, nonce }
    }
}

/// Header of a candidate block. The four proof fields stay empty while the
/// block is under agreement; the leader fills them at finalization.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockHeader {
    pub parent_hash: Hash,
    pub height: u64,
    pub txs_root: Hash,
    pub timestamp: u64,
    pub shard_id: u32,
    /// Aggregated prepare-phase multi-signature.
    pub prepare_signature: Option<BlsSignatureBytes>,
    /// Which validators (by committee index) contributed a prepare signature.
    pub prepare_bitmap: SignerBitmap,
    /// Aggregated commit-phase multi-signature.
    pub commit_signature: Option<BlsSignatureBytes>,
    pub commit_bitmap: SignerBitmap,
}

impl BlockHeader {
    pub fn new(parent_hash: Hash, height: u64, txs_root: Hash, timestamp: u64, shard_id: u32) -> Self {
        Self {
            parent_hash,
            height,
            txs_root,
            timestamp,
            shard_id,
            prepare_signature: None,
            prepare_bitmap: SignerBitmap::new(),
            commit_signature: None,
            commit_bitmap: SignerBitmap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: impl Into<Vec<Transaction>>) -> Self {
        Self { header, transactions: transactions.into() }
    }
}

/// True when `height` sits on an epoch boundary and the round must consume a
/// fresh randomness bundle before starting. `epoch_len == 0` disables epochs.
pub fn is_epoch_block(height: u64, epoch_len: u64) -> bool {
    epoch_len > 0 && height % epoch_len == 0
}
