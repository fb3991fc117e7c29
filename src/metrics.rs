// src/metrics.rs
//
// Per-message drops are never surfaced to validators; they only show up
// here. The finalization report is the operator's TPS signal.

use std::time::Duration;

use tracing::info;

use crate::codec::tx_hash;
use crate::message::CheckError;
use crate::types::{Block, Hash};

/// Why an inbound message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    BadEnvelopeSig,
    WrongConsensusId,
    WrongBlockHash,
    UnknownSender,
    DuplicateSignature,
    QuorumAlreadyReached,
    BadPayloadSig,
    /// Commit outside its collection window (before the prepare aggregate).
    WrongPhase,
    /// A kind the leader does not consume (its own echoes included).
    UnexpectedKind,
    /// Frame or envelope that does not parse.
    Malformed,
}

impl From<CheckError> for DropReason {
    fn from(e: CheckError) -> Self {
        match e {
            CheckError::BadEnvelopeSig => DropReason::BadEnvelopeSig,
            CheckError::WrongConsensusId { .. } => DropReason::WrongConsensusId,
            CheckError::WrongBlockHash => DropReason::WrongBlockHash,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounters {
    pub bad_envelope_sig: u64,
    pub wrong_consensus_id: u64,
    pub wrong_block_hash: u64,
    pub unknown_sender: u64,
    pub duplicate_signature: u64,
    pub quorum_already_reached: u64,
    pub bad_payload_sig: u64,
    pub wrong_phase: u64,
    pub unexpected_kind: u64,
    pub malformed: u64,
}

impl DropCounters {
    pub fn bump(&mut self, reason: DropReason) {
        *self.slot(reason) += 1;
    }

    pub fn get(&self, reason: DropReason) -> u64 {
        let mut copy = *self;
        *copy.slot(reason)
    }

    pub fn total(&self) -> u64 {
        self.bad_envelope_sig
            + self.wrong_consensus_id
            + self.wrong_block_hash
            + self.unknown_sender
            + self.duplicate_signature
            + self.quorum_already_reached
            + self.bad_payload_sig
            + self.wrong_phase
            + self.unexpected_kind
            + self.malformed
    }

    fn slot(&mut self, reason: DropReason) -> &mut u64 {
        match reason {
            DropReason::BadEnvelopeSig => &mut self.bad_envelope_sig,
            DropReason::WrongConsensusId => &mut self.wrong_consensus_id,
            DropReason::WrongBlockHash => &mut self.wrong_block_hash,
            DropReason::UnknownSender => &mut self.unknown_sender,
            DropReason::DuplicateSignature => &mut self.duplicate_signature,
            DropReason::QuorumAlreadyReached => &mut self.quorum_already_reached,
            DropReason::BadPayloadSig => &mut self.bad_payload_sig,
            DropReason::WrongPhase => &mut self.wrong_phase,
            DropReason::UnexpectedKind => &mut self.unexpected_kind,
            DropReason::Malformed => &mut self.malformed,
        }
    }
}

/// Log the per-round throughput report at finalization. `elapsed` is measured
/// from the moment the round started, carried in the round state rather than
/// a global.
pub fn report_round(
    block: &Block,
    block_hash: &Hash,
    elapsed: Duration,
    node_count: usize,
    consensus_id: u32,
) {
    let num_txs = block.transactions.len();
    let secs = elapsed.as_secs_f64();
    let tps = if secs > 0.0 { num_txs as f64 / secs } else { 0.0 };

    // last few tx hashes, newest first, for spot-checks against the explorer
    let mut latest_tx_hashes: Vec<String> = Vec::new();
    for tx in block.transactions.iter().rev().take(3) {
        if let Ok(h) = tx_hash(tx) {
            latest_tx_hashes.push(hex::encode(h));
        }
    }

    info!(
        "tps report: consensus_id={} num_txs={} tps={:.2} latency_ms={} node_count={} block_hash={} latest_txs={:?}",
        consensus_id,
        num_txs,
        tps,
        elapsed.as_millis(),
        node_count,
        hex::encode(block_hash),
        latest_tx_hashes,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_reason() {
        let mut c = DropCounters::default();
        c.bump(DropReason::DuplicateSignature);
        c.bump(DropReason::DuplicateSignature);
        c.bump(DropReason::BadPayloadSig);
        assert_eq!(c.get(DropReason::DuplicateSignature), 2);
        assert_eq!(c.get(DropReason::BadPayloadSig), 1);
        assert_eq!(c.get(DropReason::UnknownSender), 0);
        assert_eq!(c.total(), 3);
    }
}
