// src/message.rs
//
// The five-phase consensus envelope and its transport framing.
//
// Wire layout of an envelope:
//   kind          u8   { ANNOUNCE=1, PREPARE=2, PREPARED=3, COMMIT=4, COMMITTED=5 }
//   consensus_id  u32 LE
//   sender_id     u32 LE
//   block_hash    32 bytes
//   payload       u32 LE length + bytes
//   signature     96 bytes, BLS over (kind || consensus_id || sender_id || block_hash || payload)
//
// The envelope signature authenticates the sender; it is distinct from the
// payload, which in the prepare/commit phases is itself a BLS share.

use crate::codec::{put_bytes, put_u32, DecodeError};
use crate::crypto::bls::{
    bitmap_bytes, verify_sig, BlsPublicKeyBytes, BlsSignatureBytes, BlsSigner, SignerBitmap,
    SIGNATURE_BYTES,
};
use crate::types::{Hash, ValidatorId};

/// Byte prefix every p2p frame carries before the envelope: one category
/// byte, one action byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageCategory {
    Committee = 0x00,
    Node = 0x01,
}

pub const ACTION_CONSENSUS: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MsgKind {
    Announce = 1,
    Prepare = 2,
    Prepared = 3,
    Commit = 4,
    Committed = 5,
}

impl MsgKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(MsgKind::Announce),
            2 => Some(MsgKind::Prepare),
            3 => Some(MsgKind::Prepared),
            4 => Some(MsgKind::Commit),
            5 => Some(MsgKind::Committed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusMessage {
    pub kind: MsgKind,
    pub consensus_id: u32,
    pub sender_id: ValidatorId,
    pub block_hash: Hash,
    pub payload: Vec<u8>,
    pub signature: BlsSignatureBytes,
}

/// Envelope authentication failures. Failing messages are dropped silently
/// and only counted in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    BadEnvelopeSig,
    WrongConsensusId { got: u32, want: u32 },
    WrongBlockHash,
}

impl ConsensusMessage {
    /// Build an envelope and sign it with the sender's key.
    pub fn new_signed(
        kind: MsgKind,
        consensus_id: u32,
        sender_id: ValidatorId,
        block_hash: Hash,
        payload: Vec<u8>,
        signer: &BlsSigner,
    ) -> Self {
        let preimage = signing_bytes(kind, consensus_id, sender_id, &block_hash, &payload);
        let signature = signer.sign(&preimage);
        Self { kind, consensus_id, sender_id, block_hash, payload, signature }
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        signing_bytes(self.kind, self.consensus_id, self.sender_id, &self.block_hash, &self.payload)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(1 + 4 + 4 + 32 + 4 + self.payload.len() + SIGNATURE_BYTES);
        v.push(self.kind as u8);
        put_u32(&mut v, self.consensus_id);
        put_u32(&mut v, self.sender_id);
        v.extend_from_slice(&self.block_hash);
        put_bytes(&mut v, &self.payload);
        v.extend_from_slice(&self.signature.0);
        v
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        // fixed prefix + empty payload + signature is the minimum
        const MIN: usize = 1 + 4 + 4 + 32 + 4 + SIGNATURE_BYTES;
        if bytes.len() < MIN {
            return Err(DecodeError::Truncated);
        }
        let kind = MsgKind::from_u8(bytes[0]).ok_or(DecodeError::BadDomain)?;
        let consensus_id = u32::from_le_bytes(bytes[1..5].try_into().unwrap());
        let sender_id = u32::from_le_bytes(bytes[5..9].try_into().unwrap());
        let block_hash: Hash = bytes[9..41].try_into().unwrap();
        let payload_len = u32::from_le_bytes(bytes[41..45].try_into().unwrap()) as usize;
        if bytes.len() != MIN + payload_len {
            return Err(DecodeError::Truncated);
        }
        let payload = bytes[45..45 + payload_len].to_vec();
        let sig: [u8; SIGNATURE_BYTES] = bytes[45 + payload_len..].try_into().unwrap();
        Ok(Self {
            kind,
            consensus_id,
            sender_id,
            block_hash,
            payload,
            signature: BlsSignatureBytes(sig),
        })
    }

    pub fn verify_envelope(&self, sender_pk: &BlsPublicKeyBytes) -> bool {
        verify_sig(sender_pk, &self.signing_bytes(), &self.signature)
    }
}

fn signing_bytes(
    kind: MsgKind,
    consensus_id: u32,
    sender_id: ValidatorId,
    block_hash: &Hash,
    payload: &[u8],
) -> Vec<u8> {
    let mut v = Vec::with_capacity(1 + 4 + 4 + 32 + payload.len());
    v.push(kind as u8);
    put_u32(&mut v, consensus_id);
    put_u32(&mut v, sender_id);
    v.extend_from_slice(block_hash);
    v.extend_from_slice(payload);
    v
}

/// Authenticate an inbound envelope against the current round. The caller has
/// already resolved the sender's public key; an unknown sender never reaches
/// this point.
pub fn check_message(
    msg: &ConsensusMessage,
    current_consensus_id: u32,
    current_block_hash: &Hash,
    sender_pk: &BlsPublicKeyBytes,
) -> Result<(), CheckError> {
    if !msg.verify_envelope(sender_pk) {
        return Err(CheckError::BadEnvelopeSig);
    }
    if msg.consensus_id != current_consensus_id {
        return Err(CheckError::WrongConsensusId { got: msg.consensus_id, want: current_consensus_id });
    }
    if msg.block_hash != *current_block_hash {
        return Err(CheckError::WrongBlockHash);
    }
    Ok(())
}

/// Payload carried by PREPARED and COMMITTED: the serialized aggregate
/// followed by the raw bitmap bytes, no length prefix. Commit-phase shares
/// sign exactly these bytes; a differing byte order is a consensus bug.
pub fn multisig_payload(agg_sig: &BlsSignatureBytes, bitmap: &SignerBitmap) -> Vec<u8> {
    let mut v = Vec::with_capacity(SIGNATURE_BYTES + bitmap.as_raw_slice().len());
    v.extend_from_slice(&agg_sig.0);
    v.extend_from_slice(&bitmap_bytes(bitmap));
    v
}

/// Split a PREPARED/COMMITTED payload back into aggregate and mask bytes.
pub fn split_multisig_payload(payload: &[u8]) -> Option<(BlsSignatureBytes, &[u8])> {
    if payload.len() < SIGNATURE_BYTES {
        return None;
    }
    let sig = BlsSignatureBytes::from_slice(&payload[..SIGNATURE_BYTES])?;
    Some((sig, &payload[SIGNATURE_BYTES..]))
}

// --- transport framing ---

pub fn frame(category: MessageCategory, action: u8, payload: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(2 + payload.len());
    v.push(category as u8);
    v.push(action);
    v.extend_from_slice(payload);
    v
}

/// Strip the 2-byte frame, requiring a committee/consensus message.
pub fn unframe_consensus(bytes: &[u8]) -> Result<&[u8], DecodeError> {
    if bytes.len() < 2 {
        return Err(DecodeError::Truncated);
    }
    if bytes[0] != MessageCategory::Committee as u8 || bytes[1] != ACTION_CONSENSUS {
        return Err(DecodeError::BadDomain);
    }
    Ok(&bytes[2..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::bls::bitmap_for;

    fn signer(seed: u8) -> BlsSigner {
        BlsSigner::from_sk_bytes(&[seed; 32]).unwrap()
    }

    #[test]
    fn envelope_authenticates_and_rejects_tampering() {
        let s = signer(1);
        let msg = ConsensusMessage::new_signed(
            MsgKind::Prepare,
            7,
            3,
            [8u8; 32],
            vec![1, 2, 3],
            &s,
        );
        let pk = s.public_key_bytes();
        assert!(check_message(&msg, 7, &[8u8; 32], &pk).is_ok());

        let mut tampered = msg.clone();
        tampered.payload = vec![9, 9, 9];
        assert_eq!(check_message(&tampered, 7, &[8u8; 32], &pk), Err(CheckError::BadEnvelopeSig));

        assert_eq!(
            check_message(&msg, 8, &[8u8; 32], &pk),
            Err(CheckError::WrongConsensusId { got: 7, want: 8 })
        );
        assert_eq!(check_message(&msg, 7, &[0u8; 32], &pk), Err(CheckError::WrongBlockHash));

        let other_pk = signer(2).public_key_bytes();
        assert_eq!(check_message(&msg, 7, &[8u8; 32], &other_pk), Err(CheckError::BadEnvelopeSig));
    }

    #[test]
    fn decode_rejects_bad_kind_and_truncation() {
        let s = signer(1);
        let msg =
            ConsensusMessage::new_signed(MsgKind::Commit, 0, 1, [0u8; 32], vec![5; 10], &s);
        let mut enc = msg.encode();
        assert_eq!(ConsensusMessage::decode(&enc).unwrap(), msg);

        enc[0] = 0; // no such kind
        assert_eq!(ConsensusMessage::decode(&enc), Err(DecodeError::BadDomain));
        assert_eq!(
            ConsensusMessage::decode(&msg.encode()[..40]),
            Err(DecodeError::Truncated)
        );
    }

    #[test]
    fn multisig_payload_splits_at_signature_boundary() {
        let agg = BlsSignatureBytes([7u8; 96]);
        let mut bm = bitmap_for(10);
        bm.set(0, true);
        bm.set(9, true);
        let payload = multisig_payload(&agg, &bm);
        let (sig, mask) = split_multisig_payload(&payload).unwrap();
        assert_eq!(sig, agg);
        assert_eq!(mask, bm.as_raw_slice());
        assert!(split_multisig_payload(&payload[..95]).is_none());
    }

    #[test]
    fn framing_round_trip_and_category_check() {
        let framed = frame(MessageCategory::Committee, ACTION_CONSENSUS, b"abc");
        assert_eq!(unframe_consensus(&framed).unwrap(), b"abc");
        let wrong = frame(MessageCategory::Node, ACTION_CONSENSUS, b"abc");
        assert_eq!(unframe_consensus(&wrong), Err(DecodeError::BadDomain));
    }
}
