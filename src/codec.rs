// src/codec.rs

use crate::crypto::bls::{bitmap_from_bytes, BlsSignatureBytes, SignerBitmap, SIGNATURE_BYTES};
use crate::crypto::hash_bytes_sha256;
use crate::types::{Block, BlockHeader, Hash, Transaction};

pub const CODEC_VERSION: u8 = 1;
pub const DOM_HDR: &[u8] = b"HDR";
pub const DOM_BLK: &[u8] = b"BLK";
pub const DOM_TX: &[u8] = b"TX";

/// Hard cap on encoded field sizes; a candidate block violating these cannot
/// be announced and the round is aborted before it starts.
pub const MAX_TXS_PER_BLOCK: usize = 1 << 16;
pub const MAX_STR_LEN: usize = 1 << 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    TooManyTxs(usize),
    OversizedField(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    Truncated,
    BadVersion(u8),
    BadDomain,
    BadUtf8,
    BadBitmap,
    TrailingBytes(usize),
}

// --- helpers: write primitives deterministically ---

pub fn put_u32(dst: &mut Vec<u8>, x: u32) {
    dst.extend_from_slice(&x.to_le_bytes());
}

pub fn put_u64(dst: &mut Vec<u8>, x: u64) {
    dst.extend_from_slice(&x.to_le_bytes());
}

// append a string as length (u32 LE) + UTF-8 bytes.
fn put_str(dst: &mut Vec<u8>, s: &str) -> Result<(), EncodeError> {
    if s.len() > MAX_STR_LEN {
        return Err(EncodeError::OversizedField(s.len()));
    }
    put_u32(dst, s.len() as u32);
    dst.extend_from_slice(s.as_bytes());
    Ok(())
}

pub fn put_bytes(dst: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(dst, bytes.len() as u32);
    dst.extend_from_slice(bytes);
}

// --- helpers: bounded reader over a byte slice ---

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(DecodeError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    fn hash(&mut self) -> Result<Hash, DecodeError> {
        let b = self.take(32)?;
        Ok(b.try_into().unwrap())
    }

    fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let b = self.bytes()?;
        String::from_utf8(b.to_vec()).map_err(|_| DecodeError::BadUtf8)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

// --- transactions ---

pub fn tx_bytes(tx: &Transaction) -> Result<Vec<u8>, EncodeError> {
    let mut v = vec![CODEC_VERSION];
    v.extend_from_slice(DOM_TX);
    put_str(&mut v, &tx.from)?;
    put_str(&mut v, &tx.to)?;
    put_u64(&mut v, tx.amount);
    put_u64(&mut v, tx.nonce);
    Ok(v)
}

/// Digest identifying a transaction, used by the finalization report.
pub fn tx_hash(tx: &Transaction) -> Result<Hash, EncodeError> {
    Ok(hash_bytes_sha256(&tx_bytes(tx)?))
}

// --- block headers ---

/// The hash preimage of a header. Deliberately excludes the four proof
/// fields: the hash under agreement must be the same bytes before and after
/// the aggregates are attached.
pub fn header_signing_bytes(h: &BlockHeader) -> Vec<u8> {
    let mut v = vec![CODEC_VERSION];
    v.extend_from_slice(DOM_HDR);
    v.extend_from_slice(&h.parent_hash);
    put_u64(&mut v, h.height);
    v.extend_from_slice(&h.txs_root);
    put_u64(&mut v, h.timestamp);
    put_u32(&mut v, h.shard_id);
    v
}

/// 32-byte hash of the candidate block under agreement.
pub fn block_hash(b: &Block) -> Hash {
    hash_bytes_sha256(&header_signing_bytes(&b.header))
}

fn put_opt_sig(dst: &mut Vec<u8>, sig: &Option<BlsSignatureBytes>) {
    match sig {
        Some(s) => {
            dst.push(1);
            dst.extend_from_slice(&s.0);
        }
        None => dst.push(0),
    }
}

fn take_opt_sig(r: &mut Reader<'_>) -> Result<Option<BlsSignatureBytes>, DecodeError> {
    match r.u8()? {
        0 => Ok(None),
        _ => {
            let b = r.take(SIGNATURE_BYTES)?;
            Ok(Some(BlsSignatureBytes(b.try_into().unwrap())))
        }
    }
}

fn put_bitmap(dst: &mut Vec<u8>, bitmap: &SignerBitmap) {
    put_u32(dst, bitmap.len() as u32);
    dst.extend_from_slice(bitmap.as_raw_slice());
}

fn take_bitmap(r: &mut Reader<'_>) -> Result<SignerBitmap, DecodeError> {
    let n = r.u32()? as usize;
    let raw = r.take(n.div_ceil(8))?;
    bitmap_from_bytes(raw, n).ok_or(DecodeError::BadBitmap)
}

// --- blocks ---

/// Full wire encoding of a block, proof fields included. This is the ANNOUNCE
/// payload and what the leader keeps until finalization.
pub fn block_bytes(b: &Block) -> Result<Vec<u8>, EncodeError> {
    if b.transactions.len() > MAX_TXS_PER_BLOCK {
        return Err(EncodeError::TooManyTxs(b.transactions.len()));
    }
    let mut v = vec![CODEC_VERSION];
    v.extend_from_slice(DOM_BLK);

    let h = &b.header;
    v.extend_from_slice(&h.parent_hash);
    put_u64(&mut v, h.height);
    v.extend_from_slice(&h.txs_root);
    put_u64(&mut v, h.timestamp);
    put_u32(&mut v, h.shard_id);
    put_opt_sig(&mut v, &h.prepare_signature);
    put_bitmap(&mut v, &h.prepare_bitmap);
    put_opt_sig(&mut v, &h.commit_signature);
    put_bitmap(&mut v, &h.commit_bitmap);

    put_u32(&mut v, b.transactions.len() as u32);
    for tx in &b.transactions {
        put_str(&mut v, &tx.from)?;
        put_str(&mut v, &tx.to)?;
        put_u64(&mut v, tx.amount);
        put_u64(&mut v, tx.nonce);
    }
    Ok(v)
}

pub fn decode_block(bytes: &[u8]) -> Result<Block, DecodeError> {
    let mut r = Reader::new(bytes);
    let ver = r.u8()?;
    if ver != CODEC_VERSION {
        return Err(DecodeError::BadVersion(ver));
    }
    if r.take(DOM_BLK.len())? != DOM_BLK {
        return Err(DecodeError::BadDomain);
    }

    let parent_hash = r.hash()?;
    let height = r.u64()?;
    let txs_root = r.hash()?;
    let timestamp = r.u64()?;
    let shard_id = r.u32()?;
    let prepare_signature = take_opt_sig(&mut r)?;
    let prepare_bitmap = take_bitmap(&mut r)?;
    let commit_signature = take_opt_sig(&mut r)?;
    let commit_bitmap = take_bitmap(&mut r)?;

    let tx_count = r.u32()? as usize;
    if tx_count > MAX_TXS_PER_BLOCK {
        return Err(DecodeError::Truncated);
    }
    let mut transactions = Vec::with_capacity(tx_count);
    for _ in 0..tx_count {
        let from = r.string()?;
        let to = r.string()?;
        let amount = r.u64()?;
        let nonce = r.u64()?;
        transactions.push(Transaction { from, to, amount, nonce });
    }
    if r.remaining() != 0 {
        return Err(DecodeError::TrailingBytes(r.remaining()));
    }

    let mut header = BlockHeader::new(parent_hash, height, txs_root, timestamp, shard_id);
    header.prepare_signature = prepare_signature;
    header.prepare_bitmap = prepare_bitmap;
    header.commit_signature = commit_signature;
    header.commit_bitmap = commit_bitmap;
    Ok(Block { header, transactions })
}
