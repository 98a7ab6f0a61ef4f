//! Canonical binary encoding
//!
//! Legacy (non-witness) wire format: little-endian fixed-width integers,
//! CompactSize varints and 80-byte headers. Identical logical content
//! always encodes to identical bytes, which is what makes hash identity
//! sound. Decoding is strict: non-canonical varints, oversized counts and
//! trailing bytes are all rejected.

use crate::crypto::{double_sha256, hash_pair};
use crate::error::{ConsensusError, Result};
use crate::types::*;

/// CompactSize encoding
pub fn encode_varint(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    write_varint(&mut out, value);
    out
}

pub fn write_varint(out: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        out.push(value as u8);
    } else if value <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

pub fn varint_size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Length-prefixed byte string
pub fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

pub fn write_outpoint(out: &mut Vec<u8>, outpoint: &OutPoint) {
    out.extend_from_slice(&outpoint.hash);
    out.extend_from_slice(&outpoint.index.to_le_bytes());
}

pub fn write_output(out: &mut Vec<u8>, output: &TransactionOutput) {
    out.extend_from_slice(&output.value.to_le_bytes());
    write_bytes(out, &output.script_pubkey);
}

pub fn write_transaction(out: &mut Vec<u8>, tx: &Transaction) {
    out.extend_from_slice(&tx.version.to_le_bytes());
    write_varint(out, tx.inputs.len() as u64);
    for input in &tx.inputs {
        write_outpoint(out, &input.prevout);
        write_bytes(out, &input.script_sig);
        out.extend_from_slice(&input.sequence.to_le_bytes());
    }
    write_varint(out, tx.outputs.len() as u64);
    for output in &tx.outputs {
        write_output(out, output);
    }
    out.extend_from_slice(&tx.lock_time.to_le_bytes());
}

pub fn write_header(out: &mut Vec<u8>, header: &BlockHeader) {
    out.extend_from_slice(&header.version.to_le_bytes());
    out.extend_from_slice(&header.prev_block_hash);
    out.extend_from_slice(&header.merkle_root);
    out.extend_from_slice(&header.timestamp.to_le_bytes());
    out.extend_from_slice(&header.bits.to_le_bytes());
    out.extend_from_slice(&header.nonce.to_le_bytes());
}

pub fn serialize_transaction(tx: &Transaction) -> Vec<u8> {
    let mut out = Vec::with_capacity(transaction_size(tx));
    write_transaction(&mut out, tx);
    out
}

pub fn serialize_header(header: &BlockHeader) -> Vec<u8> {
    let mut out = Vec::with_capacity(crate::constants::HEADER_SIZE);
    write_header(&mut out, header);
    out
}

pub fn serialize_block(block: &Block) -> Vec<u8> {
    let mut out = Vec::with_capacity(block_size(block));
    write_header(&mut out, &block.header);
    write_varint(&mut out, block.transactions.len() as u64);
    for tx in &block.transactions {
        write_transaction(&mut out, tx);
    }
    out
}

/// Header list: count followed by 80-byte headers
pub fn serialize_headers(headers: &[BlockHeader]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + headers.len() * crate::constants::HEADER_SIZE);
    write_varint(&mut out, headers.len() as u64);
    for header in headers {
        write_header(&mut out, header);
    }
    out
}

pub fn transaction_size(tx: &Transaction) -> usize {
    let inputs: usize = tx
        .inputs
        .iter()
        .map(|i| 36 + varint_size(i.script_sig.len() as u64) + i.script_sig.len() + 4)
        .sum();
    let outputs: usize = tx
        .outputs
        .iter()
        .map(|o| 8 + varint_size(o.script_pubkey.len() as u64) + o.script_pubkey.len())
        .sum();
    4 + varint_size(tx.inputs.len() as u64)
        + inputs
        + varint_size(tx.outputs.len() as u64)
        + outputs
        + 4
}

pub fn block_size(block: &Block) -> usize {
    crate::constants::HEADER_SIZE
        + varint_size(block.transactions.len() as u64)
        + block.transactions.iter().map(transaction_size).sum::<usize>()
}

pub fn calculate_tx_id(tx: &Transaction) -> Hash {
    double_sha256(&serialize_transaction(tx))
}

pub fn calculate_block_hash(header: &BlockHeader) -> Hash {
    double_sha256(&serialize_header(header))
}

/// Merkle root over a list of leaf hashes.
///
/// Returns the root and whether the tree is mutated: two identical
/// sibling hashes at any level mean the same root could be produced by a
/// different (duplicated) transaction list.
pub fn compute_merkle_root(leaves: &[Hash]) -> (Hash, bool) {
    if leaves.is_empty() {
        return (NULL_HASH, false);
    }
    let mut level = leaves.to_vec();
    let mut mutated = false;
    while level.len() > 1 {
        for pair in level.chunks(2) {
            if pair.len() == 2 && pair[0] == pair[1] {
                mutated = true;
            }
        }
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().copied() {
                level.push(last);
            }
        }
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    (level[0], mutated)
}

pub fn calculate_merkle_root(transactions: &[Transaction]) -> Result<Hash> {
    if transactions.is_empty() {
        return Err(ConsensusError::Malformed(
            "cannot calculate merkle root of empty transaction list".into(),
        ));
    }
    let txids: Vec<Hash> = transactions.iter().map(|tx| tx.txid()).collect();
    Ok(compute_merkle_root(&txids).0)
}

/// Cursor over untrusted bytes
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ConsensusError::Serialization(format!(
                "unexpected end of data: wanted {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash> {
        self.take_array()
    }

    /// CompactSize; rejects encodings that are not the shortest form
    pub fn read_varint(&mut self) -> Result<u64> {
        let (value, min) = match self.read_u8()? {
            0xfd => (self.read_u16()? as u64, 0xfd),
            0xfe => (self.read_u32()? as u64, 0x1_0000),
            0xff => (self.read_u64()?, 0x1_0000_0000),
            b => return Ok(b as u64),
        };
        if value < min {
            return Err(ConsensusError::Serialization(format!(
                "non-canonical varint {} at offset {}",
                value, self.pos
            )));
        }
        Ok(value)
    }

    /// Element count, bounded by the bytes left so a hostile count cannot
    /// force a large allocation
    fn read_count(&mut self, min_element_size: usize) -> Result<usize> {
        let count = self.read_varint()?;
        let max = (self.remaining() / min_element_size.max(1)) as u64;
        if count > max {
            return Err(ConsensusError::Serialization(format!(
                "count {} exceeds remaining data",
                count
            )));
        }
        Ok(count as usize)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_count(1)?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_outpoint(&mut self) -> Result<OutPoint> {
        Ok(OutPoint {
            hash: self.read_hash()?,
            index: self.read_u32()?,
        })
    }

    pub fn read_transaction(&mut self) -> Result<Transaction> {
        let version = self.read_i32()?;
        let input_count = self.read_count(41)?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(TransactionInput {
                prevout: self.read_outpoint()?,
                script_sig: self.read_bytes()?,
                sequence: self.read_u32()?,
            });
        }
        let output_count = self.read_count(9)?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            outputs.push(TransactionOutput {
                value: self.read_i64()?,
                script_pubkey: self.read_bytes()?,
            });
        }
        let lock_time = self.read_u32()?;
        Ok(Transaction {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    pub fn read_header(&mut self) -> Result<BlockHeader> {
        Ok(BlockHeader {
            version: self.read_i32()?,
            prev_block_hash: self.read_hash()?,
            merkle_root: self.read_hash()?,
            timestamp: self.read_u32()?,
            bits: self.read_u32()?,
            nonce: self.read_u32()?,
        })
    }

    pub fn read_block(&mut self) -> Result<Block> {
        let header = self.read_header()?;
        let tx_count = self.read_count(60)?;
        let mut transactions = Vec::with_capacity(tx_count);
        for _ in 0..tx_count {
            transactions.push(self.read_transaction()?);
        }
        Ok(Block {
            header,
            transactions,
        })
    }

    /// Fails unless every byte has been consumed
    pub fn finish(self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(ConsensusError::Serialization(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}

pub fn deserialize_transaction(data: &[u8]) -> Result<Transaction> {
    let mut decoder = Decoder::new(data);
    let tx = decoder.read_transaction()?;
    decoder.finish()?;
    Ok(tx)
}

pub fn deserialize_header(data: &[u8]) -> Result<BlockHeader> {
    let mut decoder = Decoder::new(data);
    let header = decoder.read_header()?;
    decoder.finish()?;
    Ok(header)
}

pub fn deserialize_block(data: &[u8]) -> Result<Block> {
    let mut decoder = Decoder::new(data);
    let block = decoder.read_block()?;
    decoder.finish()?;
    Ok(block)
}

pub fn deserialize_headers(data: &[u8]) -> Result<Vec<BlockHeader>> {
    let mut decoder = Decoder::new(data);
    let count = decoder.read_count(crate::constants::HEADER_SIZE)?;
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        headers.push(decoder.read_header()?);
    }
    decoder.finish()?;
    Ok(headers)
}
