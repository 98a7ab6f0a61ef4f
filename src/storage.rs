//! Block and undo persistence contract
//!
//! The engine only relies on the four calls below and treats an
//! acknowledged write as durable. It never calls into a store while
//! holding its state lock.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;

use crate::error::Result;
use crate::serialization::{deserialize_block, serialize_block};
use crate::types::*;
use crate::utxo::BlockUndo;

pub trait BlockStore: Send + Sync + fmt::Debug {
    /// Raw block bytes, or `None` if never written
    fn read_block(&self, hash: &Hash) -> Result<Option<Vec<u8>>>;

    fn write_block(&self, hash: &Hash, bytes: &[u8]) -> Result<()>;

    fn read_undo(&self, hash: &Hash) -> Result<Option<BlockUndo>>;

    fn write_undo(&self, hash: &Hash, undo: &BlockUndo) -> Result<()>;

    /// Decoded block; the store is trusted not to corrupt what it holds
    fn get_block(&self, hash: &Hash) -> Result<Option<Block>> {
        self.read_block(hash)?
            .map(|bytes| deserialize_block(&bytes))
            .transpose()
    }

    fn put_block(&self, block: &Block) -> Result<()> {
        self.write_block(&block.hash(), &serialize_block(block))
    }
}

/// Store backed by process memory; undo records are kept in their
/// serialized form, as a disk store would
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Hash, Vec<u8>>>,
    undo: RwLock<HashMap<Hash, Vec<u8>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn undo_count(&self) -> usize {
        self.undo.read().len()
    }
}

impl BlockStore for MemoryBlockStore {
    fn read_block(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        Ok(self.blocks.read().get(hash).cloned())
    }

    fn write_block(&self, hash: &Hash, bytes: &[u8]) -> Result<()> {
        self.blocks.write().insert(*hash, bytes.to_vec());
        Ok(())
    }

    fn read_undo(&self, hash: &Hash) -> Result<Option<BlockUndo>> {
        self.undo
            .read()
            .get(hash)
            .map(|bytes| BlockUndo::decode(bytes))
            .transpose()
    }

    fn write_undo(&self, hash: &Hash, undo: &BlockUndo) -> Result<()> {
        let bytes = undo.encode()?;
        self.undo.write().insert(*hash, bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utxo::TxUndo;

    fn block() -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_block_hash: [1; 32],
                merkle_root: [2; 32],
                timestamp: 1_600_000_000,
                bits: 0x207fffff,
                nonce: 3,
            },
            transactions: vec![Transaction {
                version: 1,
                inputs: vec![TransactionInput {
                    prevout: OutPoint::null(),
                    script_sig: vec![0x51, 0x51],
                    sequence: 0xffff_ffff,
                }],
                outputs: vec![TransactionOutput {
                    value: 50,
                    script_pubkey: vec![0x51],
                }],
                lock_time: 0,
            }],
        }
    }

    #[test]
    fn test_block_read_write() {
        let store = MemoryBlockStore::new();
        let b = block();
        assert_eq!(store.get_block(&b.hash()).unwrap(), None);
        store.put_block(&b).unwrap();
        assert_eq!(store.get_block(&b.hash()).unwrap(), Some(b.clone()));
        assert_eq!(store.block_count(), 1);
    }

    #[test]
    fn test_undo_read_write() {
        let store = MemoryBlockStore::new();
        let b = block();
        let mut undo = BlockUndo::new(b.hash(), 7, [9; 32]);
        undo.txs.push(TxUndo {
            spent: vec![],
            created: vec![OutPoint::new(b.transactions[0].txid(), 0)],
        });
        store.write_undo(&b.hash(), &undo).unwrap();
        assert_eq!(store.read_undo(&b.hash()).unwrap(), Some(undo));
        assert_eq!(store.read_undo(&[0; 32]).unwrap(), None);
    }
}
