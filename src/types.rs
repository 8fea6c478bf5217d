//! Shared chain types exchanged between the poller and the indexer.

use bitcoin::block::Header;
use bitcoin::BlockHash;
use bitcoin::Transaction;

/// A Bitcoin block annotated with its height.
///
/// Heights are kept signed because Bitcoin itself permits them to be; the
/// indexer rejects negative heights at the point where it needs an
/// unsigned value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedBlock {
    /// Height of the block in the chain.
    pub height: i32,
    /// The 80-byte block header.
    pub header: Header,
    /// All transactions of the block, in block order.
    pub txs: Vec<Transaction>,
}

impl IndexedBlock {
    /// Create an indexed block from a full block and its height.
    pub fn from_block(height: i32, block: bitcoin::Block) -> Self {
        Self {
            height,
            header: block.header,
            txs: block.txdata,
        }
    }

    /// The double-SHA256 hash identifying this block.
    pub fn block_hash(&self) -> BlockHash {
        self.header.block_hash()
    }
}

/// The atomic unit exchanged between the poller and the indexer.
///
/// Confirmed blocks are in ascending height order and contiguous with the
/// previous update's last confirmed block. Unconfirmed blocks are the
/// current cache tail and carry no persistence obligations.
#[derive(Debug, Clone, Default)]
pub struct ChainUpdate {
    /// Blocks that became k-deep with this update, oldest first.
    pub confirmed: Vec<IndexedBlock>,
    /// The remaining unconfirmed tail of the chain, oldest first.
    pub unconfirmed: Vec<IndexedBlock>,
}
