//! Dummy block generation.

use bitcoin::block::Header;
use bitcoin::block::Version;
use bitcoin::hashes::Hash as _;
use bitcoin::BlockHash;
use bitcoin::CompactTarget;
use bitcoin::Transaction;
use bitcoin::TxMerkleNode;
use fake::Fake as _;
use fake::Faker;

use crate::types::IndexedBlock;

/// A dummy block header with random fields.
pub fn header<R: rand::Rng + ?Sized>(rng: &mut R) -> Header {
    let config = Faker;
    Header {
        version: Version::TWO,
        prev_blockhash: BlockHash::from_byte_array(config.fake_with_rng(rng)),
        merkle_root: TxMerkleNode::from_byte_array(config.fake_with_rng(rng)),
        time: config.fake_with_rng(rng),
        bits: CompactTarget::from_consensus(config.fake_with_rng(rng)),
        nonce: config.fake_with_rng(rng),
    }
}

/// A block at the given height carrying the given transactions. Its
/// previous-block hash is random; use [`linked_blocks`] for chains.
pub fn block_at<R: rand::Rng + ?Sized>(
    rng: &mut R,
    height: i32,
    txs: Vec<Transaction>,
) -> IndexedBlock {
    IndexedBlock { height, header: header(rng), txs }
}

/// A hash-linked chain of `count` empty blocks starting at `start_height`.
pub fn linked_blocks<R: rand::Rng + ?Sized>(
    rng: &mut R,
    start_height: i32,
    count: usize,
) -> Vec<IndexedBlock> {
    let mut blocks: Vec<IndexedBlock> = Vec::with_capacity(count);
    for offset in 0..count {
        let mut block = block_at(rng, start_height + offset as i32, Vec::new());
        if let Some(prev) = blocks.last() {
            block.header.prev_blockhash = prev.block_hash();
        }
        blocks.push(block);
    }
    blocks
}

/// A hash-linked chain of `count` empty blocks on top of `parent`.
pub fn linked_blocks_from<R: rand::Rng + ?Sized>(
    rng: &mut R,
    parent: &IndexedBlock,
    count: usize,
) -> Vec<IndexedBlock> {
    let mut blocks: Vec<IndexedBlock> = Vec::with_capacity(count);
    let mut prev_hash = parent.block_hash();
    for offset in 0..count {
        let mut block = block_at(rng, parent.height + 1 + offset as i32, Vec::new());
        block.header.prev_blockhash = prev_hash;
        prev_hash = block.block_hash();
        blocks.push(block);
    }
    blocks
}
