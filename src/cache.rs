//! Sliding cache over the most recent blocks of the chain.
//!
//! The cache owns the tail of the chain that is not yet deep enough to be
//! treated as confirmed. It enforces hash-chain linkage on every
//! mutation: for adjacent blocks the later one must reference the hash of
//! the earlier one and sit exactly one height above it.

use std::collections::VecDeque;

use crate::error::Error;
use crate::types::IndexedBlock;

/// Fixed-capacity ordered buffer of recent blocks.
#[derive(Debug)]
pub struct BlockCache {
    blocks: VecDeque<IndexedBlock>,
    capacity: usize,
}

impl BlockCache {
    /// Create an empty cache holding at most `capacity` blocks.
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append a block to the tail of the cache.
    ///
    /// The block must link to the current tip (or the cache must be
    /// empty). A failed add leaves the cache unchanged. When the cache
    /// grows beyond its capacity the oldest block is evicted; by
    /// construction that block has already been emitted as confirmed.
    pub fn add(&mut self, block: IndexedBlock) -> Result<(), Error> {
        if let Some(tip) = self.tip() {
            let links = block.header.prev_blockhash == tip.block_hash()
                && block.height == tip.height + 1;
            if !links {
                return Err(Error::ChainLinkageBroken { height: block.height });
            }
        }

        self.blocks.push_back(block);
        if self.blocks.len() > self.capacity {
            self.blocks.pop_front();
        }
        Ok(())
    }

    /// The most recent block, if any.
    pub fn tip(&self) -> Option<&IndexedBlock> {
        self.blocks.back()
    }

    /// Height of the oldest block still in the cache.
    pub fn first_height(&self) -> Option<i32> {
        self.blocks.front().map(|b| b.height)
    }

    /// Number of blocks currently cached.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the cache holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The cached block at the given height, if it is inside the window.
    pub fn block_at(&self, height: i32) -> Option<&IndexedBlock> {
        let first = self.first_height()?;
        if height < first {
            return None;
        }
        self.blocks.get((height - first) as usize)
    }

    /// The `k` most recent blocks in chain order (fewer if the cache is
    /// shorter).
    pub fn last_blocks(&self, k: usize) -> Vec<IndexedBlock> {
        let skip = self.blocks.len().saturating_sub(k);
        self.blocks.iter().skip(skip).cloned().collect()
    }

    /// Remove and return the confirmed prefix: all blocks whose height is
    /// at most `tip.height - depth`, preserving chain order.
    pub fn trim_confirmed(&mut self, depth: usize) -> Vec<IndexedBlock> {
        let Some(tip_height) = self.tip().map(|b| b.height) else {
            return Vec::new();
        };
        let cutoff = tip_height - depth as i32;

        let mut confirmed = Vec::new();
        while let Some(front) = self.blocks.front() {
            if front.height > cutoff {
                break;
            }
            if let Some(block) = self.blocks.pop_front() {
                confirmed.push(block);
            }
        }
        confirmed
    }

    /// Clear the cache.
    pub fn remove_all(&mut self) {
        self.blocks.clear();
    }

    /// Reorg handler: discard the suffix from `height` onward and append
    /// the replacement blocks, which must be hash-linked and connect to
    /// whatever remains.
    pub fn replace_from(
        &mut self,
        height: i32,
        replacement: Vec<IndexedBlock>,
    ) -> Result<(), Error> {
        while self
            .blocks
            .back()
            .is_some_and(|tip| tip.height >= height)
        {
            self.blocks.pop_back();
        }
        for block in replacement {
            self.add(block)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng as _;

    use super::*;
    use crate::testing::chain;

    #[test]
    fn add_enforces_linkage() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let blocks = chain::linked_blocks(&mut rng, 100, 5);
        let mut cache = BlockCache::new(16);

        for block in &blocks {
            cache.add(block.clone()).expect("linked block must be accepted");
        }
        assert_eq!(cache.len(), 5);
        assert_eq!(cache.tip().map(|b| b.height), Some(104));

        // A block that does not link to the tip is rejected and the
        // cache state is untouched.
        let stray = chain::linked_blocks(&mut rng, 105, 1).remove(0);
        let err = cache.add(stray).expect_err("unlinked block must fail");
        assert!(matches!(err, Error::ChainLinkageBroken { height: 105 }));
        assert_eq!(cache.len(), 5);
        assert_eq!(cache.tip().map(|b| b.height), Some(104));
    }

    #[test]
    fn add_evicts_the_oldest_block_beyond_capacity() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(2);
        let blocks = chain::linked_blocks(&mut rng, 0, 6);
        let mut cache = BlockCache::new(4);

        for block in blocks {
            cache.add(block).expect("linked block");
        }
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.first_height(), Some(2));
        assert_eq!(cache.tip().map(|b| b.height), Some(5));
    }

    #[test]
    fn trim_confirmed_returns_the_prefix_in_order() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let blocks = chain::linked_blocks(&mut rng, 50, 10);
        let mut cache = BlockCache::new(32);
        for block in blocks {
            cache.add(block).expect("linked block");
        }

        // Tip is 59; depth 3 confirms everything at height <= 56.
        let confirmed = cache.trim_confirmed(3);
        let heights: Vec<i32> = confirmed.iter().map(|b| b.height).collect();
        assert_eq!(heights, vec![50, 51, 52, 53, 54, 55, 56]);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.first_height(), Some(57));

        // Trimming again is a no-op.
        assert!(cache.trim_confirmed(3).is_empty());
    }

    #[test]
    fn last_blocks_returns_at_most_k() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(4);
        let blocks = chain::linked_blocks(&mut rng, 10, 4);
        let mut cache = BlockCache::new(8);
        for block in blocks {
            cache.add(block).expect("linked block");
        }

        let last = cache.last_blocks(2);
        assert_eq!(last.iter().map(|b| b.height).collect::<Vec<_>>(), vec![12, 13]);
        let all = cache.last_blocks(100);
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn replace_from_swaps_the_suffix() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(5);
        let blocks = chain::linked_blocks(&mut rng, 200, 6);
        let mut cache = BlockCache::new(16);
        for block in &blocks {
            cache.add(block.clone()).expect("linked block");
        }

        // Fork at height 203: replacement chain 203'..206' linking to 202.
        let fork = chain::linked_blocks_from(&mut rng, &blocks[2], 4);
        cache
            .replace_from(203, fork.clone())
            .expect("fork must connect to the remaining prefix");

        assert_eq!(cache.len(), 7);
        assert_eq!(cache.tip().map(|b| b.height), Some(206));
        assert_eq!(
            cache.last_blocks(4).first().map(|b| b.block_hash()),
            Some(fork[0].block_hash())
        );
    }

    #[test]
    fn replace_from_rejects_a_disconnected_fork() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(6);
        let blocks = chain::linked_blocks(&mut rng, 200, 6);
        let mut cache = BlockCache::new(16);
        for block in blocks {
            cache.add(block).expect("linked block");
        }

        let disconnected = chain::linked_blocks(&mut rng, 203, 2);
        let err = cache
            .replace_from(203, disconnected)
            .expect_err("fork that does not connect must fail");
        assert!(matches!(err, Error::ChainLinkageBroken { .. }));
    }
}
