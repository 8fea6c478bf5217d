//! # Block poller
//!
//! The poller bridges the Bitcoin node and the indexer. It waits for the
//! chain to reach the protocol activation height, backfills from the
//! requested start height, and then follows live block notifications,
//! absorbing reorgs that stay within the confirmation window.
//!
//! Every state change produces a [`ChainUpdate`] on the bounded output
//! channel: the blocks that just became k-deep, plus the current
//! unconfirmed tail. Updates are strictly ordered and confirmed heights
//! are contiguous across updates.

use std::time::Duration;

use futures::Stream;
use futures::StreamExt as _;
use tokio::sync::mpsc;

use crate::bitcoin_client::retry_rpc;
use crate::bitcoin_client::BitcoinInteract;
use crate::cache::BlockCache;
use crate::error::Error;
use crate::shutdown::ShutdownListener;
use crate::types::ChainUpdate;
use crate::types::IndexedBlock;

/// How many confirmed blocks to accumulate during bootstrap before
/// emitting a batch.
pub const CONFIRMED_BLOCK_BATCH_SIZE: usize = 100;

/// How often to re-check the node tip while waiting for activation.
const ACTIVATION_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound on the number of cached unconfirmed blocks.
const DEFAULT_MAX_CACHE_ENTRIES: usize = 1000;

/// The chain follower.
pub struct BtcPoller<Client, Blocks> {
    client: Client,
    blocks: Blocks,
    confirmation_depth: u16,
    activation_height: u64,
    chain_updates: mpsc::Sender<ChainUpdate>,
    shutdown: ShutdownListener,
    cache: BlockCache,
    /// Hash of the most recent block seen on the canonical chain,
    /// whether or not it is still in the cache.
    tip_hash: Option<bitcoin::BlockHash>,
    tip_height: u64,
    last_confirmed_height: Option<u64>,
}

impl<C, B> BtcPoller<C, B>
where
    C: BitcoinInteract,
    B: Stream<Item = Result<bitcoin::Block, Error>> + Unpin,
{
    /// Create a poller that reports on `chain_updates`.
    pub fn new(
        client: C,
        blocks: B,
        confirmation_depth: u16,
        activation_height: u64,
        chain_updates: mpsc::Sender<ChainUpdate>,
        shutdown: ShutdownListener,
    ) -> Self {
        Self {
            client,
            blocks,
            confirmation_depth: confirmation_depth.max(1),
            activation_height,
            chain_updates,
            shutdown,
            cache: BlockCache::new(DEFAULT_MAX_CACHE_ENTRIES),
            tip_hash: None,
            tip_height: 0,
            last_confirmed_height: None,
        }
    }

    /// Run the poller until the block stream closes or shutdown fires.
    #[tracing::instrument(skip_all, name = "btc-poller")]
    pub async fn run(mut self, start_height: u64) -> Result<(), Error> {
        let mut term = self.shutdown.clone();

        let run = async {
            self.wait_until_activation().await?;
            self.bootstrap(start_height).await?;

            while let Some(block) = self.blocks.next().await {
                self.handle_new_block(block?).await?;
            }
            tracing::info!("block notification stream closed");

            Ok::<_, Error>(())
        };

        tokio::select! {
            _ = term.wait() => {
                tracing::info!("btc poller received shutdown signal");
            }
            result = run => {
                result?;
            }
        }

        tracing::info!("shutting down the btc poller");

        Ok(())
    }

    /// Height of the newest block emitted as confirmed so far.
    pub fn last_confirmed_height(&self) -> Option<u64> {
        self.last_confirmed_height
    }

    async fn wait_until_activation(&mut self) -> Result<(), Error> {
        loop {
            let tip_height = self.client.get_tip_height().await?;
            if tip_height >= self.activation_height {
                return Ok(());
            }
            tracing::info!(
                tip_height,
                activation_height = self.activation_height,
                "waiting for the chain to reach the activation height"
            );
            tokio::time::sleep(ACTIVATION_POLL_INTERVAL).await;
        }
    }

    /// Sync with the node by fetching everything from `start_height` to
    /// the current tip, emitting confirmed batches along the way.
    async fn bootstrap(&mut self, start_height: u64) -> Result<(), Error> {
        tracing::info!(start_height, "bootstrapping");

        self.cache.remove_all();
        self.tip_hash = None;

        let tip_height = self.client.get_tip_height().await?;
        if start_height > tip_height {
            return Err(Error::StartHeightAboveTip { start: start_height, tip: tip_height });
        }

        let mut confirmed = Vec::new();
        for height in start_height..=tip_height {
            let block = self.client.get_block_by_height(height).await?;
            self.add_to_cache(block)?;
            confirmed.extend(self.cache.trim_confirmed(self.unconfirmed_window()));

            if confirmed.len() >= CONFIRMED_BLOCK_BATCH_SIZE {
                self.send_update(std::mem::take(&mut confirmed), Vec::new()).await?;
            }
        }

        let unconfirmed = self.unconfirmed_tail();
        if !confirmed.is_empty() || !unconfirmed.is_empty() {
            self.send_update(confirmed, unconfirmed).await?;
        }

        tracing::info!(tip_height, "bootstrapping finished");

        Ok(())
    }

    async fn handle_new_block(&mut self, block: bitcoin::Block) -> Result<(), Error> {
        if Some(block.header.prev_blockhash) == self.tip_hash {
            let height = i32::try_from(self.tip_height + 1)
                .map_err(|_| Error::BlockHeightOutOfRange(self.tip_height + 1))?;
            self.add_to_cache(IndexedBlock::from_block(height, block))?;
            return self.emit_update(Vec::new()).await;
        }

        // The block does not extend our tip: either notifications were
        // missed, the notifier replayed an old block, or the chain
        // reorganized.
        let hash = block.block_hash();
        let height = retry_rpc(|| self.client.get_block_height(&hash)).await?;

        if height > self.tip_height {
            self.backfill_to(height).await
        } else {
            self.maybe_reorg(height, hash).await
        }
    }

    /// Catch up on missed notifications by fetching the canonical chain
    /// up to `target`.
    async fn backfill_to(&mut self, target: u64) -> Result<(), Error> {
        for height in (self.tip_height + 1)..=target {
            let block = retry_rpc(|| self.client.get_block_by_height(height)).await?;
            self.add_to_cache(block)?;
        }
        self.emit_update(Vec::new()).await
    }

    /// A block at or below our tip height whose parent is not our tip.
    async fn maybe_reorg(
        &mut self,
        height: u64,
        notified: bitcoin::BlockHash,
    ) -> Result<(), Error> {
        let cached_hash = i32::try_from(height)
            .ok()
            .and_then(|h| self.cache.block_at(h))
            .map(|b| b.block_hash());

        match cached_hash {
            // A replayed notification for a block we already hold.
            Some(hash) if hash == notified => return Ok(()),
            // A different hash inside the unconfirmed window is a reorg
            // we can absorb.
            Some(_) => {}
            // The height is below the unconfirmed window. If the node
            // still agrees with the oldest block we hold this is a stale
            // notification; otherwise the chain rewrote blocks already
            // emitted as confirmed, which is beyond our tolerance.
            None => {
                if self.window_intact().await? {
                    return Ok(());
                }
                return Err(Error::ReorgBelowConfirmed {
                    height,
                    last_confirmed: self.last_confirmed_height.unwrap_or_default(),
                });
            }
        }

        tracing::warn!(height, "reorg detected, replacing the unconfirmed tail");

        let from = self
            .cache
            .first_height()
            .map_or(height, |first| height.min(first as u64));
        let tip_height = retry_rpc(|| self.client.get_tip_height()).await?;

        let mut replacement = Vec::with_capacity((tip_height - from + 1) as usize);
        for h in from..=tip_height {
            replacement.push(retry_rpc(|| self.client.get_block_by_height(h)).await?);
        }

        let from_i32 = i32::try_from(from).map_err(|_| Error::BlockHeightOutOfRange(from))?;
        self.cache.replace_from(from_i32, replacement)?;
        self.tip_hash = self.cache.tip().map(|b| b.block_hash());
        self.tip_height = tip_height;

        self.emit_update(Vec::new()).await
    }

    /// Whether the node's canonical chain still contains the oldest
    /// block of the unconfirmed window.
    async fn window_intact(&mut self) -> Result<bool, Error> {
        let Some(first) = self.cache.first_height() else {
            return Ok(true);
        };
        let canonical = retry_rpc(|| async {
            Ok(self
                .client
                .get_block_header_by_height(first as u64)
                .await?
                .block_hash())
        })
        .await?;
        Ok(self.cache.block_at(first).map(|b| b.block_hash()) == Some(canonical))
    }

    /// Trim and emit a chain update carrying `confirmed` plus any blocks
    /// that just became confirmed.
    async fn emit_update(&mut self, mut confirmed: Vec<IndexedBlock>) -> Result<(), Error> {
        confirmed.extend(self.cache.trim_confirmed(self.unconfirmed_window()));
        self.send_update(confirmed, self.unconfirmed_tail()).await
    }

    fn add_to_cache(&mut self, block: IndexedBlock) -> Result<(), Error> {
        let hash = block.block_hash();
        let height = block.height;
        self.cache.add(block)?;
        self.tip_hash = Some(hash);
        self.tip_height = height as u64;
        Ok(())
    }

    fn unconfirmed_window(&self) -> usize {
        usize::from(self.confirmation_depth) - 1
    }

    fn unconfirmed_tail(&self) -> Vec<IndexedBlock> {
        let window = self.unconfirmed_window();
        if window == 0 {
            return Vec::new();
        }
        self.cache.last_blocks(window)
    }

    async fn send_update(
        &mut self,
        confirmed: Vec<IndexedBlock>,
        unconfirmed: Vec<IndexedBlock>,
    ) -> Result<(), Error> {
        if let Some(newest) = confirmed.last() {
            self.last_confirmed_height = Some(newest.height as u64);
        }
        self.chain_updates
            .send(ChainUpdate { confirmed, unconfirmed })
            .await
            .map_err(|_| Error::ChainUpdateChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use rand::SeedableRng as _;

    use super::*;
    use crate::shutdown;
    use crate::testing::chain;

    /// A fake node whose canonical chain can be swapped under the
    /// poller's feet to simulate a reorg.
    #[derive(Debug, Clone, Default)]
    struct TestChain {
        blocks: Arc<Mutex<Vec<IndexedBlock>>>,
    }

    impl TestChain {
        fn set_chain(&self, blocks: Vec<IndexedBlock>) {
            *self.blocks.lock().expect("poisoned") = blocks;
        }

        fn push(&self, block: IndexedBlock) {
            self.blocks.lock().expect("poisoned").push(block);
        }

        fn find(&self, height: u64) -> Option<IndexedBlock> {
            self.blocks
                .lock()
                .expect("poisoned")
                .iter()
                .find(|b| b.height as u64 == height)
                .cloned()
        }
    }

    impl BitcoinInteract for TestChain {
        async fn get_tip_height(&self) -> Result<u64, Error> {
            let blocks = self.blocks.lock().expect("poisoned");
            Ok(blocks.last().map(|b| b.height as u64).unwrap_or_default())
        }

        async fn get_block_by_height(&self, height: u64) -> Result<IndexedBlock, Error> {
            self.find(height)
                .ok_or_else(|| Error::TaskJoin(format!("no block at height {height}")))
        }

        async fn get_block_header_by_height(
            &self,
            height: u64,
        ) -> Result<bitcoin::block::Header, Error> {
            self.get_block_by_height(height).await.map(|b| b.header)
        }

        async fn get_block_height(&self, hash: &bitcoin::BlockHash) -> Result<u64, Error> {
            let blocks = self.blocks.lock().expect("poisoned");
            blocks
                .iter()
                .find(|b| b.block_hash() == *hash)
                .map(|b| b.height as u64)
                .ok_or_else(|| Error::TaskJoin(format!("unknown block {hash}")))
        }
    }

    fn as_raw_block(block: &IndexedBlock) -> bitcoin::Block {
        bitcoin::Block {
            header: block.header,
            txdata: block.txs.clone(),
        }
    }

    async fn drain(rx: &mut mpsc::Receiver<ChainUpdate>) -> Vec<ChainUpdate> {
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        updates
    }

    #[test_log::test(tokio::test)]
    async fn bootstrap_splits_confirmed_and_unconfirmed() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(50);
        let node = TestChain::default();
        node.set_chain(chain::linked_blocks(&mut rng, 100, 20));

        let (tx, mut rx) = mpsc::channel(64);
        let (_signal, listener) = shutdown::channel();
        let poller = BtcPoller::new(
            node.clone(),
            futures::stream::empty::<Result<bitcoin::Block, Error>>(),
            5,
            100,
            tx,
            listener,
        );

        poller.run(100).await.expect("poller run");

        let updates = drain(&mut rx).await;
        assert_eq!(updates.len(), 1);
        // Tip is 119, depth 5: confirmed up to 115, tail 116..119.
        let confirmed: Vec<i32> = updates[0].confirmed.iter().map(|b| b.height).collect();
        assert_eq!(confirmed, (100..=115).collect::<Vec<_>>());
        let unconfirmed: Vec<i32> = updates[0].unconfirmed.iter().map(|b| b.height).collect();
        assert_eq!(unconfirmed, vec![116, 117, 118, 119]);
    }

    #[test_log::test(tokio::test)]
    async fn live_blocks_extend_the_chain_and_confirm_in_order() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(51);
        let node = TestChain::default();
        let mut blocks = chain::linked_blocks(&mut rng, 100, 25);
        let live = blocks.split_off(20);
        node.set_chain(blocks.clone());

        let (block_tx, block_rx) = mpsc::channel::<Result<bitcoin::Block, Error>>(16);
        let (tx, mut rx) = mpsc::channel(64);
        let (_signal, listener) = shutdown::channel();
        let poller = BtcPoller::new(
            node.clone(),
            tokio_stream::wrappers::ReceiverStream::new(block_rx),
            5,
            100,
            tx,
            listener,
        );

        let handle = tokio::spawn(poller.run(100));
        let bootstrap_update = rx.recv().await.expect("bootstrap update");

        for block in &live {
            node.push(block.clone());
            block_tx.send(Ok(as_raw_block(block))).await.expect("send block");
        }
        drop(block_tx);
        handle.await.expect("join").expect("poller run");

        let mut updates = vec![bootstrap_update];
        updates.extend(drain(&mut rx).await);
        let confirmed: Vec<i32> = updates
            .iter()
            .flat_map(|u| u.confirmed.iter().map(|b| b.height))
            .collect();
        // Contiguous ascending confirmed heights across all updates.
        assert_eq!(confirmed, (100..=120).collect::<Vec<_>>());
        // One update per live block on top of the bootstrap one.
        assert_eq!(updates.len(), 1 + live.len());
    }

    #[test_log::test(tokio::test)]
    async fn a_reorg_within_the_window_replaces_the_unconfirmed_tail() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(52);
        let node = TestChain::default();
        // Canonical chain 195..=205.
        let original = chain::linked_blocks(&mut rng, 195, 11);
        node.set_chain(original.clone());

        // Fork at 203: replacement blocks 203'..=206' on top of 202.
        let fork = chain::linked_blocks_from(&mut rng, &original[7], 4);
        let mut reorged: Vec<IndexedBlock> = original[..8].to_vec();
        reorged.extend(fork.clone());

        let (block_tx, block_rx) = mpsc::channel::<Result<bitcoin::Block, Error>>(16);
        let (tx, mut rx) = mpsc::channel(64);
        let (_signal, listener) = shutdown::channel();
        let poller = BtcPoller::new(
            node.clone(),
            tokio_stream::wrappers::ReceiverStream::new(block_rx),
            5,
            100,
            tx,
            listener,
        );

        let handle = tokio::spawn(poller.run(195));
        let bootstrap_update = rx.recv().await.expect("bootstrap update");

        // The node switches to the fork, then notifies us of 203'.
        node.set_chain(reorged);
        block_tx.send(Ok(as_raw_block(&fork[0]))).await.expect("send block");
        drop(block_tx);
        handle.await.expect("join").expect("poller run");

        let mut updates = vec![bootstrap_update];
        updates.extend(drain(&mut rx).await);
        let confirmed: Vec<(i32, bitcoin::BlockHash)> = updates
            .iter()
            .flat_map(|u| u.confirmed.iter().map(|b| (b.height, b.block_hash())))
            .collect();

        // Nothing from the abandoned branch was ever confirmed.
        let abandoned: Vec<bitcoin::BlockHash> =
            original[8..].iter().map(|b| b.block_hash()).collect();
        assert!(confirmed.iter().all(|(_, hash)| !abandoned.contains(hash)));

        // The new tip is 206, so 202 became confirmed; the fork itself
        // stays in the unconfirmed tail.
        assert_eq!(confirmed.last().map(|(h, _)| *h), Some(202));
        let last_tail: Vec<i32> = updates
            .last()
            .map(|u| u.unconfirmed.iter().map(|b| b.height).collect())
            .unwrap_or_default();
        assert_eq!(last_tail, vec![203, 204, 205, 206]);
        assert_eq!(
            updates.last().and_then(|u| u.unconfirmed.first().map(|b| b.block_hash())),
            Some(fork[0].block_hash())
        );
    }

    #[test_log::test(tokio::test)]
    async fn a_reorg_below_the_confirmed_prefix_is_fatal() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(53);
        let node = TestChain::default();
        let original = chain::linked_blocks(&mut rng, 100, 12);
        node.set_chain(original.clone());

        // Fork at 103, deeper than the 5-block window: 100..=107 are
        // already confirmed after bootstrap (tip 111).
        let fork = chain::linked_blocks_from(&mut rng, &original[2], 10);
        let mut reorged: Vec<IndexedBlock> = original[..3].to_vec();
        reorged.extend(fork.clone());

        let (block_tx, block_rx) = mpsc::channel::<Result<bitcoin::Block, Error>>(16);
        let (tx, mut rx) = mpsc::channel(64);
        let (_signal, listener) = shutdown::channel();
        let poller = BtcPoller::new(
            node.clone(),
            tokio_stream::wrappers::ReceiverStream::new(block_rx),
            5,
            100,
            tx,
            listener,
        );

        let handle = tokio::spawn(poller.run(100));
        let _bootstrap_update = rx.recv().await.expect("bootstrap update");

        node.set_chain(reorged);
        block_tx.send(Ok(as_raw_block(&fork[0]))).await.expect("send block");
        drop(block_tx);

        let err = handle
            .await
            .expect("join")
            .expect_err("deep reorg must be fatal");
        assert!(matches!(err, Error::ReorgBelowConfirmed { .. }));
    }

    #[test_log::test(tokio::test)]
    async fn a_start_height_above_the_tip_fails_bootstrap() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(54);
        let node = TestChain::default();
        node.set_chain(chain::linked_blocks(&mut rng, 100, 5));

        let (tx, _rx) = mpsc::channel(8);
        let (_signal, listener) = shutdown::channel();
        let poller = BtcPoller::new(
            node,
            futures::stream::empty::<Result<bitcoin::Block, Error>>(),
            3,
            100,
            tx,
            listener,
        );

        let err = poller.run(200).await.expect_err("start above tip");
        assert!(matches!(err, Error::StartHeightAboveTip { start: 200, tip: 104 }));
    }

    #[test_log::test(tokio::test)]
    async fn shutdown_stops_the_poller_mid_stream() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(55);
        let node = TestChain::default();
        node.set_chain(chain::linked_blocks(&mut rng, 100, 5));

        let (tx, mut rx) = mpsc::channel(8);
        let (signal, listener) = shutdown::channel();
        // A stream that never yields keeps the live loop waiting.
        let poller = BtcPoller::new(
            node,
            futures::stream::pending::<Result<bitcoin::Block, Error>>(),
            3,
            100,
            tx,
            listener,
        );

        let handle = tokio::spawn(poller.run(100));
        // Wait for the bootstrap update, then stop.
        let _ = rx.recv().await;
        signal.signal();
        handle.await.expect("join").expect("poller run");
    }
}
