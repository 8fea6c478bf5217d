//! Bitcoin node connectivity.
//!
//! The poller talks to the node through the [`BitcoinInteract`]
//! capability, so tests can drive it with an in-memory chain. The real
//! implementation wraps bitcoin-core RPC and receives new blocks over
//! the node's `rawblock` ZMQ publisher.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use bitcoin::block::Header;
use bitcoin::BlockHash;
use bitcoincore_rpc::RpcApi as _;
use futures::stream::BoxStream;
use futures::StreamExt as _;

use crate::config::BitcoinSettings;
use crate::error::Error;
use crate::types::IndexedBlock;

/// Basic functionality the chain follower needs from a Bitcoin node.
pub trait BitcoinInteract {
    /// Height of the node's best block.
    fn get_tip_height(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Fetch the full block at the given height.
    fn get_block_by_height(
        &self,
        height: u64,
    ) -> impl Future<Output = Result<IndexedBlock, Error>> + Send;

    /// Fetch the block header at the given height.
    fn get_block_header_by_height(
        &self,
        height: u64,
    ) -> impl Future<Output = Result<Header, Error>> + Send;

    /// Height of the block with the given hash.
    fn get_block_height(
        &self,
        hash: &BlockHash,
    ) -> impl Future<Output = Result<u64, Error>> + Send;
}

/// A [`BitcoinInteract`] implementation over bitcoin-core RPC.
#[derive(Debug, Clone)]
pub struct BitcoinCoreClient {
    inner: Arc<bitcoincore_rpc::Client>,
}

impl BitcoinCoreClient {
    /// Connect to the configured RPC endpoint.
    pub fn new(settings: &BitcoinSettings) -> Result<Self, Error> {
        let auth = bitcoincore_rpc::Auth::UserPass(
            settings.rpc_username.clone(),
            settings.rpc_password.clone(),
        );
        let client = bitcoincore_rpc::Client::new(&settings.rpc_url, auth)?;
        Ok(Self { inner: Arc::new(client) })
    }

    /// Run a synchronous RPC call off the async runtime.
    async fn with_client<T, F>(&self, op: F) -> Result<T, Error>
    where
        F: FnOnce(&bitcoincore_rpc::Client) -> Result<T, bitcoincore_rpc::Error>
            + Send
            + 'static,
        T: Send + 'static,
    {
        let client = self.inner.clone();
        tokio::task::spawn_blocking(move || op(&client))
            .await
            .map_err(|err| Error::TaskJoin(err.to_string()))?
            .map_err(Error::from)
    }
}

impl BitcoinInteract for BitcoinCoreClient {
    async fn get_tip_height(&self) -> Result<u64, Error> {
        self.with_client(|client| client.get_block_count()).await
    }

    async fn get_block_by_height(&self, height: u64) -> Result<IndexedBlock, Error> {
        let block = self
            .with_client(move |client| {
                let hash = client.get_block_hash(height)?;
                client.get_block(&hash)
            })
            .await?;
        let height =
            i32::try_from(height).map_err(|_| Error::BlockHeightOutOfRange(height))?;
        Ok(IndexedBlock::from_block(height, block))
    }

    async fn get_block_header_by_height(&self, height: u64) -> Result<Header, Error> {
        self.with_client(move |client| {
            let hash = client.get_block_hash(height)?;
            client.get_block_header(&hash)
        })
        .await
    }

    async fn get_block_height(&self, hash: &BlockHash) -> Result<u64, Error> {
        let hash = *hash;
        let info = self
            .with_client(move |client| client.get_block_info(&hash))
            .await?;
        Ok(info.height as u64)
    }
}

/// Subscribe to the node's `rawblock` ZMQ publisher.
///
/// Non-block messages on the socket are ignored.
pub fn zmq_block_stream(
    endpoint: &str,
) -> Result<BoxStream<'static, Result<bitcoin::Block, Error>>, Error> {
    let stream = bitcoincore_zmq::subscribe_async(&[endpoint])?;
    Ok(stream
        .filter_map(|message| {
            futures::future::ready(match message {
                Ok(bitcoincore_zmq::Message::Block(block, _sequence)) => Some(Ok(block)),
                Ok(_) => None,
                Err(err) => Some(Err(Error::from(err))),
            })
        })
        .boxed())
}

/// Retry a transient RPC operation with exponential backoff.
///
/// Used in the live phase only; bootstrap treats RPC failures as fatal.
pub async fn retry_rpc<T, F, Fut>(mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let policy = ExponentialBackoff {
        max_elapsed_time: Some(Duration::from_secs(300)),
        ..Default::default()
    };
    backoff::future::retry(policy, || {
        let fut = op();
        async move {
            fut.await.map_err(|err| match err {
                err @ (Error::BitcoinCoreRpc(_) | Error::TaskJoin(_)) => {
                    tracing::warn!(error = %err, "transient RPC failure, backing off");
                    backoff::Error::transient(err)
                }
                err => backoff::Error::permanent(err),
            })
        }
    })
    .await
}
