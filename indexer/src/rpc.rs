use alloy::eips::BlockNumberOrTag;
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::transports::http::Http;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;

use crate::error::IndexerError;

pub type ExternalProvider = RootProvider<Http<Client>>;

/// The parts of a canonical block the reorg check compares against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeBlock {
    pub height: u64,
    pub hash: String,
    pub parent_hash: String,
    pub time: DateTime<Utc>,
}

#[async_trait]
pub trait ChainRpc: Send + Sync + 'static {
    /// Height of the node's canonical head.
    async fn head(&self) -> Result<u64, IndexerError>;

    /// Canonical block at `height`, `None` when the node does not have it.
    async fn block(&self, height: u64) -> Result<Option<NodeBlock>, IndexerError>;
}

pub fn connect(endpoint: &str) -> Result<ExternalProvider, IndexerError> {
    let url = endpoint
        .parse()
        .map_err(|e| IndexerError::Rpc(format!("invalid node endpoint {endpoint:?}: {e}")))?;
    Ok(ProviderBuilder::new().on_http(url))
}

#[async_trait]
impl ChainRpc for ExternalProvider {
    async fn head(&self) -> Result<u64, IndexerError> {
        self.get_block_number()
            .await
            .map_err(|e| IndexerError::Rpc(e.to_string()))
    }

    async fn block(&self, height: u64) -> Result<Option<NodeBlock>, IndexerError> {
        let block = self
            .get_block_by_number(BlockNumberOrTag::Number(height), false)
            .await
            .map_err(|e| IndexerError::Rpc(e.to_string()))?;
        let Some(block) = block else {
            return Ok(None);
        };

        let header = block.header;
        let time = DateTime::from_timestamp(header.timestamp as i64, 0).ok_or_else(|| {
            IndexerError::Rpc(format!("block {height} has timestamp {}", header.timestamp))
        })?;
        Ok(Some(NodeBlock {
            height: header.number,
            hash: format!("{:#x}", header.hash),
            parent_hash: format!("{:#x}", header.parent_hash),
            time,
        }))
    }
}
