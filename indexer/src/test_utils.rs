use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, TimeZone, Utc};
use db::{DecodedAddress, DecodedBlock, DecodedHeader, DecodedTx, TxStatus};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Mutex;

use crate::error::IndexerError;
use crate::rpc::{ChainRpc, NodeBlock};

fn time_of(height: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + height * 12, 0).unwrap()
}

fn hash_of(height: i64, fork: &str) -> String {
    format!("0x{fork}{height}")
}

fn touched(hash: &str, txs_count: i64) -> DecodedAddress {
    DecodedAddress {
        hash: hash.into(),
        is_contract: false,
        txs_count,
        contracts_count: 0,
        interactions: 1,
    }
}

/// A block on chain `fork` carrying a single value transfer from `0xa` to
/// `0xb`.
pub fn block(height: i64, fork: &str) -> DecodedBlock {
    DecodedBlock {
        header: DecodedHeader {
            height,
            hash: hash_of(height, fork),
            parent_hash: hash_of(height - 1, fork),
            time: time_of(height),
            miner: "0xminer".into(),
            base_fee_per_gas: Some(BigDecimal::from(1)),
            gas_limit: BigDecimal::from(30_000_000),
            gas_used: BigDecimal::from(21_000),
        },
        txs: vec![DecodedTx {
            hash: format!("0xt{fork}{height}"),
            position: 0,
            from: "0xa".into(),
            to: Some("0xb".into()),
            amount: BigDecimal::from(1),
            fee: BigDecimal::from(21_000),
            gas_used: BigDecimal::from(21_000),
            cumulative_gas_used: BigDecimal::from(21_000),
            status: TxStatus::Success,
            input: String::new(),
            logs: vec![],
        }],
        traces: vec![],
        transfers: vec![],
        tokens: vec![],
        contracts: vec![],
        proxy_contracts: vec![],
        user_ops: vec![],
        withdrawals: vec![],
        addresses: vec![touched("0xminer", 0), touched("0xa", 1), touched("0xb", 1)],
    }
}

pub fn write_block(dir: &Path, block: &DecodedBlock) {
    let json = serde_json::to_vec_pretty(block).unwrap();
    std::fs::write(dir.join(format!("{}.json", block.height())), json).unwrap();
}

/// Node whose canonical chain the test rewrites as it goes.
#[derive(Default)]
pub struct MockRpc {
    blocks: Mutex<BTreeMap<u64, NodeBlock>>,
}

impl MockRpc {
    pub fn with_chain(self, heights: RangeInclusive<i64>, fork: &str) -> Self {
        self.set_chain(heights, fork);
        self
    }

    /// Makes `heights` canonical on chain `fork`, replacing what was there.
    pub fn set_chain(&self, heights: RangeInclusive<i64>, fork: &str) {
        let mut blocks = self.blocks.lock().unwrap();
        for height in heights {
            blocks.insert(
                height as u64,
                NodeBlock {
                    height: height as u64,
                    hash: hash_of(height, fork),
                    parent_hash: hash_of(height - 1, fork),
                    time: time_of(height),
                },
            );
        }
    }
}

#[async_trait]
impl ChainRpc for MockRpc {
    async fn head(&self) -> Result<u64, IndexerError> {
        Ok(self.blocks.lock().unwrap().keys().next_back().copied().unwrap_or(0))
    }

    async fn block(&self, height: u64) -> Result<Option<NodeBlock>, IndexerError> {
        Ok(self.blocks.lock().unwrap().get(&height).cloned())
    }
}

/// Node that accepts requests and never answers them.
pub struct HangingRpc;

#[async_trait]
impl ChainRpc for HangingRpc {
    async fn head(&self) -> Result<u64, IndexerError> {
        std::future::pending().await
    }

    async fn block(&self, _height: u64) -> Result<Option<NodeBlock>, IndexerError> {
        std::future::pending().await
    }
}
