//! Blocks as handed over by the decoder: every reference to an account or a
//! transaction is still a hex string, ids are only assigned once the
//! touched addresses have been committed.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ProxyKind, TokenKind, TraceKind, TransferKind, TxStatus};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecodedBlock {
    pub header: DecodedHeader,
    #[serde(default)]
    pub txs: Vec<DecodedTx>,
    #[serde(default)]
    pub traces: Vec<DecodedTrace>,
    #[serde(default)]
    pub transfers: Vec<DecodedTransfer>,
    #[serde(default)]
    pub tokens: Vec<DecodedToken>,
    #[serde(default)]
    pub contracts: Vec<DecodedContract>,
    #[serde(default)]
    pub proxy_contracts: Vec<DecodedProxyContract>,
    #[serde(default)]
    pub user_ops: Vec<DecodedUserOp>,
    #[serde(default)]
    pub withdrawals: Vec<DecodedWithdrawal>,
    /// Every address the block touches, duplicates included.
    #[serde(default)]
    pub addresses: Vec<DecodedAddress>,
}

impl DecodedBlock {
    pub fn height(&self) -> i64 {
        self.header.height
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecodedHeader {
    pub height: i64,
    pub hash: String,
    pub parent_hash: String,
    pub time: DateTime<Utc>,
    pub miner: String,
    #[serde(default)]
    pub base_fee_per_gas: Option<BigDecimal>,
    pub gas_limit: BigDecimal,
    pub gas_used: BigDecimal,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecodedTx {
    pub hash: String,
    pub position: i64,
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    pub amount: BigDecimal,
    pub fee: BigDecimal,
    pub gas_used: BigDecimal,
    pub cumulative_gas_used: BigDecimal,
    pub status: TxStatus,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub logs: Vec<DecodedLog>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecodedLog {
    pub position: i64,
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecodedTrace {
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub amount: Option<BigDecimal>,
    #[serde(default)]
    pub trace_address: Vec<i32>,
    pub kind: TraceKind,
    pub gas_used: BigDecimal,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecodedTransfer {
    #[serde(default)]
    pub tx_hash: Option<String>,
    pub contract: String,
    pub token_id: BigDecimal,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    pub amount: BigDecimal,
    pub kind: TransferKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecodedToken {
    pub contract: String,
    pub token_id: BigDecimal,
    pub kind: TokenKind,
    pub transfers_count: i64,
    pub supply: BigDecimal,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecodedContract {
    pub address: String,
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub compiler_version: Option<String>,
    #[serde(default)]
    pub metadata_link: Option<String>,
    #[serde(default)]
    pub abi: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecodedProxyContract {
    pub address: String,
    pub kind: ProxyKind,
    #[serde(default)]
    pub implementation: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecodedUserOp {
    pub tx_hash: String,
    pub hash: String,
    pub sender: String,
    pub bundler: String,
    #[serde(default)]
    pub paymaster: Option<String>,
    pub success: bool,
    pub actual_gas_cost: BigDecimal,
    pub actual_gas_used: BigDecimal,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecodedWithdrawal {
    pub position: i64,
    pub validator_index: i64,
    pub address: String,
    pub amount: BigDecimal,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecodedAddress {
    pub hash: String,
    #[serde(default)]
    pub is_contract: bool,
    #[serde(default)]
    pub txs_count: i64,
    #[serde(default)]
    pub contracts_count: i64,
    #[serde(default)]
    pub interactions: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_minimal_block_json() {
        let json = r#"{
            "header": {
                "height": 100,
                "hash": "0xb100",
                "parent_hash": "0xb099",
                "time": "2024-11-04T10:00:00Z",
                "miner": "0xMINER",
                "base_fee_per_gas": "7",
                "gas_limit": "30000000",
                "gas_used": "21000"
            },
            "txs": [{
                "hash": "0xt1",
                "position": 0,
                "from": "0xA",
                "amount": "10",
                "fee": "1",
                "gas_used": "21000",
                "cumulative_gas_used": "21000",
                "status": "success"
            }],
            "addresses": [{"hash": "0xA", "txs_count": 1}, {"hash": "0xminer"}]
        }"#;

        let block: DecodedBlock = serde_json::from_str(json).unwrap();
        assert_eq!(block.height(), 100);
        assert_eq!(block.txs[0].to, None);
        assert_eq!(block.txs[0].status, TxStatus::Success);
        assert_eq!(block.header.base_fee_per_gas, Some(BigDecimal::from(7)));
        assert!(block.traces.is_empty());
        assert_eq!(block.addresses.len(), 2);
    }
}
