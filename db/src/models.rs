use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::types::{ProxyKind, TokenKind, TraceKind, TransferKind, TxStatus};

#[derive(
    Clone,
    Debug,
    Queryable,
    Selectable,
    Insertable,
    Identifiable,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
)]
#[diesel(primary_key(height))]
#[diesel(table_name = crate::schema::blocks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Block {
    pub height: i64,
    pub hash: String,
    pub parent_hash: String,
    pub time: DateTime<Utc>,
    pub miner_id: i64,
    pub base_fee_per_gas: BigDecimal,
    pub gas_limit: BigDecimal,
    pub gas_used: BigDecimal,
}

#[derive(Clone, Debug, Queryable, Selectable, Insertable, Serialize, Deserialize, PartialEq, Eq)]
#[diesel(table_name = crate::schema::block_stats)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct BlockStats {
    pub height: i64,
    pub time: DateTime<Utc>,
    pub tx_count: i64,
    /// Milliseconds since the previous indexed block.
    pub block_time: i64,
}

#[derive(
    Clone,
    Debug,
    Queryable,
    Selectable,
    Identifiable,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
)]
#[diesel(table_name = crate::schema::addresses)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Address {
    pub id: i64,
    pub hash: String,
    pub first_height: i64,
    pub last_height: i64,
    pub is_contract: bool,
    pub txs_count: i64,
    pub contracts_count: i64,
    pub interactions: i64,
}

#[derive(Clone, Debug, Insertable, Serialize, Deserialize, PartialEq, Eq)]
#[diesel(table_name = crate::schema::addresses)]
pub struct NewAddress {
    pub hash: String,
    pub first_height: i64,
    pub last_height: i64,
    pub is_contract: bool,
    pub txs_count: i64,
    pub contracts_count: i64,
    pub interactions: i64,
}

impl NewAddress {
    /// Folds another occurrence of the same address into this one. Heights
    /// widen, flags only ever turn on and counters add up.
    pub fn absorb(&mut self, other: &NewAddress) {
        self.first_height = self.first_height.min(other.first_height);
        self.last_height = self.last_height.max(other.last_height);
        self.is_contract |= other.is_contract;
        self.txs_count += other.txs_count;
        self.contracts_count += other.contracts_count;
        self.interactions += other.interactions;
    }

    pub fn with_id(&self, id: i64) -> Address {
        Address {
            id,
            hash: self.hash.clone(),
            first_height: self.first_height,
            last_height: self.last_height,
            is_contract: self.is_contract,
            txs_count: self.txs_count,
            contracts_count: self.contracts_count,
            interactions: self.interactions,
        }
    }
}

impl From<&Address> for NewAddress {
    fn from(address: &Address) -> Self {
        NewAddress {
            hash: address.hash.clone(),
            first_height: address.first_height,
            last_height: address.last_height,
            is_contract: address.is_contract,
            txs_count: address.txs_count,
            contracts_count: address.contracts_count,
            interactions: address.interactions,
        }
    }
}

impl Address {
    pub fn merge(&mut self, incoming: &NewAddress) {
        let mut merged = NewAddress::from(&*self);
        merged.absorb(incoming);
        *self = merged.with_id(self.id);
    }
}

#[derive(Clone, Debug, Queryable, Selectable, Insertable, Serialize, Deserialize, PartialEq, Eq)]
#[diesel(table_name = crate::schema::balances)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Balance {
    pub id: i64,
    pub value: BigDecimal,
}

impl Balance {
    pub fn merge(&mut self, incoming: &Balance) {
        self.value += &incoming.value;
    }
}

#[derive(Clone, Debug, Queryable, Selectable, Insertable, Serialize, Deserialize, PartialEq, Eq)]
#[diesel(table_name = crate::schema::contracts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Contract {
    /// Same id as the contract's `Address` row.
    pub id: i64,
    pub height: i64,
    pub tx_id: Option<i64>,
    pub code: Option<String>,
    pub verified: bool,
    pub compiler_version: Option<String>,
    pub metadata_link: Option<String>,
    pub abi: Option<String>,
}

fn coalesce<T: Clone>(existing: &mut Option<T>, incoming: &Option<T>) {
    if incoming.is_some() {
        existing.clone_from(incoming);
    }
}

impl Contract {
    pub fn merge(&mut self, incoming: &Contract) {
        self.height = self.height.min(incoming.height);
        coalesce(&mut self.tx_id, &incoming.tx_id);
        coalesce(&mut self.code, &incoming.code);
        coalesce(&mut self.compiler_version, &incoming.compiler_version);
        coalesce(&mut self.metadata_link, &incoming.metadata_link);
        coalesce(&mut self.abi, &incoming.abi);
        self.verified |= incoming.verified;
    }
}

#[derive(Clone, Debug, Queryable, Selectable, Insertable, Serialize, Deserialize, PartialEq, Eq)]
#[diesel(table_name = crate::schema::proxy_contracts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ProxyContract {
    pub id: i64,
    pub height: i64,
    pub kind: ProxyKind,
    pub resolved: bool,
    pub implementation_id: Option<i64>,
}

impl ProxyContract {
    pub fn merge(&mut self, incoming: &ProxyContract) {
        self.height = self.height.min(incoming.height);
        coalesce(&mut self.implementation_id, &incoming.implementation_id);
        self.resolved |= incoming.resolved;
    }
}

#[derive(Clone, Debug, Queryable, Selectable, Serialize, Deserialize, PartialEq, Eq)]
#[diesel(table_name = crate::schema::txs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Tx {
    pub id: i64,
    pub height: i64,
    pub hash: String,
    pub position: i64,
    pub from_id: i64,
    pub to_id: Option<i64>,
    pub amount: BigDecimal,
    pub fee: BigDecimal,
    pub gas_used: BigDecimal,
    pub cumulative_gas_used: BigDecimal,
    pub status: TxStatus,
    pub input: String,
}

#[derive(Clone, Debug, Insertable, PartialEq, Eq)]
#[diesel(table_name = crate::schema::txs)]
pub struct NewTx {
    pub height: i64,
    pub hash: String,
    pub position: i64,
    pub from_id: i64,
    pub to_id: Option<i64>,
    pub amount: BigDecimal,
    pub fee: BigDecimal,
    pub gas_used: BigDecimal,
    pub cumulative_gas_used: BigDecimal,
    pub status: TxStatus,
    pub input: String,
}

impl NewTx {
    pub fn with_id(&self, id: i64) -> Tx {
        Tx {
            id,
            height: self.height,
            hash: self.hash.clone(),
            position: self.position,
            from_id: self.from_id,
            to_id: self.to_id,
            amount: self.amount.clone(),
            fee: self.fee.clone(),
            gas_used: self.gas_used.clone(),
            cumulative_gas_used: self.cumulative_gas_used.clone(),
            status: self.status,
            input: self.input.clone(),
        }
    }
}

#[derive(Clone, Debug, Queryable, Selectable, Serialize, Deserialize, PartialEq, Eq)]
#[diesel(table_name = crate::schema::logs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Log {
    pub id: i64,
    pub height: i64,
    pub tx_id: i64,
    pub position: i64,
    pub address_id: i64,
    pub topics: Vec<String>,
    pub data: String,
}

#[derive(Clone, Debug, Insertable, PartialEq, Eq)]
#[diesel(table_name = crate::schema::logs)]
pub struct NewLog {
    pub height: i64,
    pub tx_id: i64,
    pub position: i64,
    pub address_id: i64,
    pub topics: Vec<String>,
    pub data: String,
}

#[derive(Clone, Debug, Queryable, Selectable, Serialize, Deserialize, PartialEq, Eq)]
#[diesel(table_name = crate::schema::traces)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Trace {
    pub id: i64,
    pub height: i64,
    pub tx_id: Option<i64>,
    pub from_id: Option<i64>,
    pub to_id: Option<i64>,
    pub amount: Option<BigDecimal>,
    pub trace_address: Vec<i32>,
    pub kind: TraceKind,
    pub gas_used: BigDecimal,
}

#[derive(Clone, Debug, Insertable, PartialEq, Eq)]
#[diesel(table_name = crate::schema::traces)]
pub struct NewTrace {
    pub height: i64,
    pub tx_id: Option<i64>,
    pub from_id: Option<i64>,
    pub to_id: Option<i64>,
    pub amount: Option<BigDecimal>,
    pub trace_address: Vec<i32>,
    pub kind: TraceKind,
    pub gas_used: BigDecimal,
}

#[derive(Clone, Debug, Queryable, Selectable, Serialize, Deserialize, PartialEq, Eq)]
#[diesel(table_name = crate::schema::transfers)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Transfer {
    pub id: i64,
    pub height: i64,
    pub tx_id: Option<i64>,
    pub contract_id: i64,
    pub token_id: BigDecimal,
    pub from_id: Option<i64>,
    pub to_id: Option<i64>,
    pub amount: BigDecimal,
    pub kind: TransferKind,
}

#[derive(Clone, Debug, Insertable, PartialEq, Eq)]
#[diesel(table_name = crate::schema::transfers)]
pub struct NewTransfer {
    pub height: i64,
    pub tx_id: Option<i64>,
    pub contract_id: i64,
    pub token_id: BigDecimal,
    pub from_id: Option<i64>,
    pub to_id: Option<i64>,
    pub amount: BigDecimal,
    pub kind: TransferKind,
}

#[derive(Clone, Debug, Queryable, Selectable, Serialize, Deserialize, PartialEq, Eq)]
#[diesel(table_name = crate::schema::erc4337_user_ops)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct UserOp {
    pub id: i64,
    pub height: i64,
    pub tx_id: i64,
    pub hash: String,
    pub sender_id: i64,
    pub bundler_id: i64,
    pub paymaster_id: Option<i64>,
    pub success: bool,
    pub actual_gas_cost: BigDecimal,
    pub actual_gas_used: BigDecimal,
}

#[derive(Clone, Debug, Insertable, PartialEq, Eq)]
#[diesel(table_name = crate::schema::erc4337_user_ops)]
pub struct NewUserOp {
    pub height: i64,
    pub tx_id: i64,
    pub hash: String,
    pub sender_id: i64,
    pub bundler_id: i64,
    pub paymaster_id: Option<i64>,
    pub success: bool,
    pub actual_gas_cost: BigDecimal,
    pub actual_gas_used: BigDecimal,
}

#[derive(Clone, Debug, Queryable, Selectable, Serialize, Deserialize, PartialEq, Eq)]
#[diesel(table_name = crate::schema::beacon_withdrawals)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct BeaconWithdrawal {
    pub id: i64,
    pub height: i64,
    pub position: i64,
    pub validator_index: i64,
    pub address_id: i64,
    pub amount: BigDecimal,
}

#[derive(Clone, Debug, Insertable, PartialEq, Eq)]
#[diesel(table_name = crate::schema::beacon_withdrawals)]
pub struct NewBeaconWithdrawal {
    pub height: i64,
    pub position: i64,
    pub validator_index: i64,
    pub address_id: i64,
    pub amount: BigDecimal,
}

#[derive(Clone, Debug, Queryable, Selectable, Serialize, Deserialize, PartialEq, Eq)]
#[diesel(table_name = crate::schema::tokens)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Token {
    pub id: i64,
    pub token_id: BigDecimal,
    pub contract_id: i64,
    pub kind: TokenKind,
    /// Height the token was first seen at.
    pub height: i64,
    pub last_height: i64,
    pub transfers_count: i64,
    pub supply: BigDecimal,
}

#[derive(Clone, Debug, Insertable, PartialEq, Eq)]
#[diesel(table_name = crate::schema::tokens)]
pub struct NewToken {
    pub token_id: BigDecimal,
    pub contract_id: i64,
    pub kind: TokenKind,
    pub height: i64,
    pub last_height: i64,
    pub transfers_count: i64,
    pub supply: BigDecimal,
}

impl NewToken {
    pub fn key(&self) -> TokenKey {
        TokenKey {
            token_id: self.token_id.clone(),
            contract_id: self.contract_id,
        }
    }

    pub fn absorb(&mut self, other: &NewToken) {
        self.height = self.height.min(other.height);
        self.last_height = self.last_height.max(other.last_height);
        self.transfers_count += other.transfers_count;
        self.supply += &other.supply;
    }

    pub fn with_id(&self, id: i64) -> Token {
        Token {
            id,
            token_id: self.token_id.clone(),
            contract_id: self.contract_id,
            kind: self.kind,
            height: self.height,
            last_height: self.last_height,
            transfers_count: self.transfers_count,
            supply: self.supply.clone(),
        }
    }
}

impl Token {
    pub fn key(&self) -> TokenKey {
        TokenKey {
            token_id: self.token_id.clone(),
            contract_id: self.contract_id,
        }
    }

    pub fn merge(&mut self, incoming: &NewToken) {
        self.height = self.height.min(incoming.height);
        self.last_height = self.last_height.max(incoming.last_height);
        self.transfers_count += incoming.transfers_count;
        self.supply += &incoming.supply;
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TokenKey {
    pub token_id: BigDecimal,
    pub contract_id: i64,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TokenBalanceKey {
    pub token_id: BigDecimal,
    pub contract_id: i64,
    pub address_id: i64,
}

impl TokenBalanceKey {
    pub fn token(&self) -> TokenKey {
        TokenKey {
            token_id: self.token_id.clone(),
            contract_id: self.contract_id,
        }
    }
}

#[derive(Clone, Debug, Queryable, Selectable, Insertable, Serialize, Deserialize, PartialEq, Eq)]
#[diesel(table_name = crate::schema::token_balances)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TokenBalance {
    pub token_id: BigDecimal,
    pub contract_id: i64,
    pub address_id: i64,
    pub balance: BigDecimal,
}

impl TokenBalance {
    pub fn key(&self) -> TokenBalanceKey {
        TokenBalanceKey {
            token_id: self.token_id.clone(),
            contract_id: self.contract_id,
            address_id: self.address_id,
        }
    }
}

#[derive(Clone, Debug, Queryable, Selectable, Insertable, Serialize, Deserialize, PartialEq, Eq)]
#[diesel(table_name = crate::schema::states)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct State {
    pub name: String,
    pub last_height: i64,
    pub last_hash: String,
    pub last_time: DateTime<Utc>,
    pub total_tx: i64,
    pub total_accounts: i64,
    pub total_contracts: i64,
    pub total_tokens: i64,
    pub total_verified_contracts: i64,
}

impl State {
    pub fn seed(name: &str) -> Self {
        State {
            name: name.to_string(),
            last_height: 0,
            last_hash: String::new(),
            last_time: DateTime::<Utc>::UNIX_EPOCH,
            total_tx: 0,
            total_accounts: 0,
            total_contracts: 0,
            total_tokens: 0,
            total_verified_contracts: 0,
        }
    }

    /// An empty `last_hash` means no block has been committed yet.
    pub fn is_empty(&self) -> bool {
        self.last_hash.is_empty()
    }

    /// Height the next forward ingestion must carry, if known.
    pub fn next_height(&self) -> Option<i64> {
        (!self.is_empty()).then(|| self.last_height + 1)
    }

    pub fn point_at(&mut self, head: Option<&Block>) {
        match head {
            Some(block) => {
                self.last_height = block.height;
                self.last_hash = block.hash.clone();
                self.last_time = block.time;
            }
            None => {
                self.last_height = 0;
                self.last_hash = String::new();
                self.last_time = DateTime::<Utc>::UNIX_EPOCH;
            }
        }
    }
}
