use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bigdecimal::{BigDecimal, Zero};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use futures::future::{BoxFuture, FutureExt};
use scoped_futures::ScopedBoxFuture;
use tokio::sync::Mutex;

use crate::error::DbError;
use crate::ledger::{Ledger, LedgerTx, Upserted};
use crate::models::*;

/// Tables of the in-memory ledger. Public so tests can inspect them.
#[derive(Clone, Debug, Default)]
pub struct MemoryTables {
    pub blocks: BTreeMap<i64, Block>,
    pub block_stats: BTreeMap<i64, BlockStats>,
    pub addresses: BTreeMap<i64, Address>,
    pub balances: BTreeMap<i64, Balance>,
    pub contracts: BTreeMap<i64, Contract>,
    pub proxy_contracts: BTreeMap<i64, ProxyContract>,
    pub txs: Vec<Tx>,
    pub logs: Vec<Log>,
    pub traces: Vec<Trace>,
    pub transfers: Vec<Transfer>,
    pub user_ops: Vec<UserOp>,
    pub withdrawals: Vec<BeaconWithdrawal>,
    pub tokens: BTreeMap<TokenKey, Token>,
    pub token_balances: BTreeMap<TokenBalanceKey, TokenBalance>,
    pub states: BTreeMap<String, State>,
    address_ids: HashMap<String, i64>,
    next_id: i64,
}

impl MemoryTables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn address(&self, hash: &str) -> Option<&Address> {
        self.address_ids
            .get(hash)
            .and_then(|id| self.addresses.get(id))
    }

    /// Balance of an address by hash, zero when it has no row.
    pub fn balance_of(&self, hash: &str) -> BigDecimal {
        self.address(hash)
            .and_then(|address| self.balances.get(&address.id))
            .map(|balance| balance.value.clone())
            .unwrap_or_else(BigDecimal::zero)
    }

    pub fn total_balance(&self) -> BigDecimal {
        self.balances.values().map(|b| &b.value).sum()
    }
}

/// Ledger kept entirely in process memory. A transaction works on a copy of
/// the tables which replaces the originals only when the closure succeeds.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    tables: Mutex<MemoryTables>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> MemoryTables {
        self.tables.lock().await.clone()
    }
}

pub struct MemoryTx {
    tables: MemoryTables,
}

impl Ledger for MemoryLedger {
    type Tx = MemoryTx;

    fn transaction<'a, R, F>(&'a self, f: F) -> BoxFuture<'a, Result<R, DbError>>
    where
        F: for<'r> FnOnce(&'r mut Self::Tx) -> ScopedBoxFuture<'a, 'r, Result<R, DbError>>
            + Send
            + 'a,
        R: Send + 'a,
    {
        async move {
            let mut tables = self.tables.lock().await;
            let mut tx = MemoryTx {
                tables: tables.clone(),
            };
            let out = f(&mut tx).await?;
            *tables = tx.tables;
            Ok(out)
        }
        .boxed()
    }
}

fn unique_violation(what: String) -> DbError {
    DbError::Query(DieselError::DatabaseError(
        DatabaseErrorKind::UniqueViolation,
        Box::new(what),
    ))
}

fn drain_height<T>(rows: &mut Vec<T>, height: i64, row_height: impl Fn(&T) -> i64) -> Vec<T> {
    let (removed, kept): (Vec<T>, Vec<T>) = std::mem::take(rows)
        .into_iter()
        .partition(|row| row_height(row) == height);
    *rows = kept;
    removed
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn state(&mut self, name: &str) -> Result<Option<State>, DbError> {
        Ok(self.tables.states.get(name).cloned())
    }

    async fn save_state(&mut self, state: &State) -> Result<(), DbError> {
        self.tables
            .states
            .insert(state.name.clone(), state.clone());
        Ok(())
    }

    async fn last_block(&mut self) -> Result<Option<Block>, DbError> {
        Ok(self.tables.blocks.values().next_back().cloned())
    }

    async fn insert_block(&mut self, block: &Block) -> Result<(), DbError> {
        if self.tables.blocks.contains_key(&block.height) {
            return Err(unique_violation(format!("block {}", block.height)));
        }
        self.tables.blocks.insert(block.height, block.clone());
        Ok(())
    }

    async fn insert_block_stats(&mut self, stats: &BlockStats) -> Result<(), DbError> {
        if self.tables.block_stats.contains_key(&stats.height) {
            return Err(unique_violation(format!("block stats {}", stats.height)));
        }
        self.tables.block_stats.insert(stats.height, stats.clone());
        Ok(())
    }

    async fn insert_txs(&mut self, txs: &[NewTx]) -> Result<Vec<Tx>, DbError> {
        let mut rows = Vec::with_capacity(txs.len());
        for tx in txs {
            if self.tables.txs.iter().any(|existing| existing.hash == tx.hash) {
                return Err(unique_violation(format!("tx {}", tx.hash)));
            }
            let row = tx.with_id(self.tables.next_id());
            self.tables.txs.push(row.clone());
            rows.push(row);
        }
        Ok(rows)
    }

    async fn insert_logs(&mut self, logs: &[NewLog]) -> Result<usize, DbError> {
        for log in logs {
            let id = self.tables.next_id();
            self.tables.logs.push(Log {
                id,
                height: log.height,
                tx_id: log.tx_id,
                position: log.position,
                address_id: log.address_id,
                topics: log.topics.clone(),
                data: log.data.clone(),
            });
        }
        Ok(logs.len())
    }

    async fn insert_traces(&mut self, traces: &[NewTrace]) -> Result<usize, DbError> {
        for trace in traces {
            let id = self.tables.next_id();
            self.tables.traces.push(Trace {
                id,
                height: trace.height,
                tx_id: trace.tx_id,
                from_id: trace.from_id,
                to_id: trace.to_id,
                amount: trace.amount.clone(),
                trace_address: trace.trace_address.clone(),
                kind: trace.kind,
                gas_used: trace.gas_used.clone(),
            });
        }
        Ok(traces.len())
    }

    async fn insert_transfers(&mut self, transfers: &[NewTransfer]) -> Result<usize, DbError> {
        for transfer in transfers {
            let id = self.tables.next_id();
            self.tables.transfers.push(Transfer {
                id,
                height: transfer.height,
                tx_id: transfer.tx_id,
                contract_id: transfer.contract_id,
                token_id: transfer.token_id.clone(),
                from_id: transfer.from_id,
                to_id: transfer.to_id,
                amount: transfer.amount.clone(),
                kind: transfer.kind,
            });
        }
        Ok(transfers.len())
    }

    async fn insert_user_ops(&mut self, ops: &[NewUserOp]) -> Result<usize, DbError> {
        for op in ops {
            let id = self.tables.next_id();
            self.tables.user_ops.push(UserOp {
                id,
                height: op.height,
                tx_id: op.tx_id,
                hash: op.hash.clone(),
                sender_id: op.sender_id,
                bundler_id: op.bundler_id,
                paymaster_id: op.paymaster_id,
                success: op.success,
                actual_gas_cost: op.actual_gas_cost.clone(),
                actual_gas_used: op.actual_gas_used.clone(),
            });
        }
        Ok(ops.len())
    }

    async fn insert_withdrawals(
        &mut self,
        withdrawals: &[NewBeaconWithdrawal],
    ) -> Result<usize, DbError> {
        for w in withdrawals {
            let id = self.tables.next_id();
            self.tables.withdrawals.push(BeaconWithdrawal {
                id,
                height: w.height,
                position: w.position,
                validator_index: w.validator_index,
                address_id: w.address_id,
                amount: w.amount.clone(),
            });
        }
        Ok(withdrawals.len())
    }

    async fn upsert_addresses(
        &mut self,
        addresses: &[NewAddress],
    ) -> Result<Vec<Upserted<String>>, DbError> {
        let mut out = Vec::with_capacity(addresses.len());
        for incoming in addresses {
            let existing = self.tables.address_ids.get(&incoming.hash).copied();
            let (id, inserted) = match existing {
                Some(id) => {
                    if let Some(row) = self.tables.addresses.get_mut(&id) {
                        row.merge(incoming);
                    }
                    (id, false)
                }
                None => {
                    let id = self.tables.next_id();
                    self.tables
                        .address_ids
                        .insert(incoming.hash.clone(), id);
                    self.tables.addresses.insert(id, incoming.with_id(id));
                    (id, true)
                }
            };
            out.push(Upserted {
                key: incoming.hash.clone(),
                id,
                inserted,
            });
        }
        Ok(out)
    }

    async fn upsert_contracts(
        &mut self,
        contracts: &[Contract],
    ) -> Result<Vec<Upserted<i64>>, DbError> {
        let mut out = Vec::with_capacity(contracts.len());
        for incoming in contracts {
            let inserted = match self.tables.contracts.get_mut(&incoming.id) {
                Some(row) => {
                    row.merge(incoming);
                    false
                }
                None => {
                    self.tables.contracts.insert(incoming.id, incoming.clone());
                    true
                }
            };
            out.push(Upserted {
                key: incoming.id,
                id: incoming.id,
                inserted,
            });
        }
        Ok(out)
    }

    async fn upsert_proxy_contracts(&mut self, proxies: &[ProxyContract]) -> Result<(), DbError> {
        for incoming in proxies {
            match self.tables.proxy_contracts.get_mut(&incoming.id) {
                Some(row) => row.merge(incoming),
                None => {
                    self.tables
                        .proxy_contracts
                        .insert(incoming.id, incoming.clone());
                }
            }
        }
        Ok(())
    }

    async fn upsert_tokens(
        &mut self,
        tokens: &[NewToken],
    ) -> Result<Vec<Upserted<TokenKey>>, DbError> {
        let mut out = Vec::with_capacity(tokens.len());
        for incoming in tokens {
            let key = incoming.key();
            let (id, inserted) = match self.tables.tokens.get_mut(&key) {
                Some(row) => {
                    row.merge(incoming);
                    (row.id, false)
                }
                None => {
                    let id = self.tables.next_id();
                    self.tables.tokens.insert(key.clone(), incoming.with_id(id));
                    (id, true)
                }
            };
            out.push(Upserted { key, id, inserted });
        }
        Ok(out)
    }

    async fn merge_balances(&mut self, deltas: &[Balance]) -> Result<(), DbError> {
        for delta in deltas {
            self.tables
                .balances
                .entry(delta.id)
                .and_modify(|row| row.merge(delta))
                .or_insert_with(|| delta.clone());
        }
        Ok(())
    }

    async fn merge_token_balances(
        &mut self,
        deltas: &[TokenBalance],
    ) -> Result<Vec<TokenBalance>, DbError> {
        let mut out = Vec::with_capacity(deltas.len());
        for delta in deltas {
            let row = self
                .tables
                .token_balances
                .entry(delta.key())
                .and_modify(|row| row.balance += &delta.balance)
                .or_insert_with(|| delta.clone());
            out.push(row.clone());
        }
        Ok(out)
    }

    async fn delete_block(&mut self, height: i64) -> Result<Option<Block>, DbError> {
        Ok(self.tables.blocks.remove(&height))
    }

    async fn delete_block_stats(&mut self, height: i64) -> Result<Option<BlockStats>, DbError> {
        Ok(self.tables.block_stats.remove(&height))
    }

    async fn delete_addresses(&mut self, height: i64) -> Result<Vec<Address>, DbError> {
        let ids: Vec<i64> = self
            .tables
            .addresses
            .values()
            .filter(|a| a.first_height == height)
            .map(|a| a.id)
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(address) = self.tables.addresses.remove(&id) {
                self.tables.address_ids.remove(&address.hash);
                removed.push(address);
            }
        }
        Ok(removed)
    }

    async fn delete_balances(&mut self, ids: &[i64]) -> Result<usize, DbError> {
        Ok(ids
            .iter()
            .filter(|id| self.tables.balances.remove(*id).is_some())
            .count())
    }

    async fn delete_txs(&mut self, height: i64) -> Result<Vec<Tx>, DbError> {
        Ok(drain_height(&mut self.tables.txs, height, |tx| tx.height))
    }

    async fn delete_contracts(&mut self, height: i64) -> Result<Vec<Contract>, DbError> {
        let ids: Vec<i64> = self
            .tables
            .contracts
            .values()
            .filter(|c| c.height == height)
            .map(|c| c.id)
            .collect();
        Ok(ids
            .into_iter()
            .filter_map(|id| self.tables.contracts.remove(&id))
            .collect())
    }

    async fn delete_proxy_contracts(&mut self, height: i64) -> Result<usize, DbError> {
        let before = self.tables.proxy_contracts.len();
        self.tables
            .proxy_contracts
            .retain(|_, proxy| proxy.height != height);
        Ok(before - self.tables.proxy_contracts.len())
    }

    async fn delete_logs(&mut self, height: i64) -> Result<usize, DbError> {
        Ok(drain_height(&mut self.tables.logs, height, |log| log.height).len())
    }

    async fn delete_traces(&mut self, height: i64) -> Result<Vec<Trace>, DbError> {
        Ok(drain_height(&mut self.tables.traces, height, |t| t.height))
    }

    async fn delete_transfers(&mut self, height: i64) -> Result<Vec<Transfer>, DbError> {
        Ok(drain_height(&mut self.tables.transfers, height, |t| t.height))
    }

    async fn delete_tokens(&mut self, height: i64) -> Result<Vec<Token>, DbError> {
        let keys: Vec<TokenKey> = self
            .tables
            .tokens
            .values()
            .filter(|t| t.height == height)
            .map(|t| t.key())
            .collect();
        Ok(keys
            .into_iter()
            .filter_map(|key| self.tables.tokens.remove(&key))
            .collect())
    }

    async fn delete_user_ops(&mut self, height: i64) -> Result<usize, DbError> {
        Ok(drain_height(&mut self.tables.user_ops, height, |op| op.height).len())
    }

    async fn delete_withdrawals(&mut self, height: i64) -> Result<Vec<BeaconWithdrawal>, DbError> {
        Ok(drain_height(&mut self.tables.withdrawals, height, |w| w.height))
    }

    async fn delete_token_balances(&mut self, keys: &[TokenBalanceKey]) -> Result<usize, DbError> {
        Ok(keys
            .iter()
            .filter(|key| self.tables.token_balances.remove(*key).is_some())
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use scoped_futures::ScopedFutureExt;

    fn address(hash: &str, height: i64, txs_count: i64) -> NewAddress {
        NewAddress {
            hash: hash.into(),
            first_height: height,
            last_height: height,
            is_contract: false,
            txs_count,
            contracts_count: 0,
            interactions: 0,
        }
    }

    #[tokio::test]
    async fn failed_transaction_leaves_tables_untouched() {
        let ledger = MemoryLedger::new();
        let result: Result<(), DbError> = ledger
            .transaction(|tx| {
                async move {
                    tx.upsert_addresses(&[address("0xaa", 1, 1)]).await?;
                    Err(DbError::UnresolvedAddress("0xbb".into()))
                }
                .scope_boxed()
            })
            .await;

        assert!(matches!(result, Err(DbError::UnresolvedAddress(_))));
        assert!(ledger.snapshot().await.addresses.is_empty());
    }

    #[tokio::test]
    async fn upsert_reports_inserts_then_merges() {
        let ledger = MemoryLedger::new();
        let rows = [address("0xaa", 1, 1), address("0xbb", 1, 2)];
        let rows = &rows;

        let first = ledger
            .transaction(|tx| async move { tx.upsert_addresses(rows).await }.scope_boxed())
            .await
            .unwrap();
        let second = ledger
            .transaction(|tx| async move { tx.upsert_addresses(&rows[..1]).await }.scope_boxed())
            .await
            .unwrap();

        assert!(first.iter().all(|row| row.inserted));
        assert_eq!(second.len(), 1);
        assert!(!second[0].inserted);
        assert_eq!(second[0].id, first[0].id);
    }

    #[tokio::test]
    async fn duplicate_tx_hash_is_rejected() {
        let ledger = MemoryLedger::new();
        let tx_row = NewTx {
            height: 1,
            hash: "0xt".into(),
            position: 0,
            from_id: 1,
            to_id: None,
            amount: BigDecimal::zero(),
            fee: BigDecimal::zero(),
            gas_used: BigDecimal::zero(),
            cumulative_gas_used: BigDecimal::zero(),
            status: crate::types::TxStatus::Success,
            input: String::new(),
        };
        let rows = [tx_row.clone(), tx_row];

        let result = ledger
            .transaction(|tx| async move { tx.insert_txs(&rows).await }.scope_boxed())
            .await;

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            DbError::Query(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _))
        ));
        assert!(!err.is_transient());
        assert!(ledger.snapshot().await.txs.is_empty());
    }
}
