use async_trait::async_trait;
use futures::future::BoxFuture;
use scoped_futures::{ScopedBoxFuture, ScopedFutureExt};

use crate::error::DbError;
use crate::models::*;

/// Result of a merge-upsert for a single input row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upserted<K> {
    pub key: K,
    pub id: i64,
    /// `false` when the row already existed and was merged into.
    pub inserted: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub merged: usize,
}

impl MergeReport {
    pub fn of<K>(rows: &[Upserted<K>]) -> Self {
        let inserted = rows.iter().filter(|row| row.inserted).count();
        MergeReport {
            inserted,
            merged: rows.len() - inserted,
        }
    }
}

/// Primitive reads and writes available inside one ledger transaction.
///
/// Insert-only methods append and are not idempotent. Merge methods combine
/// with whatever is already stored under the same key.
#[async_trait]
pub trait LedgerTx: Send {
    async fn state(&mut self, name: &str) -> Result<Option<State>, DbError>;
    async fn save_state(&mut self, state: &State) -> Result<(), DbError>;
    async fn last_block(&mut self) -> Result<Option<Block>, DbError>;

    async fn insert_block(&mut self, block: &Block) -> Result<(), DbError>;
    async fn insert_block_stats(&mut self, stats: &BlockStats) -> Result<(), DbError>;
    async fn insert_txs(&mut self, txs: &[NewTx]) -> Result<Vec<Tx>, DbError>;
    async fn insert_logs(&mut self, logs: &[NewLog]) -> Result<usize, DbError>;
    async fn insert_traces(&mut self, traces: &[NewTrace]) -> Result<usize, DbError>;
    async fn insert_transfers(&mut self, transfers: &[NewTransfer]) -> Result<usize, DbError>;
    async fn insert_user_ops(&mut self, ops: &[NewUserOp]) -> Result<usize, DbError>;
    async fn insert_withdrawals(
        &mut self,
        withdrawals: &[NewBeaconWithdrawal],
    ) -> Result<usize, DbError>;

    async fn upsert_addresses(
        &mut self,
        addresses: &[NewAddress],
    ) -> Result<Vec<Upserted<String>>, DbError>;
    async fn upsert_contracts(
        &mut self,
        contracts: &[Contract],
    ) -> Result<Vec<Upserted<i64>>, DbError>;
    async fn upsert_proxy_contracts(&mut self, proxies: &[ProxyContract]) -> Result<(), DbError>;
    async fn upsert_tokens(&mut self, tokens: &[NewToken])
        -> Result<Vec<Upserted<TokenKey>>, DbError>;
    async fn merge_balances(&mut self, deltas: &[Balance]) -> Result<(), DbError>;
    /// Adds the deltas and returns the resulting rows.
    async fn merge_token_balances(
        &mut self,
        deltas: &[TokenBalance],
    ) -> Result<Vec<TokenBalance>, DbError>;

    async fn delete_block(&mut self, height: i64) -> Result<Option<Block>, DbError>;
    async fn delete_block_stats(&mut self, height: i64) -> Result<Option<BlockStats>, DbError>;
    /// Deletes addresses first seen at `height`.
    async fn delete_addresses(&mut self, height: i64) -> Result<Vec<Address>, DbError>;
    async fn delete_balances(&mut self, ids: &[i64]) -> Result<usize, DbError>;
    async fn delete_txs(&mut self, height: i64) -> Result<Vec<Tx>, DbError>;
    async fn delete_contracts(&mut self, height: i64) -> Result<Vec<Contract>, DbError>;
    async fn delete_proxy_contracts(&mut self, height: i64) -> Result<usize, DbError>;
    async fn delete_logs(&mut self, height: i64) -> Result<usize, DbError>;
    async fn delete_traces(&mut self, height: i64) -> Result<Vec<Trace>, DbError>;
    async fn delete_transfers(&mut self, height: i64) -> Result<Vec<Transfer>, DbError>;
    async fn delete_tokens(&mut self, height: i64) -> Result<Vec<Token>, DbError>;
    async fn delete_user_ops(&mut self, height: i64) -> Result<usize, DbError>;
    async fn delete_withdrawals(&mut self, height: i64)
        -> Result<Vec<BeaconWithdrawal>, DbError>;
    async fn delete_token_balances(&mut self, keys: &[TokenBalanceKey])
        -> Result<usize, DbError>;
}

/// A store that can run a closure atomically: everything the closure wrote
/// is committed when it returns `Ok`, nothing when it returns `Err`.
pub trait Ledger: Send + Sync + 'static {
    type Tx: LedgerTx;

    fn transaction<'a, R, F>(&'a self, f: F) -> BoxFuture<'a, Result<R, DbError>>
    where
        F: for<'r> FnOnce(&'r mut Self::Tx) -> ScopedBoxFuture<'a, 'r, Result<R, DbError>>
            + Send
            + 'a,
        R: Send + 'a;
}

pub async fn load_state<L: Ledger>(ledger: &L, name: &str) -> Result<Option<State>, DbError> {
    ledger
        .transaction(|tx| async move { tx.state(name).await }.scope_boxed())
        .await
}

pub async fn head<L: Ledger>(ledger: &L) -> Result<Option<Block>, DbError> {
    ledger
        .transaction(|tx| async move { tx.last_block().await }.scope_boxed())
        .await
}
