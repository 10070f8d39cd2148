use std::collections::HashSet;

use bigdecimal::Zero;
use scoped_futures::ScopedFutureExt;
use tracing::{debug, info};

use crate::error::DbError;
use crate::ledger::{Ledger, LedgerTx};
use crate::models::{State, TokenBalanceKey, TokenKey};
use crate::reconcile::{self, Direction, TraceEffect, TransferEffect, TxEffect, WithdrawalEffect};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RollbackReport {
    /// Height that was removed.
    pub height: i64,
    pub hash: String,
    pub txs: usize,
    pub addresses: usize,
    pub contracts: usize,
    pub tokens: usize,
    pub pruned_token_balances: usize,
    /// Head after the step, `None` once the ledger is empty.
    pub new_head: Option<i64>,
}

/// Removes the highest committed block and everything derived from it in one
/// transaction, reverting its balance effects. Returns `None` when there is
/// nothing left to roll back.
pub async fn rollback_head<L: Ledger>(
    ledger: &L,
    name: &str,
) -> Result<Option<RollbackReport>, DbError> {
    let report = ledger
        .transaction(|tx| async move { unwind_head(tx, name).await }.scope_boxed())
        .await?;

    if let Some(report) = &report {
        info!(
            height = report.height,
            hash = %report.hash,
            txs = report.txs,
            new_head = ?report.new_head,
            "block rolled back"
        );
    }
    Ok(report)
}

pub(crate) async fn unwind_head<T: LedgerTx + ?Sized>(
    tx: &mut T,
    name: &str,
) -> Result<Option<RollbackReport>, DbError> {
    let Some(head) = tx.last_block().await? else {
        return Ok(None);
    };
    let height = head.height;

    let block = tx
        .delete_block(height)
        .await?
        .ok_or(DbError::MissingBlock(height))?;
    let stats = tx.delete_block_stats(height).await?;
    let addresses = tx.delete_addresses(height).await?;
    let txs = tx.delete_txs(height).await?;
    let contracts = tx.delete_contracts(height).await?;
    let proxies = tx.delete_proxy_contracts(height).await?;
    let logs = tx.delete_logs(height).await?;
    let traces = tx.delete_traces(height).await?;
    let transfers = tx.delete_transfers(height).await?;
    let tokens = tx.delete_tokens(height).await?;
    let user_ops = tx.delete_user_ops(height).await?;
    let withdrawals = tx.delete_withdrawals(height).await?;

    let deleted_ids: Vec<i64> = addresses.iter().map(|a| a.id).collect();
    tx.delete_balances(&deleted_ids).await?;

    let balances = reconcile::native_deltas(
        Direction::Revert,
        block.miner_id,
        &block.base_fee_per_gas,
        txs.iter().map(TxEffect::from),
        traces.iter().map(TraceEffect::from),
        withdrawals.iter().map(WithdrawalEffect::from),
        deleted_ids.iter().copied(),
    );
    tx.merge_balances(&balances).await?;

    let token_deltas =
        reconcile::token_deltas(Direction::Revert, transfers.iter().map(TransferEffect::from));
    let merged = tx.merge_token_balances(&token_deltas).await?;
    let deleted_tokens: HashSet<TokenKey> = tokens.iter().map(|t| t.key()).collect();
    let deleted_holders: HashSet<i64> = deleted_ids.iter().copied().collect();
    let prunable: Vec<TokenBalanceKey> = merged
        .iter()
        .filter(|row| row.balance.is_zero())
        .map(|row| row.key())
        .filter(|key| {
            deleted_tokens.contains(&key.token()) || deleted_holders.contains(&key.address_id)
        })
        .collect();
    let pruned = tx.delete_token_balances(&prunable).await?;

    let new_head = tx.last_block().await?;
    let mut state = tx.state(name).await?.unwrap_or_else(|| State::seed(name));
    state.point_at(new_head.as_ref());
    state.total_tx -= stats.as_ref().map_or(0, |s| s.tx_count);
    state.total_accounts -= addresses.len() as i64;
    state.total_contracts -= contracts.len() as i64;
    state.total_tokens -= tokens.len() as i64;
    tx.save_state(&state).await?;

    debug!(
        height,
        proxies,
        logs,
        user_ops,
        balances = balances.len(),
        token_balances = token_deltas.len(),
        "height removed"
    );

    Ok(Some(RollbackReport {
        height,
        hash: block.hash,
        txs: txs.len(),
        addresses: addresses.len(),
        contracts: contracts.len(),
        tokens: tokens.len(),
        pruned_token_balances: pruned,
        new_head: new_head.map(|b| b.height),
    }))
}
