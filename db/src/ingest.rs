use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;

use bigdecimal::{BigDecimal, Zero};
use rayon::prelude::*;
use scoped_futures::ScopedFutureExt;
use tracing::{debug, info};

use crate::decoded::DecodedBlock;
use crate::error::DbError;
use crate::ledger::{Ledger, LedgerTx, MergeReport};
use crate::models::*;
use crate::reconcile::{self, Direction, TraceEffect, TransferEffect, TxEffect, WithdrawalEffect};
use crate::resolver::{AddressMap, PendingAddresses, TxMap};
use crate::types::{millis_between, non_empty, normalize_hash};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockReport {
    pub height: i64,
    pub txs: usize,
    pub logs: usize,
    pub traces: usize,
    pub transfers: usize,
    pub addresses: MergeReport,
    pub contracts: MergeReport,
    pub tokens: MergeReport,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(BlockReport),
    /// The height is at or below the committed head; nothing was written.
    AlreadyIndexed { height: i64, head: i64 },
    /// The height does not extend the committed head; nothing was written.
    OutOfOrder { height: i64, expected: i64 },
}

/// Writes one decoded block and everything derived from it in a single
/// transaction, advancing the indexer state to the block.
pub async fn save_block<L: Ledger>(
    ledger: &L,
    name: &str,
    block: &DecodedBlock,
) -> Result<SaveOutcome, DbError> {
    let outcome = ledger
        .transaction(|tx| async move { write_block(tx, name, block).await }.scope_boxed())
        .await?;

    if let SaveOutcome::Saved(report) = &outcome {
        info!(
            height = report.height,
            hash = %block.header.hash,
            txs = report.txs,
            new_addresses = report.addresses.inserted,
            "block committed"
        );
    }
    Ok(outcome)
}

pub(crate) async fn write_block<T: LedgerTx + ?Sized>(
    tx: &mut T,
    name: &str,
    block: &DecodedBlock,
) -> Result<SaveOutcome, DbError> {
    let height = block.height();
    let mut state = tx.state(name).await?.unwrap_or_else(|| State::seed(name));

    if let Some(expected) = state.next_height() {
        if height < expected {
            return Ok(SaveOutcome::AlreadyIndexed {
                height,
                head: state.last_height,
            });
        }
        if height != expected {
            return Ok(SaveOutcome::OutOfOrder { height, expected });
        }
    }

    let (addresses, address_report) = PendingAddresses::collect(block).commit(tx).await?;
    // New accounts get their balance row right away, funded or not.
    let opening: Vec<Balance> = addresses
        .created()
        .iter()
        .map(|&id| Balance {
            id,
            value: BigDecimal::zero(),
        })
        .collect();
    tx.merge_balances(&opening).await?;

    let header = &block.header;
    let miner_id = addresses.resolve(&header.miner)?;
    let base_fee_per_gas = header
        .base_fee_per_gas
        .clone()
        .unwrap_or_else(BigDecimal::zero);
    let block_row = Block {
        height,
        hash: normalize_hash(&header.hash),
        parent_hash: normalize_hash(&header.parent_hash),
        time: header.time,
        miner_id,
        base_fee_per_gas,
        gas_limit: header.gas_limit.clone(),
        gas_used: header.gas_used.clone(),
    };
    let stats = BlockStats {
        height,
        time: header.time,
        tx_count: block.txs.len() as i64,
        block_time: if state.is_empty() {
            0
        } else {
            millis_between(state.last_time, header.time)
        },
    };
    tx.insert_block(&block_row).await?;
    tx.insert_block_stats(&stats).await?;

    let new_txs = tx_rows(block, &addresses)?;
    let txs = tx.insert_txs(&new_txs).await?;
    if txs.len() != new_txs.len() {
        return Err(DbError::LengthMismatch {
            op: "insert_txs",
            expected: new_txs.len(),
            actual: txs.len(),
        });
    }
    let tx_ids = TxMap::new(&txs);

    let contracts = contract_rows(block, &addresses, &tx_ids)?;
    let contract_report = MergeReport::of(&tx.upsert_contracts(&contracts).await?);
    let proxies = proxy_rows(block, &addresses)?;
    tx.upsert_proxy_contracts(&proxies).await?;

    let logs = log_rows(block, &addresses, &tx_ids)?;
    tx.insert_logs(&logs).await?;
    let traces = trace_rows(block, &addresses, &tx_ids)?;
    tx.insert_traces(&traces).await?;

    let tokens = token_rows(block, &addresses)?;
    let token_report = MergeReport::of(&tx.upsert_tokens(&tokens).await?);
    let transfers = transfer_rows(block, &addresses, &tx_ids)?;
    tx.insert_transfers(&transfers).await?;
    let token_balances = reconcile::token_deltas(
        Direction::Apply,
        transfers.iter().map(TransferEffect::from),
    );
    tx.merge_token_balances(&token_balances).await?;

    let user_ops = user_op_rows(block, &addresses, &tx_ids)?;
    tx.insert_user_ops(&user_ops).await?;
    let withdrawals = withdrawal_rows(block, &addresses)?;
    tx.insert_withdrawals(&withdrawals).await?;

    let balances = reconcile::native_deltas(
        Direction::Apply,
        miner_id,
        &block_row.base_fee_per_gas,
        new_txs.iter().map(TxEffect::from),
        traces.iter().map(TraceEffect::from),
        withdrawals.iter().map(WithdrawalEffect::from),
        [],
    );
    tx.merge_balances(&balances).await?;

    state.point_at(Some(&block_row));
    state.total_tx += txs.len() as i64;
    state.total_accounts += address_report.inserted as i64;
    state.total_contracts += contract_report.inserted as i64;
    state.total_tokens += token_report.inserted as i64;
    tx.save_state(&state).await?;

    debug!(
        height,
        logs = logs.len(),
        traces = traces.len(),
        transfers = transfers.len(),
        balances = balances.len(),
        "block facts written"
    );

    Ok(SaveOutcome::Saved(BlockReport {
        height,
        txs: txs.len(),
        logs: logs.len(),
        traces: traces.len(),
        transfers: transfers.len(),
        addresses: address_report,
        contracts: contract_report,
        tokens: token_report,
    }))
}

fn tx_rows(block: &DecodedBlock, addresses: &AddressMap) -> Result<Vec<NewTx>, DbError> {
    block
        .txs
        .par_iter()
        .map(|tx| {
            Ok(NewTx {
                height: block.height(),
                hash: normalize_hash(&tx.hash),
                position: tx.position,
                from_id: addresses.resolve(&tx.from)?,
                to_id: addresses.resolve_opt(tx.to.as_deref())?,
                amount: tx.amount.clone(),
                fee: tx.fee.clone(),
                gas_used: tx.gas_used.clone(),
                cumulative_gas_used: tx.cumulative_gas_used.clone(),
                status: tx.status,
                input: tx.input.clone(),
            })
        })
        .collect()
}

fn log_rows(
    block: &DecodedBlock,
    addresses: &AddressMap,
    tx_ids: &TxMap,
) -> Result<Vec<NewLog>, DbError> {
    block
        .txs
        .par_iter()
        .flat_map_iter(|tx| tx.logs.iter().map(move |log| (tx, log)))
        .map(|(tx, log)| {
            Ok(NewLog {
                height: block.height(),
                tx_id: tx_ids.resolve(&tx.hash)?,
                position: log.position,
                address_id: addresses.resolve(&log.address)?,
                topics: log.topics.clone(),
                data: log.data.clone(),
            })
        })
        .collect()
}

fn trace_rows(
    block: &DecodedBlock,
    addresses: &AddressMap,
    tx_ids: &TxMap,
) -> Result<Vec<NewTrace>, DbError> {
    block
        .traces
        .par_iter()
        .map(|trace| {
            Ok(NewTrace {
                height: block.height(),
                tx_id: tx_ids.resolve_opt(trace.tx_hash.as_deref())?,
                from_id: addresses.resolve_opt(trace.from.as_deref())?,
                to_id: addresses.resolve_opt(trace.to.as_deref())?,
                amount: trace.amount.clone(),
                trace_address: trace.trace_address.clone(),
                kind: trace.kind,
                gas_used: trace.gas_used.clone(),
            })
        })
        .collect()
}

fn contract_rows(
    block: &DecodedBlock,
    addresses: &AddressMap,
    tx_ids: &TxMap,
) -> Result<Vec<Contract>, DbError> {
    let rows = block
        .contracts
        .iter()
        .map(|contract| {
            Ok(Contract {
                id: addresses.resolve(&contract.address)?,
                height: block.height(),
                tx_id: tx_ids.resolve_opt(contract.tx_hash.as_deref())?,
                code: non_empty(contract.code.clone()),
                verified: contract.verified,
                compiler_version: non_empty(contract.compiler_version.clone()),
                metadata_link: non_empty(contract.metadata_link.clone()),
                abi: non_empty(contract.abi.clone()),
            })
        })
        .collect::<Result<Vec<_>, DbError>>()?;
    Ok(fold_duplicates(rows, |row| row.id, Contract::merge))
}

fn proxy_rows(block: &DecodedBlock, addresses: &AddressMap) -> Result<Vec<ProxyContract>, DbError> {
    let rows = block
        .proxy_contracts
        .iter()
        .map(|proxy| {
            let implementation_id = addresses.resolve_opt(proxy.implementation.as_deref())?;
            Ok(ProxyContract {
                id: addresses.resolve(&proxy.address)?,
                height: block.height(),
                kind: proxy.kind,
                resolved: implementation_id.is_some(),
                implementation_id,
            })
        })
        .collect::<Result<Vec<_>, DbError>>()?;
    Ok(fold_duplicates(rows, |row| row.id, ProxyContract::merge))
}

fn token_rows(block: &DecodedBlock, addresses: &AddressMap) -> Result<Vec<NewToken>, DbError> {
    let rows = block
        .tokens
        .iter()
        .map(|token| {
            Ok(NewToken {
                token_id: token.token_id.clone(),
                contract_id: addresses.resolve(&token.contract)?,
                kind: token.kind,
                height: block.height(),
                last_height: block.height(),
                transfers_count: token.transfers_count,
                supply: token.supply.clone(),
            })
        })
        .collect::<Result<Vec<_>, DbError>>()?;
    Ok(fold_duplicates(rows, NewToken::key, NewToken::absorb))
}

/// Postgres refuses to update the same row twice within one
/// `ON CONFLICT DO UPDATE` statement, so repeated keys are merged up front.
fn fold_duplicates<T, K: Eq + Hash>(
    rows: Vec<T>,
    key: impl Fn(&T) -> K,
    merge: impl Fn(&mut T, &T),
) -> Vec<T> {
    let mut positions: HashMap<K, usize> = HashMap::with_capacity(rows.len());
    let mut folded: Vec<T> = Vec::with_capacity(rows.len());
    for row in rows {
        match positions.entry(key(&row)) {
            Entry::Occupied(entry) => merge(&mut folded[*entry.get()], &row),
            Entry::Vacant(entry) => {
                entry.insert(folded.len());
                folded.push(row);
            }
        }
    }
    folded
}

fn transfer_rows(
    block: &DecodedBlock,
    addresses: &AddressMap,
    tx_ids: &TxMap,
) -> Result<Vec<NewTransfer>, DbError> {
    block
        .transfers
        .par_iter()
        .map(|transfer| {
            Ok(NewTransfer {
                height: block.height(),
                tx_id: tx_ids.resolve_opt(transfer.tx_hash.as_deref())?,
                contract_id: addresses.resolve(&transfer.contract)?,
                token_id: transfer.token_id.clone(),
                from_id: addresses.resolve_opt(transfer.from.as_deref())?,
                to_id: addresses.resolve_opt(transfer.to.as_deref())?,
                amount: transfer.amount.clone(),
                kind: transfer.kind,
            })
        })
        .collect()
}

fn user_op_rows(
    block: &DecodedBlock,
    addresses: &AddressMap,
    tx_ids: &TxMap,
) -> Result<Vec<NewUserOp>, DbError> {
    block
        .user_ops
        .iter()
        .map(|op| {
            Ok(NewUserOp {
                height: block.height(),
                tx_id: tx_ids.resolve(&op.tx_hash)?,
                hash: op.hash.clone(),
                sender_id: addresses.resolve(&op.sender)?,
                bundler_id: addresses.resolve(&op.bundler)?,
                paymaster_id: addresses.resolve_opt(op.paymaster.as_deref())?,
                success: op.success,
                actual_gas_cost: op.actual_gas_cost.clone(),
                actual_gas_used: op.actual_gas_used.clone(),
            })
        })
        .collect()
}

fn withdrawal_rows(
    block: &DecodedBlock,
    addresses: &AddressMap,
) -> Result<Vec<NewBeaconWithdrawal>, DbError> {
    block
        .withdrawals
        .iter()
        .map(|w| {
            Ok(NewBeaconWithdrawal {
                height: block.height(),
                position: w.position,
                validator_index: w.validator_index,
                address_id: addresses.resolve(&w.address)?,
                amount: w.amount.clone(),
            })
        })
        .collect()
}
