use std::collections::BTreeMap;

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, TimeZone, Utc};
use db::{
    head, load_state, rollback_head, save_block, DbError, DecodedAddress, DecodedBlock,
    DecodedHeader, DecodedToken, DecodedTrace, DecodedTransfer, DecodedTx, DecodedWithdrawal,
    Ledger, LedgerTx, MemoryLedger, MemoryTables, NewAddress, SaveOutcome, ScopedFutureExt,
    TokenKind, TraceKind, TransferKind, TxStatus,
};
use pretty_assertions::assert_eq;

const NAME: &str = "test";
const MINER: &str = "0xminer";

fn dec(v: i64) -> BigDecimal {
    BigDecimal::from(v)
}

fn time_of(height: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + height * 12, 0).unwrap()
}

fn block(height: i64) -> DecodedBlock {
    block_on_fork(height, "")
}

fn block_on_fork(height: i64, fork: &str) -> DecodedBlock {
    let mut block = DecodedBlock {
        header: DecodedHeader {
            height,
            hash: format!("0xb{fork}{height}"),
            parent_hash: format!("0xb{fork}{}", height - 1),
            time: time_of(height),
            miner: MINER.into(),
            base_fee_per_gas: Some(dec(0)),
            gas_limit: dec(30_000_000),
            gas_used: dec(0),
        },
        txs: vec![],
        traces: vec![],
        transfers: vec![],
        tokens: vec![],
        contracts: vec![],
        proxy_contracts: vec![],
        user_ops: vec![],
        withdrawals: vec![],
        addresses: vec![],
    };
    touch(&mut block, MINER, 0);
    block
}

fn touch(block: &mut DecodedBlock, hash: &str, txs_count: i64) {
    block.addresses.push(DecodedAddress {
        hash: hash.into(),
        is_contract: false,
        txs_count,
        contracts_count: 0,
        interactions: 1,
    });
}

fn with_base_fee(mut block: DecodedBlock, base_fee: i64) -> DecodedBlock {
    block.header.base_fee_per_gas = Some(dec(base_fee));
    block
}

fn with_tx(
    mut block: DecodedBlock,
    from: &str,
    to: Option<&str>,
    amount: i64,
    fee: i64,
    gas: i64,
) -> DecodedBlock {
    let position = block.txs.len() as i64;
    block.txs.push(DecodedTx {
        hash: format!("0xt{}-{}", block.header.hash, position),
        position,
        from: from.into(),
        to: to.map(Into::into),
        amount: dec(amount),
        fee: dec(fee),
        gas_used: dec(gas),
        cumulative_gas_used: dec(gas),
        status: TxStatus::Success,
        input: String::new(),
        logs: vec![],
    });
    touch(&mut block, from, 1);
    if let Some(to) = to {
        touch(&mut block, to, 1);
    }
    block
}

fn with_trace(mut block: DecodedBlock, from: &str, to: &str, amount: i64) -> DecodedBlock {
    block.traces.push(DecodedTrace {
        tx_hash: None,
        from: Some(from.into()),
        to: Some(to.into()),
        amount: Some(dec(amount)),
        trace_address: vec![0],
        kind: TraceKind::Call,
        gas_used: dec(0),
    });
    touch(&mut block, from, 0);
    touch(&mut block, to, 0);
    block
}

fn with_withdrawal(mut block: DecodedBlock, to: &str, amount: i64) -> DecodedBlock {
    block.withdrawals.push(DecodedWithdrawal {
        position: block.withdrawals.len() as i64,
        validator_index: 1,
        address: to.into(),
        amount: dec(amount),
    });
    touch(&mut block, to, 0);
    block
}

fn with_token_transfer(
    mut block: DecodedBlock,
    contract: &str,
    kind: TransferKind,
    from: Option<&str>,
    to: Option<&str>,
    amount: i64,
) -> DecodedBlock {
    block.tokens.push(DecodedToken {
        contract: contract.into(),
        token_id: dec(0),
        kind: TokenKind::Erc20,
        transfers_count: 1,
        supply: dec(0),
    });
    block.transfers.push(DecodedTransfer {
        tx_hash: None,
        contract: contract.into(),
        token_id: dec(0),
        from: from.map(Into::into),
        to: to.map(Into::into),
        amount: dec(amount),
        kind,
    });
    touch(&mut block, contract, 0);
    for holder in [from, to].into_iter().flatten() {
        touch(&mut block, holder, 0);
    }
    block
}

async fn save(ledger: &MemoryLedger, block: &DecodedBlock) -> SaveOutcome {
    save_block(ledger, NAME, block).await.unwrap()
}

/// Balances with zero rows dropped; a zero row and a missing row mean the
/// same thing.
fn nonzero_balances(tables: &MemoryTables) -> BTreeMap<String, BigDecimal> {
    tables
        .balances
        .values()
        .filter(|b| !b.value.is_zero())
        .map(|b| {
            let hash = tables
                .addresses
                .get(&b.id)
                .map(|a| a.hash.clone())
                .unwrap_or_else(|| format!("#{}", b.id));
            (hash, b.value.clone())
        })
        .collect()
}

#[tokio::test]
async fn scenario_tx_without_receiver_round_trips() {
    let ledger = MemoryLedger::new();
    save(&ledger, &with_withdrawal(block(99), "0xa", 50)).await;
    assert_eq!(ledger.snapshot().await.balance_of("0xa"), dec(50));

    save(&ledger, &with_tx(block(100), "0xa", None, 10, 1, 0)).await;
    let tables = ledger.snapshot().await;
    assert_eq!(tables.balance_of("0xa"), dec(39));
    assert_eq!(tables.balance_of(MINER), dec(1));

    let report = rollback_head(&ledger, NAME).await.unwrap().unwrap();
    assert_eq!(report.height, 100);
    assert_eq!(report.new_head, Some(99));
    let tables = ledger.snapshot().await;
    assert_eq!(tables.balance_of("0xa"), dec(50));
    assert_eq!(tables.balance_of(MINER), dec(0));
}

#[tokio::test]
async fn merge_upsert_reinvoked_directly_doubles_counters() {
    let ledger = MemoryLedger::new();
    let rows = [NewAddress {
        hash: "0xaa".into(),
        first_height: 90,
        last_height: 90,
        is_contract: false,
        txs_count: 3,
        contracts_count: 0,
        interactions: 1,
    }];
    let rows = &rows;

    for _ in 0..2 {
        ledger
            .transaction(|tx| async move { tx.upsert_addresses(rows).await }.scope_boxed())
            .await
            .unwrap();
    }

    let tables = ledger.snapshot().await;
    let address = tables.address("0xaa").unwrap();
    assert_eq!(address.txs_count, 6);
    assert_eq!(address.interactions, 2);
}

#[tokio::test]
async fn merge_keeps_highest_last_height() {
    let ledger = MemoryLedger::new();
    let existing = [NewAddress {
        hash: "0xaa".into(),
        first_height: 10,
        last_height: 100,
        is_contract: false,
        txs_count: 5,
        contracts_count: 0,
        interactions: 0,
    }];
    let incoming = [NewAddress {
        last_height: 90,
        first_height: 90,
        txs_count: 3,
        ..existing[0].clone()
    }];
    let (existing, incoming) = (&existing, &incoming);

    ledger
        .transaction(|tx| async move { tx.upsert_addresses(existing).await }.scope_boxed())
        .await
        .unwrap();
    let merged = ledger
        .transaction(|tx| async move { tx.upsert_addresses(incoming).await }.scope_boxed())
        .await
        .unwrap();

    assert!(!merged[0].inserted);
    let tables = ledger.snapshot().await;
    let address = tables.address("0xaa").unwrap();
    assert_eq!(address.txs_count, 8);
    assert_eq!(address.last_height, 100);
    assert_eq!(address.first_height, 10);
}

#[tokio::test]
async fn committed_height_is_never_applied_twice() {
    let ledger = MemoryLedger::new();
    let first = with_tx(with_withdrawal(block(1), "0xa", 20), "0xa", Some("0xb"), 5, 0, 0);

    assert!(matches!(save(&ledger, &first).await, SaveOutcome::Saved(_)));
    let before = ledger.snapshot().await;

    assert_eq!(
        save(&ledger, &first).await,
        SaveOutcome::AlreadyIndexed { height: 1, head: 1 }
    );
    assert_eq!(
        save(&ledger, &block(3)).await,
        SaveOutcome::OutOfOrder {
            height: 3,
            expected: 2
        }
    );

    let after = ledger.snapshot().await;
    assert_eq!(after.states, before.states);
    assert_eq!(after.txs, before.txs);
    assert_eq!(nonzero_balances(&after), nonzero_balances(&before));
    assert_eq!(
        after.address("0xa").unwrap().txs_count,
        before.address("0xa").unwrap().txs_count
    );
}

#[tokio::test]
async fn balances_conserve_value_across_blocks() {
    let ledger = MemoryLedger::new();
    let blocks = vec![
        with_withdrawal(with_withdrawal(block(1), "0xa", 100), "0xb", 40),
        with_base_fee(with_tx(block(2), "0xa", Some("0xb"), 30, 5, 2), 1),
        with_trace(
            with_base_fee(with_tx(block(3), "0xb", Some("0xc"), 20, 6, 3), 2),
            "0xc",
            "0xd",
            7,
        ),
        with_tx(block(4), "0xd", Some("0xa"), 1, 1, 0),
    ];
    for b in &blocks {
        assert!(matches!(save(&ledger, b).await, SaveOutcome::Saved(_)));
    }

    let tables = ledger.snapshot().await;
    // withdrawals 140, burned 2*1 + 3*2
    assert_eq!(tables.total_balance(), dec(132));
    assert_eq!(tables.balance_of("0xa"), dec(66));
    assert_eq!(tables.balance_of("0xb"), dec(44));
    assert_eq!(tables.balance_of("0xc"), dec(13));
    assert_eq!(tables.balance_of("0xd"), dec(5));
    assert_eq!(tables.balance_of(MINER), dec(4));

    let state = load_state(&ledger, NAME).await.unwrap().unwrap();
    assert_eq!(state.last_height, 4);
    assert_eq!(state.total_tx, 3);
    assert_eq!(state.total_accounts, 5);
}

#[tokio::test]
async fn ingest_then_rollback_restores_snapshot() {
    let ledger = MemoryLedger::new();
    save(&ledger, &with_withdrawal(block(1), "0xa", 100)).await;
    save(
        &ledger,
        &with_token_transfer(block(2), "0xtoken", TransferKind::Mint, None, Some("0xa"), 50),
    )
    .await;
    let before = ledger.snapshot().await;

    let mut next = with_tx(block(3), "0xa", Some("0xnew"), 25, 2, 1);
    next = with_base_fee(next, 1);
    next = with_trace(next, "0xnew", "0xother", 5);
    next = with_token_transfer(
        next,
        "0xtoken",
        TransferKind::Transfer,
        Some("0xa"),
        Some("0xnew"),
        20,
    );
    next = with_token_transfer(next, "0xfresh", TransferKind::Mint, None, Some("0xa"), 9);
    next = with_withdrawal(next, "0xa", 3);
    let SaveOutcome::Saved(report) = save(&ledger, &next).await else {
        panic!("block 3 should be saved");
    };
    assert_eq!(report.addresses.inserted, 3);
    assert_eq!(report.tokens.inserted, 1);
    assert_eq!(report.tokens.merged, 1);

    let rolled = rollback_head(&ledger, NAME).await.unwrap().unwrap();
    assert_eq!(rolled.height, 3);
    assert_eq!(rolled.addresses, 3);
    assert_eq!(rolled.tokens, 1);

    let after = ledger.snapshot().await;
    assert_eq!(after.states, before.states);
    assert_eq!(after.blocks, before.blocks);
    assert_eq!(after.block_stats, before.block_stats);
    assert_eq!(after.txs, before.txs);
    assert_eq!(after.traces, before.traces);
    assert_eq!(after.transfers, before.transfers);
    assert_eq!(after.withdrawals, before.withdrawals);
    assert_eq!(after.tokens.len(), before.tokens.len());
    assert_eq!(after.token_balances, before.token_balances);
    assert_eq!(nonzero_balances(&after), nonzero_balances(&before));
    assert!(after.address("0xnew").is_none());
}

#[tokio::test]
async fn token_balance_unwound_to_zero_is_pruned() {
    let ledger = MemoryLedger::new();
    save(&ledger, &block(1)).await;
    save(
        &ledger,
        &with_token_transfer(block(2), "0xt", TransferKind::Mint, None, Some("0xa"), 100),
    )
    .await;
    save(
        &ledger,
        &with_token_transfer(block(3), "0xt", TransferKind::Burn, Some("0xa"), None, 100),
    )
    .await;

    let tables = ledger.snapshot().await;
    let row = tables.token_balances.values().next().unwrap();
    assert_eq!(row.balance, dec(0));

    let step = rollback_head(&ledger, NAME).await.unwrap().unwrap();
    assert_eq!(step.pruned_token_balances, 0);
    let tables = ledger.snapshot().await;
    assert_eq!(tables.token_balances.values().next().unwrap().balance, dec(100));

    let step = rollback_head(&ledger, NAME).await.unwrap().unwrap();
    assert_eq!(step.pruned_token_balances, 1);
    let tables = ledger.snapshot().await;
    assert!(tables.token_balances.is_empty());
    assert!(tables.tokens.is_empty());
}

#[tokio::test]
async fn mint_and_burn_in_one_block_are_pruned_together() {
    let ledger = MemoryLedger::new();
    save(&ledger, &block(1)).await;
    let both = with_token_transfer(
        with_token_transfer(block(2), "0xt", TransferKind::Mint, None, Some("0xa"), 100),
        "0xt",
        TransferKind::Burn,
        Some("0xa"),
        None,
        100,
    );
    save(&ledger, &both).await;

    let step = rollback_head(&ledger, NAME).await.unwrap().unwrap();
    assert_eq!(step.pruned_token_balances, 1);
    assert!(ledger.snapshot().await.token_balances.is_empty());
}

#[tokio::test]
async fn unresolved_address_commits_nothing() {
    let ledger = MemoryLedger::new();
    save(&ledger, &block(1)).await;
    let before = ledger.snapshot().await;

    let mut broken = with_tx(block(2), "0xa", Some("0xb"), 1, 0, 0);
    broken.addresses.retain(|a| a.hash != "0xb");

    let err = save_block(&ledger, NAME, &broken).await.unwrap_err();
    assert!(matches!(err, DbError::UnresolvedAddress(ref hash) if hash == "0xb"));
    assert!(!err.is_transient());

    let after = ledger.snapshot().await;
    assert_eq!(after.states, before.states);
    assert_eq!(after.blocks, before.blocks);
    assert_eq!(after.addresses, before.addresses);
}

#[tokio::test]
async fn rolling_back_everything_empties_state() {
    let ledger = MemoryLedger::new();
    save(&ledger, &with_withdrawal(block(5), "0xa", 1)).await;
    save(&ledger, &with_tx(block(6), "0xa", Some("0xb"), 1, 0, 0)).await;

    assert_eq!(rollback_head(&ledger, NAME).await.unwrap().unwrap().new_head, Some(5));
    assert_eq!(rollback_head(&ledger, NAME).await.unwrap().unwrap().new_head, None);
    assert!(rollback_head(&ledger, NAME).await.unwrap().is_none());

    assert!(head(&ledger).await.unwrap().is_none());
    let state = load_state(&ledger, NAME).await.unwrap().unwrap();
    assert!(state.is_empty());
    assert_eq!(state.total_tx, 0);
    assert_eq!(state.total_accounts, 0);
    let tables = ledger.snapshot().await;
    assert!(tables.addresses.is_empty());
    assert!(tables.balances.is_empty());

    // A fresh ledger head accepts any starting height again.
    assert!(matches!(
        save(&ledger, &block_on_fork(8, "x")).await,
        SaveOutcome::Saved(_)
    ));
}

#[tokio::test]
async fn new_address_is_stored_with_a_balance_row() {
    let ledger = MemoryLedger::new();
    save(&ledger, &block(1)).await;
    save(
        &ledger,
        &with_token_transfer(block(2), "0xt", TransferKind::Mint, None, Some("0xholder"), 7),
    )
    .await;

    let tables = ledger.snapshot().await;
    for hash in ["0xholder", "0xt", MINER] {
        let id = tables.address(hash).unwrap().id;
        assert_eq!(tables.balances[&id].value, dec(0), "{hash}");
    }
    assert_eq!(tables.balances.len(), tables.addresses.len());

    rollback_head(&ledger, NAME).await.unwrap().unwrap();
    let tables = ledger.snapshot().await;
    assert!(tables.address("0xholder").is_none());
    assert_eq!(tables.balances.len(), 1);
    assert!(tables.balances.contains_key(&tables.address(MINER).unwrap().id));
}

#[tokio::test]
async fn block_stats_track_block_time() {
    let ledger = MemoryLedger::new();
    save(&ledger, &block(1)).await;
    save(&ledger, &with_tx(block(2), "0xa", None, 0, 0, 0)).await;

    let tables = ledger.snapshot().await;
    assert_eq!(tables.block_stats[&1].block_time, 0);
    assert_eq!(tables.block_stats[&2].block_time, 12_000);
    assert_eq!(tables.block_stats[&2].tx_count, 1);
}

#[tokio::test]
async fn head_reads_highest_block() {
    let ledger = MemoryLedger::new();
    assert!(head(&ledger).await.unwrap().is_none());
    save(&ledger, &block(1)).await;
    save(&ledger, &block(2)).await;
    let tip = head(&ledger).await.unwrap().unwrap();
    assert_eq!((tip.height, tip.hash.as_str()), (2, "0xb2"));

    let check = ledger
        .transaction(|tx| async move { tx.last_block().await }.scope_boxed())
        .await
        .unwrap();
    assert_eq!(check.map(|b| b.height), Some(2));
}
