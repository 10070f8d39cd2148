//! Balance deltas implied by a block's facts.
//!
//! Forward ingestion applies them, rollback reverts them; both go through the
//! same functions with the sign flipped, so a revert is always the exact
//! inverse of the matching apply. Nothing in here touches the store.

use std::collections::{BTreeMap, HashSet};

use bigdecimal::{BigDecimal, Zero};

use crate::models::{
    Balance, BeaconWithdrawal, NewBeaconWithdrawal, NewTrace, NewTransfer, NewTx, TokenBalance,
    TokenBalanceKey, Trace, Transfer, Tx,
};
use crate::types::{TransferKind, TxStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Apply,
    Revert,
}

impl Direction {
    fn signed(self, amount: &BigDecimal) -> BigDecimal {
        match self {
            Direction::Apply => amount.clone(),
            Direction::Revert => -amount.clone(),
        }
    }
}

pub struct TxEffect<'a> {
    pub from_id: i64,
    pub to_id: Option<i64>,
    pub amount: &'a BigDecimal,
    pub fee: &'a BigDecimal,
    pub cumulative_gas_used: &'a BigDecimal,
    pub status: TxStatus,
}

impl<'a> From<&'a Tx> for TxEffect<'a> {
    fn from(tx: &'a Tx) -> Self {
        TxEffect {
            from_id: tx.from_id,
            to_id: tx.to_id,
            amount: &tx.amount,
            fee: &tx.fee,
            cumulative_gas_used: &tx.cumulative_gas_used,
            status: tx.status,
        }
    }
}

impl<'a> From<&'a NewTx> for TxEffect<'a> {
    fn from(tx: &'a NewTx) -> Self {
        TxEffect {
            from_id: tx.from_id,
            to_id: tx.to_id,
            amount: &tx.amount,
            fee: &tx.fee,
            cumulative_gas_used: &tx.cumulative_gas_used,
            status: tx.status,
        }
    }
}

pub struct TraceEffect<'a> {
    pub from_id: Option<i64>,
    pub to_id: Option<i64>,
    pub amount: Option<&'a BigDecimal>,
    pub trace_address: &'a [i32],
}

impl<'a> From<&'a Trace> for TraceEffect<'a> {
    fn from(trace: &'a Trace) -> Self {
        TraceEffect {
            from_id: trace.from_id,
            to_id: trace.to_id,
            amount: trace.amount.as_ref(),
            trace_address: &trace.trace_address,
        }
    }
}

impl<'a> From<&'a NewTrace> for TraceEffect<'a> {
    fn from(trace: &'a NewTrace) -> Self {
        TraceEffect {
            from_id: trace.from_id,
            to_id: trace.to_id,
            amount: trace.amount.as_ref(),
            trace_address: &trace.trace_address,
        }
    }
}

pub struct WithdrawalEffect<'a> {
    pub address_id: i64,
    pub amount: &'a BigDecimal,
}

impl<'a> From<&'a BeaconWithdrawal> for WithdrawalEffect<'a> {
    fn from(w: &'a BeaconWithdrawal) -> Self {
        WithdrawalEffect {
            address_id: w.address_id,
            amount: &w.amount,
        }
    }
}

impl<'a> From<&'a NewBeaconWithdrawal> for WithdrawalEffect<'a> {
    fn from(w: &'a NewBeaconWithdrawal) -> Self {
        WithdrawalEffect {
            address_id: w.address_id,
            amount: &w.amount,
        }
    }
}

pub struct TransferEffect<'a> {
    pub contract_id: i64,
    pub token_id: &'a BigDecimal,
    pub from_id: Option<i64>,
    pub to_id: Option<i64>,
    pub amount: &'a BigDecimal,
    pub kind: TransferKind,
}

impl<'a> From<&'a Transfer> for TransferEffect<'a> {
    fn from(t: &'a Transfer) -> Self {
        TransferEffect {
            contract_id: t.contract_id,
            token_id: &t.token_id,
            from_id: t.from_id,
            to_id: t.to_id,
            amount: &t.amount,
            kind: t.kind,
        }
    }
}

impl<'a> From<&'a NewTransfer> for TransferEffect<'a> {
    fn from(t: &'a NewTransfer) -> Self {
        TransferEffect {
            contract_id: t.contract_id,
            token_id: &t.token_id,
            from_id: t.from_id,
            to_id: t.to_id,
            amount: &t.amount,
            kind: t.kind,
        }
    }
}

/// Accumulated native-currency deltas, one entry per address.
pub struct NativeDeltas {
    direction: Direction,
    skip: HashSet<i64>,
    deltas: BTreeMap<i64, BigDecimal>,
}

impl NativeDeltas {
    pub fn new(direction: Direction) -> Self {
        NativeDeltas {
            direction,
            skip: HashSet::new(),
            deltas: BTreeMap::new(),
        }
    }

    /// Addresses whose balance rows are being deleted alongside the block.
    pub fn skipping(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.skip.extend(ids);
        self
    }

    fn credit(&mut self, id: i64, amount: &BigDecimal) {
        if self.skip.contains(&id) {
            return;
        }
        let delta = self.direction.signed(amount);
        *self.deltas.entry(id).or_insert_with(BigDecimal::zero) += delta;
    }

    fn debit(&mut self, id: i64, amount: &BigDecimal) {
        self.credit(id, &-amount.clone());
    }

    /// Sender pays value and fee, receiver gets the value, the miner keeps
    /// the fee minus the burned base fee. Reverted transactions move
    /// nothing.
    pub fn tx(&mut self, tx: TxEffect<'_>, miner_id: i64, base_fee_per_gas: &BigDecimal) {
        if tx.status == TxStatus::Revert {
            return;
        }
        self.debit(tx.from_id, &(tx.amount + tx.fee));
        if let Some(to_id) = tx.to_id {
            self.credit(to_id, tx.amount);
        }
        let burned = tx.cumulative_gas_used * base_fee_per_gas;
        self.credit(miner_id, &(tx.fee - burned));
    }

    /// Only internal calls carrying value count; the top-level call's value
    /// is already covered by its transaction.
    pub fn trace(&mut self, trace: TraceEffect<'_>) {
        let Some(amount) = trace.amount else {
            return;
        };
        if amount.is_zero() || trace.trace_address.is_empty() {
            return;
        }
        if let Some(from_id) = trace.from_id {
            self.debit(from_id, amount);
        }
        if let Some(to_id) = trace.to_id {
            self.credit(to_id, amount);
        }
    }

    pub fn withdrawal(&mut self, withdrawal: WithdrawalEffect<'_>) {
        self.credit(withdrawal.address_id, withdrawal.amount);
    }

    /// Every touched address, including ones whose contributions cancelled
    /// out.
    pub fn into_balances(self) -> Vec<Balance> {
        self.deltas
            .into_iter()
            .map(|(id, value)| Balance { id, value })
            .collect()
    }
}

/// Accumulated token deltas per (token, contract, holder).
pub struct TokenDeltas {
    direction: Direction,
    deltas: BTreeMap<TokenBalanceKey, BigDecimal>,
}

impl TokenDeltas {
    pub fn new(direction: Direction) -> Self {
        TokenDeltas {
            direction,
            deltas: BTreeMap::new(),
        }
    }

    fn credit(&mut self, transfer: &TransferEffect<'_>, address_id: i64, amount: &BigDecimal) {
        let key = TokenBalanceKey {
            token_id: transfer.token_id.clone(),
            contract_id: transfer.contract_id,
            address_id,
        };
        let delta = self.direction.signed(amount);
        *self.deltas.entry(key).or_insert_with(BigDecimal::zero) += delta;
    }

    pub fn transfer(&mut self, transfer: TransferEffect<'_>) {
        let amount = transfer.amount;
        let debit = -amount.clone();
        match transfer.kind {
            TransferKind::Mint => {
                if let Some(to_id) = transfer.to_id {
                    self.credit(&transfer, to_id, amount);
                }
            }
            TransferKind::Burn => {
                if let Some(from_id) = transfer.from_id {
                    self.credit(&transfer, from_id, &debit);
                }
            }
            TransferKind::Transfer => {
                if let Some(from_id) = transfer.from_id {
                    self.credit(&transfer, from_id, &debit);
                }
                if let Some(to_id) = transfer.to_id {
                    self.credit(&transfer, to_id, amount);
                }
            }
        }
    }

    pub fn into_token_balances(self) -> Vec<TokenBalance> {
        self.deltas
            .into_iter()
            .map(|(key, balance)| TokenBalance {
                token_id: key.token_id,
                contract_id: key.contract_id,
                address_id: key.address_id,
                balance,
            })
            .collect()
    }
}

pub fn native_deltas<'a>(
    direction: Direction,
    miner_id: i64,
    base_fee_per_gas: &BigDecimal,
    txs: impl IntoIterator<Item = TxEffect<'a>>,
    traces: impl IntoIterator<Item = TraceEffect<'a>>,
    withdrawals: impl IntoIterator<Item = WithdrawalEffect<'a>>,
    skip: impl IntoIterator<Item = i64>,
) -> Vec<Balance> {
    let mut deltas = NativeDeltas::new(direction).skipping(skip);
    for tx in txs {
        deltas.tx(tx, miner_id, base_fee_per_gas);
    }
    for trace in traces {
        deltas.trace(trace);
    }
    for withdrawal in withdrawals {
        deltas.withdrawal(withdrawal);
    }
    deltas.into_balances()
}

pub fn token_deltas<'a>(
    direction: Direction,
    transfers: impl IntoIterator<Item = TransferEffect<'a>>,
) -> Vec<TokenBalance> {
    let mut deltas = TokenDeltas::new(direction);
    for transfer in transfers {
        deltas.transfer(transfer);
    }
    deltas.into_token_balances()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINER: i64 = 9;

    fn dec(v: i64) -> BigDecimal {
        BigDecimal::from(v)
    }

    fn tx(from_id: i64, to_id: Option<i64>, amount: i64, fee: i64, gas: i64) -> NewTx {
        NewTx {
            height: 1,
            hash: format!("0x{from_id}{amount}"),
            position: 0,
            from_id,
            to_id,
            amount: dec(amount),
            fee: dec(fee),
            gas_used: dec(gas),
            cumulative_gas_used: dec(gas),
            status: TxStatus::Success,
            input: String::new(),
        }
    }

    fn value_of(balances: &[Balance], id: i64) -> BigDecimal {
        balances
            .iter()
            .find(|b| b.id == id)
            .map(|b| b.value.clone())
            .unwrap_or_else(BigDecimal::zero)
    }

    #[test]
    fn tx_without_receiver_moves_value_and_fee() {
        let txs = [tx(1, None, 10, 1, 0)];
        let deltas = native_deltas(
            Direction::Apply,
            MINER,
            &dec(0),
            txs.iter().map(TxEffect::from),
            [],
            [],
            [],
        );
        assert_eq!(value_of(&deltas, 1), dec(-11));
        assert_eq!(value_of(&deltas, MINER), dec(1));
    }

    #[test]
    fn burned_fee_leaves_circulation() {
        let txs = [tx(1, Some(2), 10, 50, 2)];
        let deltas = native_deltas(
            Direction::Apply,
            MINER,
            &dec(20),
            txs.iter().map(TxEffect::from),
            [],
            [],
            [],
        );
        assert_eq!(value_of(&deltas, 1), dec(-60));
        assert_eq!(value_of(&deltas, 2), dec(10));
        assert_eq!(value_of(&deltas, MINER), dec(10));
        let total: BigDecimal = deltas.iter().map(|b| &b.value).sum();
        assert_eq!(total, dec(-40));
    }

    #[test]
    fn revert_is_exact_inverse_of_apply() {
        let txs = [tx(1, Some(2), 7, 3, 1), tx(2, Some(3), 5, 2, 2)];
        let traces = [NewTrace {
            height: 1,
            tx_id: None,
            from_id: Some(3),
            to_id: Some(4),
            amount: Some(dec(4)),
            trace_address: vec![0],
            kind: crate::types::TraceKind::Call,
            gas_used: dec(0),
        }];
        let withdrawals = [NewBeaconWithdrawal {
            height: 1,
            position: 0,
            validator_index: 3,
            address_id: 5,
            amount: dec(32),
        }];

        let apply = native_deltas(
            Direction::Apply,
            MINER,
            &dec(1),
            txs.iter().map(TxEffect::from),
            traces.iter().map(TraceEffect::from),
            withdrawals.iter().map(WithdrawalEffect::from),
            [],
        );
        let revert = native_deltas(
            Direction::Revert,
            MINER,
            &dec(1),
            txs.iter().map(TxEffect::from),
            traces.iter().map(TraceEffect::from),
            withdrawals.iter().map(WithdrawalEffect::from),
            [],
        );

        assert_eq!(apply.len(), revert.len());
        for (a, r) in apply.iter().zip(&revert) {
            assert_eq!(a.id, r.id);
            assert_eq!(&a.value + &r.value, dec(0));
        }
    }

    #[test]
    fn reverted_txs_and_top_level_traces_move_nothing() {
        let mut reverted = tx(1, Some(2), 10, 1, 1);
        reverted.status = TxStatus::Revert;
        let top_level = NewTrace {
            height: 1,
            tx_id: None,
            from_id: Some(1),
            to_id: Some(2),
            amount: Some(dec(10)),
            trace_address: vec![],
            kind: crate::types::TraceKind::Call,
            gas_used: dec(0),
        };
        let deltas = native_deltas(
            Direction::Apply,
            MINER,
            &dec(1),
            [TxEffect::from(&reverted)],
            [TraceEffect::from(&top_level)],
            [],
            [],
        );
        assert!(deltas.is_empty());
    }

    #[test]
    fn deleted_addresses_are_skipped() {
        let txs = [tx(1, Some(2), 10, 1, 0)];
        let deltas = native_deltas(
            Direction::Revert,
            MINER,
            &dec(0),
            txs.iter().map(TxEffect::from),
            [],
            [],
            [1],
        );
        assert_eq!(value_of(&deltas, 1), dec(0));
        assert!(deltas.iter().all(|b| b.id != 1));
        assert_eq!(value_of(&deltas, 2), dec(-10));
        assert_eq!(value_of(&deltas, MINER), dec(-1));
    }

    #[test]
    fn token_deltas_keep_cancelled_keys() {
        let mint = NewTransfer {
            height: 1,
            tx_id: None,
            contract_id: 40,
            token_id: dec(0),
            from_id: None,
            to_id: Some(1),
            amount: dec(100),
            kind: TransferKind::Mint,
        };
        let burn = NewTransfer {
            from_id: Some(1),
            to_id: None,
            kind: TransferKind::Burn,
            ..mint.clone()
        };
        let send = NewTransfer {
            from_id: Some(2),
            to_id: Some(3),
            amount: dec(5),
            kind: TransferKind::Transfer,
            ..mint.clone()
        };

        let deltas = token_deltas(
            Direction::Revert,
            [&mint, &burn, &send].into_iter().map(TransferEffect::from),
        );
        let by_holder: Vec<(i64, BigDecimal)> = deltas
            .into_iter()
            .map(|row| (row.address_id, row.balance))
            .collect();
        assert_eq!(by_holder, vec![(1, dec(0)), (2, dec(5)), (3, dec(-5))]);
    }
}
