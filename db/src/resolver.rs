use std::collections::HashMap;

use tracing::debug;

use crate::decoded::DecodedBlock;
use crate::error::DbError;
use crate::ledger::{LedgerTx, MergeReport};
use crate::models::{NewAddress, Tx};
use crate::types::normalize_hash;

/// Touched addresses of one block, merged per hash before they reach the
/// store.
#[derive(Debug, Default)]
pub struct PendingAddresses {
    rows: Vec<NewAddress>,
    positions: HashMap<String, usize>,
}

impl PendingAddresses {
    pub fn collect(block: &DecodedBlock) -> Self {
        let height = block.height();
        let mut pending = PendingAddresses::default();
        for address in &block.addresses {
            pending.push(NewAddress {
                hash: normalize_hash(&address.hash),
                first_height: height,
                last_height: height,
                is_contract: address.is_contract,
                txs_count: address.txs_count,
                contracts_count: address.contracts_count,
                interactions: address.interactions,
            });
        }
        pending
    }

    pub fn push(&mut self, row: NewAddress) {
        match self.positions.get(&row.hash) {
            Some(&idx) => self.rows[idx].absorb(&row),
            None => {
                self.positions.insert(row.hash.clone(), self.rows.len());
                self.rows.push(row);
            }
        }
    }

    pub fn rows(&self) -> &[NewAddress] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Upserts the pending rows and returns the hash → id map for the block.
    pub async fn commit<T: LedgerTx + ?Sized>(
        self,
        tx: &mut T,
    ) -> Result<(AddressMap, MergeReport), DbError> {
        if self.rows.is_empty() {
            return Ok((AddressMap::default(), MergeReport::default()));
        }
        let upserted = tx.upsert_addresses(&self.rows).await?;
        if upserted.len() != self.rows.len() {
            return Err(DbError::LengthMismatch {
                op: "upsert_addresses",
                expected: self.rows.len(),
                actual: upserted.len(),
            });
        }
        let report = MergeReport::of(&upserted);
        debug!(
            addresses = self.rows.len(),
            inserted = report.inserted,
            merged = report.merged,
            "resolved block addresses"
        );
        let mut created = Vec::with_capacity(report.inserted);
        let mut ids = HashMap::with_capacity(upserted.len());
        for row in upserted {
            if row.inserted {
                created.push(row.id);
            }
            ids.insert(row.key, row.id);
        }
        Ok((AddressMap { ids, created }, report))
    }
}

/// Lookup from hex address to store id, valid for a single block.
#[derive(Clone, Debug, Default)]
pub struct AddressMap {
    ids: HashMap<String, i64>,
    created: Vec<i64>,
}

impl AddressMap {
    pub fn resolve(&self, hash: &str) -> Result<i64, DbError> {
        let key = normalize_hash(hash);
        self.ids
            .get(&key)
            .copied()
            .ok_or(DbError::UnresolvedAddress(key))
    }

    pub fn resolve_opt(&self, hash: Option<&str>) -> Result<Option<i64>, DbError> {
        hash.map(|hash| self.resolve(hash)).transpose()
    }

    /// Ids of addresses first stored by this block.
    pub fn created(&self) -> &[i64] {
        &self.created
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Lookup from transaction hash to the id assigned on insert.
#[derive(Clone, Debug, Default)]
pub struct TxMap {
    ids: HashMap<String, i64>,
}

impl TxMap {
    pub fn new(txs: &[Tx]) -> Self {
        TxMap {
            ids: txs.iter().map(|tx| (normalize_hash(&tx.hash), tx.id)).collect(),
        }
    }

    pub fn resolve(&self, hash: &str) -> Result<i64, DbError> {
        let key = normalize_hash(hash);
        self.ids.get(&key).copied().ok_or(DbError::UnresolvedTx(key))
    }

    pub fn resolve_opt(&self, hash: Option<&str>) -> Result<Option<i64>, DbError> {
        hash.map(|hash| self.resolve(hash)).transpose()
    }
}
