use async_trait::async_trait;
use diesel::{
    define_sql_function,
    dsl::sql,
    prelude::*,
    sql_types::{BigInt, Bool, Nullable, Text},
    upsert::excluded,
};
use diesel_async::{pooled_connection::deadpool::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use futures::future::{BoxFuture, FutureExt};
use scoped_futures::ScopedBoxFuture;

use crate::connections::DatabaseConnections;
use crate::error::DbError;
use crate::ledger::{Ledger, LedgerTx, Upserted};
use crate::models::*;
use crate::schema::{
    addresses, balances, beacon_withdrawals, block_stats, blocks, contracts, erc4337_user_ops,
    logs, proxy_contracts, states, token_balances, tokens, traces, transfers, txs,
};

define_sql_function!(fn greatest(a: BigInt, b: BigInt) -> BigInt);
define_sql_function!(fn least(a: BigInt, b: BigInt) -> BigInt);
define_sql_function! {
    #[sql_name = "coalesce"]
    fn coalesce_text(a: Nullable<Text>, b: Nullable<Text>) -> Nullable<Text>;
}
define_sql_function! {
    #[sql_name = "coalesce"]
    fn coalesce_bigint(a: Nullable<BigInt>, b: Nullable<BigInt>) -> Nullable<BigInt>;
}

/// Postgres accepts at most this many bind parameters per statement.
const MAX_BIND_PARAMS: usize = 65_535;

fn chunk_size(columns: usize) -> usize {
    (MAX_BIND_PARAMS / columns).max(1)
}

/// `xmax` is zero only for rows created by the current statement.
fn was_inserted() -> diesel::expression::SqlLiteral<Bool> {
    sql::<Bool>("xmax = 0")
}

#[derive(Clone)]
pub struct PgLedger {
    pool: Pool<AsyncPgConnection>,
}

impl PgLedger {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        PgLedger { pool }
    }

    /// Runs pending migrations and opens the connection pool.
    pub async fn connect() -> Result<Self, DbError> {
        let dbc = DatabaseConnections::init().await?;
        Ok(PgLedger::new(dbc.postgres))
    }
}

impl Ledger for PgLedger {
    type Tx = AsyncPgConnection;

    fn transaction<'a, R, F>(&'a self, f: F) -> BoxFuture<'a, Result<R, DbError>>
    where
        F: for<'r> FnOnce(&'r mut Self::Tx) -> ScopedBoxFuture<'a, 'r, Result<R, DbError>>
            + Send
            + 'a,
        R: Send + 'a,
    {
        async move {
            let mut pooled = self
                .pool
                .get()
                .await
                .map_err(|e| DbError::Pool(e.to_string()))?;
            let conn: &mut AsyncPgConnection = &mut pooled;
            conn.transaction(f).await
        }
        .boxed()
    }
}

#[async_trait]
impl LedgerTx for AsyncPgConnection {
    async fn state(&mut self, name: &str) -> Result<Option<State>, DbError> {
        Ok(states::table
            .find(name)
            .select(State::as_select())
            .first(self)
            .await
            .optional()?)
    }

    async fn save_state(&mut self, state: &State) -> Result<(), DbError> {
        diesel::insert_into(states::table)
            .values(state)
            .on_conflict(states::name)
            .do_update()
            .set((
                states::last_height.eq(excluded(states::last_height)),
                states::last_hash.eq(excluded(states::last_hash)),
                states::last_time.eq(excluded(states::last_time)),
                states::total_tx.eq(excluded(states::total_tx)),
                states::total_accounts.eq(excluded(states::total_accounts)),
                states::total_contracts.eq(excluded(states::total_contracts)),
                states::total_tokens.eq(excluded(states::total_tokens)),
                states::total_verified_contracts.eq(excluded(states::total_verified_contracts)),
            ))
            .execute(self)
            .await?;
        Ok(())
    }

    async fn last_block(&mut self) -> Result<Option<Block>, DbError> {
        Ok(blocks::table
            .order(blocks::height.desc())
            .select(Block::as_select())
            .first(self)
            .await
            .optional()?)
    }

    async fn insert_block(&mut self, block: &Block) -> Result<(), DbError> {
        diesel::insert_into(blocks::table)
            .values(block)
            .execute(self)
            .await?;
        Ok(())
    }

    async fn insert_block_stats(&mut self, stats: &BlockStats) -> Result<(), DbError> {
        diesel::insert_into(block_stats::table)
            .values(stats)
            .execute(self)
            .await?;
        Ok(())
    }

    async fn insert_txs(&mut self, rows: &[NewTx]) -> Result<Vec<Tx>, DbError> {
        let mut inserted = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(chunk_size(11)) {
            let batch: Vec<Tx> = diesel::insert_into(txs::table)
                .values(chunk)
                .returning(Tx::as_returning())
                .get_results(self)
                .await?;
            inserted.extend(batch);
        }
        Ok(inserted)
    }

    async fn insert_logs(&mut self, rows: &[NewLog]) -> Result<usize, DbError> {
        let mut count = 0;
        for chunk in rows.chunks(chunk_size(6)) {
            count += diesel::insert_into(logs::table)
                .values(chunk)
                .execute(self)
                .await?;
        }
        Ok(count)
    }

    async fn insert_traces(&mut self, rows: &[NewTrace]) -> Result<usize, DbError> {
        let mut count = 0;
        for chunk in rows.chunks(chunk_size(8)) {
            count += diesel::insert_into(traces::table)
                .values(chunk)
                .execute(self)
                .await?;
        }
        Ok(count)
    }

    async fn insert_transfers(&mut self, rows: &[NewTransfer]) -> Result<usize, DbError> {
        let mut count = 0;
        for chunk in rows.chunks(chunk_size(8)) {
            count += diesel::insert_into(transfers::table)
                .values(chunk)
                .execute(self)
                .await?;
        }
        Ok(count)
    }

    async fn insert_user_ops(&mut self, rows: &[NewUserOp]) -> Result<usize, DbError> {
        let mut count = 0;
        for chunk in rows.chunks(chunk_size(9)) {
            count += diesel::insert_into(erc4337_user_ops::table)
                .values(chunk)
                .execute(self)
                .await?;
        }
        Ok(count)
    }

    async fn insert_withdrawals(
        &mut self,
        rows: &[NewBeaconWithdrawal],
    ) -> Result<usize, DbError> {
        let mut count = 0;
        for chunk in rows.chunks(chunk_size(5)) {
            count += diesel::insert_into(beacon_withdrawals::table)
                .values(chunk)
                .execute(self)
                .await?;
        }
        Ok(count)
    }

    async fn upsert_addresses(
        &mut self,
        rows: &[NewAddress],
    ) -> Result<Vec<Upserted<String>>, DbError> {
        let mut out = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(chunk_size(7)) {
            let batch: Vec<(i64, String, bool)> = diesel::insert_into(addresses::table)
                .values(chunk)
                .on_conflict(addresses::hash)
                .do_update()
                .set((
                    addresses::first_height.eq(least(
                        addresses::first_height,
                        excluded(addresses::first_height),
                    )),
                    addresses::last_height.eq(greatest(
                        addresses::last_height,
                        excluded(addresses::last_height),
                    )),
                    addresses::is_contract
                        .eq(addresses::is_contract.or(excluded(addresses::is_contract))),
                    addresses::txs_count.eq(addresses::txs_count + excluded(addresses::txs_count)),
                    addresses::contracts_count
                        .eq(addresses::contracts_count + excluded(addresses::contracts_count)),
                    addresses::interactions
                        .eq(addresses::interactions + excluded(addresses::interactions)),
                ))
                .returning((addresses::id, addresses::hash, was_inserted()))
                .get_results(self)
                .await?;
            out.extend(
                batch
                    .into_iter()
                    .map(|(id, hash, inserted)| Upserted { key: hash, id, inserted }),
            );
        }
        Ok(out)
    }

    async fn upsert_contracts(
        &mut self,
        rows: &[Contract],
    ) -> Result<Vec<Upserted<i64>>, DbError> {
        let mut out = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(chunk_size(8)) {
            let batch: Vec<(i64, bool)> = diesel::insert_into(contracts::table)
                .values(chunk)
                .on_conflict(contracts::id)
                .do_update()
                .set((
                    contracts::height.eq(least(contracts::height, excluded(contracts::height))),
                    contracts::tx_id
                        .eq(coalesce_bigint(excluded(contracts::tx_id), contracts::tx_id)),
                    contracts::code.eq(coalesce_text(excluded(contracts::code), contracts::code)),
                    contracts::verified.eq(contracts::verified.or(excluded(contracts::verified))),
                    contracts::compiler_version.eq(coalesce_text(
                        excluded(contracts::compiler_version),
                        contracts::compiler_version,
                    )),
                    contracts::metadata_link.eq(coalesce_text(
                        excluded(contracts::metadata_link),
                        contracts::metadata_link,
                    )),
                    contracts::abi.eq(coalesce_text(excluded(contracts::abi), contracts::abi)),
                ))
                .returning((contracts::id, was_inserted()))
                .get_results(self)
                .await?;
            out.extend(
                batch
                    .into_iter()
                    .map(|(id, inserted)| Upserted { key: id, id, inserted }),
            );
        }
        Ok(out)
    }

    async fn upsert_proxy_contracts(&mut self, rows: &[ProxyContract]) -> Result<(), DbError> {
        for chunk in rows.chunks(chunk_size(5)) {
            diesel::insert_into(proxy_contracts::table)
                .values(chunk)
                .on_conflict(proxy_contracts::id)
                .do_update()
                .set((
                    proxy_contracts::height.eq(least(
                        proxy_contracts::height,
                        excluded(proxy_contracts::height),
                    )),
                    proxy_contracts::implementation_id.eq(coalesce_bigint(
                        excluded(proxy_contracts::implementation_id),
                        proxy_contracts::implementation_id,
                    )),
                    proxy_contracts::resolved
                        .eq(proxy_contracts::resolved.or(excluded(proxy_contracts::resolved))),
                ))
                .execute(self)
                .await?;
        }
        Ok(())
    }

    async fn upsert_tokens(
        &mut self,
        rows: &[NewToken],
    ) -> Result<Vec<Upserted<TokenKey>>, DbError> {
        let mut out = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(chunk_size(7)) {
            let batch: Vec<(i64, bigdecimal::BigDecimal, i64, bool)> =
                diesel::insert_into(tokens::table)
                    .values(chunk)
                    .on_conflict((tokens::token_id, tokens::contract_id))
                    .do_update()
                    .set((
                        tokens::height.eq(least(tokens::height, excluded(tokens::height))),
                        tokens::last_height
                            .eq(greatest(tokens::last_height, excluded(tokens::last_height))),
                        tokens::transfers_count
                            .eq(tokens::transfers_count + excluded(tokens::transfers_count)),
                        tokens::supply.eq(tokens::supply + excluded(tokens::supply)),
                    ))
                    .returning((
                        tokens::id,
                        tokens::token_id,
                        tokens::contract_id,
                        was_inserted(),
                    ))
                    .get_results(self)
                    .await?;
            out.extend(
                batch
                    .into_iter()
                    .map(|(id, token_id, contract_id, inserted)| Upserted {
                        key: TokenKey {
                            token_id,
                            contract_id,
                        },
                        id,
                        inserted,
                    }),
            );
        }
        Ok(out)
    }

    async fn merge_balances(&mut self, rows: &[Balance]) -> Result<(), DbError> {
        for chunk in rows.chunks(chunk_size(2)) {
            diesel::insert_into(balances::table)
                .values(chunk)
                .on_conflict(balances::id)
                .do_update()
                .set(balances::value.eq(balances::value + excluded(balances::value)))
                .execute(self)
                .await?;
        }
        Ok(())
    }

    async fn merge_token_balances(
        &mut self,
        rows: &[TokenBalance],
    ) -> Result<Vec<TokenBalance>, DbError> {
        let mut out = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(chunk_size(4)) {
            let batch: Vec<TokenBalance> = diesel::insert_into(token_balances::table)
                .values(chunk)
                .on_conflict((
                    token_balances::token_id,
                    token_balances::contract_id,
                    token_balances::address_id,
                ))
                .do_update()
                .set(
                    token_balances::balance
                        .eq(token_balances::balance + excluded(token_balances::balance)),
                )
                .returning(TokenBalance::as_returning())
                .get_results(self)
                .await?;
            out.extend(batch);
        }
        Ok(out)
    }

    async fn delete_block(&mut self, height: i64) -> Result<Option<Block>, DbError> {
        Ok(diesel::delete(blocks::table.find(height))
            .returning(Block::as_returning())
            .get_result(self)
            .await
            .optional()?)
    }

    async fn delete_block_stats(&mut self, height: i64) -> Result<Option<BlockStats>, DbError> {
        Ok(diesel::delete(block_stats::table.find(height))
            .returning(BlockStats::as_returning())
            .get_result(self)
            .await
            .optional()?)
    }

    async fn delete_addresses(&mut self, height: i64) -> Result<Vec<Address>, DbError> {
        Ok(
            diesel::delete(addresses::table.filter(addresses::first_height.eq(height)))
                .returning(Address::as_returning())
                .get_results(self)
                .await?,
        )
    }

    async fn delete_balances(&mut self, ids: &[i64]) -> Result<usize, DbError> {
        if ids.is_empty() {
            return Ok(0);
        }
        Ok(diesel::delete(balances::table.filter(balances::id.eq_any(ids)))
            .execute(self)
            .await?)
    }

    async fn delete_txs(&mut self, height: i64) -> Result<Vec<Tx>, DbError> {
        Ok(diesel::delete(txs::table.filter(txs::height.eq(height)))
            .returning(Tx::as_returning())
            .get_results(self)
            .await?)
    }

    async fn delete_contracts(&mut self, height: i64) -> Result<Vec<Contract>, DbError> {
        Ok(
            diesel::delete(contracts::table.filter(contracts::height.eq(height)))
                .returning(Contract::as_returning())
                .get_results(self)
                .await?,
        )
    }

    async fn delete_proxy_contracts(&mut self, height: i64) -> Result<usize, DbError> {
        Ok(
            diesel::delete(proxy_contracts::table.filter(proxy_contracts::height.eq(height)))
                .execute(self)
                .await?,
        )
    }

    async fn delete_logs(&mut self, height: i64) -> Result<usize, DbError> {
        Ok(diesel::delete(logs::table.filter(logs::height.eq(height)))
            .execute(self)
            .await?)
    }

    async fn delete_traces(&mut self, height: i64) -> Result<Vec<Trace>, DbError> {
        Ok(diesel::delete(traces::table.filter(traces::height.eq(height)))
            .returning(Trace::as_returning())
            .get_results(self)
            .await?)
    }

    async fn delete_transfers(&mut self, height: i64) -> Result<Vec<Transfer>, DbError> {
        Ok(
            diesel::delete(transfers::table.filter(transfers::height.eq(height)))
                .returning(Transfer::as_returning())
                .get_results(self)
                .await?,
        )
    }

    async fn delete_tokens(&mut self, height: i64) -> Result<Vec<Token>, DbError> {
        Ok(diesel::delete(tokens::table.filter(tokens::height.eq(height)))
            .returning(Token::as_returning())
            .get_results(self)
            .await?)
    }

    async fn delete_user_ops(&mut self, height: i64) -> Result<usize, DbError> {
        Ok(
            diesel::delete(erc4337_user_ops::table.filter(erc4337_user_ops::height.eq(height)))
                .execute(self)
                .await?,
        )
    }

    async fn delete_withdrawals(&mut self, height: i64) -> Result<Vec<BeaconWithdrawal>, DbError> {
        Ok(diesel::delete(
            beacon_withdrawals::table.filter(beacon_withdrawals::height.eq(height)),
        )
        .returning(BeaconWithdrawal::as_returning())
        .get_results(self)
        .await?)
    }

    async fn delete_token_balances(&mut self, keys: &[TokenBalanceKey]) -> Result<usize, DbError> {
        let mut count = 0;
        for key in keys {
            count += diesel::delete(token_balances::table.find((
                key.token_id.clone(),
                key.contract_id,
                key.address_id,
            )))
            .execute(self)
            .await?;
        }
        Ok(count)
    }
}
