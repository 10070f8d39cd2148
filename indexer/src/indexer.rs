use db::{load_state, Ledger};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::catchup::{catch_up_blocks, BlockSource};
use crate::config::IndexerConfig;
use crate::error::IndexerError;
use crate::persist::Persister;
use crate::reorg::RollbackEngine;
use crate::rpc::ChainRpc;

/// Wires the feed, persist and rollback stages together.
pub struct Indexer<L, R, S> {
    config: IndexerConfig,
    ledger: Arc<L>,
    rpc: Arc<R>,
    source: Arc<S>,
}

impl<L: Ledger, R: ChainRpc, S: BlockSource> Indexer<L, R, S> {
    pub fn new(config: IndexerConfig, ledger: Arc<L>, rpc: Arc<R>, source: S) -> Self {
        Self {
            config,
            ledger,
            rpc,
            source: Arc::new(source),
        }
    }

    /// Height the feed starts from: right above the committed head, or the
    /// configured start height for an empty ledger.
    pub async fn start_height(&self) -> Result<i64, IndexerError> {
        let state = load_state(self.ledger.as_ref(), &self.config.name).await?;
        Ok(match state.and_then(|s| s.next_height()) {
            Some(next) => next,
            None => self.config.start_height.unwrap_or(0),
        })
    }

    /// Runs every stage until `cancel` fires or one of them stops. The first
    /// failure is returned once all stages have drained.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), IndexerError> {
        let start = self.start_height().await?;
        info!(name = %self.config.name, start, "indexer starting");

        let (block_tx, block_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (signal_tx, signal_rx) = mpsc::channel(1);
        let (rewind_tx, rewind_rx) = watch::channel(None);
        let gate = Arc::new(Mutex::new(()));

        let mut tasks: JoinSet<Result<(), IndexerError>> = JoinSet::new();

        let source = self.source.clone();
        let poll_interval = self.config.poll_interval();
        let feed_cancel = cancel.clone();
        tasks.spawn(async move {
            catch_up_blocks(
                source.as_ref(),
                start,
                block_tx,
                rewind_rx,
                poll_interval,
                feed_cancel,
            )
            .await
        });

        let persister = Persister::new(
            self.ledger.clone(),
            &self.config.name,
            gate.clone(),
            self.config.retry_delay(),
        );
        tasks.spawn(persister.run(block_rx, signal_tx, cancel.clone()));

        let engine = RollbackEngine::new(
            self.ledger.clone(),
            self.rpc.clone(),
            &self.config.name,
            gate,
        );
        tasks.spawn(engine.run(
            signal_rx,
            rewind_tx,
            self.config.reorg_check_interval(),
            cancel.clone(),
        ));

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            // One stage ending leaves the pipeline broken, stop the others.
            cancel.cancel();
            if let Err(e) = joined.map_err(IndexerError::from).and_then(|result| result) {
                error!(error = %e, "indexer task failed");
                first_error.get_or_insert(e);
            }
        }
        info!(name = %self.config.name, "indexer stopped");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
