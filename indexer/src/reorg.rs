use db::{head, rollback_head, Ledger, RollbackReport};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::IndexerError;
use crate::persist::RollbackSignal;
use crate::rpc::ChainRpc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollbackState {
    /// Local head is about to be checked against the node.
    Comparing,
    /// Local head diverged and is about to be removed.
    RollingBack,
    /// Local head matches the node; idle until the next trigger.
    Synced,
}

impl fmt::Display for RollbackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackState::Comparing => write!(f, "comparing"),
            RollbackState::RollingBack => write!(f, "rolling back"),
            RollbackState::Synced => write!(f, "synced"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Heights removed during the pass.
    pub rolled_back: usize,
    /// Local head once the pass ended.
    pub head: Option<i64>,
}

/// Detects divergence between the local head and the node and unwinds the
/// ledger one height per transaction until they agree again.
pub struct RollbackEngine<L, R> {
    ledger: Arc<L>,
    rpc: Arc<R>,
    name: String,
    gate: Arc<Mutex<()>>,
    state: RollbackState,
    last_rollback: Option<RollbackReport>,
}

impl<L: Ledger, R: ChainRpc> RollbackEngine<L, R> {
    pub fn new(ledger: Arc<L>, rpc: Arc<R>, name: &str, gate: Arc<Mutex<()>>) -> Self {
        RollbackEngine {
            ledger,
            rpc,
            name: name.to_string(),
            gate,
            state: RollbackState::Comparing,
            last_rollback: None,
        }
    }

    pub fn state(&self) -> RollbackState {
        self.state
    }

    /// Performs a single transition. A failed step leaves the state as it
    /// was so the next trigger repeats it, and so does a comparison that
    /// `cancel` interrupts.
    pub async fn step(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<RollbackState, IndexerError> {
        self.state = match self.state {
            RollbackState::Comparing => self.compare(cancel).await?,
            RollbackState::RollingBack => {
                self.last_rollback = rollback_head(self.ledger.as_ref(), &self.name).await?;
                RollbackState::Comparing
            }
            RollbackState::Synced => RollbackState::Synced,
        };
        Ok(self.state)
    }

    async fn compare(&self, cancel: &CancellationToken) -> Result<RollbackState, IndexerError> {
        let Some(local) = head(self.ledger.as_ref()).await? else {
            return Ok(RollbackState::Synced);
        };
        let height = local.height as u64;

        let node_head = tokio::select! {
            _ = cancel.cancelled() => return Ok(RollbackState::Comparing),
            node_head = self.rpc.head() => node_head?,
        };
        if node_head < height {
            warn!(height, node_head, "local head is ahead of the node");
            return Ok(RollbackState::RollingBack);
        }
        let canonical = tokio::select! {
            _ = cancel.cancelled() => return Ok(RollbackState::Comparing),
            canonical = self.rpc.block(height) => canonical?,
        };
        match canonical {
            Some(canonical) if canonical.hash == local.hash => Ok(RollbackState::Synced),
            Some(canonical) => {
                warn!(
                    height,
                    local = %local.hash,
                    canonical = %canonical.hash,
                    "local head diverged from the node"
                );
                Ok(RollbackState::RollingBack)
            }
            None => {
                warn!(height, "node has no block at the local head");
                Ok(RollbackState::RollingBack)
            }
        }
    }

    /// Compares and unwinds until synced, holding the write gate throughout.
    /// Cancellation is honoured while waiting for the gate, during node
    /// requests and before every comparison. An unwind in progress always
    /// commits.
    pub async fn sync(&mut self, cancel: &CancellationToken) -> Result<SyncReport, IndexerError> {
        let gate = self.gate.clone();
        let _gate = tokio::select! {
            _ = cancel.cancelled() => return Ok(SyncReport::default()),
            guard = gate.lock() => guard,
        };
        self.state = RollbackState::Comparing;
        let mut report = SyncReport::default();

        loop {
            if self.state == RollbackState::Comparing && cancel.is_cancelled() {
                break;
            }
            let was = self.state;
            let now = self.step(cancel).await?;
            if was == RollbackState::RollingBack {
                if let Some(step) = self.last_rollback.take() {
                    report.rolled_back += 1;
                    report.head = step.new_head;
                }
            }
            if now == RollbackState::Synced {
                break;
            }
        }
        if report.rolled_back == 0 {
            report.head = head(self.ledger.as_ref()).await?.map(|b| b.height);
        }
        Ok(report)
    }

    /// Re-checks the head on every tick of `interval` and on every signal from
    /// the persist stage. After an unwind the new head is published on
    /// `rewind` so the feed resumes right above it.
    pub async fn run(
        mut self,
        mut signals: mpsc::Receiver<RollbackSignal>,
        rewind: watch::Sender<Option<i64>>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<(), IndexerError> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut signals_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
                signal = signals.recv(), if signals_open => match signal {
                    Some(RollbackSignal::CheckHead { height }) => {
                        debug!(height, "head check requested");
                    }
                    None => signals_open = false,
                },
            }

            match self.sync(&cancel).await {
                Ok(report) if report.rolled_back > 0 => {
                    info!(
                        rolled_back = report.rolled_back,
                        head = ?report.head,
                        "reorg unwound"
                    );
                    rewind.send_replace(report.head);
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    warn!(state = %self.state, error = %e, "reorg check failed, will retry");
                }
                Err(e) => {
                    error!(state = %self.state, error = %e, "reorg check failed");
                    return Err(e);
                }
            }
        }
    }
}
