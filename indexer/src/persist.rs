use db::{save_block, DecodedBlock, Ledger, SaveOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::catchup::IngestMessage;
use crate::error::IndexerError;

/// Messages from the persist stage to the rollback engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollbackSignal {
    /// A block was committed; the new head should be checked against the node.
    CheckHead { height: i64 },
}

/// Commits blocks from the feed one transaction at a time. The write gate is
/// shared with the rollback engine so a commit never interleaves with an
/// unwind.
pub struct Persister<L> {
    ledger: Arc<L>,
    name: String,
    gate: Arc<Mutex<()>>,
    retry_delay: Duration,
}

impl<L: Ledger> Persister<L> {
    pub fn new(ledger: Arc<L>, name: &str, gate: Arc<Mutex<()>>, retry_delay: Duration) -> Self {
        Persister {
            ledger,
            name: name.to_string(),
            gate,
            retry_delay,
        }
    }

    /// Runs until the feed closes or `cancel` fires. Transient store errors
    /// are retried; anything else ends the task with the error.
    pub async fn run(
        self,
        mut blocks: mpsc::Receiver<IngestMessage>,
        signals: mpsc::Sender<RollbackSignal>,
        cancel: CancellationToken,
    ) -> Result<(), IndexerError> {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                message = blocks.recv() => message,
            };
            let Some(IngestMessage::Block(block)) = message else {
                debug!("block feed closed");
                return Ok(());
            };

            let Some(outcome) = self.persist(&block, &cancel).await? else {
                return Ok(());
            };
            match outcome {
                SaveOutcome::Saved(report) => {
                    let signal = RollbackSignal::CheckHead {
                        height: report.height,
                    };
                    if let Err(TrySendError::Closed(_)) = signals.try_send(signal) {
                        debug!(height = report.height, "rollback engine gone");
                    }
                }
                SaveOutcome::AlreadyIndexed { height, head } => {
                    debug!(height, head, "block already indexed, skipped");
                }
                SaveOutcome::OutOfOrder { height, expected } => {
                    warn!(height, expected, "block out of order, skipped");
                }
            }
        }
    }

    /// `None` when cancelled while waiting for the gate or to retry.
    async fn persist(
        &self,
        block: &DecodedBlock,
        cancel: &CancellationToken,
    ) -> Result<Option<SaveOutcome>, IndexerError> {
        loop {
            let result = {
                let _gate = tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    guard = self.gate.lock() => guard,
                };
                save_block(self.ledger.as_ref(), &self.name, block).await
            };
            match result {
                Ok(outcome) => return Ok(Some(outcome)),
                Err(e) if e.is_transient() => {
                    warn!(height = block.height(), error = %e, "commit failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
                Err(e) => {
                    error!(height = block.height(), error = %e, "block rejected");
                    return Err(e.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::block;
    use db::{head, MemoryLedger};
    use pretty_assertions::assert_eq;

    fn persister(ledger: &Arc<MemoryLedger>) -> Persister<MemoryLedger> {
        Persister::new(
            ledger.clone(),
            "test",
            Arc::new(Mutex::new(())),
            Duration::from_millis(5),
        )
    }

    async fn feed(blocks: Vec<DecodedBlock>) -> mpsc::Receiver<IngestMessage> {
        let (tx, rx) = mpsc::channel(blocks.len().max(1));
        for b in blocks {
            tx.send(IngestMessage::Block(Box::new(b))).await.unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn redelivered_blocks_are_skipped() {
        let ledger = Arc::new(MemoryLedger::new());
        let blocks = feed(vec![block(1, "a"), block(1, "a"), block(2, "a"), block(4, "a")]).await;
        let (signals, mut signal_rx) = mpsc::channel(1);

        persister(&ledger)
            .run(blocks, signals, CancellationToken::new())
            .await
            .unwrap();

        let tip = head(ledger.as_ref()).await.unwrap().unwrap();
        assert_eq!(tip.height, 2);
        assert_eq!(ledger.snapshot().await.txs.len(), 2);
        // Capacity 1: the second signal is dropped while the first is pending.
        assert_eq!(
            signal_rx.recv().await,
            Some(RollbackSignal::CheckHead { height: 1 })
        );
        assert_eq!(signal_rx.recv().await, None);
    }

    #[tokio::test]
    async fn integrity_error_stops_the_task() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut broken = block(1, "a");
        broken.addresses.retain(|a| a.hash != "0xb");
        let blocks = feed(vec![broken, block(2, "a")]).await;
        let (signals, _signal_rx) = mpsc::channel(1);

        let err = persister(&ledger)
            .run(blocks, signals, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, IndexerError::Db(db::DbError::UnresolvedAddress(_))));
        assert!(head(ledger.as_ref()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_tx_hash_stops_the_task() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut doubled = block(1, "a");
        let mut again = doubled.txs[0].clone();
        again.position = 1;
        doubled.txs.push(again);
        let blocks = feed(vec![doubled]).await;
        let (signals, _signal_rx) = mpsc::channel(1);

        let run = persister(&ledger).run(blocks, signals, CancellationToken::new());
        let err = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, IndexerError::Db(db::DbError::Query(_))));
        assert!(!err.is_transient());
        assert!(head(ledger.as_ref()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_releases_a_persister_waiting_for_the_gate() {
        let ledger = Arc::new(MemoryLedger::new());
        let gate = Arc::new(Mutex::new(()));
        let persister =
            Persister::new(ledger.clone(), "test", gate.clone(), Duration::from_millis(5));
        let (_tx, blocks) = {
            let (tx, rx) = mpsc::channel(1);
            tx.send(IngestMessage::Block(Box::new(block(1, "a")))).await.unwrap();
            (tx, rx)
        };
        let (signals, _signal_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let held = gate.lock().await;
        let task = tokio::spawn(persister.run(blocks, signals, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        drop(held);
        assert!(head(ledger.as_ref()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelled_persister_returns() {
        let ledger = Arc::new(MemoryLedger::new());
        let (_tx, blocks) = mpsc::channel(1);
        let (signals, _signal_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        persister(&ledger).run(blocks, signals, cancel).await.unwrap();
    }
}
