use async_trait::async_trait;
use db::DecodedBlock;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::IndexerError;

/// Messages from the feed to the persist stage.
#[derive(Debug)]
pub enum IngestMessage {
    Block(Box<DecodedBlock>),
}

/// Where decoded blocks come from.
#[async_trait]
pub trait BlockSource: Send + Sync + 'static {
    /// The decoded block at `height`, `None` while it is not available yet.
    async fn block(&self, height: i64) -> Result<Option<DecodedBlock>, IndexerError>;
}

/// Reads decoded blocks serialized as `<dir>/<height>.json`.
#[derive(Clone, Debug)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        DirectorySource {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_of(&self, height: i64) -> PathBuf {
        self.dir.join(format!("{height}.json"))
    }
}

#[async_trait]
impl BlockSource for DirectorySource {
    async fn block(&self, height: i64) -> Result<Option<DecodedBlock>, IndexerError> {
        let bytes = match tokio::fs::read(self.path_of(height)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let block: DecodedBlock = serde_json::from_slice(&bytes)?;
        if block.height() != height {
            return Err(IndexerError::Source(format!(
                "{} holds block {}",
                self.path_of(height).display(),
                block.height()
            )));
        }
        Ok(Some(block))
    }
}

/// Pushes blocks from `start` upwards into `blocks`, waiting `poll_interval`
/// whenever the next height is not available. A new head published on
/// `rewind` restarts the feed right above it.
pub async fn catch_up_blocks<S: BlockSource + ?Sized>(
    source: &S,
    start: i64,
    blocks: mpsc::Sender<IngestMessage>,
    mut rewind: watch::Receiver<Option<i64>>,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> Result<(), IndexerError> {
    let mut next = start;
    let mut rewound = false;
    let mut rewind_open = true;
    info!(height = next, "block feed starting");

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        if rewound || rewind.has_changed().unwrap_or(false) {
            rewound = false;
            let head = *rewind.borrow_and_update();
            next = head.map_or(start, |h| h + 1);
            info!(height = next, "block feed rewound");
        }

        match source.block(next).await {
            Ok(Some(block)) => {
                debug!(height = next, txs = block.txs.len(), "block read");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    sent = blocks.send(IngestMessage::Block(Box::new(block))) => {
                        sent.map_err(|_| IndexerError::ChannelClosed("blocks"))?;
                    }
                }
                next += 1;
            }
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    changed = rewind.changed(), if rewind_open => match changed {
                        Ok(()) => rewound = true,
                        Err(_) => rewind_open = false,
                    },
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            Err(e) if e.is_transient() => {
                warn!(height = next, error = %e, "block read failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}
