pub mod catchup;
pub mod config;
pub mod error;
pub mod indexer;
pub mod persist;
pub mod reorg;
pub mod rpc;

#[cfg(test)]
pub(crate) mod test_utils;

pub use catchup::{BlockSource, DirectorySource, IngestMessage};
pub use config::IndexerConfig;
pub use error::IndexerError;
pub use crate::indexer::Indexer;
pub use persist::{Persister, RollbackSignal};
pub use reorg::{RollbackEngine, RollbackState, SyncReport};
pub use rpc::{ChainRpc, ExternalProvider, NodeBlock};
