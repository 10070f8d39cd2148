use clap::Parser;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::error::IndexerError;

#[derive(Parser, Debug)]
pub struct CLIArguments {
    #[clap(long, value_parser)]
    pub config_path: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct IndexerConfig {
    /// Key of the persisted indexer state.
    pub name: String,
    pub node_endpoint: String,
    /// Directory of decoded blocks, one `<height>.json` per block.
    pub blocks_dir: PathBuf,
    /// First height to ingest into an empty ledger.
    pub start_height: Option<i64>,
    pub channel_capacity: usize,
    pub poll_interval_ms: u64,
    pub reorg_check_interval_ms: u64,
    pub retry_delay_ms: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        IndexerConfig {
            name: "evm_indexer".to_string(),
            node_endpoint: "http://127.0.0.1:8545".to_string(),
            blocks_dir: PathBuf::from("./blocks"),
            start_height: None,
            channel_capacity: 16,
            poll_interval_ms: 500,
            reorg_check_interval_ms: 2000,
            retry_delay_ms: 1000,
        }
    }
}

impl IndexerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reorg_check_interval(&self) -> Duration {
        Duration::from_millis(self.reorg_check_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Reads the TOML config at `config_path`. A missing or malformed file falls
/// back to the defaults; fields left out of the file keep their default.
pub fn load_config(config_path: &str) -> Result<IndexerConfig, IndexerError> {
    if config_path.is_empty() {
        return Ok(IndexerConfig::default());
    }
    match std::fs::read_to_string(config_path) {
        Ok(file_str) => match toml::from_str(&file_str) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!(path = config_path, error = %e, "invalid config, loading defaults");
                Ok(IndexerConfig::default())
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(path = config_path, "config not found, loading defaults");
            Ok(IndexerConfig::default())
        }
        Err(e) => Err(e.into()),
    }
}
