use db::DbError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Database Error: {0}")]
    Db(#[from] DbError),

    #[error("External Provider Error: {0}")]
    Rpc(String),

    #[error("Block Source Error: {0}")]
    Source(String),

    #[error("Deserialization Error: {0}")]
    Deserialization(#[from] SerdeError),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tokio Join Error: {0}")]
    TokioJoinError(#[from] JoinError),

    #[error("Channel Closed: {0}")]
    ChannelClosed(&'static str),
}

impl IndexerError {
    /// Errors worth another attempt after a pause. Everything else stops the
    /// task that hit it.
    pub fn is_transient(&self) -> bool {
        match self {
            IndexerError::Db(e) => e.is_transient(),
            IndexerError::Rpc(_) | IndexerError::Io(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_errors_are_fatal() {
        assert!(!IndexerError::Db(DbError::UnresolvedAddress("0xaa".into())).is_transient());
        assert!(!IndexerError::Source("height mismatch".into()).is_transient());
        assert!(IndexerError::Db(DbError::Pool("timed out".into())).is_transient());
        assert!(IndexerError::Rpc("connection refused".into()).is_transient());
    }
}
