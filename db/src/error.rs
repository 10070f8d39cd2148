use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection Pool Error: {0}")]
    Pool(String),

    #[error("Query Error: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("Migration Error: {0}")]
    Migration(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    /// A fact referenced an address that was not part of the block's
    /// touched-address set.
    #[error("address {0} is not resolved for the pending block")]
    UnresolvedAddress(String),

    #[error("transaction {0} is not part of the pending block")]
    UnresolvedTx(String),

    #[error("{op}: expected {expected} rows, store returned {actual}")]
    LengthMismatch {
        op: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("block {0} disappeared while rolling back")]
    MissingBlock(i64),
}

impl DbError {
    /// Errors worth retrying with the same input: lost connections,
    /// serialization conflicts and pool exhaustion. Constraint violations,
    /// missing rows and decoding failures will fail again.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::Pool(_) => true,
            DbError::Query(DieselError::DatabaseError(kind, _)) => matches!(
                kind,
                DatabaseErrorKind::SerializationFailure
                    | DatabaseErrorKind::ClosedConnection
                    | DatabaseErrorKind::UnableToSendCommand
            ),
            DbError::Query(DieselError::BrokenTransactionManager) => true,
            _ => false,
        }
    }
}
