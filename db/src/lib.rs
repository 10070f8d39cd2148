pub mod connections;
pub mod decoded;
pub mod error;
pub mod ingest;
pub mod ledger;
pub mod models;
pub mod providers;
pub mod reconcile;
pub mod resolver;
pub mod rollback;
pub mod schema;
pub mod types;

pub use connections::*;
pub use decoded::*;
pub use error::DbError;
pub use ingest::{save_block, BlockReport, SaveOutcome};
pub use ledger::{head, load_state, Ledger, LedgerTx, MergeReport, Upserted};
pub use models::*;
pub use providers::*;
pub use rollback::{rollback_head, RollbackReport};
pub use types::*;

pub use scoped_futures::ScopedFutureExt;
