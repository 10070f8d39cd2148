pub mod memory;
pub mod postgres;

pub use memory::{MemoryLedger, MemoryTables, MemoryTx};
pub use postgres::PgLedger;
