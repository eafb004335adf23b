//! Database layer - single session, control ledger and target table DDL

pub mod ledger;
pub mod schema;
pub mod session;

pub use ledger::{Ledger, LedgerEntry, LedgerRecord, LedgerStatus};
pub use schema::TableSchema;
pub use session::{Backend, DbSession, Session, SqlValue, Statement};
