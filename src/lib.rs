//! minirel: the storage and transaction core of a small relational database
//! engine.
//!
//! The core is five cooperating subsystems: a paged heap-file store with
//! slotted pages, B+tree secondary indexes, a hierarchical lock manager with
//! deadlock detection, a write-ahead log, and ARIES-style crash recovery.
//! Everything hangs off an explicit [`Database`] handle.

pub mod catalog;
pub mod engine;
pub mod error;
pub mod storage;
pub mod transaction;
pub mod types;
pub mod utils;

mod database;

pub use catalog::{ColumnInfo, DataType, IndexInfo, TableInfo, TriggerInfo, Value, ViewInfo};
pub use database::{Database, DatabaseOptions};
pub use engine::StorageEngine;
pub use error::{DbError, ErrorKind};
pub use transaction::{
    IsolationLevel, LockMode, ResourceId, Transaction, TransactionManager, TransactionState,
};
pub use types::{DbResult, Lsn, PageId, RecordId, RowId, TransactionId};
