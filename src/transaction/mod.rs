mod lock_manager;
mod log_manager;
mod log_record;
mod recovery;
#[allow(clippy::module_inception)]
mod transaction;
mod transaction_manager;
mod wait_for_graph;

pub use lock_manager::{LockManager, LockMode, ResourceId, CATALOG_RESOURCE};
pub use log_manager::{LogManager, LogReader};
pub use log_record::{ClrPayload, IndexDescriptor, LogRecord, LogRecordBody};
pub use recovery::recover;
pub use transaction::{IsolationLevel, Transaction, TransactionState};
pub use transaction_manager::TransactionManager;
