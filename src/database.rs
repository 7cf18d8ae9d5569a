//! The `Database` handle: one value owning the catalog, lock manager, log
//! manager, storage engine, and transaction manager of a database directory.
//! Everything is reached through this handle; there is no process-global
//! state.
//!
//! Layout on disk: `<base>/catalog.json`, `<base>/wal.log`, and the table
//! and index files under `<base>/data/`.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock, Weak},
    thread,
    time::Duration,
};

use log::{debug, info};

use crate::{
    catalog::Catalog,
    engine::StorageEngine,
    error::DbError,
    storage::{buffer_pool::DEFAULT_BUFFER_SIZE, tablespace::DEFAULT_PAGE_SIZE},
    transaction::{
        recover, IsolationLevel, LockManager, LogManager, LogRecordBody, Transaction,
        TransactionManager,
    },
    types::{DbResult, Pod, NULL_LSN, SYSTEM_TXN_ID},
    utils::HandyRwLock,
};

#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub page_size: usize,
    pub buffer_size: usize,
    /// How long a lock request waits before giving up.
    pub lock_wait_timeout: Duration,
    /// ACTIVE transactions older than this are aborted by the background
    /// detector.
    pub transaction_timeout: Duration,
    /// Interval of the background deadlock/timeout check.
    pub deadlock_check_interval: Duration,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            lock_wait_timeout: Duration::from_secs(3),
            transaction_timeout: Duration::from_secs(300),
            deadlock_check_interval: Duration::from_secs(1),
        }
    }
}

pub struct Database {
    path: PathBuf,
    catalog: Pod<Catalog>,
    lock_manager: Arc<LockManager>,
    log_manager: Pod<LogManager>,
    storage: Arc<StorageEngine>,
    transactions: Arc<TransactionManager>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::open_with(path, DatabaseOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, options: DatabaseOptions) -> Result<Self, DbError> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path).map_err(|e| DbError::io(&e.to_string()))?;

        let catalog = Arc::new(RwLock::new(Catalog::load(path.join("catalog.json"))));
        let lock_manager = Arc::new(LockManager::new(options.lock_wait_timeout));
        let log_manager = Arc::new(RwLock::new(LogManager::open(path.join("wal.log"))?));
        let storage = Arc::new(StorageEngine::new(
            path.join("data"),
            options.page_size,
            options.buffer_size,
            catalog.clone(),
            log_manager.clone(),
            lock_manager.clone(),
        )?);

        // crash recovery runs before the first transaction is handed out;
        // it also tells us where transaction numbering must resume
        let max_txn_id = recover(&log_manager, &storage)?;

        let transactions = Arc::new(TransactionManager::new(
            lock_manager.clone(),
            log_manager.clone(),
            storage.clone(),
            max_txn_id + 1,
            options.transaction_timeout,
        ));

        Self::spawn_detector(
            Arc::downgrade(&lock_manager),
            Arc::downgrade(&transactions),
            options.deadlock_check_interval,
        );

        info!("database open at {:?}", path);
        Ok(Self {
            path,
            catalog,
            lock_manager,
            log_manager,
            storage,
            transactions,
        })
    }

    fn spawn_detector(
        lock_manager: Weak<LockManager>,
        transactions: Weak<TransactionManager>,
        interval: Duration,
    ) {
        thread::Builder::new()
            .name("deadlock-detector".to_string())
            .spawn(move || loop {
                thread::sleep(interval);
                let lm = match lock_manager.upgrade() {
                    Some(lm) => lm,
                    None => break,
                };
                lm.detect_victims();
                if let Some(tm) = transactions.upgrade() {
                    tm.abort_expired();
                }
            })
            .ok();
    }

    pub fn get_path(&self) -> &Path {
        &self.path
    }

    pub fn get_catalog(&self) -> Pod<Catalog> {
        self.catalog.clone()
    }

    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    pub fn begin(&self) -> Arc<Transaction> {
        self.transactions.begin(IsolationLevel::RepeatableRead)
    }

    pub fn begin_with(&self, isolation: IsolationLevel) -> Arc<Transaction> {
        self.transactions.begin(isolation)
    }

    pub fn commit(&self, tx: &Transaction) -> DbResult {
        self.transactions.commit(tx)
    }

    pub fn abort(&self, tx: &Transaction) -> DbResult {
        self.transactions.abort(tx)
    }

    /// Fuzzy checkpoint: flush every pool, then record the surviving ATT and
    /// DPT so the next recovery can start its analysis here.
    pub fn checkpoint(&self) -> DbResult {
        debug!("checkpoint starting");
        self.log_manager
            .wl()
            .append_with_prev(SYSTEM_TXN_ID, NULL_LSN, LogRecordBody::BeginCheckpoint)?;

        self.storage.flush_all_pools()?;

        let att = self.transactions.active_lsn_table();
        let dpt = self.storage.dirty_page_table();
        let end_lsn = self.log_manager.wl().append_with_prev(
            SYSTEM_TXN_ID,
            NULL_LSN,
            LogRecordBody::EndCheckpoint { att, dpt },
        )?;
        self.log_manager.wl().flush_to_lsn(end_lsn)?;
        self.catalog.rl().save()?;
        debug!("checkpoint complete at lsn {}", end_lsn);
        Ok(())
    }

    /// Orderly shutdown: abort stragglers, flush everything, checkpoint,
    /// persist the catalog.
    pub fn shutdown(&self) -> DbResult {
        info!("shutting down database at {:?}", self.path);
        self.transactions.abort_all();
        self.storage.flush_all_pools()?;
        self.log_manager.wl().flush_all()?;
        self.checkpoint()?;
        Ok(())
    }
}
