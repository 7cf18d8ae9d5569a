//! Transaction lifecycle: begin, commit, abort with CLR-driven rollback.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use log::{debug, error, info};

use crate::{
    engine::StorageEngine,
    error::{DbError, ErrorKind},
    transaction::{
        lock_manager::LockManager,
        log_manager::LogManager,
        log_record::{ClrPayload, LogRecordBody},
        transaction::{IsolationLevel, Transaction, TransactionState},
    },
    types::{DbResult, Lsn, Pod, TransactionId, NULL_LSN},
    utils::HandyRwLock,
};

pub struct TransactionManager {
    lock_manager: Arc<LockManager>,
    log_manager: Pod<LogManager>,
    storage: Arc<StorageEngine>,
    next_txn_id: AtomicU32,
    txn_table: Mutex<HashMap<TransactionId, Arc<Transaction>>>,
    transaction_timeout: Duration,
}

impl TransactionManager {
    pub fn new(
        lock_manager: Arc<LockManager>,
        log_manager: Pod<LogManager>,
        storage: Arc<StorageEngine>,
        start_txn_id: TransactionId,
        transaction_timeout: Duration,
    ) -> Self {
        Self {
            lock_manager,
            log_manager,
            storage,
            next_txn_id: AtomicU32::new(start_txn_id),
            txn_table: Mutex::new(HashMap::new()),
            transaction_timeout,
        }
    }

    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let tx = Arc::new(Transaction::new(id, isolation_level));
        self.txn_table.lock().unwrap().insert(id, tx.clone());
        info!("began {} ({:?})", tx, isolation_level);
        tx
    }

    /// Commit: COMMIT record, force the log, release locks. Only once the
    /// record is durable does this return.
    pub fn commit(&self, tx: &Transaction) -> DbResult {
        if tx.get_state() != TransactionState::Active {
            return Err(DbError::new(
                ErrorKind::Internal,
                &format!("{} cannot commit from state {:?}", tx, tx.get_state()),
            ));
        }
        tx.set_state(TransactionState::Committing);

        let commit_lsn = {
            let mut log = self.log_manager.wl();
            let lsn = log.append(tx, LogRecordBody::Commit)?;
            log.flush_to_lsn(lsn)?;
            lsn
        };

        tx.set_state(TransactionState::Committed);
        self.lock_manager.release_all(tx);
        self.txn_table.lock().unwrap().remove(&tx.get_id());
        info!("{} committed at lsn {}", tx, commit_lsn);
        Ok(())
    }

    /// Abort: undo the transaction's chain with CLRs, append ABORT, release
    /// locks. Lock release happens even when the undo itself fails.
    pub fn abort(&self, tx: &Transaction) -> DbResult {
        match tx.get_state() {
            TransactionState::Committed | TransactionState::Aborted => return Ok(()),
            _ => {}
        }
        tx.set_state(TransactionState::Aborting);
        info!("aborting {}", tx);

        let rollback_result = (|| -> DbResult {
            // the chain must be readable from the file before walking it
            let last_lsn = tx.get_last_lsn();
            self.log_manager.wl().flush_to_lsn(last_lsn)?;
            self.rollback(tx)
        })();
        if let Err(e) = &rollback_result {
            error!("{} rollback failed, locks released anyway: {}", tx, e);
        }

        self.log_manager.wl().append(tx, LogRecordBody::Abort)?;
        tx.set_state(TransactionState::Aborted);
        self.lock_manager.release_all(tx);
        self.txn_table.lock().unwrap().remove(&tx.get_id());
        info!("{} aborted", tx);
        rollback_result
    }

    /// Walk the transaction's chain backward, emitting and applying a CLR
    /// for every data record. CLRs themselves are never undone: their
    /// `undo_next_lsn` skips already-compensated work.
    fn rollback(&self, tx: &Transaction) -> DbResult {
        let mut current = tx.get_last_lsn();
        while current != NULL_LSN {
            let record = self
                .log_manager
                .rl()
                .read_record_by_lsn(current)?
                .ok_or_else(|| {
                    DbError::corruption(&format!("undo chain points at missing lsn {}", current))
                })?;

            let payload = match &record.body {
                LogRecordBody::Update {
                    resource, before, ..
                } => Some(ClrPayload::Update {
                    resource: resource.clone(),
                    restore: before.clone(),
                }),
                LogRecordBody::Insert { resource, data } => Some(ClrPayload::Insert {
                    resource: resource.clone(),
                    record_size: data.len() as u32,
                }),
                LogRecordBody::Delete { resource, data } => Some(ClrPayload::Delete {
                    resource: resource.clone(),
                    restore: data.clone(),
                }),
                _ => None,
            };

            match payload {
                Some(payload) => {
                    debug!("{} undoing lsn {}", tx, record.lsn);
                    let clr_lsn = {
                        let mut log = self.log_manager.wl();
                        let lsn = log.append(
                            tx,
                            LogRecordBody::Clr {
                                undo_next_lsn: record.prev_lsn,
                                payload: payload.clone(),
                            },
                        )?;
                        log.flush_to_lsn(lsn)?;
                        lsn
                    };
                    self.storage.apply_clr_payload(&payload, clr_lsn)?;
                    current = record.prev_lsn;
                }
                None => match &record.body {
                    LogRecordBody::Clr { undo_next_lsn, .. } => current = *undo_next_lsn,
                    _ => current = record.prev_lsn,
                },
            }
        }
        Ok(())
    }

    pub fn get_transaction(&self, id: TransactionId) -> Option<Arc<Transaction>> {
        self.txn_table.lock().unwrap().get(&id).cloned()
    }

    pub fn active_transaction_count(&self) -> usize {
        self.txn_table.lock().unwrap().len()
    }

    /// Snapshot of the active-transaction table for END_CHECKPOINT.
    pub fn active_lsn_table(&self) -> HashMap<TransactionId, Lsn> {
        self.txn_table
            .lock()
            .unwrap()
            .values()
            .map(|tx| (tx.get_id(), tx.get_last_lsn()))
            .collect()
    }

    pub fn active_transactions(&self) -> Vec<Arc<Transaction>> {
        self.txn_table.lock().unwrap().values().cloned().collect()
    }

    /// Abort every ACTIVE transaction that overran the configured timeout.
    /// The background detector calls this periodically.
    pub fn abort_expired(&self) {
        let expired: Vec<Arc<Transaction>> = self
            .txn_table
            .lock()
            .unwrap()
            .values()
            .filter(|tx| {
                tx.get_state() == TransactionState::Active
                    && tx.get_start_time().elapsed() > self.transaction_timeout
            })
            .cloned()
            .collect();
        for tx in expired {
            info!("{} exceeded the transaction timeout, aborting", tx);
            if let Err(e) = self.abort(&tx) {
                error!("timeout abort of {} failed: {}", tx, e);
            }
        }
    }

    /// Abort everything still running, for shutdown.
    pub fn abort_all(&self) {
        for tx in self.active_transactions() {
            if let Err(e) = self.abort(&tx) {
                error!("shutdown abort of {} failed: {}", tx, e);
            }
        }
    }
}
