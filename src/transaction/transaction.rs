use core::fmt;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Instant,
};

use crate::{
    transaction::lock_manager::ResourceId,
    types::{Lsn, TransactionId, NULL_LSN},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// ACTIVE -> COMMITTING -> COMMITTED, or ACTIVE -> ABORTING -> ABORTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

/// Per-transaction context. A passive container: the transaction manager
/// drives the state machine, the log manager maintains `last_lsn`, the lock
/// manager maintains the held-lock set. Interior mutability lets all of them
/// work through a shared reference.
pub struct Transaction {
    id: TransactionId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    last_lsn: AtomicU64,
    held_locks: Mutex<HashSet<ResourceId>>,
    start_time: Instant,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Active),
            last_lsn: AtomicU64::new(NULL_LSN),
            held_locks: Mutex::new(HashSet::new()),
            start_time: Instant::now(),
        }
    }

    pub fn get_id(&self) -> TransactionId {
        self.id
    }

    pub fn get_isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn get_state(&self) -> TransactionState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: TransactionState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn get_last_lsn(&self) -> Lsn {
        self.last_lsn.load(Ordering::SeqCst)
    }

    pub(crate) fn set_last_lsn(&self, lsn: Lsn) {
        self.last_lsn.store(lsn, Ordering::SeqCst);
    }

    pub(crate) fn add_held_lock(&self, resource: ResourceId) {
        self.held_locks.lock().unwrap().insert(resource);
    }

    pub fn get_held_locks(&self) -> HashSet<ResourceId> {
        self.held_locks.lock().unwrap().clone()
    }

    pub(crate) fn take_held_locks(&self) -> HashSet<ResourceId> {
        std::mem::take(&mut *self.held_locks.lock().unwrap())
    }

    pub fn get_start_time(&self) -> Instant {
        self.start_time
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Transaction {}

impl std::hash::Hash for Transaction {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx_{}", self.id)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}
