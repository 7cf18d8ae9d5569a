//! Hierarchical lock manager.
//!
//! Resources form a three-level hierarchy: table, page, record. Acquiring a
//! lock first plants the matching intention lock on every ancestor (IX for
//! X/IX/SIX requests, IS otherwise). Waiting is a poll loop with a deadline;
//! each time a transaction starts waiting, its waits-for edges are added and
//! a cycle check runs — the new waiter dies on a cycle. A background
//! detector additionally scans the whole graph and marks victims.

use core::fmt;
use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    thread::sleep,
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{
    error::{DbError, ErrorKind},
    transaction::{transaction::Transaction, wait_for_graph::WaitForGraph},
    types::{DbResult, PageId, RecordId, TransactionId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    /// The §compatibility matrix:
    ///
    /// | held\req | IS | IX | S | SIX | X |
    /// |----------|----|----|---|-----|---|
    /// | IS       | Y  | Y  | Y | Y   | N |
    /// | IX       | Y  | Y  | N | N   | N |
    /// | S        | Y  | N  | Y | N   | N |
    /// | SIX      | Y  | N  | N | N   | N |
    /// | X        | N  | N  | N | N   | N |
    pub fn compatible(held: LockMode, requested: LockMode) -> bool {
        use LockMode::*;
        match (held, requested) {
            (IntentionShared, Exclusive) => false,
            (IntentionShared, _) => true,
            (IntentionExclusive, IntentionShared) | (IntentionExclusive, IntentionExclusive) => {
                true
            }
            (Shared, IntentionShared) | (Shared, Shared) => true,
            (SharedIntentionExclusive, IntentionShared) => true,
            _ => false,
        }
    }

    /// Whether holding `self` already satisfies a request for `other`.
    pub fn covers(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (x, y) if x == y => true,
            (Exclusive, _) => true,
            (SharedIntentionExclusive, Shared)
            | (SharedIntentionExclusive, IntentionShared)
            | (SharedIntentionExclusive, IntentionExclusive) => true,
            (Shared, IntentionShared) => true,
            (IntentionExclusive, IntentionShared) => true,
            _ => false,
        }
    }

    /// The mode a holder ends up with after an upgrade request.
    fn combine(held: LockMode, requested: LockMode) -> LockMode {
        use LockMode::*;
        if held.covers(requested) {
            held
        } else if requested.covers(held) {
            requested
        } else if matches!(
            (held, requested),
            (Shared, IntentionExclusive) | (IntentionExclusive, Shared)
        ) {
            SharedIntentionExclusive
        } else {
            requested
        }
    }

    fn is_exclusive_flavored(self) -> bool {
        matches!(
            self,
            LockMode::Exclusive | LockMode::IntentionExclusive | LockMode::SharedIntentionExclusive
        )
    }
}

/// Identifier of a lockable resource: a table, a page of it, or a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub table_name: String,
    pub page_id: Option<PageId>,
    pub record_id: Option<RecordId>,
}

/// Catalog mutations are serialized under an X lock on this resource.
pub const CATALOG_RESOURCE: &str = "__catalog__";

impl ResourceId {
    pub fn table(table_name: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            page_id: None,
            record_id: None,
        }
    }

    pub fn page(table_name: &str, page_id: PageId) -> Self {
        Self {
            table_name: table_name.to_string(),
            page_id: Some(page_id),
            record_id: None,
        }
    }

    pub fn record(table_name: &str, page_id: PageId, record_id: RecordId) -> Self {
        Self {
            table_name: table_name.to_string(),
            page_id: Some(page_id),
            record_id: Some(record_id),
        }
    }

    pub fn catalog() -> Self {
        Self::table(CATALOG_RESOURCE)
    }

    /// The immediate ancestor in the hierarchy, if any.
    pub fn parent(&self) -> Option<ResourceId> {
        if self.record_id.is_some() {
            Some(ResourceId::page(&self.table_name, self.page_id.unwrap()))
        } else if self.page_id.is_some() {
            Some(ResourceId::table(&self.table_name))
        } else {
            None
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.page_id, self.record_id) {
            (Some(p), Some(r)) => write!(f, "{}[{}:{}]", self.table_name, p, r),
            (Some(p), None) => write!(f, "{}[{}]", self.table_name, p),
            _ => write!(f, "{}", self.table_name),
        }
    }
}

#[derive(Default)]
struct LockQueue {
    granted: HashMap<TransactionId, LockMode>,
    waiting: Vec<(TransactionId, LockMode)>,
}

impl LockQueue {
    fn is_compatible(&self, requested: LockMode, except: TransactionId) -> bool {
        self.granted
            .iter()
            .filter(|(tid, _)| **tid != except)
            .all(|(_, held)| LockMode::compatible(*held, requested))
    }

    fn is_empty(&self) -> bool {
        self.granted.is_empty() && self.waiting.is_empty()
    }
}

struct LockTables {
    resources: HashMap<ResourceId, LockQueue>,
    waits_for: WaitForGraph,
    victims: HashSet<TransactionId>,
}

pub struct LockManager {
    tables: Mutex<LockTables>,
    wait_timeout: Duration,
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);

impl LockManager {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            tables: Mutex::new(LockTables {
                resources: HashMap::new(),
                waits_for: WaitForGraph::new(),
                victims: HashSet::new(),
            }),
            wait_timeout,
        }
    }

    /// Block until the lock is granted. Raises Deadlock when this
    /// transaction must die to break a cycle, LockTimeout when the wait
    /// budget runs out. The transaction manager is responsible for rolling
    /// back the victim.
    pub fn acquire(
        &self,
        tx: &Transaction,
        mode: LockMode,
        resource: ResourceId,
    ) -> DbResult {
        // ancestors first: IX above exclusive-flavored requests, IS above
        // shared ones. Using IS here would let conflicting X holders coexist.
        if let Some(parent) = resource.parent() {
            let parent_mode = if mode.is_exclusive_flavored() {
                LockMode::IntentionExclusive
            } else {
                LockMode::IntentionShared
            };
            self.acquire(tx, parent_mode, parent)?;
        }

        let tid = tx.get_id();
        let start_time = Instant::now();
        loop {
            {
                let mut guard = self.tables.lock().unwrap();
                let tables = &mut *guard;

                if tables.victims.remove(&tid) {
                    Self::stop_waiting(tables, tid, &resource);
                    return Err(DbError::new(
                        ErrorKind::Deadlock,
                        &format!("{} chosen as deadlock victim", tx),
                    ));
                }

                let queue = tables.resources.entry(resource.clone()).or_default();

                if let Some(held) = queue.granted.get(&tid).copied() {
                    if held.covers(mode) {
                        return Ok(());
                    }
                }

                // grant iff compatible with every other holder and nobody
                // else is already waiting in front of us
                let only_self_waiting = queue.waiting.iter().all(|(t, _)| *t == tid);
                if queue.is_compatible(mode, tid) && only_self_waiting {
                    let held = queue.granted.get(&tid).copied();
                    let new_mode = match held {
                        Some(h) => LockMode::combine(h, mode),
                        None => mode,
                    };
                    queue.granted.insert(tid, new_mode);
                    queue.waiting.retain(|(t, _)| *t != tid);
                    tables.waits_for.remove_waiter(tid);
                    tx.add_held_lock(resource.clone());
                    debug!("{} granted {:?} on {}", tx, mode, resource);
                    return Ok(());
                }

                // enqueue and wait; edges go to every current holder
                if !queue.waiting.iter().any(|(t, _)| *t == tid) {
                    queue.waiting.push((tid, mode));
                }
                let holders: Vec<TransactionId> = queue
                    .granted
                    .keys()
                    .copied()
                    .filter(|t| *t != tid)
                    .collect();
                for holder in holders {
                    tables.waits_for.add_edge(tid, holder);
                }

                if let Some(cycle) = tables.waits_for.find_cycle_from(tid) {
                    warn!(
                        "deadlock detected, aborting new waiter {} (cycle: {:?})",
                        tx, cycle
                    );
                    Self::stop_waiting(tables, tid, &resource);
                    return Err(DbError::new(
                        ErrorKind::Deadlock,
                        &format!("deadlock detected, {} chosen as victim", tx),
                    ));
                }
            }

            if start_time.elapsed() >= self.wait_timeout {
                let mut guard = self.tables.lock().unwrap();
                Self::stop_waiting(&mut guard, tid, &resource);
                return Err(DbError::new(
                    ErrorKind::LockTimeout,
                    &format!("{} timed out waiting for {:?} on {}", tx, mode, resource),
                ));
            }
            sleep(POLL_INTERVAL);
        }
    }

    fn stop_waiting(tables: &mut LockTables, tid: TransactionId, resource: &ResourceId) {
        if let Some(queue) = tables.resources.get_mut(resource) {
            queue.waiting.retain(|(t, _)| *t != tid);
        }
        tables.waits_for.remove_waiter(tid);
    }

    /// Release every lock the transaction holds or waits for and clear its
    /// waits-for edges. Strict 2PL: called only at commit/abort.
    pub fn release_all(&self, tx: &Transaction) {
        let tid = tx.get_id();
        let held = tx.take_held_locks();
        let mut guard = self.tables.lock().unwrap();
        let tables = &mut *guard;
        for resource in held {
            let mut now_empty = false;
            if let Some(queue) = tables.resources.get_mut(&resource) {
                queue.granted.remove(&tid);
                queue.waiting.retain(|(t, _)| *t != tid);
                now_empty = queue.is_empty();
            }
            if now_empty {
                tables.resources.remove(&resource);
            }
        }
        // drop any leftover waiting entries (failed acquires)
        for queue in tables.resources.values_mut() {
            queue.waiting.retain(|(t, _)| *t != tid);
        }
        tables.waits_for.remove_transaction(tid);
        tables.victims.remove(&tid);
        debug!("{} released all locks", tx);
    }

    /// The mode `tx` holds on `resource`, if any.
    pub fn held_mode(&self, tx: &Transaction, resource: &ResourceId) -> Option<LockMode> {
        let tables = self.tables.lock().unwrap();
        tables
            .resources
            .get(resource)
            .and_then(|q| q.granted.get(&tx.get_id()).copied())
    }

    /// Periodic scan by the background detector: mark the youngest
    /// transaction of any cycle as victim. Waiters observe the mark on their
    /// next poll.
    pub fn detect_victims(&self) {
        let mut guard = self.tables.lock().unwrap();
        let tables = &mut *guard;
        if let Some(cycle) = tables.waits_for.find_any_cycle() {
            if let Some(&victim) = cycle.iter().max() {
                warn!(
                    "background deadlock check found cycle {:?}; victim {}",
                    cycle, victim
                );
                tables.victims.insert(victim);
            }
        }
    }
}
