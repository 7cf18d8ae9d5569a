//! ARIES crash recovery: analysis, redo, undo.
//!
//! Analysis rebuilds the catalog from DDL records and derives the
//! active-transaction and dirty-page tables, starting from the last
//! END_CHECKPOINT when one exists. Redo replays history forward from the
//! oldest recovery LSN, guarded by each page's PageLSN. Undo rolls back the
//! losers newest-LSN-first, emitting redo-only CLRs so a crash during
//! recovery leaves a state the next recovery completes from.

use std::collections::{BTreeMap, HashMap};

use log::{debug, info, warn};

use crate::{
    catalog::{IndexInfo, TableInfo},
    engine::StorageEngine,
    error::DbError,
    transaction::{
        log_manager::{LogManager, LogReader},
        log_record::{ClrPayload, LogRecord, LogRecordBody},
    },
    types::{DbResult, Lsn, PageId, Pod, TransactionId, NULL_LSN, SYSTEM_TXN_ID},
    utils::HandyRwLock,
};

/// Run crash recovery. Returns the highest transaction id seen in the log,
/// so the transaction manager can continue numbering past it.
pub fn recover(
    log_manager: &Pod<LogManager>,
    engine: &StorageEngine,
) -> Result<TransactionId, DbError> {
    let path = log_manager.rl().get_path().to_path_buf();
    let catalog = engine.get_catalog();

    // pass 0: index the log by lsn, remember the last complete checkpoint
    let mut lsn_offsets: BTreeMap<Lsn, u64> = BTreeMap::new();
    let mut checkpoint: Option<(u64, HashMap<TransactionId, Lsn>, HashMap<PageId, Lsn>)> = None;
    {
        let mut reader = LogReader::open(&path)?;
        while let Some((offset, record)) = reader.next_record()? {
            lsn_offsets.insert(record.lsn, offset);
            if let LogRecordBody::EndCheckpoint { att, dpt } = &record.body {
                checkpoint = Some((offset, att.clone(), dpt.clone()));
            }
        }
    }
    if lsn_offsets.is_empty() {
        info!("log is empty, nothing to recover");
        return Ok(0);
    }

    // phase 1: analysis
    let (checkpoint_offset, mut att, mut dpt) = match checkpoint {
        Some((offset, att, dpt)) => (Some(offset), att, dpt),
        None => (None, HashMap::new(), HashMap::new()),
    };
    let mut max_txn_id: TransactionId = 0;

    {
        let mut reader = LogReader::open(&path)?;
        while let Some((offset, record)) = reader.next_record()? {
            if let Some(ckpt) = checkpoint_offset {
                if offset <= ckpt {
                    continue;
                }
            }
            analyze_record(&record, engine, &catalog, &mut att, &mut dpt, &mut max_txn_id)?;
        }
    }
    info!(
        "analysis done: {} loser transaction(s), {} dirty page(s)",
        att.len(),
        dpt.len()
    );

    // phase 2: redo
    let min_rec_lsn = dpt.values().copied().min().unwrap_or(NULL_LSN);
    if min_rec_lsn != NULL_LSN {
        let mut reader = LogReader::open(&path)?;
        for (&lsn, &offset) in lsn_offsets.range(min_rec_lsn..) {
            let record = reader.read_at(offset)?;
            let resource = match record.body.data_resource() {
                Some(r) => r.clone(),
                None => continue,
            };

            // re-derive the heap chain endpoints the catalog document may
            // not have seen
            let page_id = resource.page_id.unwrap_or(0);
            {
                let mut catalog_guard = catalog.wl();
                if let Ok(info) = catalog_guard.get_table_mut(&resource.table_name) {
                    if info.root_page_id.is_none() {
                        info.root_page_id = Some(page_id);
                    }
                    if info.last_page_id.map_or(true, |last| page_id > last) {
                        info.last_page_id = Some(page_id);
                    }
                }
            }

            if dpt.contains_key(&page_id) {
                if let Err(e) = engine.redo_record(&record) {
                    warn!("redo of lsn {} failed: {}", lsn, e);
                }
            }
        }
    }
    info!("redo done");

    // phase 3: undo the losers, newest LSN first
    let mut to_undo: HashMap<TransactionId, Lsn> = att.clone();
    let mut last_lsn: HashMap<TransactionId, Lsn> = att;
    let mut reader = LogReader::open(&path)?;
    while !to_undo.is_empty() {
        let (&txn_id, &lsn) = to_undo.iter().max_by_key(|(_, l)| **l).unwrap();

        if lsn == NULL_LSN {
            finish_loser(log_manager, txn_id, last_lsn.get(&txn_id).copied())?;
            to_undo.remove(&txn_id);
            continue;
        }

        let offset = match lsn_offsets.get(&lsn) {
            Some(o) => *o,
            None => {
                warn!("undo chain lsn {} missing from the log, abandoning walk", lsn);
                to_undo.insert(txn_id, NULL_LSN);
                continue;
            }
        };
        let record = reader.read_at(offset)?;

        match undo_payload(&record) {
            Some(payload) => {
                debug!("undo: compensating lsn {} of txn {}", record.lsn, txn_id);
                let prev = last_lsn.get(&txn_id).copied().unwrap_or(NULL_LSN);
                let clr_lsn = {
                    let mut log = log_manager.wl();
                    let clr_lsn = log.append_with_prev(
                        txn_id,
                        prev,
                        LogRecordBody::Clr {
                            undo_next_lsn: record.prev_lsn,
                            payload: payload.clone(),
                        },
                    )?;
                    log.flush_to_lsn(clr_lsn)?;
                    clr_lsn
                };
                last_lsn.insert(txn_id, clr_lsn);
                engine.apply_clr_payload(&payload, clr_lsn)?;
                to_undo.insert(txn_id, record.prev_lsn);
            }
            None => match &record.body {
                // a CLR from a previous crash: skip what it compensated
                LogRecordBody::Clr { undo_next_lsn, .. } => {
                    to_undo.insert(txn_id, *undo_next_lsn);
                }
                _ => {
                    to_undo.insert(txn_id, record.prev_lsn);
                }
            },
        }

        if to_undo.get(&txn_id) == Some(&NULL_LSN) {
            finish_loser(log_manager, txn_id, last_lsn.get(&txn_id).copied())?;
            to_undo.remove(&txn_id);
        }
    }
    log_manager.wl().flush_all()?;
    info!("undo done, recovery complete (max txn id {})", max_txn_id);

    Ok(max_txn_id)
}

fn finish_loser(
    log_manager: &Pod<LogManager>,
    txn_id: TransactionId,
    last_lsn: Option<Lsn>,
) -> DbResult {
    debug!("loser txn {} fully undone, writing ABORT", txn_id);
    let mut log = log_manager.wl();
    log.append_with_prev(txn_id, last_lsn.unwrap_or(NULL_LSN), LogRecordBody::Abort)?;
    Ok(())
}

fn undo_payload(record: &LogRecord) -> Option<ClrPayload> {
    match &record.body {
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
    }
}

fn analyze_record(
    record: &LogRecord,
    engine: &StorageEngine,
    catalog: &Pod<crate::catalog::Catalog>,
    att: &mut HashMap<TransactionId, Lsn>,
    dpt: &mut HashMap<PageId, Lsn>,
    max_txn_id: &mut TransactionId,
) -> DbResult {
    // DDL records rebuild the catalog so redo can find files and schemas
    match &record.body {
        LogRecordBody::CreateTable {
            table_name,
            columns,
        } => {
            if !catalog.rl().table_exists(table_name) {
                debug!("analysis: rebuilding table {}", table_name);
                catalog
                    .wl()
                    .install_table(TableInfo::new(table_name, columns.clone()));
            }
        }
        LogRecordBody::DropTable { table_name } => {
            debug!("analysis: replaying drop of table {}", table_name);
            engine.forget_table_state(table_name);
            let _ = catalog.wl().remove_table(table_name);
        }
        LogRecordBody::CreateIndex {
            table_name,
            index_name,
            columns,
            key_col_types,
            is_unique,
        } => {
            let known = catalog.rl().get_index(table_name, index_name).is_ok();
            if !known && catalog.rl().table_exists(table_name) {
                debug!("analysis: rebuilding index {} on {}", index_name, table_name);
                catalog.wl().add_index(
                    table_name,
                    IndexInfo {
                        index_name: index_name.clone(),
                        file_name: format!("{}_{}.idx", table_name, index_name),
                        root_page_id: None,
                        column_names: columns.clone(),
                        key_col_types: key_col_types.clone(),
                        index_type: "BTREE".to_string(),
                        is_unique: *is_unique,
                    },
                )?;
            }
        }
        LogRecordBody::DropIndex {
            table_name,
            index_name,
        } => {
            let _ = catalog.wl().remove_index(table_name, index_name);
        }
        LogRecordBody::CreateView {
            view_name,
            definition,
            is_updatable,
        }
        | LogRecordBody::AlterView {
            view_name,
            definition,
            is_updatable,
        } => {
            catalog.wl().install_view(crate::catalog::ViewInfo {
                view_name: view_name.clone(),
                definition: definition.clone(),
                is_updatable: *is_updatable,
            });
        }
        LogRecordBody::DropView { view_name } => {
            let _ = catalog.wl().remove_view(view_name);
        }
        LogRecordBody::CreateTrigger(info) | LogRecordBody::AlterTrigger(info) => {
            catalog.wl().install_trigger(info.clone());
        }
        LogRecordBody::DropTrigger { trigger_name } => {
            let _ = catalog.wl().remove_trigger(trigger_name);
        }
        _ => {}
    }

    if record.txn_id != SYSTEM_TXN_ID {
        if record.txn_id > *max_txn_id {
            *max_txn_id = record.txn_id;
        }
        match record.body {
            LogRecordBody::Commit | LogRecordBody::Abort => {
                att.remove(&record.txn_id);
            }
            _ => {
                att.insert(record.txn_id, record.lsn);
            }
        }
    }

    if let Some(resource) = record.body.data_resource() {
        let page_id = resource.page_id.unwrap_or(0);
        dpt.entry(page_id).or_insert(record.lsn);
    }

    Ok(())
}
