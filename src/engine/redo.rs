//! Forward application of log records: redo during recovery, and CLRs both
//! during rollback and during recovery redo.
//!
//! The PageLSN guard makes every application idempotent: a record whose
//! effect is already on the page is skipped. Index maintenance replays
//! alongside the data page, exactly as the original operation did.

use log::{debug, warn};

use crate::{
    error::DbError,
    storage::page::PageType,
    transaction::{ClrPayload, LogRecord, LogRecordBody, ResourceId},
    types::{DbResult, Lsn, RowId},
    utils::HandyRwLock,
};

use super::StorageEngine;

impl StorageEngine {
    /// True when the record's table still exists; dropped tables make the
    /// record unapplicable (Recovery-skip).
    fn table_alive(&self, resource: &ResourceId) -> bool {
        let alive = self.catalog.rl().table_exists(&resource.table_name);
        if !alive {
            warn!(
                "skipping log record for dropped table {}",
                resource.table_name
            );
        }
        alive
    }

    /// Whether the record's forward effect is missing from its data page.
    fn needs_apply(&self, resource: &ResourceId, lsn: Lsn) -> Result<bool, DbError> {
        let pool = self.table_pool(&resource.table_name)?;
        let page_id = resource.page_id.unwrap_or(0);
        let page = pool.wl().get_page(page_id, PageType::Heap)?;
        let page_lsn = page.rl().get_page_lsn();
        pool.wl().unpin_page(page_id, false);
        Ok(page_lsn < lsn)
    }

    /// Apply the forward effect of a data record (UPDATE/INSERT/DELETE/CLR).
    /// Non-data records are ignored.
    pub fn redo_record(&self, record: &LogRecord) -> DbResult {
        let resource = match record.body.data_resource() {
            Some(r) => r.clone(),
            None => return Ok(()),
        };
        if !self.table_alive(&resource) {
            return Ok(());
        }
        if !self.needs_apply(&resource, record.lsn)? {
            debug!("redo skip: page already at or past lsn {}", record.lsn);
            return Ok(());
        }

        let row_id = RowId::new(resource.page_id.unwrap_or(0), resource.record_id.unwrap_or(0));
        let codec = self.row_codec(&resource.table_name)?;
        let heap = self.heap_file(&resource.table_name)?;

        match &record.body {
            LogRecordBody::Insert { data, .. } => {
                let row = codec.deserialize(data)?;
                self.index_insert_entries(&resource.table_name, &row, row_id, record.lsn)?;
                heap.insert_at(row_id, data, record.lsn)?;
            }
            LogRecordBody::Delete { data, .. } => {
                let row = codec.deserialize(data)?;
                self.index_delete_entries(&resource.table_name, &row, row_id, record.lsn)?;
                heap.delete(row_id, data.len(), record.lsn)?;
            }
            LogRecordBody::Update { before, after, .. } => {
                let old_row = codec.deserialize(before)?;
                let new_row = codec.deserialize(after)?;
                self.index_update_entries(
                    &resource.table_name,
                    &old_row,
                    &new_row,
                    row_id,
                    record.lsn,
                )?;
                heap.update(row_id, after, record.lsn)?;
            }
            LogRecordBody::Clr { payload, .. } => {
                self.apply_clr_payload(payload, record.lsn)?;
            }
            _ => {}
        }
        debug!("redo applied lsn {} to {}", record.lsn, resource);
        Ok(())
    }

    /// Forward-apply a CLR: restore the before-image, tombstone the insert,
    /// or put the deleted record back — data page and indexes together.
    pub(crate) fn apply_clr_payload(&self, payload: &ClrPayload, lsn: Lsn) -> DbResult {
        let resource = payload.resource().clone();
        if !self.table_alive(&resource) {
            return Ok(());
        }

        let row_id = RowId::new(resource.page_id.unwrap_or(0), resource.record_id.unwrap_or(0));
        let codec = self.row_codec(&resource.table_name)?;
        let heap = self.heap_file(&resource.table_name)?;

        match payload {
            ClrPayload::Update { restore, .. } => {
                // the row currently carries the aborted after-image; swing
                // the index entries back before restoring the bytes
                let current = heap.get(row_id, codec.record_size())?;
                let current_row = codec.deserialize(&current)?;
                let restored_row = codec.deserialize(restore)?;
                self.index_update_entries(
                    &resource.table_name,
                    &current_row,
                    &restored_row,
                    row_id,
                    lsn,
                )?;
                heap.update(row_id, restore, lsn)?;
            }
            ClrPayload::Insert { record_size, .. } => {
                // undo of an insert: drop its index entries and tombstone
                match heap.get(row_id, *record_size as usize) {
                    Ok(current) => {
                        let row = codec.deserialize(&current)?;
                        self.index_delete_entries(&resource.table_name, &row, row_id, lsn)?;
                        heap.delete(row_id, *record_size as usize, lsn)?;
                        self.catalog.wl().inc_row_count(&resource.table_name, -1);
                    }
                    Err(_) => {
                        // already tombstoned by an earlier pass
                        debug!("clr insert-undo found {} already gone", row_id);
                    }
                }
            }
            ClrPayload::Delete { restore, .. } => {
                // undo of a delete: the record returns to its original slot
                let row = codec.deserialize(restore)?;
                heap.insert_at(row_id, restore, lsn)?;
                self.index_insert_entries(&resource.table_name, &row, row_id, lsn)?;
                self.catalog.wl().inc_row_count(&resource.table_name, 1);
            }
        }
        Ok(())
    }
}
