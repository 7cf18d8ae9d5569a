//! Secondary-index maintenance alongside every data mutation.

use crate::{
    catalog::Value,
    error::DbError,
    storage::key::Key,
    types::{DbResult, Lsn, RowId},
    utils::HandyRwLock,
};

use super::StorageEngine;

impl StorageEngine {
    fn index_names(&self, table: &str) -> Result<Vec<String>, DbError> {
        let catalog = self.catalog.rl();
        Ok(catalog.get_table(table)?.indexes.keys().cloned().collect())
    }

    fn key_for(&self, table: &str, index: &str, row: &[Value]) -> Result<Key, DbError> {
        let column_names = {
            let catalog = self.catalog.rl();
            catalog.get_index(table, index)?.column_names.clone()
        };
        let codec = self.row_codec(table)?;
        let values = codec.project_key(row, &column_names)?;
        Key::from_values(&values)
    }

    pub(crate) fn index_insert_entries(
        &self,
        table: &str,
        row: &[Value],
        row_id: RowId,
        lsn: Lsn,
    ) -> DbResult {
        for index in self.index_names(table)? {
            let key = self.key_for(table, &index, row)?;
            let mut btree = self.btree(table, &index)?;
            btree.insert(&key, row_id, lsn)?;
        }
        Ok(())
    }

    pub(crate) fn index_delete_entries(
        &self,
        table: &str,
        row: &[Value],
        row_id: RowId,
        lsn: Lsn,
    ) -> DbResult {
        for index in self.index_names(table)? {
            let key = self.key_for(table, &index, row)?;
            let mut btree = self.btree(table, &index)?;
            btree.delete(&key, row_id, lsn)?;
        }
        Ok(())
    }

    /// Indexes whose projected key changed get a delete of the old entry
    /// and an insert of the new one, both under the operation's lsn.
    pub(crate) fn index_update_entries(
        &self,
        table: &str,
        old_row: &[Value],
        new_row: &[Value],
        row_id: RowId,
        lsn: Lsn,
    ) -> DbResult {
        for index in self.index_names(table)? {
            let old_key = self.key_for(table, &index, old_row)?;
            let new_key = self.key_for(table, &index, new_row)?;
            if old_key == new_key {
                continue;
            }
            let mut btree = self.btree(table, &index)?;
            btree.delete(&old_key, row_id, lsn)?;
            btree.insert(&new_key, row_id, lsn)?;
        }
        Ok(())
    }
}
