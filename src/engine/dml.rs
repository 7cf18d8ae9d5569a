//! Row-level operations and constraint checks.

use log::debug;

use crate::{
    catalog::{ColumnInfo, Value},
    error::{DbError, ErrorKind},
    storage::key::Key,
    transaction::{LockMode, LogRecordBody, ResourceId, Transaction},
    types::{DbResult, RowId},
    utils::HandyRwLock,
};

use super::StorageEngine;

impl StorageEngine {
    pub fn insert_row(
        &self,
        tx: &Transaction,
        table_name: &str,
        row: Vec<Value>,
    ) -> Result<RowId, DbError> {
        let columns = {
            let catalog = self.catalog.rl();
            catalog.get_table(table_name)?.columns.clone()
        };

        // step 1: defaults and constraints
        let row = apply_defaults(&columns, row)?;
        check_constraints(&columns, &row)?;
        if let Some(pk_idx) = columns.iter().position(|c| c.is_primary_key) {
            if self
                .lookup_by_column(tx, table_name, &columns[pk_idx].column_name, &row[pk_idx], None)?
                .is_some()
            {
                return Err(DbError::new(
                    ErrorKind::ConstraintViolation,
                    &format!(
                        "primary key value {} already exists in {}",
                        row[pk_idx], table_name
                    ),
                ));
            }
        }

        let codec = self.row_codec(table_name)?;
        let row_bytes = codec.serialize(&row)?;

        // step 2: pre-locate the physical slot so the log record can carry it
        let heap = self.heap_file(table_name)?;
        let row_id = heap.find_space_for_record(&row_bytes)?;

        // step 3: lock the target page before any mutation
        self.lock_manager.acquire(
            tx,
            LockMode::Exclusive,
            ResourceId::page(table_name, row_id.page_id),
        )?;

        // step 4: log first, then place the record
        let lsn = self.log_manager.wl().append(
            tx,
            LogRecordBody::Insert {
                resource: ResourceId::record(table_name, row_id.page_id, row_id.record_id),
                data: row_bytes.clone(),
            },
        )?;
        heap.insert_at(row_id, &row_bytes, lsn)?;

        // step 5: every index gets the new entry under the same lsn
        self.index_insert_entries(table_name, &row, row_id, lsn)?;

        self.catalog.wl().inc_row_count(table_name, 1);
        debug!("{} inserted {} into {}", tx, row_id, table_name);
        Ok(row_id)
    }

    pub fn update_row(
        &self,
        tx: &Transaction,
        table_name: &str,
        row_id: RowId,
        new_row: Vec<Value>,
    ) -> DbResult {
        let columns = {
            let catalog = self.catalog.rl();
            catalog.get_table(table_name)?.columns.clone()
        };
        let codec = self.row_codec(table_name)?;

        // lock before reading the before-image, or a lost update slips in
        self.lock_manager.acquire(
            tx,
            LockMode::Exclusive,
            ResourceId::record(table_name, row_id.page_id, row_id.record_id),
        )?;

        let heap = self.heap_file(table_name)?;
        let before_bytes = heap.get(row_id, codec.record_size())?;
        let old_row = codec.deserialize(&before_bytes)?;

        check_constraints(&columns, &new_row)?;
        if let Some(pk_idx) = columns.iter().position(|c| c.is_primary_key) {
            if old_row[pk_idx] != new_row[pk_idx] {
                if self
                    .lookup_by_column(
                        tx,
                        table_name,
                        &columns[pk_idx].column_name,
                        &new_row[pk_idx],
                        Some(row_id),
                    )?
                    .is_some()
                {
                    return Err(DbError::new(
                        ErrorKind::ConstraintViolation,
                        &format!(
                            "primary key value {} already exists in {}",
                            new_row[pk_idx], table_name
                        ),
                    ));
                }
            }
        }

        let after_bytes = codec.serialize(&new_row)?;
        let lsn = self.log_manager.wl().append(
            tx,
            LogRecordBody::Update {
                resource: ResourceId::record(table_name, row_id.page_id, row_id.record_id),
                before: before_bytes,
                after: after_bytes.clone(),
            },
        )?;

        self.index_update_entries(table_name, &old_row, &new_row, row_id, lsn)?;
        heap.update(row_id, &after_bytes, lsn)?;
        debug!("{} updated {} in {}", tx, row_id, table_name);
        Ok(())
    }

    pub fn delete_row(
        &self,
        tx: &Transaction,
        table_name: &str,
        row_id: RowId,
    ) -> DbResult {
        let codec = self.row_codec(table_name)?;

        self.lock_manager.acquire(
            tx,
            LockMode::Exclusive,
            ResourceId::record(table_name, row_id.page_id, row_id.record_id),
        )?;

        let heap = self.heap_file(table_name)?;
        let before_bytes = heap.get(row_id, codec.record_size())?;
        let old_row = codec.deserialize(&before_bytes)?;

        let lsn = self.log_manager.wl().append(
            tx,
            LogRecordBody::Delete {
                resource: ResourceId::record(table_name, row_id.page_id, row_id.record_id),
                data: before_bytes,
            },
        )?;

        self.index_delete_entries(table_name, &old_row, row_id, lsn)?;
        heap.delete(row_id, codec.record_size(), lsn)?;
        self.catalog.wl().inc_row_count(table_name, -1);
        debug!("{} deleted {} from {}", tx, row_id, table_name);
        Ok(())
    }

    /// Full scan under a table S lock.
    pub fn scan(
        &self,
        tx: &Transaction,
        table_name: &str,
    ) -> Result<Vec<(RowId, Vec<Value>)>, DbError> {
        self.lock_manager
            .acquire(tx, LockMode::Shared, ResourceId::table(table_name))?;
        let codec = self.row_codec(table_name)?;
        let heap = self.heap_file(table_name)?;
        let mut rows = Vec::new();
        for (row_id, bytes) in heap.scan(codec.record_size())? {
            rows.push((row_id, codec.deserialize(&bytes)?));
        }
        Ok(rows)
    }

    /// Point read of one row under a record S lock.
    pub fn get_row(
        &self,
        tx: &Transaction,
        table_name: &str,
        row_id: RowId,
    ) -> Result<Vec<Value>, DbError> {
        self.lock_manager.acquire(
            tx,
            LockMode::Shared,
            ResourceId::record(table_name, row_id.page_id, row_id.record_id),
        )?;
        let codec = self.row_codec(table_name)?;
        let heap = self.heap_file(table_name)?;
        let bytes = heap.get(row_id, codec.record_size())?;
        codec.deserialize(&bytes)
    }

    pub fn find_by_index(
        &self,
        _tx: &Transaction,
        table_name: &str,
        index_name: &str,
        key_values: &[Value],
    ) -> Result<Option<RowId>, DbError> {
        let key = Key::from_values(key_values)?;
        let btree = self.btree(table_name, index_name)?;
        btree.search(&key)
    }

    /// Find a row whose `column` equals `value`, preferring a unique index
    /// probe and falling back to a scan. `exclude` skips one row id (the row
    /// being updated).
    fn lookup_by_column(
        &self,
        tx: &Transaction,
        table_name: &str,
        column: &str,
        value: &Value,
        exclude: Option<RowId>,
    ) -> Result<Option<RowId>, DbError> {
        if value.is_null() {
            return Ok(None);
        }

        let unique_index = {
            let catalog = self.catalog.rl();
            let info = catalog.get_table(table_name)?;
            info.indexes
                .values()
                .find(|idx| {
                    idx.is_unique
                        && idx.column_names.len() == 1
                        && idx.column_names[0] == column
                })
                .map(|idx| idx.index_name.clone())
        };

        if let Some(index_name) = unique_index {
            let found = self.find_by_index(tx, table_name, &index_name, &[value.clone()])?;
            return Ok(found.filter(|rid| Some(*rid) != exclude));
        }

        let column_idx = {
            let catalog = self.catalog.rl();
            catalog
                .get_table(table_name)?
                .column_index(column)
                .ok_or_else(|| DbError::not_found(&format!("column {} not found", column)))?
        };
        for (row_id, row) in self.scan(tx, table_name)? {
            if Some(row_id) == exclude {
                continue;
            }
            if &row[column_idx] == value {
                return Ok(Some(row_id));
            }
        }
        Ok(None)
    }
}

fn apply_defaults(columns: &[ColumnInfo], mut row: Vec<Value>) -> Result<Vec<Value>, DbError> {
    if row.len() != columns.len() {
        return Err(DbError::new(
            ErrorKind::ConstraintViolation,
            &format!(
                "row has {} values, table has {} columns",
                row.len(),
                columns.len()
            ),
        ));
    }
    for (value, column) in row.iter_mut().zip(columns.iter()) {
        if value.is_null() {
            if let Some(default) = &column.default {
                *value = default.clone();
            }
        }
    }
    Ok(row)
}

fn check_constraints(columns: &[ColumnInfo], row: &[Value]) -> DbResult {
    for (value, column) in row.iter().zip(columns.iter()) {
        if value.is_null() && (column.not_null || column.is_primary_key) {
            return Err(DbError::new(
                ErrorKind::ConstraintViolation,
                &format!("column {} cannot be NULL", column.column_name),
            ));
        }
        if let Some(expr) = &column.check {
            if !eval_check(expr, &column.column_name, value)? {
                return Err(DbError::new(
                    ErrorKind::ConstraintViolation,
                    &format!(
                        "CHECK constraint failed for column {}: {}",
                        column.column_name, expr
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// Evaluate a simple `<column> <op> <literal>` comparison. NULL passes every
/// check (SQL three-valued logic collapses to "not violated").
fn eval_check(expr: &str, column: &str, value: &Value) -> Result<bool, DbError> {
    if value.is_null() {
        return Ok(true);
    }
    let tokens: Vec<&str> = expr.split_whitespace().collect();
    if tokens.len() != 3 {
        return Err(DbError::new(
            ErrorKind::ConstraintViolation,
            &format!("unsupported CHECK expression: {}", expr),
        ));
    }
    let (lhs, op, literal) = (tokens[0], tokens[1], tokens[2]);
    if lhs != column {
        return Err(DbError::new(
            ErrorKind::ConstraintViolation,
            &format!("CHECK on {} references unknown column {}", column, lhs),
        ));
    }

    let ordering = match value {
        Value::Int(v) => {
            let rhs: f64 = literal.parse().map_err(|_| {
                DbError::new(
                    ErrorKind::ConstraintViolation,
                    &format!("non-numeric literal in CHECK: {}", literal),
                )
            })?;
            (*v as f64).partial_cmp(&rhs)
        }
        Value::Float(v) => {
            let rhs: f64 = literal.parse().map_err(|_| {
                DbError::new(
                    ErrorKind::ConstraintViolation,
                    &format!("non-numeric literal in CHECK: {}", literal),
                )
            })?;
            v.partial_cmp(&rhs)
        }
        Value::Str(v) => {
            let rhs = literal.trim_matches('\'').trim_matches('"');
            Some(v.as_str().cmp(rhs))
        }
        Value::Null => return Ok(true),
    };
    let ordering = match ordering {
        Some(o) => o,
        None => return Ok(false),
    };

    let result = match op {
        "=" | "==" => ordering.is_eq(),
        "!=" | "<>" => !ordering.is_eq(),
        "<" => ordering.is_lt(),
        "<=" => ordering.is_le(),
        ">" => ordering.is_gt(),
        ">=" => ordering.is_ge(),
        other => {
            return Err(DbError::new(
                ErrorKind::ConstraintViolation,
                &format!("unsupported CHECK operator: {}", other),
            ))
        }
    };
    Ok(result)
}
