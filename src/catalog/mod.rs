//! In-memory system catalog with JSON persistence.
//!
//! The catalog document is a fast-start optimization only: recovery rebuilds
//! every entry from DDL log records, so losing `catalog.json` loses nothing.

use std::{
    collections::BTreeMap,
    fmt,
    fs,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::{DbError, ErrorKind},
    types::{DbResult, PageId},
};

/// Column types the row codec understands. Widths are fixed per column so
/// every table has a fixed record size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int,
    /// Fixed-width UTF-8 string of the declared byte length.
    Str(u16),
    /// DECIMAL(precision, scale), stored as text in `precision + 2` bytes
    /// (room for a sign and the decimal point).
    Decimal(u8, u8),
    Float,
    Date,
    Timestamp,
}

impl DataType {
    /// On-disk width of a column of this type, in bytes.
    pub fn byte_width(&self) -> usize {
        match self {
            DataType::Int => 4,
            DataType::Str(len) => *len as usize,
            DataType::Decimal(precision, _) => *precision as usize + 2,
            DataType::Float => 20,
            DataType::Date | DataType::Timestamp => 20,
        }
    }

    /// Key component tag used by the index key codec.
    pub fn key_type_tag(&self) -> u8 {
        match self {
            DataType::Int => crate::storage::key::KEY_TYPE_INT,
            DataType::Decimal(_, _) | DataType::Float => crate::storage::key::KEY_TYPE_FLOAT,
            _ => crate::storage::key::KEY_TYPE_STR,
        }
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i32),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub column_name: String,
    pub data_type: DataType,
    pub not_null: bool,
    pub default: Option<Value>,
    /// Simple comparison expression, e.g. `age >= 0`.
    pub check: Option<String>,
    pub is_primary_key: bool,
}

impl ColumnInfo {
    pub fn new(name: &str, data_type: DataType) -> Self {
        Self {
            column_name: name.to_string(),
            data_type,
            not_null: false,
            default: None,
            check: None,
            is_primary_key: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.not_null = true;
        self
    }

    pub fn with_default(mut self, v: Value) -> Self {
        self.default = Some(v);
        self
    }

    pub fn with_check(mut self, expr: &str) -> Self {
        self.check = Some(expr.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub index_name: String,
    pub file_name: String,
    pub root_page_id: Option<PageId>,
    pub column_names: Vec<String>,
    pub key_col_types: Vec<u8>,
    pub index_type: String,
    pub is_unique: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewInfo {
    pub view_name: String,
    pub definition: String,
    pub is_updatable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub trigger_name: String,
    pub table_name: String,
    pub timing: String,
    pub events: Vec<String>,
    pub is_row_level: bool,
    pub when_condition: Option<String>,
    pub trigger_body: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub table_name: String,
    pub columns: Vec<ColumnInfo>,
    pub file_name: String,
    pub root_page_id: Option<PageId>,
    pub last_page_id: Option<PageId>,
    pub indexes: BTreeMap<String, IndexInfo>,
    pub row_count: u64,
}

impl TableInfo {
    pub fn new(table_name: &str, columns: Vec<ColumnInfo>) -> Self {
        Self {
            table_name: table_name.to_string(),
            columns,
            file_name: format!("{}.db", table_name),
            root_page_id: None,
            last_page_id: None,
            indexes: BTreeMap::new(),
            row_count: 0,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.column_name == name)
    }

    pub fn primary_key_column(&self) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.is_primary_key)
    }

    /// Fixed record size of this table, derived from the schema.
    pub fn record_size(&self) -> usize {
        self.columns.iter().map(|c| c.data_type.byte_width()).sum()
    }
}

#[derive(Default, Serialize, Deserialize)]
struct CatalogDocument {
    tables: BTreeMap<String, TableInfo>,
    views: BTreeMap<String, ViewInfo>,
    triggers: BTreeMap<String, TriggerInfo>,
}

pub struct Catalog {
    path: PathBuf,
    tables: BTreeMap<String, TableInfo>,
    views: BTreeMap<String, ViewInfo>,
    triggers: BTreeMap<String, TriggerInfo>,
}

impl Catalog {
    /// Load the catalog document if one exists, otherwise start empty.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut doc = CatalogDocument::default();

        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(text) => match serde_json::from_str::<CatalogDocument>(&text) {
                    Ok(parsed) => doc = parsed,
                    Err(e) => warn!("catalog document unreadable, starting empty: {}", e),
                },
                Err(e) => warn!("catalog document unreadable, starting empty: {}", e),
            }
        }

        debug!(
            "catalog loaded: {} tables, {} views, {} triggers",
            doc.tables.len(),
            doc.views.len(),
            doc.triggers.len()
        );

        Self {
            path,
            tables: doc.tables,
            views: doc.views,
            triggers: doc.triggers,
        }
    }

    pub fn save(&self) -> DbResult {
        let doc = CatalogDocument {
            tables: self.tables.clone(),
            views: self.views.clone(),
            triggers: self.triggers.clone(),
        };
        let text = serde_json::to_string_pretty(&doc)
            .map_err(|e| DbError::internal(&format!("catalog serialization failed: {}", e)))?;
        fs::write(&self.path, text).map_err(|e| DbError::io(&e.to_string()))?;
        Ok(())
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn get_table(&self, name: &str) -> Result<&TableInfo, DbError> {
        self.tables
            .get(name)
            .ok_or_else(|| DbError::not_found(&format!("table {} not found", name)))
    }

    pub fn get_table_mut(&mut self, name: &str) -> Result<&mut TableInfo, DbError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| DbError::not_found(&format!("table {} not found", name)))
    }

    pub fn add_table(&mut self, info: TableInfo) -> DbResult {
        if self.tables.contains_key(&info.table_name) {
            return Err(DbError::new(
                ErrorKind::AlreadyExists,
                &format!("table {} already exists", info.table_name),
            ));
        }
        self.tables.insert(info.table_name.clone(), info);
        Ok(())
    }

    pub fn remove_table(&mut self, name: &str) -> Result<TableInfo, DbError> {
        self.tables
            .remove(name)
            .ok_or_else(|| DbError::not_found(&format!("table {} not found", name)))
    }

    /// Install a table unconditionally, replacing any previous entry. Used
    /// by recovery when replaying CREATE_TABLE records.
    pub fn install_table(&mut self, info: TableInfo) {
        self.tables.insert(info.table_name.clone(), info);
    }

    pub fn list_tables(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn get_index(&self, table: &str, index: &str) -> Result<&IndexInfo, DbError> {
        self.get_table(table)?.indexes.get(index).ok_or_else(|| {
            DbError::not_found(&format!("index {} not found on table {}", index, table))
        })
    }

    pub fn add_index(&mut self, table: &str, info: IndexInfo) -> DbResult {
        let table_info = self.get_table_mut(table)?;
        if table_info.indexes.contains_key(&info.index_name) {
            return Err(DbError::new(
                ErrorKind::AlreadyExists,
                &format!("index {} already exists on table {}", info.index_name, table),
            ));
        }
        table_info.indexes.insert(info.index_name.clone(), info);
        Ok(())
    }

    pub fn remove_index(&mut self, table: &str, index: &str) -> Result<IndexInfo, DbError> {
        self.get_table_mut(table)?
            .indexes
            .remove(index)
            .ok_or_else(|| {
                DbError::not_found(&format!("index {} not found on table {}", index, table))
            })
    }

    pub fn update_index_root_page(
        &mut self,
        table: &str,
        index: &str,
        root_page_id: PageId,
    ) -> DbResult {
        let table_info = self.get_table_mut(table)?;
        let idx = table_info.indexes.get_mut(index).ok_or_else(|| {
            DbError::not_found(&format!("index {} not found on table {}", index, table))
        })?;
        idx.root_page_id = Some(root_page_id);
        Ok(())
    }

    pub fn inc_row_count(&mut self, table: &str, delta: i64) {
        if let Some(info) = self.tables.get_mut(table) {
            info.row_count = (info.row_count as i64 + delta).max(0) as u64;
        }
    }

    // view metadata

    pub fn view_exists(&self, name: &str) -> bool {
        self.views.contains_key(name)
    }

    pub fn get_view(&self, name: &str) -> Result<&ViewInfo, DbError> {
        self.views
            .get(name)
            .ok_or_else(|| DbError::not_found(&format!("view {} not found", name)))
    }

    pub fn install_view(&mut self, info: ViewInfo) {
        self.views.insert(info.view_name.clone(), info);
    }

    pub fn remove_view(&mut self, name: &str) -> Result<ViewInfo, DbError> {
        self.views
            .remove(name)
            .ok_or_else(|| DbError::not_found(&format!("view {} not found", name)))
    }

    // trigger metadata

    pub fn trigger_exists(&self, name: &str) -> bool {
        self.triggers.contains_key(name)
    }

    pub fn get_trigger(&self, name: &str) -> Result<&TriggerInfo, DbError> {
        self.triggers
            .get(name)
            .ok_or_else(|| DbError::not_found(&format!("trigger {} not found", name)))
    }

    pub fn install_trigger(&mut self, info: TriggerInfo) {
        self.triggers.insert(info.trigger_name.clone(), info);
    }

    pub fn remove_trigger(&mut self, name: &str) -> Result<TriggerInfo, DbError> {
        self.triggers
            .remove(name)
            .ok_or_else(|| DbError::not_found(&format!("trigger {} not found", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_schema() -> Vec<ColumnInfo> {
        vec![
            ColumnInfo::new("name", DataType::Str(20)).primary_key(),
            ColumnInfo::new("age", DataType::Int),
        ]
    }

    #[test]
    fn test_record_size() {
        let info = TableInfo::new("users", users_schema());
        assert_eq!(info.record_size(), 24);
    }

    #[test]
    fn test_document_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");

        let mut catalog = Catalog::load(&path);
        catalog
            .add_table(TableInfo::new("users", users_schema()))
            .unwrap();
        catalog.inc_row_count("users", 3);
        catalog.save().unwrap();

        let reloaded = Catalog::load(&path);
        let info = reloaded.get_table("users").unwrap();
        assert_eq!(info.row_count, 3);
        assert_eq!(info.columns.len(), 2);
        assert!(info.columns[0].is_primary_key);
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::load(dir.path().join("catalog.json"));
        catalog
            .add_table(TableInfo::new("users", users_schema()))
            .unwrap();
        let err = catalog
            .add_table(TableInfo::new("users", users_schema()))
            .unwrap_err();
        assert_eq!(err.get_kind(), crate::error::ErrorKind::AlreadyExists);
    }
}
