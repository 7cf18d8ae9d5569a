//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use minirel::{
    utils, ColumnInfo, Database, DataType, RowId, Transaction, Value,
};
use tempfile::TempDir;

/// Logger setup; call at the top of every test.
pub fn setup() {
    utils::init_log();
}

/// A fresh on-disk database in its own temp directory. Keep the TempDir
/// alive for the duration of the test.
pub fn temp_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    (dir, db)
}

pub fn reopen(dir: &TempDir) -> Database {
    Database::open(dir.path()).unwrap()
}

/// name STR(20), age INT — the workhorse schema.
pub fn users_schema() -> Vec<ColumnInfo> {
    vec![
        ColumnInfo::new("name", DataType::Str(20)),
        ColumnInfo::new("age", DataType::Int),
    ]
}

/// Same, with a primary key on name (which auto-creates a unique index).
pub fn users_schema_pk() -> Vec<ColumnInfo> {
    vec![
        ColumnInfo::new("name", DataType::Str(20)).primary_key(),
        ColumnInfo::new("age", DataType::Int),
    ]
}

pub fn user_row(name: &str, age: i32) -> Vec<Value> {
    vec![Value::Str(name.to_string()), Value::Int(age)]
}

pub fn create_users_table(db: &Database) {
    let tx = db.begin();
    db.storage()
        .create_table(&tx, "users", users_schema())
        .unwrap();
    db.commit(&tx).unwrap();
}

pub fn insert_user(db: &Database, tx: &Arc<Transaction>, name: &str, age: i32) -> RowId {
    db.storage()
        .insert_row(tx, "users", user_row(name, age))
        .unwrap()
}

/// Scan "users" in a fresh committed transaction, returning (name, age)
/// pairs in row order.
pub fn scan_users(db: &Database) -> Vec<(RowId, String, i32)> {
    let tx = db.begin();
    let rows = db.storage().scan(&tx, "users").unwrap();
    db.commit(&tx).unwrap();
    rows.into_iter()
        .map(|(row_id, row)| {
            let name = match &row[0] {
                Value::Str(s) => s.clone(),
                other => panic!("expected a string, got {:?}", other),
            };
            let age = match &row[1] {
                Value::Int(v) => *v,
                other => panic!("expected an int, got {:?}", other),
            };
            (row_id, name, age)
        })
        .collect()
}
