mod test_utils;

use minirel::{ColumnInfo, DataType, ErrorKind, RowId, TriggerInfo, Value};

use crate::test_utils::*;

/// Commit and read back: create a table, insert a row, scan it from a later
/// transaction.
#[test]
fn test_commit_and_read() {
    setup();
    let (_dir, db) = temp_db();

    create_users_table(&db);

    let tx = db.begin();
    let row_id = insert_user(&db, &tx, "alice", 25);
    assert_eq!(row_id, RowId::new(1, 0));
    db.commit(&tx).unwrap();

    let rows = scan_users(&db);
    assert_eq!(rows, vec![(RowId::new(1, 0), "alice".to_string(), 25)]);
}

/// Abort discards: an uncommitted insert is invisible after rollback.
#[test]
fn test_abort_discards_insert() {
    setup();
    let (_dir, db) = temp_db();

    create_users_table(&db);

    let tx = db.begin();
    insert_user(&db, &tx, "bob", 30);
    db.abort(&tx).unwrap();

    assert!(scan_users(&db).is_empty());
}

#[test]
fn test_abort_restores_update_and_delete() {
    setup();
    let (_dir, db) = temp_db();

    create_users_table(&db);
    let tx = db.begin();
    let r1 = insert_user(&db, &tx, "carol", 41);
    let r2 = insert_user(&db, &tx, "dan", 42);
    db.commit(&tx).unwrap();

    let tx = db.begin();
    db.storage()
        .update_row(&tx, "users", r1, user_row("carol", 99))
        .unwrap();
    db.storage().delete_row(&tx, "users", r2).unwrap();
    db.abort(&tx).unwrap();

    let mut rows = scan_users(&db);
    rows.sort();
    assert_eq!(
        rows,
        vec![
            (r1, "carol".to_string(), 41),
            (r2, "dan".to_string(), 42),
        ]
    );
}

#[test]
fn test_update_and_get_row() {
    setup();
    let (_dir, db) = temp_db();

    create_users_table(&db);
    let tx = db.begin();
    let row_id = insert_user(&db, &tx, "erin", 33);
    db.commit(&tx).unwrap();

    let tx = db.begin();
    db.storage()
        .update_row(&tx, "users", row_id, user_row("erin", 34))
        .unwrap();
    db.commit(&tx).unwrap();

    let tx = db.begin();
    let row = db.storage().get_row(&tx, "users", row_id).unwrap();
    assert_eq!(row, user_row("erin", 34));
    db.commit(&tx).unwrap();
}

#[test]
fn test_delete_then_scan_skips_tombstones() {
    setup();
    let (_dir, db) = temp_db();

    create_users_table(&db);
    let tx = db.begin();
    let r1 = insert_user(&db, &tx, "frank", 20);
    let r2 = insert_user(&db, &tx, "grace", 21);
    db.commit(&tx).unwrap();

    let tx = db.begin();
    db.storage().delete_row(&tx, "users", r1).unwrap();
    db.commit(&tx).unwrap();

    let rows = scan_users(&db);
    assert_eq!(rows, vec![(r2, "grace".to_string(), 21)]);

    // a fully tombstoned table scans as empty
    let tx = db.begin();
    db.storage().delete_row(&tx, "users", r2).unwrap();
    db.commit(&tx).unwrap();
    assert!(scan_users(&db).is_empty());
}

#[test]
fn test_primary_key_constraints() {
    setup();
    let (_dir, db) = temp_db();

    let tx = db.begin();
    db.storage()
        .create_table(&tx, "users", users_schema_pk())
        .unwrap();
    db.commit(&tx).unwrap();

    let tx = db.begin();
    insert_user(&db, &tx, "henry", 50);
    db.commit(&tx).unwrap();

    // duplicate primary key
    let tx = db.begin();
    let err = db
        .storage()
        .insert_row(&tx, "users", user_row("henry", 51))
        .unwrap_err();
    assert!(matches!(
        err.get_kind(),
        ErrorKind::ConstraintViolation | ErrorKind::UniqueViolation
    ));
    db.abort(&tx).unwrap();

    // NULL primary key
    let tx = db.begin();
    let err = db
        .storage()
        .insert_row(&tx, "users", vec![Value::Null, Value::Int(1)])
        .unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::ConstraintViolation);
    db.abort(&tx).unwrap();
}

#[test]
fn test_check_and_default_constraints() {
    setup();
    let (_dir, db) = temp_db();

    let schema = vec![
        ColumnInfo::new("name", DataType::Str(20)),
        ColumnInfo::new("age", DataType::Int)
            .with_check("age >= 0")
            .with_default(Value::Int(18)),
    ];
    let tx = db.begin();
    db.storage().create_table(&tx, "users", schema).unwrap();
    db.commit(&tx).unwrap();

    // default fills the NULL
    let tx = db.begin();
    let row_id = db
        .storage()
        .insert_row(
            &tx,
            "users",
            vec![Value::Str("ivy".to_string()), Value::Null],
        )
        .unwrap();
    db.commit(&tx).unwrap();

    let tx = db.begin();
    let row = db.storage().get_row(&tx, "users", row_id).unwrap();
    assert_eq!(row[1], Value::Int(18));
    db.commit(&tx).unwrap();

    // CHECK rejects a negative age
    let tx = db.begin();
    let err = db
        .storage()
        .insert_row(&tx, "users", user_row("judy", -3))
        .unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::ConstraintViolation);
    db.abort(&tx).unwrap();
}

#[test]
fn test_secondary_index_lookup() {
    setup();
    let (_dir, db) = temp_db();

    create_users_table(&db);
    let tx = db.begin();
    let r_isaac = insert_user(&db, &tx, "isaac", 18);
    let r_jane = insert_user(&db, &tx, "jane", 22);
    insert_user(&db, &tx, "kate", 30);
    db.commit(&tx).unwrap();

    let tx = db.begin();
    db.storage()
        .create_index(&tx, "users", "idx_name", &["name".to_string()], true)
        .unwrap();
    db.commit(&tx).unwrap();

    let tx = db.begin();
    let found = db
        .storage()
        .find_by_index(&tx, "users", "idx_name", &[Value::Str("jane".to_string())])
        .unwrap();
    assert_eq!(found, Some(r_jane));
    let missing = db
        .storage()
        .find_by_index(&tx, "users", "idx_name", &[Value::Str("zoe".to_string())])
        .unwrap();
    assert_eq!(missing, None);
    db.commit(&tx).unwrap();

    // index follows updates and deletes
    let tx = db.begin();
    db.storage()
        .update_row(&tx, "users", r_isaac, user_row("ian", 18))
        .unwrap();
    db.storage().delete_row(&tx, "users", r_jane).unwrap();
    db.commit(&tx).unwrap();

    let tx = db.begin();
    assert_eq!(
        db.storage()
            .find_by_index(&tx, "users", "idx_name", &[Value::Str("ian".to_string())])
            .unwrap(),
        Some(r_isaac)
    );
    assert_eq!(
        db.storage()
            .find_by_index(&tx, "users", "idx_name", &[Value::Str("isaac".to_string())])
            .unwrap(),
        None
    );
    assert_eq!(
        db.storage()
            .find_by_index(&tx, "users", "idx_name", &[Value::Str("jane".to_string())])
            .unwrap(),
        None
    );
    db.commit(&tx).unwrap();
}

#[test]
fn test_unique_index_violation() {
    setup();
    let (_dir, db) = temp_db();

    create_users_table(&db);
    let tx = db.begin();
    insert_user(&db, &tx, "luke", 40);
    db.commit(&tx).unwrap();

    let tx = db.begin();
    db.storage()
        .create_index(&tx, "users", "idx_name", &["name".to_string()], true)
        .unwrap();
    db.commit(&tx).unwrap();

    let tx = db.begin();
    let err = db
        .storage()
        .insert_row(&tx, "users", user_row("luke", 41))
        .unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::UniqueViolation);
    db.abort(&tx).unwrap();
}

#[test]
fn test_drop_table_and_index() {
    setup();
    let (_dir, db) = temp_db();

    create_users_table(&db);
    let tx = db.begin();
    insert_user(&db, &tx, "mary", 28);
    db.storage()
        .create_index(&tx, "users", "idx_name", &["name".to_string()], false)
        .unwrap();
    db.commit(&tx).unwrap();

    let tx = db.begin();
    db.storage().drop_index(&tx, "users", "idx_name").unwrap();
    let err = db
        .storage()
        .find_by_index(&tx, "users", "idx_name", &[Value::Str("mary".to_string())])
        .unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::NotFound);
    db.commit(&tx).unwrap();

    let tx = db.begin();
    assert!(db.storage().drop_table(&tx, "users", false).unwrap());
    db.commit(&tx).unwrap();

    let tx = db.begin();
    let err = db.storage().scan(&tx, "users").unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::NotFound);
    // if_exists suppresses the error
    assert!(!db.storage().drop_table(&tx, "users", true).unwrap());
    db.commit(&tx).unwrap();
}

#[test]
fn test_multi_page_scan() {
    setup();
    let (_dir, db) = temp_db();

    // 25 bytes per record incl. the validity flag, ~162 rows per 4 KiB page
    create_users_table(&db);
    let tx = db.begin();
    let total = 500;
    for i in 0..total {
        insert_user(&db, &tx, &format!("user{:03}", i), i);
    }
    db.commit(&tx).unwrap();

    let rows = scan_users(&db);
    assert_eq!(rows.len(), total as usize);
    // more than one page got used
    assert!(rows.iter().any(|(rid, _, _)| rid.page_id > 1));
    let catalog = db.get_catalog();
    let catalog = catalog.read().unwrap();
    assert_eq!(catalog.get_table("users").unwrap().row_count, total as u64);
}

#[test]
fn test_view_and_trigger_ddl() {
    setup();
    let (_dir, db) = temp_db();
    create_users_table(&db);

    let tx = db.begin();
    db.storage()
        .create_view(&tx, "adults", "SELECT * FROM users WHERE age >= 18", false)
        .unwrap();
    db.storage()
        .create_trigger(
            &tx,
            TriggerInfo {
                trigger_name: "audit_users".to_string(),
                table_name: "users".to_string(),
                timing: "AFTER".to_string(),
                events: vec!["INSERT".to_string()],
                is_row_level: true,
                when_condition: None,
                trigger_body: vec!["INSERT INTO audit VALUES (1)".to_string()],
            },
        )
        .unwrap();
    db.commit(&tx).unwrap();

    {
        let catalog = db.get_catalog();
        let catalog = catalog.read().unwrap();
        assert!(catalog.view_exists("adults"));
        assert!(catalog.trigger_exists("audit_users"));
    }

    let tx = db.begin();
    let err = db
        .storage()
        .create_view(&tx, "adults", "SELECT 1", false)
        .unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::AlreadyExists);
    db.abort(&tx).unwrap();

    let tx = db.begin();
    db.storage().drop_view(&tx, "adults").unwrap();
    db.storage().drop_trigger(&tx, "audit_users").unwrap();
    db.commit(&tx).unwrap();
}
