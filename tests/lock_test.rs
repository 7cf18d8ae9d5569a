mod test_utils;

use std::{sync::Arc, thread, time::Duration};

use minirel::{Database, DatabaseOptions, ErrorKind, LockMode, ResourceId};

use crate::test_utils::*;

fn quick_db(dir: &tempfile::TempDir) -> Database {
    let options = DatabaseOptions {
        lock_wait_timeout: Duration::from_secs(2),
        deadlock_check_interval: Duration::from_millis(100),
        ..DatabaseOptions::default()
    };
    Database::open_with(dir.path(), options).unwrap()
}

/// Writers hold X on the record and intention locks on every ancestor.
#[test]
fn test_write_plants_intention_locks() {
    setup();
    let (_dir, db) = temp_db();

    create_users_table(&db);
    let tx = db.begin();
    let row_id = insert_user(&db, &tx, "alice", 25);

    assert_eq!(
        db.lock_manager()
            .held_mode(&tx, &ResourceId::table("users")),
        Some(LockMode::IntentionExclusive)
    );
    assert_eq!(
        db.lock_manager()
            .held_mode(&tx, &ResourceId::page("users", row_id.page_id)),
        Some(LockMode::Exclusive)
    );
    db.commit(&tx).unwrap();

    // strict 2PL: everything is gone after commit
    assert_eq!(
        db.lock_manager()
            .held_mode(&tx, &ResourceId::table("users")),
        None
    );
}

/// Two readers share the table; a writer waits for both.
#[test]
fn test_readers_share_writer_waits() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(quick_db(&dir));
    create_users_table(&db);
    let tx = db.begin();
    insert_user(&db, &tx, "bob", 30);
    db.commit(&tx).unwrap();

    let reader1 = db.begin();
    let reader2 = db.begin();
    db.storage().scan(&reader1, "users").unwrap();
    db.storage().scan(&reader2, "users").unwrap();

    // the writer blocks until both readers finish
    let db2 = db.clone();
    let writer = thread::spawn(move || {
        let tx = db2.begin();
        let result = db2.storage().insert_row(&tx, "users", user_row("carl", 31));
        match result {
            Ok(_) => db2.commit(&tx).map(|_| true),
            Err(_) => db2.abort(&tx).map(|_| false),
        }
    });

    thread::sleep(Duration::from_millis(200));
    db.commit(&reader1).unwrap();
    db.commit(&reader2).unwrap();

    assert_eq!(writer.join().unwrap().unwrap(), true);
    assert_eq!(scan_users(&db).len(), 2);
}

/// A two-transaction deadlock kills exactly one; the other finishes.
#[test]
fn test_deadlock_aborts_one_victim() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(quick_db(&dir));

    create_users_table(&db);
    let tx = db.begin();
    let r1 = insert_user(&db, &tx, "dora", 41);
    let r2 = insert_user(&db, &tx, "emil", 42);
    db.commit(&tx).unwrap();

    let db_a = db.clone();
    let db_b = db.clone();

    let a = thread::spawn(move || {
        let tx = db_a.begin();
        db_a.storage()
            .update_row(&tx, "users", r1, user_row("dora", 51))
            .unwrap();
        thread::sleep(Duration::from_millis(300));
        // crossing order with the other thread
        let second = db_a
            .storage()
            .update_row(&tx, "users", r2, user_row("emil", 52));
        match second {
            Ok(()) => {
                db_a.commit(&tx).unwrap();
                true
            }
            Err(e) => {
                assert!(matches!(
                    e.get_kind(),
                    ErrorKind::Deadlock | ErrorKind::LockTimeout
                ));
                db_a.abort(&tx).unwrap();
                false
            }
        }
    });

    let b = thread::spawn(move || {
        let tx = db_b.begin();
        db_b.storage()
            .update_row(&tx, "users", r2, user_row("emil", 62))
            .unwrap();
        thread::sleep(Duration::from_millis(300));
        let second = db_b
            .storage()
            .update_row(&tx, "users", r1, user_row("dora", 61));
        match second {
            Ok(()) => {
                db_b.commit(&tx).unwrap();
                true
            }
            Err(e) => {
                assert!(matches!(
                    e.get_kind(),
                    ErrorKind::Deadlock | ErrorKind::LockTimeout
                ));
                db_b.abort(&tx).unwrap();
                false
            }
        }
    });

    let a_won = a.join().unwrap();
    let b_won = b.join().unwrap();
    // exactly one side lost, its rollback released the locks
    assert_ne!(a_won, b_won);

    // both rows reflect exactly one transaction's effects
    let rows = scan_users(&db);
    let ages: Vec<i32> = rows.iter().map(|(_, _, age)| *age).collect();
    if a_won {
        assert_eq!(ages, vec![51, 52]);
    } else {
        assert_eq!(ages, vec![61, 62]);
    }
}

/// The victim of a deadlock can retry and succeed once the winner commits.
#[test]
fn test_victim_retry_succeeds() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(quick_db(&dir));

    create_users_table(&db);
    let tx = db.begin();
    let r1 = insert_user(&db, &tx, "finn", 20);
    db.commit(&tx).unwrap();

    let winner = db.begin();
    db.storage()
        .update_row(&winner, "users", r1, user_row("finn", 21))
        .unwrap();

    let db2 = db.clone();
    let loser = thread::spawn(move || {
        let tx = db2.begin();
        let result = db2.storage().update_row(&tx, "users", r1, user_row("finn", 30));
        assert!(result.is_err());
        db2.abort(&tx).unwrap();

        // winner is still holding the lock; wait until it commits
        thread::sleep(Duration::from_secs(3));
        let tx = db2.begin();
        db2.storage()
            .update_row(&tx, "users", r1, user_row("finn", 31))
            .unwrap();
        db2.commit(&tx).unwrap();
    });

    thread::sleep(Duration::from_millis(2600));
    db.commit(&winner).unwrap();
    loser.join().unwrap();

    let rows = scan_users(&db);
    assert_eq!(rows[0].2, 31);
}
