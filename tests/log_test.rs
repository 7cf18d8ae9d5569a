mod test_utils;

use minirel::transaction::{ClrPayload, LogReader, LogRecord, LogRecordBody};

use crate::test_utils::*;

fn read_log(dir: &tempfile::TempDir) -> Vec<LogRecord> {
    let mut reader = LogReader::open(dir.path().join("wal.log")).unwrap();
    let mut records = Vec::new();
    while let Some((_, record)) = reader.next_record().unwrap() {
        records.push(record);
    }
    records
}

/// An empty transaction leaves exactly one record: its COMMIT.
#[test]
fn test_empty_transaction_logs_only_commit() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = minirel::Database::open(dir.path()).unwrap();

    let tx = db.begin();
    let txn_id = tx.get_id();
    db.commit(&tx).unwrap();

    let records: Vec<LogRecord> = read_log(&dir)
        .into_iter()
        .filter(|r| r.txn_id == txn_id)
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].body, LogRecordBody::Commit);
    assert_eq!(records[0].prev_lsn, 0);

    // no locks left behind either
    assert!(tx.get_held_locks().is_empty());
}

/// Commit forces its record to disk before returning.
#[test]
fn test_commit_record_is_durable() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = minirel::Database::open(dir.path()).unwrap();

    create_users_table(&db);
    let tx = db.begin();
    let txn_id = tx.get_id();
    insert_user(&db, &tx, "alice", 25);
    db.commit(&tx).unwrap();

    // read the file directly: both the INSERT and the COMMIT must be there
    let records = read_log(&dir);
    let mine: Vec<&LogRecord> = records.iter().filter(|r| r.txn_id == txn_id).collect();
    assert!(matches!(mine[0].body, LogRecordBody::Insert { .. }));
    assert!(matches!(mine.last().unwrap().body, LogRecordBody::Commit));
}

/// prev_lsn chains a transaction's records together.
#[test]
fn test_prev_lsn_chain() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = minirel::Database::open(dir.path()).unwrap();

    create_users_table(&db);
    let tx = db.begin();
    let txn_id = tx.get_id();
    let r1 = insert_user(&db, &tx, "bob", 30);
    db.storage()
        .update_row(&tx, "users", r1, user_row("bob", 31))
        .unwrap();
    db.storage().delete_row(&tx, "users", r1).unwrap();
    db.commit(&tx).unwrap();

    let mine: Vec<LogRecord> = read_log(&dir)
        .into_iter()
        .filter(|r| r.txn_id == txn_id)
        .collect();
    assert_eq!(mine.len(), 4); // insert, update, delete, commit
    assert_eq!(mine[0].prev_lsn, 0);
    for pair in mine.windows(2) {
        assert_eq!(pair[1].prev_lsn, pair[0].lsn);
    }
}

/// Abort writes one CLR per data record, newest first, then ABORT. CLRs
/// carry `undo_next_lsn` pointing past the record they compensate.
#[test]
fn test_abort_emits_clr_chain() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = minirel::Database::open(dir.path()).unwrap();

    create_users_table(&db);
    let tx = db.begin();
    let txn_id = tx.get_id();
    insert_user(&db, &tx, "carol", 40);
    insert_user(&db, &tx, "dan", 41);
    db.abort(&tx).unwrap();

    let mine: Vec<LogRecord> = read_log(&dir)
        .into_iter()
        .filter(|r| r.txn_id == txn_id)
        .collect();
    // insert, insert, clr(second), clr(first), abort
    assert_eq!(mine.len(), 5);
    let (i1, i2) = (&mine[0], &mine[1]);
    match (&mine[2].body, &mine[3].body) {
        (
            LogRecordBody::Clr {
                undo_next_lsn: u1,
                payload: ClrPayload::Insert { .. },
            },
            LogRecordBody::Clr {
                undo_next_lsn: u2,
                payload: ClrPayload::Insert { .. },
            },
        ) => {
            // the first CLR compensates the newest insert
            assert_eq!(*u1, i1.lsn);
            assert_eq!(*u2, 0);
            let _ = i2;
        }
        other => panic!("expected two insert CLRs, got {:?}", other),
    }
    assert_eq!(mine[4].body, LogRecordBody::Abort);
}

/// Pages carry the LSN of the last record applied to them, and a flushed
/// page never runs ahead of the durable log.
#[test]
fn test_page_lsn_tracks_log() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = minirel::Database::open(dir.path()).unwrap();

    create_users_table(&db);
    let tx = db.begin();
    insert_user(&db, &tx, "erin", 20);
    db.commit(&tx).unwrap();
    // flushing the pool forces the WAL contract on every page write
    db.storage().flush_all_pools().unwrap();

    let records = read_log(&dir);
    let max_logged = records.iter().map(|r| r.lsn).max().unwrap();

    // the heap page on disk carries a PageLSN covered by the durable log
    let mut ts = minirel::storage::tablespace::Tablespace::open(
        dir.path().join("data").join("users.db"),
        4096,
    )
    .unwrap();
    let bytes = ts.read(1).unwrap();
    let page_lsn = u64::from_le_bytes(bytes[9..17].try_into().unwrap());
    assert!(page_lsn > 0);
    assert!(page_lsn <= max_logged);
}
