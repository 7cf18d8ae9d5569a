mod test_utils;

use std::sync::{Arc, RwLock};

use minirel::{
    catalog::{Catalog, ColumnInfo, IndexInfo, TableInfo},
    storage::{
        btree::BTreeManager,
        buffer_pool::BufferPool,
        key::{Key, KeyValue, KEY_TYPE_INT},
        tablespace::Tablespace,
    },
    transaction::LogManager,
    utils::HandyRwLock,
    DataType, ErrorKind, RowId,
};
use rand::seq::SliceRandom;

use crate::test_utils::setup;

struct Fixture {
    _dir: tempfile::TempDir,
    catalog: minirel::types::Pod<Catalog>,
    pool: minirel::types::Pod<BufferPool>,
}

fn int_key(v: i32) -> Key {
    Key(vec![KeyValue::Int(v)])
}

fn fixture(is_unique: bool) -> (Fixture, BTreeManager) {
    let dir = tempfile::tempdir().unwrap();

    let catalog = Arc::new(RwLock::new(Catalog::load(dir.path().join("catalog.json"))));
    catalog
        .wl()
        .add_table(TableInfo::new(
            "t",
            vec![ColumnInfo::new("k", DataType::Int)],
        ))
        .unwrap();
    catalog
        .wl()
        .add_index(
            "t",
            IndexInfo {
                index_name: "idx".to_string(),
                file_name: "t_idx.idx".to_string(),
                root_page_id: None,
                column_names: vec!["k".to_string()],
                key_col_types: vec![KEY_TYPE_INT],
                index_type: "BTREE".to_string(),
                is_unique,
            },
        )
        .unwrap();

    let log = Arc::new(RwLock::new(
        LogManager::open(dir.path().join("wal.log")).unwrap(),
    ));
    let tablespace = Tablespace::open(dir.path().join("t_idx.idx"), 4096).unwrap();
    let pool = Arc::new(RwLock::new(BufferPool::new(
        tablespace,
        64,
        log,
        &[KEY_TYPE_INT],
    )));

    let btree = BTreeManager::new(pool.clone(), catalog.clone(), "t", "idx").unwrap();
    (
        Fixture {
            _dir: dir,
            catalog,
            pool,
        },
        btree,
    )
}

#[test]
fn test_insert_then_search() {
    setup();
    let (_fx, mut btree) = fixture(false);

    let mut keys: Vec<i32> = (0..1000).collect();
    keys.shuffle(&mut rand::thread_rng());
    for &k in &keys {
        btree.insert(&int_key(k), RowId::new(1, k as u32), 1).unwrap();
    }

    for k in 0..1000 {
        assert_eq!(
            btree.search(&int_key(k)).unwrap(),
            Some(RowId::new(1, k as u32)),
            "key {} missing",
            k
        );
    }
    assert_eq!(btree.search(&int_key(5000)).unwrap(), None);
    assert_eq!(btree.search(&int_key(-1)).unwrap(), None);
}

/// Filling the root leaf past capacity forces exactly one split and an
/// internal root above two leaves.
#[test]
fn test_root_leaf_split_grows_tree() {
    setup();
    let (fx, mut btree) = fixture(false);

    // an int entry is 15 bytes plus a 4-byte slot
    let leaf_capacity = (4096 - 25) / 19;
    for k in 0..=leaf_capacity as i32 {
        btree.insert(&int_key(k), RowId::new(1, k as u32), 1).unwrap();
    }

    // the file now holds the old root, its right sibling, and a new root
    assert_eq!(fx.pool.rl().get_total_pages(), 3);
    let root = fx
        .catalog
        .rl()
        .get_index("t", "idx")
        .unwrap()
        .root_page_id
        .unwrap();
    assert_eq!(root, 3);

    for k in 0..=leaf_capacity as i32 {
        assert_eq!(
            btree.search(&int_key(k)).unwrap(),
            Some(RowId::new(1, k as u32))
        );
    }
}

#[test]
fn test_unique_rejects_duplicate_key() {
    setup();
    let (_fx, mut btree) = fixture(true);

    btree.insert(&int_key(7), RowId::new(1, 0), 1).unwrap();
    // identical (key, row_id) replays silently
    btree.insert(&int_key(7), RowId::new(1, 0), 2).unwrap();
    let err = btree.insert(&int_key(7), RowId::new(1, 1), 3).unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::UniqueViolation);
}

#[test]
fn test_delete_and_search() {
    setup();
    let (_fx, mut btree) = fixture(false);

    for k in 0..2000 {
        btree.insert(&int_key(k), RowId::new(1, k as u32), 1).unwrap();
    }
    // remove the odd keys, in shuffled order, exercising redistribution and
    // merges along the way
    let mut odd: Vec<i32> = (0..2000).filter(|k| k % 2 == 1).collect();
    odd.shuffle(&mut rand::thread_rng());
    for &k in &odd {
        assert!(btree.delete(&int_key(k), RowId::new(1, k as u32), 2).unwrap());
    }

    for k in 0..2000 {
        let expected = if k % 2 == 0 {
            Some(RowId::new(1, k as u32))
        } else {
            None
        };
        assert_eq!(btree.search(&int_key(k)).unwrap(), expected, "key {}", k);
    }

    // deleting an absent key is a no-op
    assert!(!btree.delete(&int_key(1), RowId::new(1, 1), 3).unwrap());
}

/// Draining a multi-level tree merges leaves and collapses the root back
/// down; the survivors stay reachable throughout.
#[test]
fn test_drain_collapses_tree() {
    setup();
    let (_fx, mut btree) = fixture(false);

    let n = 3000;
    for k in 0..n {
        btree.insert(&int_key(k), RowId::new(1, k as u32), 1).unwrap();
    }
    for k in 0..n - 1 {
        assert!(btree.delete(&int_key(k), RowId::new(1, k as u32), 2).unwrap());
    }
    assert_eq!(
        btree.search(&int_key(n - 1)).unwrap(),
        Some(RowId::new(1, (n - 1) as u32))
    );
    for k in 0..n - 1 {
        assert_eq!(btree.search(&int_key(k)).unwrap(), None);
    }
}

/// insert then delete leaves the tree logically unchanged.
#[test]
fn test_insert_delete_round_trip() {
    setup();
    let (_fx, mut btree) = fixture(false);

    for k in 0..100 {
        btree.insert(&int_key(k), RowId::new(1, k as u32), 1).unwrap();
    }
    btree.insert(&int_key(500), RowId::new(9, 9), 2).unwrap();
    assert!(btree.delete(&int_key(500), RowId::new(9, 9), 3).unwrap());

    for k in 0..100 {
        assert_eq!(
            btree.search(&int_key(k)).unwrap(),
            Some(RowId::new(1, k as u32))
        );
    }
    assert_eq!(btree.search(&int_key(500)).unwrap(), None);
}

/// Duplicate keys under different row ids coexist in a non-unique index and
/// are deleted individually.
#[test]
fn test_non_unique_duplicates() {
    setup();
    let (_fx, mut btree) = fixture(false);

    btree.insert(&int_key(1), RowId::new(1, 0), 1).unwrap();
    btree.insert(&int_key(1), RowId::new(1, 1), 1).unwrap();
    btree.insert(&int_key(1), RowId::new(2, 0), 1).unwrap();

    assert!(btree.delete(&int_key(1), RowId::new(1, 1), 2).unwrap());
    // the remaining duplicates are still present
    assert!(btree.search(&int_key(1)).unwrap().is_some());
    assert!(btree.delete(&int_key(1), RowId::new(1, 0), 3).unwrap());
    assert!(btree.delete(&int_key(1), RowId::new(2, 0), 4).unwrap());
    assert_eq!(btree.search(&int_key(1)).unwrap(), None);
}
