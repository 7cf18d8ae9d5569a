//! Heap file manager: a chain of slotted heap pages per table.
//!
//! Pages are threaded through `next_page_id`; the catalog tracks the chain
//! head (`root_page_id`) and the insertion target (`last_page_id`).

use log::debug;

use crate::{
    catalog::Catalog,
    error::DbError,
    storage::{buffer_pool::BufferPool, page::PageType},
    types::{DbResult, Lsn, PageId, Pod, RowId},
    utils::HandyRwLock,
};

pub struct HeapFile {
    buffer_pool: Pod<BufferPool>,
    catalog: Pod<Catalog>,
    table_name: String,
}

impl HeapFile {
    pub fn new(buffer_pool: Pod<BufferPool>, catalog: Pod<Catalog>, table_name: &str) -> Self {
        Self {
            buffer_pool,
            catalog,
            table_name: table_name.to_string(),
        }
    }

    fn get_chain(&self) -> Result<(Option<PageId>, Option<PageId>), DbError> {
        let catalog = self.catalog.rl();
        let info = catalog.get_table(&self.table_name)?;
        Ok((info.root_page_id, info.last_page_id))
    }

    fn set_chain(&self, root: Option<PageId>, last: Option<PageId>) -> DbResult {
        let mut catalog = self.catalog.wl();
        let info = catalog.get_table_mut(&self.table_name)?;
        if root.is_some() {
            info.root_page_id = root;
        }
        if last.is_some() {
            info.last_page_id = last;
        }
        Ok(())
    }

    /// Dry-run of the next insert: the `(page_id, record_id)` the subsequent
    /// `insert_at` will use. The WAL needs the physical location before the
    /// log record is written, so this may allocate (and thread) a new page
    /// but writes no record bytes.
    pub fn find_space_for_record(&self, record: &[u8]) -> Result<RowId, DbError> {
        let (_, last) = self.get_chain()?;

        let last_page_id = match last {
            None => {
                // first page of the table
                let page = self.buffer_pool.wl().new_page(PageType::Heap)?;
                let page_id = page.rl().get_page_id();
                self.buffer_pool.wl().unpin_page(page_id, false);
                self.set_chain(Some(page_id), Some(page_id))?;
                debug!("table {} got its first page {}", self.table_name, page_id);
                return Ok(RowId::new(page_id, 0));
            }
            Some(pid) => pid,
        };

        let page = self
            .buffer_pool
            .wl()
            .get_page(last_page_id, PageType::Heap)?;
        let free_slot = page.rl().as_heap()?.find_free_slot(record.len());

        if let Some(record_id) = free_slot {
            self.buffer_pool.wl().unpin_page(last_page_id, false);
            return Ok(RowId::new(last_page_id, record_id));
        }

        // the last page is full: allocate a successor and thread the chain
        let new_page = self.buffer_pool.wl().new_page(PageType::Heap)?;
        let new_page_id = new_page.rl().get_page_id();
        page.wl().as_heap_mut()?.set_next_page_id(new_page_id);
        {
            let mut pool = self.buffer_pool.wl();
            pool.unpin_page(last_page_id, true);
            pool.unpin_page(new_page_id, false);
        }
        self.set_chain(None, Some(new_page_id))?;
        Ok(RowId::new(new_page_id, 0))
    }

    /// Physically place the record at the slot `find_space_for_record`
    /// promised.
    pub fn insert_at(&self, row_id: RowId, record: &[u8], lsn: Lsn) -> DbResult {
        let page = self
            .buffer_pool
            .wl()
            .get_page(row_id.page_id, PageType::Heap)?;
        let result = page
            .wl()
            .as_heap_mut()
            .and_then(|p| p.insert_at(row_id.record_id, record, lsn));
        self.buffer_pool.wl().unpin_page(row_id.page_id, true);
        result
    }

    /// Locate space, log-free convenience insert. Callers that need the WAL
    /// ordering use `find_space_for_record` + `insert_at` themselves.
    pub fn insert(&self, record: &[u8], lsn: Lsn) -> Result<RowId, DbError> {
        let row_id = self.find_space_for_record(record)?;
        self.insert_at(row_id, record, lsn)?;
        Ok(row_id)
    }

    pub fn update(&self, row_id: RowId, record: &[u8], lsn: Lsn) -> DbResult {
        let page = self
            .buffer_pool
            .wl()
            .get_page(row_id.page_id, PageType::Heap)?;
        let result = page
            .wl()
            .as_heap_mut()
            .and_then(|p| p.update(row_id.record_id, record, lsn));
        self.buffer_pool.wl().unpin_page(row_id.page_id, true);
        result
    }

    pub fn delete(&self, row_id: RowId, record_size: usize, lsn: Lsn) -> Result<bool, DbError> {
        let page = self
            .buffer_pool
            .wl()
            .get_page(row_id.page_id, PageType::Heap)?;
        let result = page
            .wl()
            .as_heap_mut()
            .and_then(|p| p.mark_deleted(row_id.record_id, record_size, lsn));
        self.buffer_pool.wl().unpin_page(row_id.page_id, true);
        result
    }

    pub fn get(&self, row_id: RowId, record_size: usize) -> Result<Vec<u8>, DbError> {
        let page = self
            .buffer_pool
            .wl()
            .get_page(row_id.page_id, PageType::Heap)?;
        let (valid, bytes) = page.rl().as_heap()?.get(row_id.record_id, record_size);
        self.buffer_pool.wl().unpin_page(row_id.page_id, false);
        if !valid {
            return Err(DbError::not_found(&format!(
                "record {} of table {} not found or deleted",
                row_id, self.table_name
            )));
        }
        Ok(bytes.unwrap())
    }

    /// Every valid record in chain order.
    pub fn scan(&self, record_size: usize) -> Result<Vec<(RowId, Vec<u8>)>, DbError> {
        let (root, _) = self.get_chain()?;
        let mut rows = Vec::new();
        let mut current = match root {
            None => return Ok(rows),
            Some(pid) => pid,
        };

        loop {
            let page = self.buffer_pool.wl().get_page(current, PageType::Heap)?;
            let next;
            {
                let guard = page.rl();
                let heap = guard.as_heap()?;
                for record_id in 0..heap.get_record_count() {
                    let (valid, bytes) = heap.get(record_id, record_size);
                    if valid {
                        rows.push((RowId::new(current, record_id), bytes.unwrap()));
                    }
                }
                next = heap.get_next_page_id();
            }
            self.buffer_pool.wl().unpin_page(current, false);
            if next == 0 {
                break;
            }
            current = next;
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, RwLock};

    use crate::{
        catalog::{Catalog, ColumnInfo, DataType, TableInfo},
        storage::tablespace::{Tablespace, DEFAULT_PAGE_SIZE},
        transaction::LogManager,
    };

    use super::*;

    const RECORD_SIZE: usize = 24;

    fn fixture() -> (tempfile::TempDir, HeapFile) {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::load(dir.path().join("catalog.json"));
        catalog
            .add_table(TableInfo::new(
                "users",
                vec![
                    ColumnInfo::new("name", DataType::Str(20)),
                    ColumnInfo::new("age", DataType::Int),
                ],
            ))
            .unwrap();
        let catalog = Arc::new(RwLock::new(catalog));

        let log = Arc::new(RwLock::new(
            LogManager::open(dir.path().join("wal.log")).unwrap(),
        ));
        let tablespace = Tablespace::open(dir.path().join("users.db"), DEFAULT_PAGE_SIZE).unwrap();
        let pool = Arc::new(RwLock::new(crate::storage::buffer_pool::BufferPool::new(
            tablespace,
            16,
            log,
            &[],
        )));
        let heap = HeapFile::new(pool, catalog, "users");
        (dir, heap)
    }

    fn record(tag: u8) -> Vec<u8> {
        vec![tag; RECORD_SIZE]
    }

    #[test]
    fn test_first_insert_starts_the_chain() {
        let (_dir, heap) = fixture();
        let rid = heap.insert(&record(1), 1).unwrap();
        assert_eq!(rid, RowId::new(1, 0));

        let (root, last) = heap.get_chain().unwrap();
        assert_eq!(root, Some(1));
        assert_eq!(last, Some(1));
    }

    #[test]
    fn test_find_space_predicts_insert_at() {
        let (_dir, heap) = fixture();
        heap.insert(&record(1), 1).unwrap();

        let promised = heap.find_space_for_record(&record(2)).unwrap();
        heap.insert_at(promised, &record(2), 2).unwrap();
        assert_eq!(heap.get(promised, RECORD_SIZE).unwrap(), record(2));
    }

    #[test]
    fn test_update_and_delete() {
        let (_dir, heap) = fixture();
        let rid = heap.insert(&record(1), 1).unwrap();

        heap.update(rid, &record(9), 2).unwrap();
        assert_eq!(heap.get(rid, RECORD_SIZE).unwrap(), record(9));

        assert!(heap.delete(rid, RECORD_SIZE, 3).unwrap());
        assert!(heap.get(rid, RECORD_SIZE).is_err());
        // tombstoned rows vanish from scans
        assert!(heap.scan(RECORD_SIZE).unwrap().is_empty());
    }

    #[test]
    fn test_chain_grows_across_pages() {
        let (_dir, heap) = fixture();
        let per_page = (DEFAULT_PAGE_SIZE - 24) / (RECORD_SIZE + 1);
        let total = per_page * 2 + 3;
        for i in 0..total {
            heap.insert(&record((i % 251) as u8), i as u64 + 1).unwrap();
        }

        let rows = heap.scan(RECORD_SIZE).unwrap();
        assert_eq!(rows.len(), total);
        let (_, last) = heap.get_chain().unwrap();
        assert_eq!(last, Some(3));
    }
}
