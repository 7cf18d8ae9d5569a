//! Page cache with pin counts, LRU eviction, and the WAL ordering contract.
//!
//! One pool fronts one tablespace file. A page may be written back only when
//! every log record reflected in it is durable: `flush_page` forces the log
//! up to the page LSN before touching the tablespace.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use log::debug;

use crate::{
    error::{DbError, ErrorKind},
    storage::{
        page::{Page, PageType},
        tablespace::Tablespace,
    },
    transaction::LogManager,
    types::{DbResult, Lsn, PageId, Pod, ResultPod},
    utils::HandyRwLock,
};

pub const DEFAULT_BUFFER_SIZE: usize = 64;

pub struct BufferPool {
    tablespace: Tablespace,
    capacity: usize,
    log_manager: Pod<LogManager>,
    /// Key component tags for B+tree page decoding; unused by heap pools.
    key_col_types: Vec<u8>,

    cache: HashMap<PageId, Pod<Page>>,
    /// Front is least recently used.
    lru: Vec<PageId>,
    pin_counts: HashMap<PageId, usize>,
    dirty_pages: HashSet<PageId>,
}

impl BufferPool {
    pub fn new(
        tablespace: Tablespace,
        capacity: usize,
        log_manager: Pod<LogManager>,
        key_col_types: &[u8],
    ) -> Self {
        Self {
            tablespace,
            capacity,
            log_manager,
            key_col_types: key_col_types.to_vec(),
            cache: HashMap::new(),
            lru: Vec::new(),
            pin_counts: HashMap::new(),
            dirty_pages: HashSet::new(),
        }
    }

    fn touch(&mut self, page_id: PageId) {
        self.lru.retain(|&p| p != page_id);
        self.lru.push(page_id);
    }

    /// Fetch a page, pinning it. The caller must pair this with `unpin`.
    pub fn get_page(&mut self, page_id: PageId, hint: PageType) -> ResultPod<Page> {
        if let Some(page) = self.cache.get(&page_id).cloned() {
            self.touch(page_id);
            *self.pin_counts.entry(page_id).or_insert(0) += 1;
            return Ok(page);
        }

        if self.cache.len() >= self.capacity {
            self.evict_one()?;
        }

        let bytes = self.tablespace.read(page_id)?;
        let page = Page::from_bytes(
            page_id,
            bytes,
            hint,
            self.tablespace.get_page_size(),
            &self.key_col_types,
        )?;
        let pod = Arc::new(RwLock::new(page));
        self.cache.insert(page_id, pod.clone());
        self.touch(page_id);
        *self.pin_counts.entry(page_id).or_insert(0) += 1;
        Ok(pod)
    }

    /// Allocate a fresh page of the given type, pinned.
    pub fn new_page(&mut self, page_type: PageType) -> ResultPod<Page> {
        if self.cache.len() >= self.capacity {
            self.evict_one()?;
        }
        let page_id = self.tablespace.allocate()?;
        let page = Page::new_empty(
            page_id,
            page_type,
            self.tablespace.get_page_size(),
            &self.key_col_types,
        );
        let pod = Arc::new(RwLock::new(page));
        self.cache.insert(page_id, pod.clone());
        self.touch(page_id);
        self.pin_counts.insert(page_id, 1);
        Ok(pod)
    }

    pub fn unpin_page(&mut self, page_id: PageId, dirty: bool) {
        if !self.cache.contains_key(&page_id) {
            return;
        }
        if dirty {
            self.dirty_pages.insert(page_id);
        }
        if let Some(count) = self.pin_counts.get_mut(&page_id) {
            if *count > 0 {
                *count -= 1;
            }
        }
    }

    /// Write a dirty page back, honoring the WAL contract: the log is
    /// flushed through the page LSN first.
    pub fn flush_page(&mut self, page_id: PageId) -> DbResult {
        let page = match self.cache.get(&page_id) {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        if !self.dirty_pages.contains(&page_id) && !page.rl().is_dirty() {
            return Ok(());
        }

        let page_lsn = page.rl().get_page_lsn();
        let flushed_lsn = self.log_manager.rl().get_flushed_lsn();
        if page_lsn > flushed_lsn {
            self.log_manager.wl().flush_to_lsn(page_lsn)?;
        }

        let bytes = page.wl().to_bytes();
        self.tablespace.write(page_id, &bytes)?;
        page.wl().clear_dirty();
        self.dirty_pages.remove(&page_id);
        Ok(())
    }

    pub fn flush_all(&mut self) -> DbResult {
        let dirty: Vec<PageId> = self.dirty_pages.iter().copied().collect();
        for page_id in dirty {
            self.flush_page(page_id)?;
        }
        // pages dirtied without an unpin notification
        let also_dirty: Vec<PageId> = self
            .cache
            .iter()
            .filter(|(_, p)| p.rl().is_dirty())
            .map(|(id, _)| *id)
            .collect();
        for page_id in also_dirty {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Flush and drop a page from the cache. The physical page stays
    /// allocated.
    pub fn free_page(&mut self, page_id: PageId) -> DbResult {
        if self.cache.contains_key(&page_id) {
            self.flush_page(page_id)?;
            self.cache.remove(&page_id);
            self.lru.retain(|&p| p != page_id);
            self.pin_counts.remove(&page_id);
            self.dirty_pages.remove(&page_id);
        }
        Ok(())
    }

    /// Drop a page without writing it back. Used when its transaction is
    /// rolled back wholesale or its table is being dropped.
    pub fn discard_page(&mut self, page_id: PageId) {
        self.cache.remove(&page_id);
        self.lru.retain(|&p| p != page_id);
        self.pin_counts.remove(&page_id);
        self.dirty_pages.remove(&page_id);
    }

    /// Return the freed page to the tablespace free list.
    pub fn free_physical(&mut self, page_id: PageId) -> DbResult {
        self.discard_page(page_id);
        self.tablespace.free(page_id)
    }

    fn evict_one(&mut self) -> DbResult {
        let victim = self
            .lru
            .iter()
            .copied()
            .find(|p| self.pin_counts.get(p).copied().unwrap_or(0) == 0);
        let victim = victim.ok_or_else(|| {
            DbError::new(
                ErrorKind::BufferPoolFull,
                "every cached page is pinned; unpin before requesting more pages",
            )
        })?;
        debug!("evicting page {} from the buffer pool", victim);
        self.flush_page(victim)?;
        self.cache.remove(&victim);
        self.lru.retain(|&p| p != victim);
        self.pin_counts.remove(&victim);
        Ok(())
    }

    /// `(page_id, page_lsn)` of every dirty page, for the checkpoint's
    /// dirty-page table.
    pub fn dirty_page_lsns(&self) -> Vec<(PageId, Lsn)> {
        let mut out = Vec::new();
        for page_id in &self.dirty_pages {
            if let Some(page) = self.cache.get(page_id) {
                out.push((*page_id, page.rl().get_page_lsn()));
            }
        }
        out
    }

    pub fn get_total_pages(&self) -> u32 {
        self.tablespace.get_total_pages()
    }

    /// Drop every cached page and delete the backing file.
    pub fn delete_file(&mut self) -> DbResult {
        self.cache.clear();
        self.lru.clear();
        self.pin_counts.clear();
        self.dirty_pages.clear();
        self.tablespace.delete_file()
    }
}
