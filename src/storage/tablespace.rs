//! Physical page file.
//!
//! The file begins with a 4-byte header holding the head of the free-page
//! list (0 when the list is empty). Page ids start at 1; page `i` lives at
//! `HEADER_SIZE + (i - 1) * page_size`. A freed page stores the id of the
//! next free page in its first 4 bytes.

use std::{
    fs,
    io::SeekFrom,
    path::{Path, PathBuf},
};

use log::debug;

use crate::{
    error::DbError,
    types::{DbResult, PageId},
    utils::DbFile,
};

pub const DEFAULT_PAGE_SIZE: usize = 4096;

const FILE_HEADER_SIZE: u64 = 4;
const NULL_PAGE_ID: PageId = 0;

pub struct Tablespace {
    path: PathBuf,
    file: DbFile,
    page_size: usize,
    total_pages: u32,
}

impl Tablespace {
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self, DbError> {
        let path = path.as_ref().to_path_buf();
        let mut file = DbFile::open(&path)?;

        let size = file.get_size()?;
        let total_pages;
        if size < FILE_HEADER_SIZE {
            // brand new file: write the empty free-list header
            file.seek(SeekFrom::Start(0))?;
            file.write(&NULL_PAGE_ID)?;
            file.sync()?;
            total_pages = 0;
        } else {
            total_pages = ((size - FILE_HEADER_SIZE) / page_size as u64) as u32;
        }

        Ok(Self {
            path,
            file,
            page_size,
            total_pages,
        })
    }

    pub fn get_page_size(&self) -> usize {
        self.page_size
    }

    pub fn get_total_pages(&self) -> u32 {
        self.total_pages
    }

    fn page_offset(&self, page_id: PageId) -> Result<u64, DbError> {
        if page_id < 1 {
            return Err(DbError::internal(&format!(
                "page id must be positive, got {}",
                page_id
            )));
        }
        Ok(FILE_HEADER_SIZE + (page_id as u64 - 1) * self.page_size as u64)
    }

    fn get_free_list_head(&mut self) -> Result<PageId, DbError> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read::<u32>()
    }

    fn set_free_list_head(&mut self, page_id: PageId) -> DbResult {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write(&page_id)?;
        self.file.sync()
    }

    /// Pop the free list, or extend the file by one zeroed page.
    pub fn allocate(&mut self) -> Result<PageId, DbError> {
        let free_head = self.get_free_list_head()?;
        if free_head != NULL_PAGE_ID {
            // the first 4 bytes of a freed page hold the next free id
            let offset = self.page_offset(free_head)?;
            self.file.seek(SeekFrom::Start(offset))?;
            let next_free = self.file.read::<u32>()?;
            self.set_free_list_head(next_free)?;
            debug!("reused free page {} from {:?}", free_head, self.path);
            return Ok(free_head);
        }

        let page_id = self.total_pages + 1;
        self.total_pages += 1;
        self.write(page_id, &vec![0u8; self.page_size])?;
        Ok(page_id)
    }

    /// Push the page onto the head of the free list.
    pub fn free(&mut self, page_id: PageId) -> DbResult {
        let current_head = self.get_free_list_head()?;
        let offset = self.page_offset(page_id)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write(&current_head)?;
        self.set_free_list_head(page_id)
    }

    /// Read one page. A page past the current end of the file reads as
    /// zero bytes; holes cannot exist because only `allocate` extends.
    pub fn read(&mut self, page_id: PageId) -> Result<Vec<u8>, DbError> {
        if page_id > self.total_pages {
            return Ok(vec![0u8; self.page_size]);
        }
        let offset = self.page_offset(page_id)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_bytes(self.page_size)
    }

    pub fn write(&mut self, page_id: PageId, data: &[u8]) -> DbResult {
        if data.len() != self.page_size {
            return Err(DbError::internal(&format!(
                "page write of {} bytes does not match page size {}",
                data.len(),
                self.page_size
            )));
        }
        let offset = self.page_offset(page_id)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_bytes(data)?;
        self.file.sync()?;
        if page_id > self.total_pages {
            self.total_pages = page_id;
        }
        Ok(())
    }

    /// Unlink the backing file. The handle stays open until drop; nothing
    /// may use the tablespace afterwards.
    pub fn delete_file(&mut self) -> DbResult {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| DbError::io(&e.to_string()))?;
        }
        self.total_pages = 0;
        Ok(())
    }
}
