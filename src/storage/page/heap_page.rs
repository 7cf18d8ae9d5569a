//! Slotted heap page for fixed-width tuple records.
//!
//! Header (24 bytes): `is_leaf(1) || record_count(4) || next_page_id(4) ||
//! page_lsn(8) || padding(7)`. Body: `record_count` slots, each a one-byte
//! validity flag followed by the record bytes. Deletion tombstones the flag;
//! inserts may reuse tombstoned slots.

use crate::{
    error::{DbError, ErrorKind},
    types::{DbResult, Lsn, PageId, RecordId},
};

pub const HEAP_HEADER_SIZE: usize = 24;

#[derive(Debug)]
pub struct HeapPage {
    page_id: PageId,
    page_size: usize,
    data: Vec<u8>,

    record_count: u32,
    next_page_id: PageId,
    page_lsn: Lsn,

    dirty: bool,
}

impl HeapPage {
    pub fn new(page_id: PageId, page_size: usize) -> Self {
        Self {
            page_id,
            page_size,
            data: vec![0u8; page_size],
            record_count: 0,
            next_page_id: 0,
            page_lsn: 0,
            dirty: false,
        }
    }

    pub fn from_bytes(page_id: PageId, data: Vec<u8>, page_size: usize) -> Self {
        let record_count = u32::from_le_bytes(data[1..5].try_into().unwrap());
        let next_page_id = u32::from_le_bytes(data[5..9].try_into().unwrap());
        let page_lsn = u64::from_le_bytes(data[9..17].try_into().unwrap());
        Self {
            page_id,
            page_size,
            data,
            record_count,
            next_page_id,
            page_lsn,
            dirty: false,
        }
    }

    fn save_header(&mut self) {
        self.data[0] = 0; // is_leaf, unused for heap pages
        self.data[1..5].copy_from_slice(&self.record_count.to_le_bytes());
        self.data[5..9].copy_from_slice(&self.next_page_id.to_le_bytes());
        self.data[9..17].copy_from_slice(&self.page_lsn.to_le_bytes());
    }

    pub fn get_page_id(&self) -> PageId {
        self.page_id
    }

    pub fn get_page_lsn(&self) -> Lsn {
        self.page_lsn
    }

    pub fn set_page_lsn(&mut self, lsn: Lsn) {
        self.page_lsn = lsn;
        self.dirty = true;
        self.save_header();
    }

    pub fn get_record_count(&self) -> u32 {
        self.record_count
    }

    pub fn get_next_page_id(&self) -> PageId {
        self.next_page_id
    }

    pub fn set_next_page_id(&mut self, next: PageId) {
        self.next_page_id = next;
        self.dirty = true;
        self.save_header();
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn to_bytes(&mut self) -> Vec<u8> {
        self.save_header();
        self.data.clone()
    }

    fn slot_offset(&self, record_id: RecordId, record_size: usize) -> usize {
        HEAP_HEADER_SIZE + record_id as usize * (record_size + 1)
    }

    /// True iff appending one more record of this size would overflow.
    pub fn is_full(&self, record_size: usize) -> bool {
        let offset = self.slot_offset(self.record_count, record_size);
        offset + record_size + 1 > self.page_size
    }

    /// The slot the next `insert` will use: the first tombstone, or the
    /// append position. None when the page is full.
    pub fn find_free_slot(&self, record_size: usize) -> Option<RecordId> {
        for i in 0..self.record_count {
            let offset = self.slot_offset(i, record_size);
            if self.data[offset] == 0 {
                return Some(i);
            }
        }
        if self.is_full(record_size) {
            None
        } else {
            Some(self.record_count)
        }
    }

    /// Insert into the first free slot.
    pub fn insert(&mut self, record: &[u8], lsn: Lsn) -> Result<RecordId, DbError> {
        let record_id = self.find_free_slot(record.len()).ok_or_else(|| {
            DbError::new(
                ErrorKind::PageFull,
                &format!("heap page {} cannot fit another record", self.page_id),
            )
        })?;
        self.insert_at(record_id, record, lsn)?;
        Ok(record_id)
    }

    /// Explicit-slot insert, used when the location was pre-determined for
    /// the log record and by redo.
    pub fn insert_at(&mut self, record_id: RecordId, record: &[u8], lsn: Lsn) -> DbResult {
        let offset = self.slot_offset(record_id, record.len());
        if offset + record.len() + 1 > self.page_size {
            return Err(DbError::new(
                ErrorKind::PageFull,
                &format!(
                    "record {} does not fit in heap page {}",
                    record_id, self.page_id
                ),
            ));
        }
        self.data[offset] = 1;
        self.data[offset + 1..offset + 1 + record.len()].copy_from_slice(record);
        if record_id >= self.record_count {
            self.record_count = record_id + 1;
        }
        self.set_page_lsn(lsn);
        Ok(())
    }

    pub fn update(&mut self, record_id: RecordId, record: &[u8], lsn: Lsn) -> DbResult {
        if record_id >= self.record_count {
            return Err(DbError::not_found(&format!(
                "record {} out of range on heap page {}",
                record_id, self.page_id
            )));
        }
        let offset = self.slot_offset(record_id, record.len());
        if self.data[offset] == 0 {
            return Err(DbError::not_found(&format!(
                "record {} on heap page {} is deleted",
                record_id, self.page_id
            )));
        }
        self.data[offset + 1..offset + 1 + record.len()].copy_from_slice(record);
        self.set_page_lsn(lsn);
        Ok(())
    }

    /// Tombstone a slot. Returns false when it was already tombstoned, which
    /// keeps redo idempotent.
    pub fn mark_deleted(
        &mut self,
        record_id: RecordId,
        record_size: usize,
        lsn: Lsn,
    ) -> Result<bool, DbError> {
        if record_id >= self.record_count {
            return Err(DbError::not_found(&format!(
                "record {} out of range on heap page {}",
                record_id, self.page_id
            )));
        }
        let offset = self.slot_offset(record_id, record_size);
        if self.data[offset] == 0 {
            return Ok(false);
        }
        self.data[offset] = 0;
        self.set_page_lsn(lsn);
        Ok(true)
    }

    /// Read a slot: `(valid, bytes)`.
    pub fn get(&self, record_id: RecordId, record_size: usize) -> (bool, Option<Vec<u8>>) {
        let offset = self.slot_offset(record_id, record_size);
        if record_id >= self.record_count || offset + record_size + 1 > self.page_size {
            return (false, None);
        }
        if self.data[offset] != 1 {
            return (false, None);
        }
        let bytes = self.data[offset + 1..offset + 1 + record_size].to_vec();
        (true, Some(bytes))
    }
}
