//! B+tree internal page.
//!
//! Header is the leaf header plus `leftmost_child_page_id(4)` (29 bytes).
//! Entries are `key bytes || child_page_id(4)`. The leftmost child covers
//! keys strictly below the first key; slot `i`'s child covers
//! `[slot[i].key, slot[i+1].key)`.

use std::io::Cursor;

use crate::{
    error::DbError,
    storage::key::Key,
    types::{DbResult, Lsn, PageId},
    utils::{Decodeable, Encodeable},
};

use super::{
    slotted::{self, SLOT_SIZE},
    BTREE_INTERNAL_TAG, NULL_BTREE_PAGE_ID,
};

pub const INTERNAL_HEADER_SIZE: usize = 29;

/// Where a child pointer sits inside its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildPos {
    Leftmost,
    Slot(usize),
}

#[derive(Debug)]
pub struct InternalPage {
    page_id: PageId,
    page_size: usize,
    data: Vec<u8>,

    free_space_pointer: usize,
    entry_count: usize,
    parent_page_id: PageId,
    page_lsn: Lsn,
    leftmost_child_page_id: PageId,

    key_col_types: Vec<u8>,
    dirty: bool,
}

impl InternalPage {
    pub fn new(page_id: PageId, page_size: usize, key_col_types: &[u8]) -> Self {
        let mut page = Self {
            page_id,
            page_size,
            data: vec![0u8; page_size],
            free_space_pointer: INTERNAL_HEADER_SIZE,
            entry_count: 0,
            parent_page_id: NULL_BTREE_PAGE_ID,
            page_lsn: 0,
            leftmost_child_page_id: NULL_BTREE_PAGE_ID,
            key_col_types: key_col_types.to_vec(),
            dirty: false,
        };
        page.save_header();
        page
    }

    pub fn from_bytes(
        page_id: PageId,
        data: Vec<u8>,
        page_size: usize,
        key_col_types: &[u8],
    ) -> Self {
        let free_space_pointer = u32::from_le_bytes(data[1..5].try_into().unwrap()) as usize;
        let entry_count = u32::from_le_bytes(data[5..9].try_into().unwrap()) as usize;
        // bytes 9..13 mirror the leaf's next-sibling field and stay null
        let parent_page_id = u32::from_le_bytes(data[13..17].try_into().unwrap());
        let page_lsn = u64::from_le_bytes(data[17..25].try_into().unwrap());
        let leftmost_child_page_id = u32::from_le_bytes(data[25..29].try_into().unwrap());
        Self {
            page_id,
            page_size,
            data,
            free_space_pointer,
            entry_count,
            parent_page_id,
            page_lsn,
            leftmost_child_page_id,
            key_col_types: key_col_types.to_vec(),
            dirty: false,
        }
    }

    fn save_header(&mut self) {
        self.data[0] = BTREE_INTERNAL_TAG;
        self.data[1..5].copy_from_slice(&(self.free_space_pointer as u32).to_le_bytes());
        self.data[5..9].copy_from_slice(&(self.entry_count as u32).to_le_bytes());
        self.data[9..13].copy_from_slice(&NULL_BTREE_PAGE_ID.to_le_bytes());
        self.data[13..17].copy_from_slice(&self.parent_page_id.to_le_bytes());
        self.data[17..25].copy_from_slice(&self.page_lsn.to_le_bytes());
        self.data[25..29].copy_from_slice(&self.leftmost_child_page_id.to_le_bytes());
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

    pub fn get_entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn get_leftmost_child(&self) -> PageId {
        self.leftmost_child_page_id
    }

    pub fn set_leftmost_child(&mut self, page_id: PageId) {
        self.leftmost_child_page_id = page_id;
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

    fn free_space(&self) -> usize {
        let slot_array_start = self.page_size - self.entry_count * SLOT_SIZE;
        slot_array_start - self.free_space_pointer
    }

    pub fn entry_at(&self, idx: usize) -> Result<(Key, PageId), DbError> {
        let (off, len) = slotted::read_slot(&self.data, self.page_size, idx);
        let mut cursor = Cursor::new(&self.data[off..off + len]);
        let key = Key::decode_from(&mut cursor, &self.key_col_types)?;
        let child = u32::decode_from(&mut cursor)?;
        Ok((key, child))
    }

    pub fn entries(&self) -> Result<Vec<(Key, PageId)>, DbError> {
        (0..self.entry_count).map(|i| self.entry_at(i)).collect()
    }

    fn find_slot_for_key(&self, key: &Key) -> Result<usize, DbError> {
        let mut low = 0usize;
        let mut high = self.entry_count;
        while low < high {
            let mid = (low + high) / 2;
            let (mid_key, _) = self.entry_at(mid)?;
            if &mid_key < key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        Ok(low)
    }

    /// The child covering `key`: the leftmost child below the first key,
    /// otherwise the child of the greatest slot whose key is <= `key`.
    pub fn find_child(&self, key: &Key) -> Result<PageId, DbError> {
        if self.entry_count == 0 {
            return Ok(self.leftmost_child_page_id);
        }
        let idx = self.find_slot_for_key(key)?;
        if idx < self.entry_count {
            let (slot_key, child) = self.entry_at(idx)?;
            if &slot_key == key {
                return Ok(child);
            }
        }
        if idx == 0 {
            Ok(self.leftmost_child_page_id)
        } else {
            Ok(self.entry_at(idx - 1)?.1)
        }
    }

    /// Locate a child pointer; None when the child is not referenced here.
    pub fn find_child_pos(&self, child: PageId) -> Result<Option<ChildPos>, DbError> {
        if self.leftmost_child_page_id == child {
            return Ok(Some(ChildPos::Leftmost));
        }
        for i in 0..self.entry_count {
            if self.entry_at(i)?.1 == child {
                return Ok(Some(ChildPos::Slot(i)));
            }
        }
        Ok(None)
    }

    pub fn min_entries(&self) -> usize {
        // estimate capacity with a typical entry footprint
        let capacity = (self.page_size - INTERNAL_HEADER_SIZE) / (32 + SLOT_SIZE);
        (capacity / 2).max(1)
    }

    /// Ordered insertion of the separator entry. False when a split is
    /// needed.
    pub fn insert(&mut self, key: &Key, child: PageId, lsn: Lsn) -> Result<bool, DbError> {
        let idx = self.find_slot_for_key(key)?;

        let mut entry = key.encode();
        entry.extend_from_slice(&child.to_le_bytes());
        let entry_len = entry.len();

        if self.free_space() < entry_len + SLOT_SIZE {
            self.compact();
            if self.free_space() < entry_len + SLOT_SIZE {
                return Ok(false);
            }
        }

        let data_off = self.free_space_pointer;
        self.data[data_off..data_off + entry_len].copy_from_slice(&entry);
        slotted::open_slot_gap(&mut self.data, self.page_size, self.entry_count, idx);
        slotted::write_slot(&mut self.data, self.page_size, idx, data_off, entry_len);
        self.entry_count += 1;
        self.free_space_pointer += entry_len;
        self.set_page_lsn(lsn);
        Ok(true)
    }

    /// Split around the middle slot. The middle key moves up (it lands in
    /// neither half); its child becomes the new right page's leftmost child;
    /// entries after it move to the right page.
    pub fn split(&mut self, new_right: &mut InternalPage, lsn: Lsn) -> Result<Key, DbError> {
        let mid = self.entry_count / 2;
        let (up_key, mid_child) = self.entry_at(mid)?;
        new_right.set_leftmost_child(mid_child);

        for i in mid + 1..self.entry_count {
            let (key, child) = self.entry_at(i)?;
            new_right.insert(&key, child, lsn)?;
        }

        self.entry_count = mid;
        self.free_space_pointer = slotted::compact(
            &mut self.data,
            self.page_size,
            self.entry_count,
            INTERNAL_HEADER_SIZE,
        );
        self.set_page_lsn(lsn);
        new_right.set_page_lsn(lsn);
        Ok(up_key)
    }

    pub fn delete_by_key(&mut self, key: &Key, lsn: Lsn) -> Result<bool, DbError> {
        let idx = self.find_slot_for_key(key)?;
        if idx < self.entry_count {
            let (slot_key, _) = self.entry_at(idx)?;
            if &slot_key == key {
                self.delete_entry_by_index(idx, lsn)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn delete_entry_by_index(&mut self, idx: usize, lsn: Lsn) -> DbResult {
        if idx >= self.entry_count {
            return Err(DbError::internal(&format!(
                "separator index {} out of range ({} entries)",
                idx, self.entry_count
            )));
        }
        slotted::remove_slot(&mut self.data, self.page_size, self.entry_count, idx);
        self.entry_count -= 1;
        self.set_page_lsn(lsn);
        Ok(())
    }

    /// Rewrite the key of slot `idx`, keeping its child pointer. Used when a
    /// right subtree's minimum changes during rebalancing.
    pub fn replace_key_at(&mut self, idx: usize, new_key: &Key, lsn: Lsn) -> DbResult {
        let (_, child) = self.entry_at(idx)?;
        self.delete_entry_by_index(idx, lsn)?;
        if !self.insert(new_key, child, lsn)? {
            return Err(DbError::internal(
                "separator rewrite overflowed an internal page",
            ));
        }
        Ok(())
    }

    fn compact(&mut self) {
        self.free_space_pointer = slotted::compact(
            &mut self.data,
            self.page_size,
            self.entry_count,
            INTERNAL_HEADER_SIZE,
        );
        self.save_header();
    }
}
