//! B+tree leaf page.
//!
//! Header (25 bytes): `type(1) || free_space_pointer(4) || entry_count(4) ||
//! next_leaf_page_id(4) || parent_page_id(4) || page_lsn(8)`. Entries are
//! `key bytes || row_id(8)` in the data region; the slot array keeps them in
//! ascending key order.

use std::io::Cursor;

use crate::{
    error::{DbError, ErrorKind},
    storage::key::Key,
    types::{Lsn, PageId, RowId},
    utils::{Decodeable, Encodeable},
};

use super::{
    slotted::{self, SLOT_SIZE},
    BTREE_LEAF_TAG, NULL_BTREE_PAGE_ID,
};

pub const LEAF_HEADER_SIZE: usize = 25;

#[derive(Debug)]
pub struct LeafPage {
    page_id: PageId,
    page_size: usize,
    data: Vec<u8>,

    free_space_pointer: usize,
    entry_count: usize,
    next_leaf_page_id: PageId,
    parent_page_id: PageId,
    page_lsn: Lsn,

    key_col_types: Vec<u8>,
    dirty: bool,
}

impl LeafPage {
    pub fn new(page_id: PageId, page_size: usize, key_col_types: &[u8]) -> Self {
        let mut page = Self {
            page_id,
            page_size,
            data: vec![0u8; page_size],
            free_space_pointer: LEAF_HEADER_SIZE,
            entry_count: 0,
            next_leaf_page_id: NULL_BTREE_PAGE_ID,
            parent_page_id: NULL_BTREE_PAGE_ID,
            page_lsn: 0,
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
        let next_leaf_page_id = u32::from_le_bytes(data[9..13].try_into().unwrap());
        let parent_page_id = u32::from_le_bytes(data[13..17].try_into().unwrap());
        let page_lsn = u64::from_le_bytes(data[17..25].try_into().unwrap());
        Self {
            page_id,
            page_size,
            data,
            free_space_pointer,
            entry_count,
            next_leaf_page_id,
            parent_page_id,
            page_lsn,
            key_col_types: key_col_types.to_vec(),
            dirty: false,
        }
    }

    fn save_header(&mut self) {
        self.data[0] = BTREE_LEAF_TAG;
        self.data[1..5].copy_from_slice(&(self.free_space_pointer as u32).to_le_bytes());
        self.data[5..9].copy_from_slice(&(self.entry_count as u32).to_le_bytes());
        self.data[9..13].copy_from_slice(&self.next_leaf_page_id.to_le_bytes());
        self.data[13..17].copy_from_slice(&self.parent_page_id.to_le_bytes());
        self.data[17..25].copy_from_slice(&self.page_lsn.to_le_bytes());
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

    pub fn get_next_leaf_page_id(&self) -> Option<PageId> {
        if self.next_leaf_page_id == NULL_BTREE_PAGE_ID {
            None
        } else {
            Some(self.next_leaf_page_id)
        }
    }

    pub fn set_next_leaf_page_id(&mut self, pid: Option<PageId>) {
        self.next_leaf_page_id = pid.unwrap_or(NULL_BTREE_PAGE_ID);
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

    pub fn entry_at(&self, idx: usize) -> Result<(Key, RowId), DbError> {
        let (off, len) = slotted::read_slot(&self.data, self.page_size, idx);
        let mut cursor = Cursor::new(&self.data[off..off + len]);
        let key = Key::decode_from(&mut cursor, &self.key_col_types)?;
        let row_id = RowId::decode_from(&mut cursor)?;
        Ok((key, row_id))
    }

    pub fn entries(&self) -> Result<Vec<(Key, RowId)>, DbError> {
        (0..self.entry_count).map(|i| self.entry_at(i)).collect()
    }

    pub fn min_key(&self) -> Result<Key, DbError> {
        if self.entry_count == 0 {
            return Err(DbError::internal("min_key on an empty leaf"));
        }
        Ok(self.entry_at(0)?.0)
    }

    /// Binary search for the first slot whose key is >= `key`.
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

    pub fn search(&self, key: &Key) -> Result<Option<RowId>, DbError> {
        let idx = self.find_slot_for_key(key)?;
        if idx < self.entry_count {
            let (slot_key, row_id) = self.entry_at(idx)?;
            if &slot_key == key {
                return Ok(Some(row_id));
            }
        }
        Ok(None)
    }

    /// Minimum entry count before the page is considered underfull.
    fn min_entries(&self, entry_len: usize) -> usize {
        let capacity = (self.page_size - LEAF_HEADER_SIZE) / (entry_len + SLOT_SIZE);
        (capacity / 2).max(1)
    }

    /// Whether this page can lend an entry to an underfull sibling without
    /// going underfull itself.
    pub fn can_lend(&self) -> Result<bool, DbError> {
        if self.entry_count <= 1 {
            return Ok(false);
        }
        let (_, entry_len) = slotted::read_slot(&self.data, self.page_size, 0);
        Ok(self.entry_count > self.min_entries(entry_len))
    }

    /// Insert `(key, row_id)`.
    ///
    /// Returns false when the page cannot fit the entry even after
    /// compaction (the caller must split). An exact `(key, row_id)`
    /// duplicate is a no-op so redo stays idempotent; a same-key insert
    /// under a different row id fails when the index is unique.
    pub fn insert(
        &mut self,
        key: &Key,
        row_id: RowId,
        is_unique: bool,
        lsn: Lsn,
    ) -> Result<bool, DbError> {
        let idx = self.find_slot_for_key(key)?;
        if idx < self.entry_count {
            let (slot_key, slot_row_id) = self.entry_at(idx)?;
            if &slot_key == key {
                if slot_row_id == row_id {
                    return Ok(true);
                }
                if is_unique {
                    return Err(DbError::new(
                        ErrorKind::UniqueViolation,
                        &format!("key {} already exists in unique index", key),
                    ));
                }
            }
        }

        let mut entry = key.encode();
        entry.extend_from_slice(&row_id.encode());
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

    /// Delete the entry matching both key and row id.
    ///
    /// Returns `(deleted, underflow)`. A missing entry is a no-op, again for
    /// redo idempotence.
    pub fn delete(&mut self, key: &Key, row_id: RowId, lsn: Lsn) -> Result<(bool, bool), DbError> {
        let mut idx = self.find_slot_for_key(key)?;
        // duplicates of the same key sit adjacent; walk them for the row id
        while idx < self.entry_count {
            let (slot_key, slot_row_id) = self.entry_at(idx)?;
            if &slot_key != key {
                break;
            }
            if slot_row_id == row_id {
                let (_, entry_len) = slotted::read_slot(&self.data, self.page_size, idx);
                slotted::remove_slot(&mut self.data, self.page_size, self.entry_count, idx);
                self.entry_count -= 1;
                let underflow = self.entry_count < self.min_entries(entry_len);
                self.set_page_lsn(lsn);
                return Ok((true, underflow));
            }
            idx += 1;
        }
        Ok((false, false))
    }

    /// Move the upper half of the entries into `new_right`, thread the leaf
    /// chain, and return the smallest key now in the right page.
    pub fn split(&mut self, new_right: &mut LeafPage, lsn: Lsn) -> Result<Key, DbError> {
        let mid = self.entry_count / 2;
        for i in mid..self.entry_count {
            let (key, row_id) = self.entry_at(i)?;
            new_right.insert(&key, row_id, false, lsn)?;
        }
        new_right.next_leaf_page_id = self.next_leaf_page_id;
        self.next_leaf_page_id = new_right.page_id;

        self.entry_count = mid;
        self.free_space_pointer =
            slotted::compact(&mut self.data, self.page_size, self.entry_count, LEAF_HEADER_SIZE);
        self.set_page_lsn(lsn);
        new_right.set_page_lsn(lsn);
        new_right.min_key()
    }

    fn compact(&mut self) {
        self.free_space_pointer =
            slotted::compact(&mut self.data, self.page_size, self.entry_count, LEAF_HEADER_SIZE);
        self.save_header();
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::key::KeyValue;

    use super::*;

    const PAGE_SIZE: usize = 4096;

    fn int_key(v: i32) -> Key {
        Key(vec![KeyValue::Int(v)])
    }

    fn new_leaf(page_id: PageId) -> LeafPage {
        LeafPage::new(page_id, PAGE_SIZE, &[crate::storage::key::KEY_TYPE_INT])
    }

    #[test]
    fn test_sorted_insert_and_search() {
        let mut leaf = new_leaf(1);
        for v in [5, 1, 3, 9, 7] {
            assert!(leaf
                .insert(&int_key(v), RowId::new(1, v as u32), false, 1)
                .unwrap());
        }
        let entries = leaf.entries().unwrap();
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.clone()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        assert_eq!(
            leaf.search(&int_key(7)).unwrap(),
            Some(RowId::new(1, 7))
        );
        assert_eq!(leaf.search(&int_key(4)).unwrap(), None);
    }

    #[test]
    fn test_unique_violation() {
        let mut leaf = new_leaf(1);
        leaf.insert(&int_key(1), RowId::new(1, 0), true, 1).unwrap();
        // same key, same row id: idempotent no-op
        assert!(leaf.insert(&int_key(1), RowId::new(1, 0), true, 2).unwrap());
        let err = leaf
            .insert(&int_key(1), RowId::new(1, 1), true, 3)
            .unwrap_err();
        assert_eq!(err.get_kind(), ErrorKind::UniqueViolation);
    }

    #[test]
    fn test_insert_delete_leaves_leaf_unchanged() {
        let mut leaf = new_leaf(1);
        for v in 0..10 {
            leaf.insert(&int_key(v), RowId::new(1, v as u32), false, 1)
                .unwrap();
        }
        let before = leaf.entries().unwrap();
        leaf.insert(&int_key(100), RowId::new(1, 100), false, 2)
            .unwrap();
        let (deleted, _) = leaf.delete(&int_key(100), RowId::new(1, 100), 3).unwrap();
        assert!(deleted);
        assert_eq!(leaf.entries().unwrap(), before);
    }

    #[test]
    fn test_split_halves_and_links() {
        let mut left = new_leaf(1);
        let mut count = 0;
        loop {
            if !left
                .insert(&int_key(count), RowId::new(1, count as u32), false, 1)
                .unwrap()
            {
                break;
            }
            count += 1;
        }
        let mut right = new_leaf(2);
        let min_key = left.split(&mut right, 2).unwrap();

        assert_eq!(left.get_next_leaf_page_id(), Some(2));
        assert_eq!(
            left.get_entry_count() + right.get_entry_count(),
            count as usize
        );
        assert_eq!(right.min_key().unwrap(), min_key);
        let (last_left, _) = left.entry_at(left.get_entry_count() - 1).unwrap();
        assert!(last_left < min_key);
    }

    #[test]
    fn test_bytes_round_trip() {
        let mut leaf = new_leaf(1);
        leaf.insert(&int_key(42), RowId::new(9, 3), false, 77).unwrap();
        let bytes = leaf.to_bytes();
        let reloaded =
            LeafPage::from_bytes(1, bytes, PAGE_SIZE, &[crate::storage::key::KEY_TYPE_INT]);
        assert_eq!(reloaded.get_entry_count(), 1);
        assert_eq!(reloaded.get_page_lsn(), 77);
        assert_eq!(
            reloaded.search(&int_key(42)).unwrap(),
            Some(RowId::new(9, 3))
        );
    }
}
