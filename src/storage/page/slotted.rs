//! Slot-array plumbing shared by the B+tree leaf and internal pages.
//!
//! The data region grows forward from the header; the slot array grows
//! backward from the page tail. Each slot is `(offset: u16, length: u16)`.

pub const SLOT_SIZE: usize = 4;

pub fn slot_offset(page_size: usize, idx: usize) -> usize {
    page_size - (idx + 1) * SLOT_SIZE
}

pub fn read_slot(data: &[u8], page_size: usize, idx: usize) -> (usize, usize) {
    let off = slot_offset(page_size, idx);
    let data_off = u16::from_le_bytes([data[off], data[off + 1]]) as usize;
    let data_len = u16::from_le_bytes([data[off + 2], data[off + 3]]) as usize;
    (data_off, data_len)
}

pub fn write_slot(data: &mut [u8], page_size: usize, idx: usize, data_off: usize, data_len: usize) {
    let off = slot_offset(page_size, idx);
    data[off..off + 2].copy_from_slice(&(data_off as u16).to_le_bytes());
    data[off + 2..off + 4].copy_from_slice(&(data_len as u16).to_le_bytes());
}

/// Shift slots `idx..entry_count` one position toward the tail to open a gap
/// at `idx` for a new slot.
pub fn open_slot_gap(data: &mut [u8], page_size: usize, entry_count: usize, idx: usize) {
    for i in (idx..entry_count).rev() {
        let (off, len) = read_slot(data, page_size, i);
        write_slot(data, page_size, i + 1, off, len);
    }
}

/// Remove slot `idx`, closing the gap. The data region is untouched
/// (compaction is lazy).
pub fn remove_slot(data: &mut [u8], page_size: usize, entry_count: usize, idx: usize) {
    for i in idx..entry_count - 1 {
        let (off, len) = read_slot(data, page_size, i + 1);
        write_slot(data, page_size, i, off, len);
    }
}

/// Rewrite the data region so entries sit contiguously after the header,
/// in slot order. Returns the new free-space pointer.
pub fn compact(data: &mut [u8], page_size: usize, entry_count: usize, header_size: usize) -> usize {
    let mut entries = Vec::with_capacity(entry_count);
    for i in 0..entry_count {
        let (off, len) = read_slot(data, page_size, i);
        entries.push(data[off..off + len].to_vec());
    }
    let mut cursor = header_size;
    for (i, entry) in entries.iter().enumerate() {
        data[cursor..cursor + entry.len()].copy_from_slice(entry);
        write_slot(data, page_size, i, cursor, entry.len());
        cursor += entry.len();
    }
    cursor
}
