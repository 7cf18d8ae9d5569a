mod heap_page;
mod internal_page;
mod leaf_page;
mod slotted;

pub use heap_page::HeapPage;
pub use internal_page::{ChildPos, InternalPage};
pub use leaf_page::LeafPage;

use crate::{
    error::DbError,
    types::{Lsn, PageId},
};

/// First byte of a B+tree page header.
pub const BTREE_INTERNAL_TAG: u8 = 1;
pub const BTREE_LEAF_TAG: u8 = 2;

/// Null sibling/parent pointer inside B+tree pages.
pub const NULL_BTREE_PAGE_ID: PageId = 0xFFFF_FFFF;

/// What the caller expects a page to be. The buffer pool uses this to pick
/// the header layout when reconstructing a page from disk; for B+tree pages
/// the on-disk tag byte wins once the page has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Heap,
    Leaf,
    Internal,
}

/// Tagged variant stored in the buffer pool. Operations match on the
/// variant; the first byte of the header encodes it for disk round-trips.
#[derive(Debug)]
pub enum Page {
    Heap(HeapPage),
    Leaf(LeafPage),
    Internal(InternalPage),
}

impl Page {
    pub fn from_bytes(
        page_id: PageId,
        bytes: Vec<u8>,
        hint: PageType,
        page_size: usize,
        key_col_types: &[u8],
    ) -> Result<Self, DbError> {
        match hint {
            PageType::Heap => Ok(Page::Heap(HeapPage::from_bytes(page_id, bytes, page_size))),
            PageType::Leaf | PageType::Internal => {
                // trust the disk tag once the page has one; a zeroed page is
                // fresh and takes the caller's hint
                let tag = bytes.first().copied().unwrap_or(0);
                match tag {
                    BTREE_LEAF_TAG => Ok(Page::Leaf(LeafPage::from_bytes(
                        page_id,
                        bytes,
                        page_size,
                        key_col_types,
                    ))),
                    BTREE_INTERNAL_TAG => Ok(Page::Internal(InternalPage::from_bytes(
                        page_id,
                        bytes,
                        page_size,
                        key_col_types,
                    ))),
                    0 => match hint {
                        PageType::Leaf => {
                            Ok(Page::Leaf(LeafPage::new(page_id, page_size, key_col_types)))
                        }
                        _ => Ok(Page::Internal(InternalPage::new(
                            page_id,
                            page_size,
                            key_col_types,
                        ))),
                    },
                    other => Err(DbError::corruption(&format!(
                        "page {} carries unknown type tag {}",
                        page_id, other
                    ))),
                }
            }
        }
    }

    pub fn new_empty(
        page_id: PageId,
        page_type: PageType,
        page_size: usize,
        key_col_types: &[u8],
    ) -> Self {
        match page_type {
            PageType::Heap => Page::Heap(HeapPage::new(page_id, page_size)),
            PageType::Leaf => Page::Leaf(LeafPage::new(page_id, page_size, key_col_types)),
            PageType::Internal => {
                Page::Internal(InternalPage::new(page_id, page_size, key_col_types))
            }
        }
    }

    pub fn get_page_id(&self) -> PageId {
        match self {
            Page::Heap(p) => p.get_page_id(),
            Page::Leaf(p) => p.get_page_id(),
            Page::Internal(p) => p.get_page_id(),
        }
    }

    pub fn get_page_lsn(&self) -> Lsn {
        match self {
            Page::Heap(p) => p.get_page_lsn(),
            Page::Leaf(p) => p.get_page_lsn(),
            Page::Internal(p) => p.get_page_lsn(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        match self {
            Page::Heap(p) => p.is_dirty(),
            Page::Leaf(p) => p.is_dirty(),
            Page::Internal(p) => p.is_dirty(),
        }
    }

    pub fn clear_dirty(&mut self) {
        match self {
            Page::Heap(p) => p.clear_dirty(),
            Page::Leaf(p) => p.clear_dirty(),
            Page::Internal(p) => p.clear_dirty(),
        }
    }

    pub fn to_bytes(&mut self) -> Vec<u8> {
        match self {
            Page::Heap(p) => p.to_bytes(),
            Page::Leaf(p) => p.to_bytes(),
            Page::Internal(p) => p.to_bytes(),
        }
    }

    /// Next page in a chain: the heap `next_page_id` or the leaf sibling.
    /// Used when walking a file's pages for bulk free.
    pub fn get_next_page_id(&self) -> Option<PageId> {
        match self {
            Page::Heap(p) => {
                let next = p.get_next_page_id();
                if next == 0 {
                    None
                } else {
                    Some(next)
                }
            }
            Page::Leaf(p) => p.get_next_leaf_page_id(),
            Page::Internal(_) => None,
        }
    }

    pub fn as_heap_mut(&mut self) -> Result<&mut HeapPage, DbError> {
        match self {
            Page::Heap(p) => Ok(p),
            _ => Err(DbError::corruption("expected a heap page")),
        }
    }

    pub fn as_heap(&self) -> Result<&HeapPage, DbError> {
        match self {
            Page::Heap(p) => Ok(p),
            _ => Err(DbError::corruption("expected a heap page")),
        }
    }

    pub fn as_leaf_mut(&mut self) -> Result<&mut LeafPage, DbError> {
        match self {
            Page::Leaf(p) => Ok(p),
            _ => Err(DbError::corruption("expected a leaf page")),
        }
    }

    pub fn as_leaf(&self) -> Result<&LeafPage, DbError> {
        match self {
            Page::Leaf(p) => Ok(p),
            _ => Err(DbError::corruption("expected a leaf page")),
        }
    }

    pub fn as_internal_mut(&mut self) -> Result<&mut InternalPage, DbError> {
        match self {
            Page::Internal(p) => Ok(p),
            _ => Err(DbError::corruption("expected an internal page")),
        }
    }

    pub fn as_internal(&self) -> Result<&InternalPage, DbError> {
        match self {
            Page::Internal(p) => Ok(p),
            _ => Err(DbError::corruption("expected an internal page")),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Page::Leaf(_))
    }
}
