//! B+tree index manager.
//!
//! One manager per index; it holds the index's buffer pool, the catalog
//! entry (for the root pointer), the key column types, and the uniqueness
//! flag. Inserts split upward to the root; deletes redistribute from a
//! sibling when possible and merge otherwise, collapsing the root when an
//! internal root runs empty.

use log::debug;

use crate::{
    catalog::Catalog,
    error::DbError,
    storage::{
        buffer_pool::BufferPool,
        key::Key,
        page::{ChildPos, Page, PageType},
    },
    types::{DbResult, Lsn, PageId, Pod, RowId},
    utils::HandyRwLock,
};

pub struct BTreeManager {
    buffer_pool: Pod<BufferPool>,
    catalog: Pod<Catalog>,
    table_name: String,
    index_name: String,
    key_col_types: Vec<u8>,
    is_unique: bool,
    root_page_id: Option<PageId>,
}

impl BTreeManager {
    pub fn new(
        buffer_pool: Pod<BufferPool>,
        catalog: Pod<Catalog>,
        table_name: &str,
        index_name: &str,
    ) -> Result<Self, DbError> {
        let (key_col_types, is_unique, root_page_id) = {
            let catalog_guard = catalog.rl();
            let info = catalog_guard.get_index(table_name, index_name)?;
            (info.key_col_types.clone(), info.is_unique, info.root_page_id)
        };
        Ok(Self {
            buffer_pool,
            catalog,
            table_name: table_name.to_string(),
            index_name: index_name.to_string(),
            key_col_types,
            is_unique,
            root_page_id,
        })
    }

    fn set_root(&mut self, root: PageId) -> DbResult {
        self.root_page_id = Some(root);
        self.catalog
            .wl()
            .update_index_root_page(&self.table_name, &self.index_name, root)
    }

    fn get_page(&self, page_id: PageId) -> Result<Pod<Page>, DbError> {
        self.buffer_pool.wl().get_page(page_id, PageType::Leaf)
    }

    fn unpin(&self, page_id: PageId, dirty: bool) {
        self.buffer_pool.wl().unpin_page(page_id, dirty);
    }

    pub fn search(&self, key: &Key) -> Result<Option<RowId>, DbError> {
        let mut current = match self.root_page_id {
            None => return Ok(None),
            Some(pid) => pid,
        };
        loop {
            let page = self.get_page(current)?;
            let step = {
                let guard = page.rl();
                match &*guard {
                    Page::Leaf(leaf) => Ok(leaf.search(key)?),
                    Page::Internal(internal) => Err(internal.find_child(key)?),
                    Page::Heap(_) => {
                        return Err(DbError::corruption(
                            "heap page found inside a B+tree file",
                        ))
                    }
                }
            };
            self.unpin(current, false);
            match step {
                Ok(result) => return Ok(result),
                Err(child) => current = child,
            }
        }
    }

    /// Root-to-leaf page id path for `key`.
    fn find_path_to_leaf(&self, key: &Key) -> Result<Vec<PageId>, DbError> {
        let mut path = Vec::new();
        let mut current = self
            .root_page_id
            .ok_or_else(|| DbError::internal("descend into an empty tree"))?;
        loop {
            path.push(current);
            let page = self.get_page(current)?;
            let next = {
                let guard = page.rl();
                match &*guard {
                    Page::Leaf(_) => None,
                    Page::Internal(internal) => Some(internal.find_child(key)?),
                    Page::Heap(_) => {
                        return Err(DbError::corruption(
                            "heap page found inside a B+tree file",
                        ))
                    }
                }
            };
            self.unpin(current, false);
            match next {
                None => return Ok(path),
                Some(child) => current = child,
            }
        }
    }

    pub fn insert(&mut self, key: &Key, row_id: RowId, lsn: Lsn) -> DbResult {
        // an empty tree grows its first leaf, which becomes the root
        if self.root_page_id.is_none() {
            let page = self.buffer_pool.wl().new_page(PageType::Leaf)?;
            let page_id = page.rl().get_page_id();
            let result = page
                .wl()
                .as_leaf_mut()
                .and_then(|leaf| leaf.insert(key, row_id, self.is_unique, lsn));
            self.unpin(page_id, true);
            result?;
            self.set_root(page_id)?;
            return Ok(());
        }

        let path = self.find_path_to_leaf(key)?;
        let leaf_page_id = *path.last().unwrap();
        let page = self.get_page(leaf_page_id)?;
        let fit = {
            let mut guard = page.wl();
            guard
                .as_leaf_mut()
                .and_then(|leaf| leaf.insert(key, row_id, self.is_unique, lsn))
        };
        self.unpin(leaf_page_id, true);
        if fit? {
            return Ok(());
        }

        self.handle_split(&path, key, row_id, lsn)
    }

    /// The leaf on `path` is full: split it and propagate separators upward,
    /// growing a new root if the split reaches the top.
    fn handle_split(
        &mut self,
        path: &[PageId],
        key: &Key,
        row_id: RowId,
        lsn: Lsn,
    ) -> DbResult {
        let leaf_page_id = *path.last().unwrap();
        let leaf_pod = self.get_page(leaf_page_id)?;
        let right_pod = self.buffer_pool.wl().new_page(PageType::Leaf)?;
        let right_page_id = right_pod.rl().get_page_id();

        let min_key = {
            let mut left_guard = leaf_pod.wl();
            let mut right_guard = right_pod.wl();
            let left = left_guard.as_leaf_mut()?;
            let right = right_guard.as_leaf_mut()?;
            let min_key = left.split(right, lsn)?;
            // place the pending entry in whichever half covers it
            if key >= &min_key {
                right.insert(key, row_id, self.is_unique, lsn)?;
            } else {
                left.insert(key, row_id, self.is_unique, lsn)?;
            }
            min_key
        };
        self.unpin(leaf_page_id, true);
        self.unpin(right_page_id, true);

        let mut up_key = min_key;
        let mut new_child = right_page_id;

        // propagate into ancestors, splitting as needed
        for level in (0..path.len() - 1).rev() {
            let parent_id = path[level];
            let parent_pod = self.get_page(parent_id)?;
            let fit = {
                let mut guard = parent_pod.wl();
                guard
                    .as_internal_mut()
                    .and_then(|p| p.insert(&up_key, new_child, lsn))
            };
            self.unpin(parent_id, true);
            if fit? {
                return Ok(());
            }

            let parent_pod = self.get_page(parent_id)?;
            let right_pod = self.buffer_pool.wl().new_page(PageType::Internal)?;
            let right_id = right_pod.rl().get_page_id();
            let promoted = {
                let mut parent_guard = parent_pod.wl();
                let mut right_guard = right_pod.wl();
                let parent = parent_guard.as_internal_mut()?;
                let right = right_guard.as_internal_mut()?;
                let promoted = parent.split(right, lsn)?;
                // the pending separator still has to land somewhere
                if up_key >= promoted {
                    right.insert(&up_key, new_child, lsn)?;
                } else {
                    parent.insert(&up_key, new_child, lsn)?;
                }
                promoted
            };
            self.unpin(parent_id, true);
            self.unpin(right_id, true);

            up_key = promoted;
            new_child = right_id;
        }

        // the root itself split: grow the tree by one level
        let old_root = path[0];
        let new_root_pod = self.buffer_pool.wl().new_page(PageType::Internal)?;
        let new_root_id = new_root_pod.rl().get_page_id();
        {
            let mut guard = new_root_pod.wl();
            let root = guard.as_internal_mut()?;
            root.set_leftmost_child(old_root);
            root.insert(&up_key, new_child, lsn)?;
        }
        self.unpin(new_root_id, true);
        self.set_root(new_root_id)?;
        debug!(
            "index {}.{} grew a new root {} over {}",
            self.table_name, self.index_name, new_root_id, old_root
        );
        Ok(())
    }

    pub fn delete(&mut self, key: &Key, row_id: RowId, lsn: Lsn) -> Result<bool, DbError> {
        if self.root_page_id.is_none() {
            return Ok(false);
        }

        let path = self.find_path_to_leaf(key)?;
        let leaf_page_id = *path.last().unwrap();
        let page = self.get_page(leaf_page_id)?;
        let result = {
            let mut guard = page.wl();
            guard
                .as_leaf_mut()
                .and_then(|leaf| leaf.delete(key, row_id, lsn))
        };
        self.unpin(leaf_page_id, true);
        let (deleted, underflow) = result?;

        if !deleted {
            return Ok(false);
        }
        if underflow && path.len() > 1 {
            self.rebalance(&path, lsn)?;
        }
        Ok(true)
    }

    /// Siblings of `current` under its parent, as `(separator slot, page id)`
    /// pairs. The separator slot is the parent slot whose child is the
    /// *right* page of the pair.
    fn find_siblings(
        &self,
        parent_id: PageId,
        current: PageId,
    ) -> Result<(Option<PageId>, Option<PageId>, ChildPos), DbError> {
        let parent_pod = self.get_page(parent_id)?;
        let result = {
            let guard = parent_pod.rl();
            let parent = guard.as_internal()?;
            let pos = parent.find_child_pos(current)?.ok_or_else(|| {
                DbError::corruption("parent page does not reference its child")
            })?;
            let (left, right) = match pos {
                ChildPos::Leftmost => {
                    let right = if parent.get_entry_count() > 0 {
                        Some(parent.entry_at(0)?.1)
                    } else {
                        None
                    };
                    (None, right)
                }
                ChildPos::Slot(i) => {
                    let left = if i == 0 {
                        Some(parent.get_leftmost_child())
                    } else {
                        Some(parent.entry_at(i - 1)?.1)
                    };
                    let right = if i + 1 < parent.get_entry_count() {
                        Some(parent.entry_at(i + 1)?.1)
                    } else {
                        None
                    };
                    (left, right)
                }
            };
            (left, right, pos)
        };
        self.unpin(parent_id, false);
        Ok(result)
    }

    fn rebalance(&mut self, path: &[PageId], lsn: Lsn) -> DbResult {
        let current = *path.last().unwrap();
        let parent_id = path[path.len() - 2];
        let (left, right, pos) = self.find_siblings(parent_id, current)?;

        if self.try_redistribute(parent_id, current, left, right, pos, lsn)? {
            return Ok(());
        }

        self.merge(parent_id, current, left, right, pos, lsn)?;

        // the parent lost a separator; it may now underflow itself
        let parent_pod = self.get_page(parent_id)?;
        let (parent_entries, parent_min) = {
            let guard = parent_pod.rl();
            let parent = guard.as_internal()?;
            (parent.get_entry_count(), parent.min_entries())
        };
        self.unpin(parent_id, false);

        if path.len() - 1 > 1 {
            if parent_entries < parent_min {
                self.rebalance(&path[..path.len() - 1], lsn)?;
            }
        } else if parent_entries == 0 {
            // empty internal root: its only child becomes the new root
            let parent_pod = self.get_page(parent_id)?;
            let new_root = parent_pod.rl().as_internal()?.get_leftmost_child();
            self.unpin(parent_id, false);
            self.buffer_pool.wl().free_physical(parent_id)?;
            self.set_root(new_root)?;
            debug!(
                "index {}.{} collapsed its root to {}",
                self.table_name, self.index_name, new_root
            );
        }
        Ok(())
    }

    /// Borrow one entry from a sibling that can spare it; rewrite the parent
    /// separator whose right subtree's minimum changed.
    fn try_redistribute(
        &mut self,
        parent_id: PageId,
        current: PageId,
        left: Option<PageId>,
        right: Option<PageId>,
        pos: ChildPos,
        lsn: Lsn,
    ) -> Result<bool, DbError> {
        let current_pod = self.get_page(current)?;
        let current_is_leaf = current_pod.rl().is_leaf();
        self.unpin(current, false);

        if !current_is_leaf {
            return self.try_redistribute_internal(parent_id, current, left, right, pos, lsn);
        }

        if let Some(left_id) = left {
            let left_pod = self.get_page(left_id)?;
            let can_lend = left_pod.rl().as_leaf()?.can_lend()?;
            if can_lend {
                let (borrow_key, borrow_rid) = {
                    let guard = left_pod.rl();
                    let leaf = guard.as_leaf()?;
                    leaf.entry_at(leaf.get_entry_count() - 1)?
                };
                {
                    let mut guard = left_pod.wl();
                    guard.as_leaf_mut()?.delete(&borrow_key, borrow_rid, lsn)?;
                }
                self.unpin(left_id, true);

                let current_pod = self.get_page(current)?;
                {
                    let mut guard = current_pod.wl();
                    guard
                        .as_leaf_mut()?
                        .insert(&borrow_key, borrow_rid, false, lsn)?;
                }
                self.unpin(current, true);

                // current's minimum changed: its separator follows
                self.rewrite_separator_for(parent_id, pos, &borrow_key, lsn)?;
                return Ok(true);
            }
            self.unpin(left_id, false);
        }

        if let Some(right_id) = right {
            let right_pod = self.get_page(right_id)?;
            let can_lend = right_pod.rl().as_leaf()?.can_lend()?;
            if can_lend {
                let (borrow_key, borrow_rid) = {
                    let guard = right_pod.rl();
                    guard.as_leaf()?.entry_at(0)?
                };
                let right_new_min = {
                    let mut guard = right_pod.wl();
                    let leaf = guard.as_leaf_mut()?;
                    leaf.delete(&borrow_key, borrow_rid, lsn)?;
                    leaf.min_key()?
                };
                self.unpin(right_id, true);

                let current_pod = self.get_page(current)?;
                {
                    let mut guard = current_pod.wl();
                    guard
                        .as_leaf_mut()?
                        .insert(&borrow_key, borrow_rid, false, lsn)?;
                }
                self.unpin(current, true);

                // the right sibling's minimum changed: rewrite its separator
                let right_pos = match pos {
                    ChildPos::Leftmost => ChildPos::Slot(0),
                    ChildPos::Slot(i) => ChildPos::Slot(i + 1),
                };
                self.rewrite_separator_for(parent_id, right_pos, &right_new_min, lsn)?;
                return Ok(true);
            }
            self.unpin(right_id, false);
        }

        Ok(false)
    }

    /// Internal-node redistribution rotates an entry through the parent
    /// separator.
    fn try_redistribute_internal(
        &mut self,
        parent_id: PageId,
        current: PageId,
        left: Option<PageId>,
        right: Option<PageId>,
        pos: ChildPos,
        lsn: Lsn,
    ) -> Result<bool, DbError> {
        if let (Some(left_id), ChildPos::Slot(sep_idx)) = (left, pos) {
            let left_pod = self.get_page(left_id)?;
            let can_lend = {
                let guard = left_pod.rl();
                let node = guard.as_internal()?;
                node.get_entry_count() > node.min_entries()
            };
            if can_lend {
                let (left_last_key, left_last_child) = {
                    let guard = left_pod.rl();
                    let node = guard.as_internal()?;
                    node.entry_at(node.get_entry_count() - 1)?
                };
                {
                    let mut guard = left_pod.wl();
                    let node = guard.as_internal_mut()?;
                    let last = node.get_entry_count() - 1;
                    node.delete_entry_by_index(last, lsn)?;
                }
                self.unpin(left_id, true);

                let sep_key = {
                    let parent_pod = self.get_page(parent_id)?;
                    let key = parent_pod.rl().as_internal()?.entry_at(sep_idx)?.0;
                    self.unpin(parent_id, false);
                    key
                };

                // the separator descends in front of current; the lent child
                // becomes current's leftmost; the lent key ascends
                let current_pod = self.get_page(current)?;
                {
                    let mut guard = current_pod.wl();
                    let node = guard.as_internal_mut()?;
                    let old_leftmost = node.get_leftmost_child();
                    node.set_leftmost_child(left_last_child);
                    node.insert(&sep_key, old_leftmost, lsn)?;
                }
                self.unpin(current, true);

                let parent_pod = self.get_page(parent_id)?;
                {
                    let mut guard = parent_pod.wl();
                    guard
                        .as_internal_mut()?
                        .replace_key_at(sep_idx, &left_last_key, lsn)?;
                }
                self.unpin(parent_id, true);
                return Ok(true);
            }
            self.unpin(left_id, false);
        }

        if let Some(right_id) = right {
            let sep_idx = match pos {
                ChildPos::Leftmost => 0,
                ChildPos::Slot(i) => i + 1,
            };
            let right_pod = self.get_page(right_id)?;
            let can_lend = {
                let guard = right_pod.rl();
                let node = guard.as_internal()?;
                node.get_entry_count() > node.min_entries()
            };
            if can_lend {
                let (right_first_key, right_first_child, right_leftmost) = {
                    let guard = right_pod.rl();
                    let node = guard.as_internal()?;
                    let (k, c) = node.entry_at(0)?;
                    (k, c, node.get_leftmost_child())
                };
                {
                    let mut guard = right_pod.wl();
                    let node = guard.as_internal_mut()?;
                    node.set_leftmost_child(right_first_child);
                    node.delete_entry_by_index(0, lsn)?;
                }
                self.unpin(right_id, true);

                let sep_key = {
                    let parent_pod = self.get_page(parent_id)?;
                    let key = parent_pod.rl().as_internal()?.entry_at(sep_idx)?.0;
                    self.unpin(parent_id, false);
                    key
                };

                // separator descends onto current's tail, pointing at the
                // right sibling's old leftmost child
                let current_pod = self.get_page(current)?;
                {
                    let mut guard = current_pod.wl();
                    guard.as_internal_mut()?.insert(&sep_key, right_leftmost, lsn)?;
                }
                self.unpin(current, true);

                let parent_pod = self.get_page(parent_id)?;
                {
                    let mut guard = parent_pod.wl();
                    guard
                        .as_internal_mut()?
                        .replace_key_at(sep_idx, &right_first_key, lsn)?;
                }
                self.unpin(parent_id, true);
                return Ok(true);
            }
            self.unpin(right_id, false);
        }

        Ok(false)
    }

    fn rewrite_separator_for(
        &mut self,
        parent_id: PageId,
        child_pos: ChildPos,
        new_key: &Key,
        lsn: Lsn,
    ) -> DbResult {
        // the leftmost child has no separator above it
        if let ChildPos::Slot(idx) = child_pos {
            let parent_pod = self.get_page(parent_id)?;
            {
                let mut guard = parent_pod.wl();
                guard.as_internal_mut()?.replace_key_at(idx, new_key, lsn)?;
            }
            self.unpin(parent_id, true);
        }
        Ok(())
    }

    /// Merge `current` with a sibling. Merging into the left sibling is
    /// preferred; when there is no left sibling, the right sibling is
    /// absorbed into `current` so leaf-chain pointers from cousins stay
    /// valid.
    fn merge(
        &mut self,
        parent_id: PageId,
        current: PageId,
        left: Option<PageId>,
        right: Option<PageId>,
        pos: ChildPos,
        lsn: Lsn,
    ) -> DbResult {
        if let (Some(left_id), ChildPos::Slot(sep_idx)) = (left, pos) {
            self.merge_pair(parent_id, left_id, current, sep_idx, lsn)?;
            self.buffer_pool.wl().free_physical(current)?;
            return Ok(());
        }
        if let Some(right_id) = right {
            let sep_idx = match pos {
                ChildPos::Leftmost => 0,
                ChildPos::Slot(i) => i + 1,
            };
            self.merge_pair(parent_id, current, right_id, sep_idx, lsn)?;
            self.buffer_pool.wl().free_physical(right_id)?;
            return Ok(());
        }
        Err(DbError::corruption(
            "underfull page has neither sibling to merge with",
        ))
    }

    /// Absorb `right_id` into `left_id` and drop the separator at `sep_idx`
    /// (the parent slot pointing at `right_id`).
    fn merge_pair(
        &mut self,
        parent_id: PageId,
        left_id: PageId,
        right_id: PageId,
        sep_idx: usize,
        lsn: Lsn,
    ) -> DbResult {
        let sep_key = {
            let parent_pod = self.get_page(parent_id)?;
            let key = parent_pod.rl().as_internal()?.entry_at(sep_idx)?.0;
            self.unpin(parent_id, false);
            key
        };

        let left_pod = self.get_page(left_id)?;
        let right_pod = self.get_page(right_id)?;
        {
            let mut left_guard = left_pod.wl();
            let mut right_guard = right_pod.wl();
            match (&mut *left_guard, &mut *right_guard) {
                (Page::Leaf(left), Page::Leaf(right)) => {
                    for (key, row_id) in right.entries()? {
                        left.insert(&key, row_id, false, lsn)?;
                    }
                    left.set_next_leaf_page_id(right.get_next_leaf_page_id());
                    left.set_page_lsn(lsn);
                }
                (Page::Internal(left), Page::Internal(right)) => {
                    // the separator descends between the two halves
                    left.insert(&sep_key, right.get_leftmost_child(), lsn)?;
                    for (key, child) in right.entries()? {
                        left.insert(&key, child, lsn)?;
                    }
                }
                _ => {
                    return Err(DbError::corruption(
                        "sibling pages disagree about their level",
                    ))
                }
            }
        }
        self.unpin(left_id, true);
        self.unpin(right_id, true);

        let parent_pod = self.get_page(parent_id)?;
        {
            let mut guard = parent_pod.wl();
            guard.as_internal_mut()?.delete_entry_by_index(sep_idx, lsn)?;
        }
        self.unpin(parent_id, true);
        Ok(())
    }
}
