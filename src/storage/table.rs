//! The table facade and the B+ tree algorithms.
//!
//! The tree lives entirely in pages resolved through the pager; parent and
//! child links are page numbers, never references, so restructuring can
//! never invalidate a pointer. The root is always page 0: splitting the
//! root copies its content to a fresh page and re-initializes page 0 as the
//! new root, and collapsing does the reverse, so external references to
//! "root = page 0" stay valid across the table's whole life.
//!
//! Mutating operations run as short pinned phases (`Pager::with_scope`):
//! each phase fetches the two or three pages it works on, reads out what the
//! next phase needs (page numbers, keys, counts), and releases its pins
//! before recursing. Deep split or merge cascades therefore never pin more
//! pages than the cache holds slots for.

use crate::errors::Error;
use crate::storage::cursor::Cursor;
use crate::storage::node::{
    Node, NodeType, INTERNAL_NODE_MAX_KEYS, INTERNAL_NODE_MIN_KEYS, INVALID_PAGE_NUM,
    LEAF_NODE_LEFT_SPLIT_COUNT, LEAF_NODE_MAX_CELLS, LEAF_NODE_MIN_CELLS,
    LEAF_NODE_RIGHT_SPLIT_COUNT,
};
use crate::storage::pager::{lock_page, Pager};
use crate::storage::row::Row;
use std::path::Path;
use tracing::{debug, warn};

pub struct Table {
    pub pager: Pager,
    pub root_page_num: u32,
}

impl Table {
    /// Opens the database file, initializing page 0 as an empty root leaf
    /// for a brand-new file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Table, Error> {
        let mut pager = Pager::open(path.as_ref())?;
        let root_page_num = 0;
        if pager.num_pages() == 0 {
            pager.with_scope(|pager, scope| {
                let page = pager.fetch(root_page_num, scope)?;
                let mut node = lock_page(&page)?;
                node.init_leaf();
                node.set_root(true);
                Ok(())
            })?;
        }
        Ok(Table {
            pager,
            root_page_num,
        })
    }

    /// Writes the free-page header, flushes every resident page, and syncs.
    /// A clean close is required for durability.
    pub fn close(mut self) -> Result<(), Error> {
        self.pager.close()
    }

    pub fn insert(&mut self, row: &Row) -> Result<(), Error> {
        insert_row(self, row)
    }

    pub fn delete(&mut self, key: u32) -> Result<(), Error> {
        delete_row(self, key)
    }

    /// Calls `emit` for every row, in ascending key order.
    pub fn select_all(&mut self, mut emit: impl FnMut(&Row)) -> Result<(), Error> {
        let mut cursor = Cursor::start(self)?;
        while !cursor.end_of_table {
            let row = cursor.read_row(self)?;
            emit(&row);
            cursor.advance(self)?;
        }
        Ok(())
    }

    pub fn rows(&mut self) -> Result<Vec<Row>, Error> {
        let mut rows = Vec::new();
        self.select_all(|row| rows.push(row.clone()))?;
        Ok(rows)
    }

    /// Indented rendering of the tree, for the `.btree` debug command.
    pub fn print_tree(&mut self) -> Result<String, Error> {
        let mut out = String::new();
        render_node(self, self.root_page_num, 0, &mut out)?;
        Ok(out)
    }
}

/// Maximum key in the subtree rooted at `page_num`: the last cell of the
/// rightmost leaf. Pages visited are pinned one step at a time.
fn node_max_key(pager: &mut Pager, page_num: u32) -> Result<u32, Error> {
    let mut current = page_num;
    loop {
        enum Step {
            Key(u32),
            Descend(u32),
        }
        let step = pager.with_scope(|pager, scope| {
            let page = pager.fetch(current, scope)?;
            let node = lock_page(&page)?;
            match node.node_type()? {
                NodeType::Leaf => {
                    let num_cells = node.num_cells();
                    if num_cells == 0 {
                        return Err(err!(Storage, "max key of empty leaf {}", current));
                    }
                    Ok(Step::Key(node.leaf_key(num_cells - 1)?))
                }
                NodeType::Internal => {
                    let right_child = node.right_child();
                    if right_child == INVALID_PAGE_NUM {
                        return Err(err!(Storage, "max key of empty internal node {}", current));
                    }
                    Ok(Step::Descend(right_child))
                }
            }
        })?;
        match step {
            Step::Key(key) => return Ok(key),
            Step::Descend(child) => current = child,
        }
    }
}

/// Index of `child_page` among `node`'s children; `num_keys` for the right
/// child.
fn internal_child_index(node: &Node, child_page: u32) -> Result<u32, Error> {
    let num_keys = node.num_keys();
    if node.right_child() == child_page {
        return Ok(num_keys);
    }
    for i in 0..num_keys {
        if node.internal_child(i)? == child_page {
            return Ok(i);
        }
    }
    Err(err!(
        Storage,
        "page {} not found among its parent's children",
        child_page
    ))
}

/// A node's maximum key changed from `old_key` to `new_key`; repairs the
/// separator tracking it. While the node is its parent's right child the
/// parent holds no separator for it, but the parent's own subtree maximum
/// changed too, so the update climbs until it reaches the root or an
/// ancestor holding a separator cell.
fn propagate_key_update(
    table: &mut Table,
    start_page: u32,
    old_key: u32,
    new_key: u32,
) -> Result<(), Error> {
    if old_key == new_key {
        return Ok(());
    }
    let mut child_page = start_page;
    loop {
        let (is_root, parent_page) = table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(child_page, scope)?;
            let node = lock_page(&page)?;
            Ok((node.is_root(), node.parent()))
        })?;
        if is_root {
            return Ok(());
        }
        let climbed = table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(parent_page, scope)?;
            let mut parent = lock_page(&page)?;
            if parent.right_child() == child_page {
                Ok(true)
            } else {
                parent.update_key(old_key, new_key)?;
                Ok(false)
            }
        })?;
        if !climbed {
            return Ok(());
        }
        child_page = parent_page;
    }
}

pub fn insert_row(table: &mut Table, row: &Row) -> Result<(), Error> {
    let key = row.id;
    let value = row.serialize()?;
    debug!(key, "Inserting a row...");

    let cursor = Cursor::find(table, key)?;
    let page_num = cursor.page_num;
    let duplicate = table.pager.with_scope(|pager, scope| {
        let page = pager.fetch(page_num, scope)?;
        let node = lock_page(&page)?;
        Ok(cursor.cell_num < node.num_cells() && node.leaf_key(cursor.cell_num)? == key)
    })?;
    if duplicate {
        return Err(Error::DuplicateKey);
    }
    leaf_node_insert(table, page_num, cursor.cell_num, key, &value)
}

pub fn delete_row(table: &mut Table, key: u32) -> Result<(), Error> {
    debug!(key, "Deleting a row...");

    let cursor = Cursor::find(table, key)?;
    let page_num = cursor.page_num;
    let found = table.pager.with_scope(|pager, scope| {
        let page = pager.fetch(page_num, scope)?;
        let node = lock_page(&page)?;
        Ok(cursor.cell_num < node.num_cells() && node.leaf_key(cursor.cell_num)? == key)
    })?;
    if !found {
        return Err(Error::KeyNotFound);
    }
    leaf_node_delete(table, page_num, cursor.cell_num)
}

/// Writes `(key, value)` at `cell_num`, shifting later cells right, or
/// splits the leaf when it is full.
fn leaf_node_insert(
    table: &mut Table,
    page_num: u32,
    cell_num: u32,
    key: u32,
    value: &[u8],
) -> Result<(), Error> {
    let inserted = table.pager.with_scope(|pager, scope| {
        let page = pager.fetch(page_num, scope)?;
        let mut node = lock_page(&page)?;
        let num_cells = node.num_cells();
        if num_cells as usize >= LEAF_NODE_MAX_CELLS {
            return Ok(false);
        }
        if cell_num < num_cells {
            // Make room for the new cell.
            for i in (cell_num + 1..=num_cells).rev() {
                node.copy_leaf_cell(i - 1, i)?;
            }
        }
        node.set_num_cells(num_cells + 1);
        node.set_leaf_key(cell_num, key)?;
        node.set_leaf_value(cell_num, value)?;
        Ok(true)
    })?;
    if inserted {
        Ok(())
    } else {
        leaf_node_split_and_insert(table, page_num, cell_num, key, value)
    }
}

/// Creates a sibling leaf and moves half the cells over, inserting the new
/// value into whichever half it lands in, then updates the parent (or
/// creates a new root).
fn leaf_node_split_and_insert(
    table: &mut Table,
    page_num: u32,
    cell_num: u32,
    key: u32,
    value: &[u8],
) -> Result<(), Error> {
    warn!(page_num, key, "Leaf node full. Splitting...");
    let new_page_num = table.pager.unused_page_num();

    let (was_root, parent_page, old_max, new_left_max) =
        table.pager.with_scope(|pager, scope| {
            let old_page = pager.fetch(page_num, scope)?;
            let new_page = pager.fetch(new_page_num, scope)?;
            let mut old_node = lock_page(&old_page)?;
            let mut new_node = lock_page(&new_page)?;

            let old_max = old_node.leaf_key(old_node.num_cells() - 1)?;
            new_node.init_leaf();
            new_node.set_parent(old_node.parent());
            // The old leaf's sibling becomes the new leaf, and the new
            // leaf's sibling becomes whatever the old leaf's sibling was.
            new_node.set_next_leaf(old_node.next_leaf());
            old_node.set_next_leaf(new_page_num);

            // All existing cells plus the new one are divided evenly
            // between the old (left) and new (right) nodes. Starting from
            // the right, move each cell to its new position.
            let snapshot = old_node.clone();
            for i in (0..=LEAF_NODE_MAX_CELLS).rev() {
                let dest = if i >= LEAF_NODE_LEFT_SPLIT_COUNT {
                    &mut *new_node
                } else {
                    &mut *old_node
                };
                let index_within_node = (i % LEAF_NODE_LEFT_SPLIT_COUNT) as u32;
                if i == cell_num as usize {
                    dest.set_leaf_key(index_within_node, key)?;
                    dest.set_leaf_value(index_within_node, value)?;
                } else if i > cell_num as usize {
                    dest.write_leaf_cell(index_within_node, snapshot.leaf_cell(i as u32 - 1)?)?;
                } else {
                    dest.write_leaf_cell(index_within_node, snapshot.leaf_cell(i as u32)?)?;
                }
            }
            old_node.set_num_cells(LEAF_NODE_LEFT_SPLIT_COUNT as u32);
            new_node.set_num_cells(LEAF_NODE_RIGHT_SPLIT_COUNT as u32);

            let new_left_max = old_node.leaf_key(LEAF_NODE_LEFT_SPLIT_COUNT as u32 - 1)?;
            Ok((old_node.is_root(), old_node.parent(), old_max, new_left_max))
        })?;

    if was_root {
        create_new_root(table, new_page_num)
    } else {
        table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(parent_page, scope)?;
            let result = lock_page(&page)?.update_key(old_max, new_left_max);
            result
        })?;
        internal_node_insert(table, parent_page, new_page_num)
    }
}

/// Splits the root. The old root's content is copied to a fresh page which
/// becomes the left child; the address of the right child is passed in; and
/// page 0 is re-initialized as a new internal root over the two, so the
/// root page number never changes.
fn create_new_root(table: &mut Table, right_child_page_num: u32) -> Result<(), Error> {
    debug!(right_child_page_num, "Creating a new root.");
    let root_page_num = table.root_page_num;
    let old_root_max = node_max_key(&mut table.pager, root_page_num)?;
    let left_child_page_num = table.pager.unused_page_num();

    let left_children = table.pager.with_scope(|pager, scope| {
        let root_page = pager.fetch(root_page_num, scope)?;
        let right_page = pager.fetch(right_child_page_num, scope)?;
        let left_page = pager.fetch(left_child_page_num, scope)?;
        let mut root = lock_page(&root_page)?;
        let mut right_child = lock_page(&right_page)?;
        let mut left_child = lock_page(&left_page)?;

        // When an internal root splits, the incoming right child is a page
        // the split has not shaped yet (possibly recycled bytes).
        let root_was_internal = root.node_type()? == NodeType::Internal;
        if root_was_internal {
            right_child.init_internal();
        }

        // The old root is copied to the left child so the root page can be
        // reused.
        left_child.data = root.data;
        left_child.set_root(false);

        let left_children = if root_was_internal {
            let num_keys = left_child.num_keys();
            let mut children = Vec::with_capacity(num_keys as usize + 1);
            for i in 0..=num_keys {
                children.push(left_child.internal_child(i)?);
            }
            children
        } else {
            Vec::new()
        };

        // Page 0 becomes a new internal root with one key and two children.
        root.init_internal();
        root.set_root(true);
        root.set_num_keys(1);
        root.set_internal_cell(0, left_child_page_num, old_root_max)?;
        root.set_right_child(right_child_page_num);

        left_child.set_parent(root_page_num);
        right_child.set_parent(root_page_num);
        Ok(left_children)
    })?;

    // The copy took the old root's children with it; point them at their
    // new parent page.
    for child in left_children {
        table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(child, scope)?;
            lock_page(&page)?.set_parent(left_child_page_num);
            Ok(())
        })?;
    }
    Ok(())
}

/// Adds a `(child, key)` pair to `parent` for `child_page`. The rightmost
/// child pointer is stored apart from the cells, so a child whose maximum
/// exceeds the current right child's replaces it and the old right child
/// moves into the cell array.
fn internal_node_insert(table: &mut Table, parent_page: u32, child_page: u32) -> Result<(), Error> {
    let child_max = node_max_key(&mut table.pager, child_page)?;

    let (num_keys, right_child, index) = table.pager.with_scope(|pager, scope| {
        let page = pager.fetch(parent_page, scope)?;
        let parent = lock_page(&page)?;
        let index = parent.internal_find_child(child_max)?;
        Ok((parent.num_keys(), parent.right_child(), index))
    })?;

    if num_keys as usize >= INTERNAL_NODE_MAX_KEYS {
        return internal_node_split_and_insert(table, parent_page, child_page);
    }

    // An internal node with an INVALID right child is empty; the first
    // child becomes the right child. The split path relies on this when it
    // transfers children into a freshly initialized node.
    if right_child == INVALID_PAGE_NUM {
        return table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(parent_page, scope)?;
            lock_page(&page)?.set_right_child(child_page);
            Ok(())
        });
    }

    let right_max = node_max_key(&mut table.pager, right_child)?;

    table.pager.with_scope(|pager, scope| {
        let page = pager.fetch(parent_page, scope)?;
        let mut parent = lock_page(&page)?;
        parent.set_num_keys(num_keys + 1);
        if child_max > right_max {
            // Replace the right child; its cell records the old one.
            parent.set_internal_cell(num_keys, right_child, right_max)?;
            parent.set_right_child(child_page);
        } else {
            // Make room for the new cell.
            for i in (index + 1..=num_keys).rev() {
                parent.copy_internal_cell(i - 1, i)?;
            }
            parent.set_internal_cell(index, child_page, child_max)?;
        }
        Ok(())
    })
}

/// Splits a full internal node: a sibling takes the upper half of its
/// children (right child first, then the upper cells), the pending child is
/// routed to whichever half covers its key range, and the parent separator
/// is repaired. Splitting the root goes through [`create_new_root`] first.
fn internal_node_split_and_insert(
    table: &mut Table,
    parent_page_num: u32,
    child_page_num: u32,
) -> Result<(), Error> {
    warn!(
        parent_page_num,
        child_page_num, "Internal node full. Splitting..."
    );

    let mut old_page_num = parent_page_num;
    let old_max = node_max_key(&mut table.pager, old_page_num)?;
    let child_max = node_max_key(&mut table.pager, child_page_num)?;
    let new_page_num = table.pager.unused_page_num();

    let splitting_root = table.pager.with_scope(|pager, scope| {
        let page = pager.fetch(old_page_num, scope)?;
        let is_root = lock_page(&page)?.is_root();
        Ok(is_root)
    })?;

    let parent_page;
    if splitting_root {
        create_new_root(table, new_page_num)?;
        parent_page = table.root_page_num;
        // The old content now lives in the root's first child; that page is
        // the one being split.
        old_page_num = table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(parent_page, scope)?;
            let child = lock_page(&page)?.internal_child(0);
            child
        })?;
    } else {
        parent_page = table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(old_page_num, scope)?;
            let parent = lock_page(&page)?.parent();
            Ok(parent)
        })?;
        table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(new_page_num, scope)?;
            lock_page(&page)?.init_internal();
            Ok(())
        })?;
    }

    // Detach the upper half: the right child first, then the cells from
    // MAX_KEYS-1 down to MAX_KEYS/2+1.
    let moved = table.pager.with_scope(|pager, scope| {
        let page = pager.fetch(old_page_num, scope)?;
        let mut old_node = lock_page(&page)?;

        let mut moved = vec![old_node.right_child()];
        old_node.set_right_child(INVALID_PAGE_NUM);

        let mut num_keys = old_node.num_keys();
        for i in ((INTERNAL_NODE_MAX_KEYS / 2 + 1)..INTERNAL_NODE_MAX_KEYS).rev() {
            moved.push(old_node.internal_child(i as u32)?);
            num_keys -= 1;
            old_node.set_num_keys(num_keys);
        }

        // The old node's highest remaining cell child becomes its right
        // child.
        let new_right = old_node.internal_child(num_keys - 1)?;
        old_node.set_right_child(new_right);
        old_node.set_num_keys(num_keys - 1);
        Ok(moved)
    })?;

    for page in moved {
        internal_node_insert(table, new_page_num, page)?;
        table.pager.with_scope(|pager, scope| {
            let child = pager.fetch(page, scope)?;
            lock_page(&child)?.set_parent(new_page_num);
            Ok(())
        })?;
    }

    // Route the pending child by its key range.
    let max_after_split = node_max_key(&mut table.pager, old_page_num)?;
    let destination = if child_max < max_after_split {
        old_page_num
    } else {
        new_page_num
    };
    internal_node_insert(table, destination, child_page_num)?;
    table.pager.with_scope(|pager, scope| {
        let child = pager.fetch(child_page_num, scope)?;
        lock_page(&child)?.set_parent(destination);
        Ok(())
    })?;

    table.pager.with_scope(|pager, scope| {
        let page = pager.fetch(parent_page, scope)?;
        let result = lock_page(&page)?.update_key(old_max, max_after_split);
        result
    })?;

    if !splitting_root {
        internal_node_insert(table, parent_page, new_page_num)?;
        table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(new_page_num, scope)?;
            lock_page(&page)?.set_parent(parent_page);
            Ok(())
        })?;
    }
    Ok(())
}

/// Removes the cell at `cell_num`, repairs the parent separator when the
/// leaf's maximum changed, and rebalances when the leaf underflows.
fn leaf_node_delete(table: &mut Table, page_num: u32, cell_num: u32) -> Result<(), Error> {
    let (num_cells, is_root, deleted_key, new_max) = table.pager.with_scope(|pager, scope| {
        let page = pager.fetch(page_num, scope)?;
        let mut node = lock_page(&page)?;
        let num_cells = node.num_cells();
        let deleted_key = node.leaf_key(cell_num)?;
        for i in cell_num + 1..num_cells {
            node.copy_leaf_cell(i, i - 1)?;
        }
        node.set_num_cells(num_cells - 1);
        let new_max = if num_cells > 1 {
            Some(node.leaf_key(num_cells - 2)?)
        } else {
            None
        };
        Ok((num_cells, node.is_root(), deleted_key, new_max))
    })?;

    // Deleting the last cell lowers this leaf's maximum; the separator
    // tracking it may sit several levels up the right spine.
    let was_last = cell_num + 1 == num_cells;
    if was_last && !is_root {
        if let Some(new_max) = new_max {
            propagate_key_update(table, page_num, deleted_key, new_max)?;
        }
    }

    if (num_cells - 1) < LEAF_NODE_MIN_CELLS as u32 && !is_root {
        leaf_node_merge(table, page_num)?;
    }
    Ok(())
}

/// Rebalances an underfilled leaf: borrow one cell from an adjacent sibling
/// that can spare it, else merge into the sibling and delete this leaf from
/// the parent.
fn leaf_node_merge(table: &mut Table, page_num: u32) -> Result<(), Error> {
    let (parent_page, node_cells, node_next, node_max) =
        table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(page_num, scope)?;
            let node = lock_page(&page)?;
            let node_cells = node.num_cells();
            if node_cells == 0 {
                return Err(err!(Storage, "rebalancing an empty leaf {}", page_num));
            }
            Ok((
                node.parent(),
                node_cells,
                node.next_leaf(),
                node.leaf_key(node_cells - 1)?,
            ))
        })?;

    let (index, num_keys, sibling_page, parent_is_root) =
        table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(parent_page, scope)?;
            let parent = lock_page(&page)?;
            let index = internal_child_index(&parent, page_num)?;
            let num_keys = parent.num_keys();
            let node_is_right = index == num_keys;
            if node_is_right && index == 0 {
                return Err(err!(Storage, "leaf {} has no sibling to rebalance with", page_num));
            }
            let sibling_index = if node_is_right { index - 1 } else { index + 1 };
            let sibling_page = parent.internal_child(sibling_index)?;
            Ok((index, num_keys, sibling_page, parent.is_root()))
        })?;
    let node_is_right = index == num_keys;

    let sibling_cells = table.pager.with_scope(|pager, scope| {
        let page = pager.fetch(sibling_page, scope)?;
        let num_cells = lock_page(&page)?.num_cells();
        Ok(num_cells)
    })?;

    if sibling_cells > LEAF_NODE_MIN_CELLS as u32 {
        // Borrow one cell. A left sibling gives its last cell, a right
        // sibling its first; deleting the donated cell from the sibling
        // goes through leaf_node_delete, which repairs the sibling's
        // separator when its maximum moved.
        debug!(page_num, sibling_page, "Leaf underflow. Borrowing a cell.");
        if node_is_right {
            let (borrowed_key, borrowed_value) = table.pager.with_scope(|pager, scope| {
                let page = pager.fetch(sibling_page, scope)?;
                let sibling = lock_page(&page)?;
                Ok((
                    sibling.leaf_key(sibling_cells - 1)?,
                    sibling.leaf_value(sibling_cells - 1)?.to_vec(),
                ))
            })?;
            leaf_node_insert(table, page_num, 0, borrowed_key, &borrowed_value)?;
            leaf_node_delete(table, sibling_page, sibling_cells - 1)?;
        } else {
            let (borrowed_key, borrowed_value) = table.pager.with_scope(|pager, scope| {
                let page = pager.fetch(sibling_page, scope)?;
                let sibling = lock_page(&page)?;
                Ok((sibling.leaf_key(0)?, sibling.leaf_value(0)?.to_vec()))
            })?;
            leaf_node_insert(table, page_num, node_cells, borrowed_key, &borrowed_value)?;
            // This leaf's maximum grew to the borrowed key.
            propagate_key_update(table, page_num, node_max, borrowed_key)?;
            leaf_node_delete(table, sibling_page, 0)?;
        }
        return Ok(());
    }

    // The sibling is at the minimum too: merge this leaf into it.
    warn!(page_num, sibling_page, "Leaf underflow. Merging into sibling.");
    let sibling_old_max = table.pager.with_scope(|pager, scope| {
        let page = pager.fetch(sibling_page, scope)?;
        let result = lock_page(&page)?.leaf_key(sibling_cells - 1);
        result
    })?;

    for i in 0..node_cells {
        let (key, value) = table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(page_num, scope)?;
            let node = lock_page(&page)?;
            Ok((node.leaf_key(i)?, node.leaf_value(i)?.to_vec()))
        })?;
        let slot = table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(sibling_page, scope)?;
            let result = lock_page(&page)?.leaf_find_slot(key);
            result
        })?;
        leaf_node_insert(table, sibling_page, slot, key, &value)?;
    }

    if parent_is_root && num_keys == 1 {
        // The root is left with a single leaf: collapse it back into
        // page 0 and reclaim both children.
        table.pager.with_scope(|pager, scope| {
            let sibling = pager.fetch(sibling_page, scope)?;
            let root = pager.fetch(parent_page, scope)?;
            let sibling_node = lock_page(&sibling)?;
            let mut root_node = lock_page(&root)?;
            root_node.data = sibling_node.data;
            root_node.set_root(true);
            root_node.set_next_leaf(0);
            Ok(())
        })?;
        table.pager.free_page(sibling_page);
        table.pager.free_page(page_num);
        return Ok(());
    }

    let sibling_new_max = table.pager.with_scope(|pager, scope| {
        let page = pager.fetch(sibling_page, scope)?;
        let sibling = lock_page(&page)?;
        sibling.leaf_key(sibling.num_cells() - 1)
    })?;
    propagate_key_update(table, sibling_page, sibling_old_max, sibling_new_max)?;

    // Repair the leaf chain around the disappearing node.
    if node_is_right {
        // The sibling sits immediately to the left.
        table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(sibling_page, scope)?;
            lock_page(&page)?.set_next_leaf(node_next);
            Ok(())
        })?;
    } else if let Some(predecessor) = predecessor_leaf(table, page_num)? {
        table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(predecessor, scope)?;
            lock_page(&page)?.set_next_leaf(sibling_page);
            Ok(())
        })?;
    }

    internal_node_delete(table, parent_page, page_num, index, node_max)
}

/// Leaf holding the keys just below `leaf_page`'s, or `None` for the
/// leftmost leaf. Climbs to the first ancestor where the current subtree is
/// not the leftmost child, then descends the left neighbor's right spine.
fn predecessor_leaf(table: &mut Table, leaf_page: u32) -> Result<Option<u32>, Error> {
    let mut child_page = leaf_page;
    let left_subtree = loop {
        let (is_root, parent_page) = table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(child_page, scope)?;
            let node = lock_page(&page)?;
            Ok((node.is_root(), node.parent()))
        })?;
        if is_root {
            return Ok(None);
        }
        let neighbor = table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(parent_page, scope)?;
            let parent = lock_page(&page)?;
            let index = internal_child_index(&parent, child_page)?;
            if index > 0 {
                Ok(Some(parent.internal_child(index - 1)?))
            } else {
                Ok(None)
            }
        })?;
        match neighbor {
            Some(page) => break page,
            None => child_page = parent_page,
        }
    };

    let mut current = left_subtree;
    loop {
        enum Step {
            Found,
            Descend(u32),
        }
        let step = table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(current, scope)?;
            let node = lock_page(&page)?;
            match node.node_type()? {
                NodeType::Leaf => Ok(Step::Found),
                NodeType::Internal => {
                    let right_child = node.right_child();
                    if right_child == INVALID_PAGE_NUM {
                        return Err(err!(Storage, "empty internal node {} in descent", current));
                    }
                    Ok(Step::Descend(right_child))
                }
            }
        })?;
        match step {
            Step::Found => return Ok(Some(current)),
            Step::Descend(child) => current = child,
        }
    }
}

/// Unlinks `child_page` (already drained) from `parent_page`, frees it, and
/// rebalances the parent if it underflows. `removed_max` is the child's
/// maximum before it was drained, used to repair ancestor separators when
/// the removed child was the right child.
fn internal_node_delete(
    table: &mut Table,
    parent_page: u32,
    child_page: u32,
    index: u32,
    removed_max: u32,
) -> Result<(), Error> {
    debug!(parent_page, child_page, "Removing child from internal node.");

    let (was_right, new_right, keys_after, parent_is_root) =
        table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(parent_page, scope)?;
            let mut parent = lock_page(&page)?;
            let num_keys = parent.num_keys();
            let was_right = index == num_keys;
            let mut new_right = None;
            if was_right {
                let replacement = parent.internal_child(index - 1)?;
                parent.set_right_child(replacement);
                new_right = Some(replacement);
            } else {
                for i in index + 1..num_keys {
                    parent.copy_internal_cell(i, i - 1)?;
                }
            }
            parent.set_num_keys(num_keys - 1);
            Ok((was_right, new_right, num_keys - 1, parent.is_root()))
        })?;

    if was_right {
        if let Some(new_right) = new_right {
            let new_max = node_max_key(&mut table.pager, new_right)?;
            propagate_key_update(table, parent_page, removed_max, new_max)?;
        }
    }

    table.pager.free_page(child_page);

    if keys_after < INTERNAL_NODE_MIN_KEYS as u32 && !parent_is_root {
        internal_node_merge(table, parent_page)?;
    }
    Ok(())
}

/// Rebalances an internal node left with no keys (a single child in its
/// right-child slot): borrow a child from an adjacent sibling, else move
/// the remaining child into the sibling and delete this node.
fn internal_node_merge(table: &mut Table, page_num: u32) -> Result<(), Error> {
    let (parent_page, node_right) = table.pager.with_scope(|pager, scope| {
        let page = pager.fetch(page_num, scope)?;
        let node = lock_page(&page)?;
        let node_right = node.right_child();
        if node_right == INVALID_PAGE_NUM {
            return Err(err!(Storage, "rebalancing an empty internal node {}", page_num));
        }
        Ok((node.parent(), node_right))
    })?;

    let (index, num_keys, sibling_page, parent_is_root) =
        table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(parent_page, scope)?;
            let parent = lock_page(&page)?;
            let index = internal_child_index(&parent, page_num)?;
            let num_keys = parent.num_keys();
            let node_is_right = index == num_keys;
            if node_is_right && index == 0 {
                return Err(err!(
                    Storage,
                    "internal node {} has no sibling to rebalance with",
                    page_num
                ));
            }
            let sibling_index = if node_is_right { index - 1 } else { index + 1 };
            let sibling_page = parent.internal_child(sibling_index)?;
            Ok((index, num_keys, sibling_page, parent.is_root()))
        })?;
    let node_is_right = index == num_keys;

    let sibling_keys = table.pager.with_scope(|pager, scope| {
        let page = pager.fetch(sibling_page, scope)?;
        let num_keys = lock_page(&page)?.num_keys();
        Ok(num_keys)
    })?;

    if sibling_keys > INTERNAL_NODE_MIN_KEYS as u32 {
        // Borrow one child: the left sibling gives its right child, the
        // right sibling its leftmost.
        debug!(page_num, sibling_page, "Internal underflow. Borrowing a child.");
        if node_is_right {
            let borrowed = table.pager.with_scope(|pager, scope| {
                let page = pager.fetch(sibling_page, scope)?;
                let right_child = lock_page(&page)?.right_child();
                Ok(right_child)
            })?;
            let sibling_old_max = node_max_key(&mut table.pager, sibling_page)?;
            table.pager.with_scope(|pager, scope| {
                let page = pager.fetch(sibling_page, scope)?;
                let mut sibling = lock_page(&page)?;
                let replacement = sibling.internal_child(sibling_keys - 1)?;
                sibling.set_right_child(replacement);
                sibling.set_num_keys(sibling_keys - 1);
                Ok(())
            })?;
            let sibling_new_max = node_max_key(&mut table.pager, sibling_page)?;
            propagate_key_update(table, sibling_page, sibling_old_max, sibling_new_max)?;
            internal_node_insert(table, page_num, borrowed)?;
            table.pager.with_scope(|pager, scope| {
                let page = pager.fetch(borrowed, scope)?;
                lock_page(&page)?.set_parent(page_num);
                Ok(())
            })?;
        } else {
            let borrowed = table.pager.with_scope(|pager, scope| {
                let page = pager.fetch(sibling_page, scope)?;
                let result = lock_page(&page)?.internal_child(0);
                result
            })?;
            let node_old_max = node_max_key(&mut table.pager, page_num)?;
            table.pager.with_scope(|pager, scope| {
                let page = pager.fetch(sibling_page, scope)?;
                let mut sibling = lock_page(&page)?;
                for i in 1..sibling_keys {
                    sibling.copy_internal_cell(i, i - 1)?;
                }
                sibling.set_num_keys(sibling_keys - 1);
                Ok(())
            })?;
            internal_node_insert(table, page_num, borrowed)?;
            table.pager.with_scope(|pager, scope| {
                let page = pager.fetch(borrowed, scope)?;
                lock_page(&page)?.set_parent(page_num);
                Ok(())
            })?;
            // This node's maximum grew to the borrowed subtree's.
            let node_new_max = node_max_key(&mut table.pager, page_num)?;
            propagate_key_update(table, page_num, node_old_max, node_new_max)?;
        }
        return Ok(());
    }

    // The sibling holds exactly the minimum: move this node's remaining
    // child into it and delete this node.
    warn!(page_num, sibling_page, "Internal underflow. Merging into sibling.");
    let node_old_max = node_max_key(&mut table.pager, page_num)?;
    internal_node_insert(table, sibling_page, node_right)?;
    table.pager.with_scope(|pager, scope| {
        let page = pager.fetch(node_right, scope)?;
        lock_page(&page)?.set_parent(sibling_page);
        Ok(())
    })?;

    if parent_is_root && num_keys == 1 {
        // Collapse a tree level: the surviving sibling becomes the root.
        let root_children = table.pager.with_scope(|pager, scope| {
            let sibling = pager.fetch(sibling_page, scope)?;
            let root = pager.fetch(parent_page, scope)?;
            let sibling_node = lock_page(&sibling)?;
            let mut root_node = lock_page(&root)?;
            root_node.data = sibling_node.data;
            root_node.set_root(true);
            let num_keys = root_node.num_keys();
            let mut children = Vec::with_capacity(num_keys as usize + 1);
            for i in 0..=num_keys {
                children.push(root_node.internal_child(i)?);
            }
            Ok(children)
        })?;
        for child in root_children {
            table.pager.with_scope(|pager, scope| {
                let page = pager.fetch(child, scope)?;
                lock_page(&page)?.set_parent(parent_page);
                Ok(())
            })?;
        }
        table.pager.free_page(sibling_page);
        table.pager.free_page(page_num);
        return Ok(());
    }

    internal_node_delete(table, parent_page, page_num, index, node_old_max)
}

fn render_node(
    table: &mut Table,
    page_num: u32,
    level: usize,
    out: &mut String,
) -> Result<(), Error> {
    enum Info {
        Leaf(Vec<u32>),
        Internal {
            keys: Vec<u32>,
            children: Vec<u32>,
            right_child: u32,
        },
    }
    let info = table.pager.with_scope(|pager, scope| {
        let page = pager.fetch(page_num, scope)?;
        let node = lock_page(&page)?;
        match node.node_type()? {
            NodeType::Leaf => {
                let mut keys = Vec::with_capacity(node.num_cells() as usize);
                for i in 0..node.num_cells() {
                    keys.push(node.leaf_key(i)?);
                }
                Ok(Info::Leaf(keys))
            }
            NodeType::Internal => {
                let num_keys = node.num_keys();
                let mut keys = Vec::with_capacity(num_keys as usize);
                let mut children = Vec::with_capacity(num_keys as usize);
                for i in 0..num_keys {
                    keys.push(node.internal_key(i)?);
                    children.push(node.internal_child(i)?);
                }
                Ok(Info::Internal {
                    keys,
                    children,
                    right_child: node.right_child(),
                })
            }
        }
    })?;

    let pad = "  ".repeat(level);
    match info {
        Info::Leaf(keys) => {
            out.push_str(&format!("{}- leaf (size {})\n", pad, keys.len()));
            for key in keys {
                out.push_str(&format!("{}  - {}\n", pad, key));
            }
        }
        Info::Internal {
            keys,
            children,
            right_child,
        } => {
            out.push_str(&format!("{}- internal (size {})\n", pad, keys.len()));
            for (i, child) in children.iter().enumerate() {
                render_node(table, *child, level + 1, out)?;
                out.push_str(&format!("{}  - key {}\n", pad, keys[i]));
            }
            if right_child != INVALID_PAGE_NUM {
                render_node(table, right_child, level + 1, out)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_table(dir: &tempfile::TempDir) -> Table {
        Table::open(dir.path().join("test.db")).unwrap()
    }

    fn row(id: u32) -> Row {
        Row::new(id, &format!("user{}", id), &format!("person{}@example.com", id))
    }

    fn ids(table: &mut Table) -> Vec<u32> {
        table.rows().unwrap().iter().map(|r| r.id).collect()
    }

    #[test]
    fn test_insert_and_select() {
        let dir = tempdir().unwrap();
        let mut table = open_table(&dir);
        table.insert(&row(1)).unwrap();
        let rows = table.rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], row(1));
    }

    #[test]
    fn test_select_is_key_ordered() {
        let dir = tempdir().unwrap();
        let mut table = open_table(&dir);
        for id in [3u32, 1, 2] {
            table.insert(&row(id)).unwrap();
        }
        assert_eq!(ids(&mut table), vec![1, 2, 3]);
    }

    #[test]
    fn test_duplicate_key() {
        let dir = tempdir().unwrap();
        let mut table = open_table(&dir);
        table.insert(&row(1)).unwrap();
        let result = table.insert(&Row::new(1, "user2", "person2@example.com"));
        assert!(matches!(result, Err(Error::DuplicateKey)));
        assert_eq!(table.rows().unwrap(), vec![row(1)]);
    }

    #[test]
    fn test_leaf_split_builds_internal_root() {
        let dir = tempdir().unwrap();
        let mut table = open_table(&dir);
        for id in 1..=(LEAF_NODE_MAX_CELLS as u32 + 1) {
            table.insert(&row(id)).unwrap();
        }
        let rendering = table.print_tree().unwrap();
        assert!(rendering.starts_with("- internal (size 1)"));
        // Both halves hold at least the left split count minus one.
        assert!(rendering.contains("- leaf (size 7)"));
        assert_eq!(ids(&mut table), (1..=14).collect::<Vec<_>>());
    }

    #[test]
    fn test_many_inserts_any_order() {
        let dir = tempdir().unwrap();
        let mut table = open_table(&dir);
        // Deterministic shuffle of 1..=60: multiples of a coprime stride.
        let keys: Vec<u32> = (1..=60u32).map(|i| (i * 37) % 61).collect();
        for key in &keys {
            table.insert(&row(*key)).unwrap();
        }
        assert_eq!(ids(&mut table), (1..=60).collect::<Vec<_>>());
    }

    #[test]
    fn test_delete_missing_key() {
        let dir = tempdir().unwrap();
        let mut table = open_table(&dir);
        table.insert(&row(1)).unwrap();
        assert!(matches!(table.delete(2), Err(Error::KeyNotFound)));
        assert!(matches!(table.delete(0), Err(Error::KeyNotFound)));
    }

    #[test]
    fn test_delete_from_root_leaf() {
        let dir = tempdir().unwrap();
        let mut table = open_table(&dir);
        for id in 1..=5u32 {
            table.insert(&row(id)).unwrap();
        }
        table.delete(3).unwrap();
        assert_eq!(ids(&mut table), vec![1, 2, 4, 5]);
        assert!(matches!(table.delete(3), Err(Error::KeyNotFound)));
    }

    #[test]
    fn test_delete_then_reinsert() {
        let dir = tempdir().unwrap();
        let mut table = open_table(&dir);
        for id in 1..=20u32 {
            table.insert(&row(id)).unwrap();
        }
        table.delete(10).unwrap();
        assert!(!ids(&mut table).contains(&10));
        table.insert(&row(10)).unwrap();
        assert_eq!(ids(&mut table), (1..=20).collect::<Vec<_>>());
    }

    #[test]
    fn test_delete_last_cell_updates_separator() {
        let dir = tempdir().unwrap();
        let mut table = open_table(&dir);
        for id in 1..=14u32 {
            table.insert(&row(id)).unwrap();
        }
        // Key 7 is the left leaf's maximum and the root's separator;
        // deleting it must not break the search for its neighbors.
        table.delete(7).unwrap();
        assert_eq!(
            ids(&mut table),
            vec![1, 2, 3, 4, 5, 6, 8, 9, 10, 11, 12, 13, 14]
        );
        table.insert(&row(7)).unwrap();
        assert_eq!(ids(&mut table), (1..=14).collect::<Vec<_>>());
    }

    #[test]
    fn test_delete_everything_leaves_empty_root() {
        let dir = tempdir().unwrap();
        let mut table = open_table(&dir);
        for id in 1..=30u32 {
            table.insert(&row(id)).unwrap();
        }
        for id in 1..=30u32 {
            table.delete(id).unwrap();
        }
        assert!(ids(&mut table).is_empty());
        assert_eq!(table.print_tree().unwrap(), "- leaf (size 0)\n");

        // The collapsed tree keeps working.
        table.insert(&row(42)).unwrap();
        assert_eq!(ids(&mut table), vec![42]);
    }

    #[test]
    fn test_deep_tree_delete_all_reverse() {
        let dir = tempdir().unwrap();
        let mut table = open_table(&dir);
        for id in 1..=60u32 {
            table.insert(&row(id)).unwrap();
        }
        for id in (1..=60u32).rev() {
            table.delete(id).unwrap();
        }
        assert!(ids(&mut table).is_empty());
    }

    #[test]
    fn test_interleaved_inserts_and_deletes() {
        let dir = tempdir().unwrap();
        let mut table = open_table(&dir);
        let keys: Vec<u32> = (1..=60u32).map(|i| (i * 37) % 61).collect();
        for key in &keys {
            table.insert(&row(*key)).unwrap();
        }
        for key in keys.iter().filter(|k| *k % 3 == 0) {
            table.delete(*key).unwrap();
        }
        let expected: Vec<u32> = (1..=60u32).filter(|k| k % 3 != 0).collect();
        assert_eq!(ids(&mut table), expected);

        for key in keys.iter().filter(|k| *k % 3 == 0) {
            table.insert(&row(*key)).unwrap();
        }
        assert_eq!(ids(&mut table), (1..=60).collect::<Vec<_>>());
    }

    #[test]
    fn test_print_tree_single_leaf() {
        let dir = tempdir().unwrap();
        let mut table = open_table(&dir);
        for id in 1..=3u32 {
            table.insert(&row(id)).unwrap();
        }
        assert_eq!(
            table.print_tree().unwrap(),
            "- leaf (size 3)\n  - 1\n  - 2\n  - 3\n"
        );
    }
}
