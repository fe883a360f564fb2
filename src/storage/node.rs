//! On-disk node format.
//!
//! Every 4096-byte page is one B+ tree node, either a leaf holding
//! `(key, row)` cells or an internal node holding `(child, key)` routing
//! cells. All multi-byte integers are little-endian. The layout is a plain
//! array of fixed-size cells after a fixed header, so every accessor is a
//! constant-offset read or write into the page buffer.
//!
//! | Property           | Internal node                 | Leaf node           |
//! |--------------------|-------------------------------|---------------------|
//! | Stores             | keys and pointers to children | keys and rows       |
//! | Number of keys     | up to 3                       | as many as will fit |
//! | Number of pointers | number of keys + 1            | none                |
//! | Key purpose        | routing                       | paired with row     |

use crate::errors::Error;
use crate::storage::row::ROW_SIZE;

/// Page size 4 kilobytes because it's the same size as a page used in
/// the virtual memory systems of most computer architectures.
pub const PAGE_SIZE: usize = 4096;

/// Sentinel for "no such page". A valid page number is always below
/// `TABLE_MAX_PAGES`.
pub const INVALID_PAGE_NUM: u32 = u32::MAX;

// Common node header layout.
const NODE_TYPE_SIZE: usize = 1;
const NODE_TYPE_OFFSET: usize = 0;
const IS_ROOT_SIZE: usize = 1;
const IS_ROOT_OFFSET: usize = NODE_TYPE_OFFSET + NODE_TYPE_SIZE;
const PARENT_POINTER_SIZE: usize = 4;
const PARENT_POINTER_OFFSET: usize = IS_ROOT_OFFSET + IS_ROOT_SIZE;
pub const COMMON_NODE_HEADER_SIZE: usize =
    NODE_TYPE_SIZE + IS_ROOT_SIZE + PARENT_POINTER_SIZE;

// Leaf node header layout.
const LEAF_NODE_NUM_CELLS_SIZE: usize = 4;
const LEAF_NODE_NUM_CELLS_OFFSET: usize = COMMON_NODE_HEADER_SIZE;
const LEAF_NODE_NEXT_LEAF_SIZE: usize = 4;
const LEAF_NODE_NEXT_LEAF_OFFSET: usize = LEAF_NODE_NUM_CELLS_OFFSET + LEAF_NODE_NUM_CELLS_SIZE;
pub const LEAF_NODE_HEADER_SIZE: usize =
    COMMON_NODE_HEADER_SIZE + LEAF_NODE_NUM_CELLS_SIZE + LEAF_NODE_NEXT_LEAF_SIZE;

// Leaf node body layout.
const LEAF_NODE_KEY_SIZE: usize = 4;
pub const LEAF_NODE_CELL_SIZE: usize = LEAF_NODE_KEY_SIZE + ROW_SIZE;
pub const LEAF_NODE_SPACE_FOR_CELLS: usize = PAGE_SIZE - LEAF_NODE_HEADER_SIZE;
pub const LEAF_NODE_MAX_CELLS: usize = LEAF_NODE_SPACE_FOR_CELLS / LEAF_NODE_CELL_SIZE;

/// Cells assigned to the right sibling when a full leaf splits.
pub const LEAF_NODE_RIGHT_SPLIT_COUNT: usize = (LEAF_NODE_MAX_CELLS + 1) / 2;
/// Cells kept by the left (original) node when a full leaf splits.
pub const LEAF_NODE_LEFT_SPLIT_COUNT: usize =
    (LEAF_NODE_MAX_CELLS + 1) - LEAF_NODE_RIGHT_SPLIT_COUNT;
/// A non-root leaf dropping below this many cells is rebalanced.
pub const LEAF_NODE_MIN_CELLS: usize = 7;

// Internal node header layout.
const INTERNAL_NODE_NUM_KEYS_SIZE: usize = 4;
const INTERNAL_NODE_NUM_KEYS_OFFSET: usize = COMMON_NODE_HEADER_SIZE;
const INTERNAL_NODE_RIGHT_CHILD_SIZE: usize = 4;
const INTERNAL_NODE_RIGHT_CHILD_OFFSET: usize =
    INTERNAL_NODE_NUM_KEYS_OFFSET + INTERNAL_NODE_NUM_KEYS_SIZE;
pub const INTERNAL_NODE_HEADER_SIZE: usize =
    COMMON_NODE_HEADER_SIZE + INTERNAL_NODE_NUM_KEYS_SIZE + INTERNAL_NODE_RIGHT_CHILD_SIZE;

// Internal node body layout.
const INTERNAL_NODE_CHILD_SIZE: usize = 4;
const INTERNAL_NODE_KEY_SIZE: usize = 4;
pub const INTERNAL_NODE_CELL_SIZE: usize = INTERNAL_NODE_CHILD_SIZE + INTERNAL_NODE_KEY_SIZE;

/// Keep this small so splits happen after a handful of children and the
/// rebalancing paths get exercised early.
pub const INTERNAL_NODE_MAX_KEYS: usize = 3;
/// A non-root internal node dropping below this many keys is rebalanced.
pub const INTERNAL_NODE_MIN_KEYS: usize = 1;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum NodeType {
    Leaf,
    Internal,
}

/// One page's worth of node data, owned.
#[derive(Clone)]
pub struct Node {
    pub data: [u8; PAGE_SIZE],
}

impl Node {
    pub fn zeroed() -> Self {
        Node {
            data: [0u8; PAGE_SIZE],
        }
    }

    pub fn from_bytes(buf: &[u8; PAGE_SIZE]) -> Self {
        Node { data: *buf }
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn node_type(&self) -> Result<NodeType, Error> {
        match self.data[NODE_TYPE_OFFSET] {
            0 => Ok(NodeType::Internal),
            1 => Ok(NodeType::Leaf),
            invalid => Err(err!(Storage, "invalid node type value: {}", invalid)),
        }
    }

    pub fn set_node_type(&mut self, node_type: NodeType) {
        self.data[NODE_TYPE_OFFSET] = match node_type {
            NodeType::Internal => 0,
            NodeType::Leaf => 1,
        };
    }

    pub fn is_root(&self) -> bool {
        self.data[IS_ROOT_OFFSET] != 0
    }

    pub fn set_root(&mut self, is_root: bool) {
        self.data[IS_ROOT_OFFSET] = is_root as u8;
    }

    /// Parent page number. Undefined on the root node.
    pub fn parent(&self) -> u32 {
        self.read_u32(PARENT_POINTER_OFFSET)
    }

    pub fn set_parent(&mut self, page_num: u32) {
        self.write_u32(PARENT_POINTER_OFFSET, page_num);
    }

    // Leaf accessors.

    pub fn num_cells(&self) -> u32 {
        self.read_u32(LEAF_NODE_NUM_CELLS_OFFSET)
    }

    pub fn set_num_cells(&mut self, num: u32) {
        self.write_u32(LEAF_NODE_NUM_CELLS_OFFSET, num);
    }

    /// Page number of the leaf holding the next-higher keys, 0 for the
    /// rightmost leaf.
    pub fn next_leaf(&self) -> u32 {
        self.read_u32(LEAF_NODE_NEXT_LEAF_OFFSET)
    }

    pub fn set_next_leaf(&mut self, page_num: u32) {
        self.write_u32(LEAF_NODE_NEXT_LEAF_OFFSET, page_num);
    }

    fn leaf_cell_offset(cell_num: u32) -> Result<usize, Error> {
        if cell_num as usize >= LEAF_NODE_MAX_CELLS {
            return Err(err!(
                Storage,
                "leaf cell {} out of bounds (max {})",
                cell_num,
                LEAF_NODE_MAX_CELLS
            ));
        }
        Ok(LEAF_NODE_HEADER_SIZE + cell_num as usize * LEAF_NODE_CELL_SIZE)
    }

    pub fn leaf_key(&self, cell_num: u32) -> Result<u32, Error> {
        let offset = Self::leaf_cell_offset(cell_num)?;
        Ok(self.read_u32(offset))
    }

    pub fn set_leaf_key(&mut self, cell_num: u32, key: u32) -> Result<(), Error> {
        let offset = Self::leaf_cell_offset(cell_num)?;
        self.write_u32(offset, key);
        Ok(())
    }

    /// The row bytes of the cell, valid until the next mutation of the page.
    pub fn leaf_value(&self, cell_num: u32) -> Result<&[u8], Error> {
        let offset = Self::leaf_cell_offset(cell_num)? + LEAF_NODE_KEY_SIZE;
        Ok(&self.data[offset..offset + ROW_SIZE])
    }

    pub fn set_leaf_value(&mut self, cell_num: u32, value: &[u8]) -> Result<(), Error> {
        if value.len() != ROW_SIZE {
            return Err(err!(
                Storage,
                "value size mismatch (expected={}, got={})",
                ROW_SIZE,
                value.len()
            ));
        }
        let offset = Self::leaf_cell_offset(cell_num)? + LEAF_NODE_KEY_SIZE;
        self.data[offset..offset + ROW_SIZE].copy_from_slice(value);
        Ok(())
    }

    pub fn leaf_cell(&self, cell_num: u32) -> Result<&[u8], Error> {
        let offset = Self::leaf_cell_offset(cell_num)?;
        Ok(&self.data[offset..offset + LEAF_NODE_CELL_SIZE])
    }

    pub fn write_leaf_cell(&mut self, cell_num: u32, cell: &[u8]) -> Result<(), Error> {
        if cell.len() != LEAF_NODE_CELL_SIZE {
            return Err(err!(
                Storage,
                "cell size mismatch (expected={}, got={})",
                LEAF_NODE_CELL_SIZE,
                cell.len()
            ));
        }
        let offset = Self::leaf_cell_offset(cell_num)?;
        self.data[offset..offset + LEAF_NODE_CELL_SIZE].copy_from_slice(cell);
        Ok(())
    }

    pub fn copy_leaf_cell(&mut self, from: u32, to: u32) -> Result<(), Error> {
        let src = Self::leaf_cell_offset(from)?;
        let dst = Self::leaf_cell_offset(to)?;
        self.data.copy_within(src..src + LEAF_NODE_CELL_SIZE, dst);
        Ok(())
    }

    /// Binary search for `key`: the cell holding it, or the index where it
    /// would be inserted to keep the cells ordered.
    pub fn leaf_find_slot(&self, key: u32) -> Result<u32, Error> {
        let mut min_index = 0;
        let mut one_past_max_index = self.num_cells();
        while one_past_max_index != min_index {
            let index = (min_index + one_past_max_index) / 2;
            let key_at_index = self.leaf_key(index)?;
            if key == key_at_index {
                return Ok(index);
            }
            if key < key_at_index {
                one_past_max_index = index;
            } else {
                min_index = index + 1;
            }
        }
        Ok(min_index)
    }

    // Internal accessors.

    pub fn num_keys(&self) -> u32 {
        self.read_u32(INTERNAL_NODE_NUM_KEYS_OFFSET)
    }

    pub fn set_num_keys(&mut self, num: u32) {
        self.write_u32(INTERNAL_NODE_NUM_KEYS_OFFSET, num);
    }

    pub fn right_child(&self) -> u32 {
        self.read_u32(INTERNAL_NODE_RIGHT_CHILD_OFFSET)
    }

    pub fn set_right_child(&mut self, page_num: u32) {
        self.write_u32(INTERNAL_NODE_RIGHT_CHILD_OFFSET, page_num);
    }

    fn internal_cell_offset(cell_num: u32) -> Result<usize, Error> {
        if cell_num as usize >= INTERNAL_NODE_MAX_KEYS {
            return Err(err!(
                Storage,
                "internal cell {} out of bounds (max {})",
                cell_num,
                INTERNAL_NODE_MAX_KEYS
            ));
        }
        Ok(INTERNAL_NODE_HEADER_SIZE + cell_num as usize * INTERNAL_NODE_CELL_SIZE)
    }

    pub fn internal_key(&self, key_num: u32) -> Result<u32, Error> {
        let offset = Self::internal_cell_offset(key_num)? + INTERNAL_NODE_CHILD_SIZE;
        Ok(self.read_u32(offset))
    }

    pub fn set_internal_key(&mut self, key_num: u32, key: u32) -> Result<(), Error> {
        let offset = Self::internal_cell_offset(key_num)? + INTERNAL_NODE_CHILD_SIZE;
        self.write_u32(offset, key);
        Ok(())
    }

    /// Child pointer at `child_num`. Index `num_keys` is the right child.
    pub fn internal_child(&self, child_num: u32) -> Result<u32, Error> {
        let num_keys = self.num_keys();
        if child_num > num_keys {
            return Err(err!(
                Storage,
                "child index {} exceeds num_keys {}",
                child_num,
                num_keys
            ));
        }
        if child_num == num_keys {
            Ok(self.right_child())
        } else {
            let offset = Self::internal_cell_offset(child_num)?;
            Ok(self.read_u32(offset))
        }
    }

    pub fn set_internal_cell(&mut self, cell_num: u32, child: u32, key: u32) -> Result<(), Error> {
        let offset = Self::internal_cell_offset(cell_num)?;
        self.write_u32(offset, child);
        self.write_u32(offset + INTERNAL_NODE_CHILD_SIZE, key);
        Ok(())
    }

    pub fn copy_internal_cell(&mut self, from: u32, to: u32) -> Result<(), Error> {
        let src = Self::internal_cell_offset(from)?;
        let dst = Self::internal_cell_offset(to)?;
        self.data.copy_within(src..src + INTERNAL_NODE_CELL_SIZE, dst);
        Ok(())
    }

    /// Index of the child subtree that should contain `key`: the smallest
    /// `i` with `key[i] >= key`, or `num_keys` for the right child.
    pub fn internal_find_child(&self, key: u32) -> Result<u32, Error> {
        let mut min_index = 0;
        let mut max_index = self.num_keys();
        while min_index != max_index {
            let index = (min_index + max_index) / 2;
            if self.internal_key(index)? >= key {
                max_index = index;
            } else {
                min_index = index + 1;
            }
        }
        Ok(min_index)
    }

    /// Replaces the separator that currently reads `old_key` with `new_key`.
    /// No-op when no cell holds `old_key` (the child is the right child, so
    /// no separator tracks its maximum).
    pub fn update_key(&mut self, old_key: u32, new_key: u32) -> Result<(), Error> {
        let index = self.internal_find_child(old_key)?;
        if index < self.num_keys() && self.internal_key(index)? == old_key {
            self.set_internal_key(index, new_key)?;
        }
        Ok(())
    }

    pub fn init_leaf(&mut self) {
        self.set_node_type(NodeType::Leaf);
        self.set_root(false);
        self.set_num_cells(0);
        self.set_next_leaf(0); // 0 represents no sibling
    }

    pub fn init_internal(&mut self) {
        self.set_node_type(NodeType::Internal);
        self.set_root(false);
        self.set_num_keys(0);
        // The root page number is 0, so a zeroed right child would silently
        // make this node a parent of the root. An empty internal node is
        // marked by an INVALID right child instead.
        self.set_right_child(INVALID_PAGE_NUM);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_constants() {
        assert_eq!(COMMON_NODE_HEADER_SIZE, 6);
        assert_eq!(LEAF_NODE_HEADER_SIZE, 14);
        assert_eq!(LEAF_NODE_CELL_SIZE, 297);
        assert_eq!(LEAF_NODE_MAX_CELLS, 13);
        assert_eq!(LEAF_NODE_LEFT_SPLIT_COUNT, 7);
        assert_eq!(LEAF_NODE_RIGHT_SPLIT_COUNT, 7);
        assert_eq!(INTERNAL_NODE_HEADER_SIZE, 14);
        assert_eq!(INTERNAL_NODE_CELL_SIZE, 8);
    }

    #[test]
    fn test_leaf_header_roundtrip() {
        let mut node = Node::zeroed();
        node.init_leaf();
        assert_eq!(node.node_type().unwrap(), NodeType::Leaf);
        assert!(!node.is_root());
        assert_eq!(node.num_cells(), 0);
        assert_eq!(node.next_leaf(), 0);

        node.set_root(true);
        node.set_parent(7);
        node.set_num_cells(3);
        node.set_next_leaf(9);
        assert!(node.is_root());
        assert_eq!(node.parent(), 7);
        assert_eq!(node.num_cells(), 3);
        assert_eq!(node.next_leaf(), 9);
    }

    #[test]
    fn test_leaf_cells() {
        let mut node = Node::zeroed();
        node.init_leaf();

        let value = [42u8; crate::storage::row::ROW_SIZE];
        node.set_leaf_key(0, 11).unwrap();
        node.set_leaf_value(0, &value).unwrap();
        node.set_num_cells(1);

        assert_eq!(node.leaf_key(0).unwrap(), 11);
        assert_eq!(node.leaf_value(0).unwrap(), &value[..]);

        // Out-of-range cells are refused.
        assert!(node.leaf_key(LEAF_NODE_MAX_CELLS as u32).is_err());
        assert!(node.set_leaf_value(0, &[0u8; 5]).is_err());
    }

    #[test]
    fn test_leaf_find_slot() {
        let mut node = Node::zeroed();
        node.init_leaf();
        for (i, key) in [10u32, 20, 30].iter().enumerate() {
            node.set_leaf_key(i as u32, *key).unwrap();
        }
        node.set_num_cells(3);

        assert_eq!(node.leaf_find_slot(10).unwrap(), 0);
        assert_eq!(node.leaf_find_slot(30).unwrap(), 2);
        assert_eq!(node.leaf_find_slot(5).unwrap(), 0);
        assert_eq!(node.leaf_find_slot(15).unwrap(), 1);
        assert_eq!(node.leaf_find_slot(99).unwrap(), 3);
    }

    #[test]
    fn test_internal_accessors() {
        let mut node = Node::zeroed();
        node.init_internal();
        assert_eq!(node.node_type().unwrap(), NodeType::Internal);
        assert_eq!(node.right_child(), INVALID_PAGE_NUM);

        node.set_num_keys(2);
        node.set_internal_cell(0, 4, 100).unwrap();
        node.set_internal_cell(1, 5, 200).unwrap();
        node.set_right_child(6);

        assert_eq!(node.internal_key(0).unwrap(), 100);
        assert_eq!(node.internal_child(0).unwrap(), 4);
        assert_eq!(node.internal_child(1).unwrap(), 5);
        assert_eq!(node.internal_child(2).unwrap(), 6);
        assert!(node.internal_child(3).is_err());

        assert_eq!(node.internal_find_child(50).unwrap(), 0);
        assert_eq!(node.internal_find_child(100).unwrap(), 0);
        assert_eq!(node.internal_find_child(150).unwrap(), 1);
        assert_eq!(node.internal_find_child(500).unwrap(), 2);
    }

    #[test]
    fn test_update_key() {
        let mut node = Node::zeroed();
        node.init_internal();
        node.set_num_keys(2);
        node.set_internal_cell(0, 4, 100).unwrap();
        node.set_internal_cell(1, 5, 200).unwrap();
        node.set_right_child(6);

        node.update_key(100, 120).unwrap();
        assert_eq!(node.internal_key(0).unwrap(), 120);

        // The right child has no separator cell; updating its old max is a
        // no-op rather than a stray write.
        node.update_key(999, 1000).unwrap();
        assert_eq!(node.internal_key(0).unwrap(), 120);
        assert_eq!(node.internal_key(1).unwrap(), 200);
    }

    #[test]
    fn test_invalid_node_type() {
        let mut node = Node::zeroed();
        node.data[0] = 9;
        assert!(node.node_type().is_err());
    }
}
