//! Table cursor.
//!
//! A cursor is a plain position value: a leaf page number, a cell index
//! within it, and an end-of-table marker. It re-resolves the page through
//! the pager on every access, so holding one across mutations or evictions
//! is safe; the position itself is only meaningful until the tree is
//! restructured.

use crate::errors::Error;
use crate::storage::node::{NodeType, INVALID_PAGE_NUM};
use crate::storage::pager::lock_page;
use crate::storage::row::Row;
use crate::storage::table::Table;

pub struct Cursor {
    pub page_num: u32,
    pub cell_num: u32,
    pub end_of_table: bool,
}

impl Cursor {
    /// Positions a cursor at `key`: on the cell holding it, or on the slot
    /// where it would be inserted. Descends from the root one pinned step
    /// at a time.
    pub fn find(table: &mut Table, key: u32) -> Result<Self, Error> {
        let mut page_num = table.root_page_num;
        loop {
            enum Step {
                Leaf(u32),
                Descend(u32),
            }
            let step = table.pager.with_scope(|pager, scope| {
                let page = pager.fetch(page_num, scope)?;
                let node = lock_page(&page)?;
                match node.node_type()? {
                    NodeType::Leaf => Ok(Step::Leaf(node.leaf_find_slot(key)?)),
                    NodeType::Internal => {
                        let child_index = node.internal_find_child(key)?;
                        let child = node.internal_child(child_index)?;
                        if child == INVALID_PAGE_NUM {
                            return Err(err!(
                                Storage,
                                "internal node {} routes key {} to an invalid page",
                                page_num,
                                key
                            ));
                        }
                        Ok(Step::Descend(child))
                    }
                }
            })?;
            match step {
                Step::Leaf(cell_num) => {
                    return Ok(Cursor {
                        page_num,
                        cell_num,
                        end_of_table: false,
                    })
                }
                Step::Descend(child) => page_num = child,
            }
        }
    }

    /// Positions a cursor at the smallest key, with `end_of_table` set when
    /// the tree is empty.
    pub fn start(table: &mut Table) -> Result<Self, Error> {
        let mut cursor = Cursor::find(table, 0)?;
        let page_num = cursor.page_num;
        let num_cells = table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(page_num, scope)?;
            let num_cells = lock_page(&page)?.num_cells();
            Ok(num_cells)
        })?;
        cursor.end_of_table = num_cells == 0;
        Ok(cursor)
    }

    /// Decodes the row under the cursor.
    pub fn read_row(&self, table: &mut Table) -> Result<Row, Error> {
        let page_num = self.page_num;
        let cell_num = self.cell_num;
        table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(page_num, scope)?;
            let node = lock_page(&page)?;
            Row::deserialize(node.leaf_value(cell_num)?)
        })
    }

    /// Advances one cell, following the leaf chain. The rightmost leaf's
    /// `next_leaf` is 0, which marks the end of the table.
    pub fn advance(&mut self, table: &mut Table) -> Result<(), Error> {
        let page_num = self.page_num;
        let (num_cells, next_leaf) = table.pager.with_scope(|pager, scope| {
            let page = pager.fetch(page_num, scope)?;
            let node = lock_page(&page)?;
            Ok((node.num_cells(), node.next_leaf()))
        })?;

        self.cell_num += 1;
        if self.cell_num >= num_cells {
            if next_leaf == 0 {
                self.end_of_table = true;
            } else {
                self.page_num = next_leaf;
                self.cell_num = 0;
            }
        }
        Ok(())
    }
}
