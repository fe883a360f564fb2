//! kvlite: a single-file, single-user persistent key-value store.
//!
//! Rows keyed by a `u32` id live in a B+ tree of 4096-byte pages inside one
//! database file. The pager keeps a small LRU-evicted cache of pages and a
//! persistent stack of reclaimable page numbers; the tree handles ordered
//! scans over a linked leaf chain, splits on insert, and borrow-or-merge
//! rebalancing on delete. See `storage::table::Table` for the programmatic
//! surface and `repl` for the interactive loop built on top of it.

#[macro_use]
pub mod errors;
pub mod command;
pub mod repl;
pub mod storage;
