//! End-to-end tests against the engine facade: ordered scans, persistence
//! across reopen, rebalancing deletes, and on-disk format conformance.

use kvlite::errors::Error;
use kvlite::storage::freelist::HEADER_SIZE;
use kvlite::storage::node::{Node, NodeType, INVALID_PAGE_NUM, PAGE_SIZE};
use kvlite::storage::{Row, Table};
use std::path::PathBuf;
use tempfile::TempDir;

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("test.db")
}

fn row(id: u32) -> Row {
    Row::new(id, &format!("user{}", id), &format!("person{}@example.com", id))
}

fn ids(table: &mut Table) -> Vec<u32> {
    table.rows().unwrap().iter().map(|r| r.id).collect()
}

#[test]
fn insert_and_select_single_row() {
    let dir = TempDir::new().unwrap();
    let mut table = Table::open(db_path(&dir)).unwrap();

    table
        .insert(&Row::new(1, "user1", "person1@example.com"))
        .unwrap();

    let rows = table.rows().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].to_string(), "(1, user1, person1@example.com)");
}

#[test]
fn select_returns_rows_in_key_order() {
    let dir = TempDir::new().unwrap();
    let mut table = Table::open(db_path(&dir)).unwrap();

    for id in [2u32, 3, 1] {
        table.insert(&row(id)).unwrap();
    }
    assert_eq!(ids(&mut table), vec![1, 2, 3]);
}

#[test]
fn delete_after_split() {
    let dir = TempDir::new().unwrap();
    let mut table = Table::open(db_path(&dir)).unwrap();

    for id in 1..=14u32 {
        table.insert(&row(id)).unwrap();
    }
    table.delete(13).unwrap();

    let mut expected: Vec<u32> = (1..=12).collect();
    expected.push(14);
    assert_eq!(ids(&mut table), expected);
}

#[test]
fn rows_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    {
        let mut table = Table::open(&path).unwrap();
        for id in 1..=30u32 {
            table.insert(&row(id)).unwrap();
        }
        table.close().unwrap();
    }
    {
        let mut table = Table::open(&path).unwrap();
        assert_eq!(ids(&mut table), (1..=30).collect::<Vec<_>>());
        // The reopened tree is fully usable.
        table.insert(&row(31)).unwrap();
        assert_eq!(ids(&mut table), (1..=31).collect::<Vec<_>>());
    }
}

#[test]
fn deleting_low_keys_triggers_rebalancing() {
    let dir = TempDir::new().unwrap();
    let mut table = Table::open(db_path(&dir)).unwrap();

    for id in 1..=20u32 {
        table.insert(&row(id)).unwrap();
    }
    for id in 1..=4u32 {
        table.delete(id).unwrap();
    }
    assert_eq!(ids(&mut table), (5..=20).collect::<Vec<_>>());
}

#[test]
fn duplicate_key_keeps_original_row() {
    let dir = TempDir::new().unwrap();
    let mut table = Table::open(db_path(&dir)).unwrap();

    table
        .insert(&Row::new(1, "user1", "person1@example.com"))
        .unwrap();
    let result = table.insert(&Row::new(1, "user2", "person2@example.com"));
    assert!(matches!(result, Err(Error::DuplicateKey)));

    let rows = table.rows().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].username, "user1");
}

#[test]
fn delete_missing_key() {
    let dir = TempDir::new().unwrap();
    let mut table = Table::open(db_path(&dir)).unwrap();

    assert!(matches!(table.delete(1), Err(Error::KeyNotFound)));
    table.insert(&row(1)).unwrap();
    table.delete(1).unwrap();
    assert!(matches!(table.delete(1), Err(Error::KeyNotFound)));
    assert!(ids(&mut table).is_empty());
}

#[test]
fn insert_delete_round_trip_any_order() {
    let dir = TempDir::new().unwrap();
    let mut table = Table::open(db_path(&dir)).unwrap();

    // Deterministic shuffles: strides coprime to 101 permute 1..=100.
    let inserts: Vec<u32> = (1..=100u32).map(|i| (i * 31) % 101).collect();
    let deletes: Vec<u32> = (1..=100u32).map(|i| (i * 67) % 101).collect();

    for key in &inserts {
        table.insert(&row(*key)).unwrap();
    }
    assert_eq!(ids(&mut table), (1..=100).collect::<Vec<_>>());

    for key in &deletes {
        table.delete(*key).unwrap();
    }
    assert!(ids(&mut table).is_empty());
}

#[test]
fn deletes_survive_reopen_and_pages_are_reused() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    {
        let mut table = Table::open(&path).unwrap();
        for id in 1..=30u32 {
            table.insert(&row(id)).unwrap();
        }
        for id in 15..=30u32 {
            table.delete(id).unwrap();
        }
        table.close().unwrap();
    }
    let file_len_after_deletes = std::fs::metadata(&path).unwrap().len();
    {
        let mut table = Table::open(&path).unwrap();
        assert_eq!(ids(&mut table), (1..=14).collect::<Vec<_>>());

        // Refilling reuses reclaimed pages instead of growing the file.
        for id in 15..=30u32 {
            table.insert(&row(id)).unwrap();
        }
        assert_eq!(ids(&mut table), (1..=30).collect::<Vec<_>>());
        table.close().unwrap();
    }
    assert_eq!(std::fs::metadata(&path).unwrap().len(), file_len_after_deletes);
}

// Reads page `page_num` out of the raw file image.
fn page_at(bytes: &[u8], page_num: u32) -> Node {
    let start = HEADER_SIZE + page_num as usize * PAGE_SIZE;
    let buf: [u8; PAGE_SIZE] = bytes[start..start + PAGE_SIZE].try_into().unwrap();
    Node::from_bytes(&buf)
}

// In-order keys of the subtree at `page_num`, re-parsed from file bytes.
fn collect_keys(bytes: &[u8], page_num: u32, keys: &mut Vec<u32>) {
    let node = page_at(bytes, page_num);
    match node.node_type().unwrap() {
        NodeType::Leaf => {
            for i in 0..node.num_cells() {
                keys.push(node.leaf_key(i).unwrap());
            }
        }
        NodeType::Internal => {
            for i in 0..node.num_keys() {
                collect_keys(bytes, node.internal_child(i).unwrap(), keys);
            }
            assert_ne!(node.right_child(), INVALID_PAGE_NUM);
            collect_keys(bytes, node.right_child(), keys);
        }
    }
}

fn collect_pages(bytes: &[u8], page_num: u32, pages: &mut Vec<u32>) {
    pages.push(page_num);
    let node = page_at(bytes, page_num);
    if node.node_type().unwrap() == NodeType::Internal {
        for i in 0..=node.num_keys() {
            collect_pages(bytes, node.internal_child(i).unwrap(), pages);
        }
    }
}

#[test]
fn file_format_conformance() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    {
        let mut table = Table::open(&path).unwrap();
        for id in 1..=30u32 {
            table.insert(&row(id)).unwrap();
        }
        table.close().unwrap();
    }

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!((bytes.len() - HEADER_SIZE) % PAGE_SIZE, 0);

    // Nothing was deleted, so the freed stack is empty.
    assert_eq!(&bytes[0..4], &0u32.to_le_bytes());

    // Page 0 is the root.
    let root = page_at(&bytes, 0);
    assert!(root.is_root());

    // Re-parsing the page array yields the inserted keys in order.
    let mut keys = Vec::new();
    collect_keys(&bytes, 0, &mut keys);
    assert_eq!(keys, (1..=30).collect::<Vec<_>>());
}

#[test]
fn freed_and_reachable_pages_partition_the_file() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    {
        let mut table = Table::open(&path).unwrap();
        for id in 1..=30u32 {
            table.insert(&row(id)).unwrap();
        }
        for id in 1..=30u32 {
            table.delete(id).unwrap();
        }
        table.close().unwrap();
    }

    let bytes = std::fs::read(&path).unwrap();
    let num_pages = ((bytes.len() - HEADER_SIZE) / PAGE_SIZE) as u32;

    let free_count = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let mut free_pages = Vec::new();
    for i in 0..free_count as usize {
        let start = 4 + i * 4;
        free_pages.push(u32::from_le_bytes(bytes[start..start + 4].try_into().unwrap()));
    }

    let mut tree_pages = Vec::new();
    collect_pages(&bytes, 0, &mut tree_pages);

    // Disjoint, and together they account for every page in the file.
    let mut all: Vec<u32> = tree_pages.iter().chain(free_pages.iter()).copied().collect();
    all.sort_unstable();
    assert_eq!(all, (0..num_pages).collect::<Vec<_>>());
}

#[test]
fn empty_database_selects_nothing() {
    let dir = TempDir::new().unwrap();
    let mut table = Table::open(db_path(&dir)).unwrap();
    assert!(table.rows().unwrap().is_empty());
}
