//! Persistent free-page stack.
//!
//! Pages emptied by deletion or merging are pushed here and handed back out
//! before the file is grown. The stack is stored in the file header so
//! reclamation survives restarts. A freed page keeps its stale bytes on
//! disk; allocation sites must reinitialize the node before use.

use crate::errors::Error;
use crate::storage::pager::TABLE_MAX_PAGES;
use bincode::{config, Decode, Encode};

/// Encoded header size: `free_pages_count` plus the full stack array.
pub const HEADER_SIZE: usize = 4 + TABLE_MAX_PAGES * 4;

/// On-disk image of the free-page stack. Only the first `count` entries of
/// `pages` are meaningful.
#[derive(Encode, Decode)]
struct FreeListHeader {
    count: u32,
    pages: [u32; TABLE_MAX_PAGES],
}

/// Bounded LIFO of reclaimable page numbers.
#[derive(Default)]
pub struct FreeList {
    pages: heapless::Vec<u32, TABLE_MAX_PAGES>,
}

impl FreeList {
    pub fn new() -> Self {
        FreeList {
            pages: heapless::Vec::new(),
        }
    }

    /// Silent on overflow; the stack is bounded by the page budget, so a
    /// full stack means the number is simply not reclaimed.
    pub fn push(&mut self, page_num: u32) {
        let _ = self.pages.push(page_num);
    }

    pub fn pop(&mut self) -> Option<u32> {
        self.pages.pop()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Fixed-width little-endian encoding, so the header bytes are exactly
    /// the documented file layout.
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE], Error> {
        let mut header = FreeListHeader {
            count: self.pages.len() as u32,
            pages: [0u32; TABLE_MAX_PAGES],
        };
        header.pages[..self.pages.len()].copy_from_slice(&self.pages);

        let mut buf = [0u8; HEADER_SIZE];
        let written = bincode::encode_into_slice(
            &header,
            &mut buf,
            config::standard().with_fixed_int_encoding(),
        )
        .map_err(|e| err!(Encoding, "failed to encode file header. {}", e))?;
        if written != HEADER_SIZE {
            return Err(err!(
                Encoding,
                "file header size mismatch (expected={}, got={})",
                HEADER_SIZE,
                written
            ));
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let (header, _): (FreeListHeader, usize) =
            bincode::decode_from_slice(buf, config::standard().with_fixed_int_encoding())
                .map_err(|e| err!(Encoding, "failed to decode file header. {}", e))?;
        if header.count as usize > TABLE_MAX_PAGES {
            return Err(err!(
                Encoding,
                "free page count {} exceeds page budget {}",
                header.count,
                TABLE_MAX_PAGES
            ));
        }
        let mut list = FreeList::new();
        for &page_num in &header.pages[..header.count as usize] {
            list.push(page_num);
        }
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifo_order() {
        let mut list = FreeList::new();
        assert!(list.is_empty());
        assert_eq!(list.pop(), None);

        list.push(5);
        list.push(10);
        assert_eq!(list.len(), 2);
        assert_eq!(list.pop(), Some(10));
        assert_eq!(list.pop(), Some(5));
        assert_eq!(list.pop(), None);
    }

    #[test]
    fn test_overflow_is_silent() {
        let mut list = FreeList::new();
        for i in 0..(TABLE_MAX_PAGES as u32 + 5) {
            list.push(i);
        }
        assert_eq!(list.len(), TABLE_MAX_PAGES);
    }

    #[test]
    fn test_encode_layout() {
        let mut list = FreeList::new();
        list.push(3);
        list.push(9);
        let buf = list.encode().unwrap();

        assert_eq!(buf.len(), 1604);
        // count at offset 0, entries from offset 4, little-endian.
        assert_eq!(&buf[0..4], &2u32.to_le_bytes());
        assert_eq!(&buf[4..8], &3u32.to_le_bytes());
        assert_eq!(&buf[8..12], &9u32.to_le_bytes());
        assert!(buf[12..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_roundtrip() {
        let mut list = FreeList::new();
        for page in [7u32, 1, 300] {
            list.push(page);
        }
        let buf = list.encode().unwrap();
        let mut back = FreeList::decode(&buf).unwrap();
        assert_eq!(back.pop(), Some(300));
        assert_eq!(back.pop(), Some(1));
        assert_eq!(back.pop(), Some(7));
    }
}
