//! Pager and page cache.
//!
//! The pager owns the database file and a fixed set of in-memory page
//! buffers. Pages are addressed by number; page `i` lives at
//! `HEADER_SIZE + i * PAGE_SIZE` in the file, after the free-page header.
//! At most [`MAX_NUM_LOADED_PAGES`] pages are resident at a time; loading
//! one more evicts the least recently used page whose pin count is zero,
//! writing it back to disk first.
//!
//! Pages are handed out as `Arc<Mutex<Node>>` so a tree operation can hold
//! several pages at once; the pin counters keep everything an active scope
//! still references from being evicted underneath it.

use crate::errors::Error;
use crate::storage::freelist::{FreeList, HEADER_SIZE};
use crate::storage::lru::LruList;
use crate::storage::node::{Node, PAGE_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, trace};

/// Hard ceiling on the database size, and the length of the free-page
/// stack persisted in the header.
pub const TABLE_MAX_PAGES: usize = 400;

/// Resident-set budget. Deliberately small; tree operations must keep their
/// simultaneously pinned pages well under it.
pub const MAX_NUM_LOADED_PAGES: usize = 10;

/// Shared handle to a resident page buffer.
pub type PageRef = Arc<Mutex<Node>>;

/// Locks a page handle for the current step. The engine is single-threaded,
/// so a lock that is already held means a re-entrant access bug, not
/// contention.
pub fn lock_page(page: &PageRef) -> Result<MutexGuard<'_, Node>, Error> {
    page.try_lock()
        .map_err(|_| err!(Storage, "page buffer already locked"))
}

/// Pages pinned during one phase of an operation. Every [`Pager::fetch`]
/// records its pin here; releasing the scope unpins them all, in insertion
/// order, on success and error paths alike.
#[derive(Default)]
pub struct PinScope {
    pages: Vec<u32>,
}

impl PinScope {
    pub fn new() -> Self {
        PinScope { pages: Vec::new() }
    }

    fn record(&mut self, page_num: u32) {
        self.pages.push(page_num);
    }
}

pub struct Pager {
    file: File,
    file_length: u64,
    num_pages: u32,
    slots: [Option<PageRef>; MAX_NUM_LOADED_PAGES],
    /// page number -> slot index, for resident pages.
    resident: [Option<usize>; TABLE_MAX_PAGES],
    /// Pin counts. A page is evictable only at zero; counters rather than
    /// flags so short-lived inner scopes can overlap an outer scope's pins.
    pins: [u16; TABLE_MAX_PAGES],
    lru: LruList,
    free_list: FreeList,
}

impl Pager {
    /// Opens or creates the database file and reads the free-page header.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let file_length = file.metadata()?.len();
        let mut free_list = FreeList::new();
        let mut num_pages = 0;

        if file_length > 0 {
            if file_length < HEADER_SIZE as u64
                || (file_length - HEADER_SIZE as u64) % PAGE_SIZE as u64 != 0
            {
                return Err(err!(
                    Storage,
                    "db file is not a whole number of pages, corrupt file"
                ));
            }
            let mut buf = [0u8; HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            free_list = FreeList::decode(&buf)?;
            num_pages = ((file_length - HEADER_SIZE as u64) / PAGE_SIZE as u64) as u32;
        }

        info!(
            path = %path.display(),
            num_pages,
            free_pages = free_list.len(),
            "Opened database file."
        );

        Ok(Pager {
            file,
            file_length,
            num_pages,
            slots: std::array::from_fn(|_| None),
            resident: [None; TABLE_MAX_PAGES],
            pins: [0; TABLE_MAX_PAGES],
            lru: LruList::new(),
            free_list,
        })
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    /// Runs one phase of an operation under a fresh pin scope, releasing
    /// every pin the phase took whether it succeeded or failed.
    pub fn with_scope<T>(
        &mut self,
        f: impl FnOnce(&mut Pager, &mut PinScope) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut scope = PinScope::new();
        let result = f(self, &mut scope);
        self.release(&mut scope);
        result
    }

    /// Pins `page_num` into `scope` and returns its buffer, loading it from
    /// disk (or zero-filling a fresh page) if it is not resident.
    pub fn fetch(&mut self, page_num: u32, scope: &mut PinScope) -> Result<PageRef, Error> {
        if page_num as usize >= TABLE_MAX_PAGES {
            return Err(err!(
                Storage,
                "tried to fetch page number out of bounds. {} >= {}",
                page_num,
                TABLE_MAX_PAGES
            ));
        }

        self.pins[page_num as usize] += 1;
        scope.record(page_num);
        self.lru.touch(page_num);

        if let Some(slot) = self.resident[page_num as usize] {
            return match &self.slots[slot] {
                Some(page) => Ok(Arc::clone(page)),
                None => Err(err!(Storage, "resident page {} missing from its slot", page_num)),
            };
        }

        // Not resident: materialize a buffer, reading from disk when the
        // page exists there.
        let mut node = Node::zeroed();
        if (page_num as u64) < self.pages_on_disk() {
            let offset = Self::page_offset(page_num);
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(&mut node.data)?;
            trace!(page_num, "Read page from disk.");
        }
        if page_num >= self.num_pages {
            self.num_pages = page_num + 1;
        }

        let slot = match self.free_slot() {
            Some(slot) => slot,
            None => self.evict()?,
        };
        let page = Arc::new(Mutex::new(node));
        self.slots[slot] = Some(Arc::clone(&page));
        self.resident[page_num as usize] = Some(slot);
        Ok(page)
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| slot.is_none())
    }

    /// Walks the LRU list from the tail, skipping pinned pages, writes the
    /// victim back, and returns its freed slot. Failing to find an unpinned
    /// resident page is a bug in the caller's pin discipline.
    fn evict(&mut self) -> Result<usize, Error> {
        let victim = self
            .lru
            .victim(|p| self.pins[p as usize] == 0 && self.resident[p as usize].is_some())
            .ok_or_else(|| err!(Storage, "cannot evict: every loaded page is pinned"))?;

        debug!(page_num = victim, "Evicting page.");
        self.flush_page(victim)?;

        let slot = self.resident[victim as usize]
            .take()
            .ok_or_else(|| err!(Storage, "eviction victim {} is not resident", victim))?;
        self.slots[slot] = None;
        self.lru.remove(victim);
        Ok(slot)
    }

    /// Writes a resident page's buffer to its file offset.
    pub fn flush_page(&mut self, page_num: u32) -> Result<(), Error> {
        let Some(slot) = self.resident[page_num as usize] else {
            return Ok(());
        };
        let page = match &self.slots[slot] {
            Some(page) => Arc::clone(page),
            None => {
                return Err(err!(Storage, "resident page {} missing from its slot", page_num))
            }
        };
        let node = lock_page(&page)?;
        let offset = Self::page_offset(page_num);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&node.data)?;
        let end = offset + PAGE_SIZE as u64;
        if end > self.file_length {
            self.file_length = end;
        }
        Ok(())
    }

    /// Unpins everything `scope` recorded.
    pub fn release(&mut self, scope: &mut PinScope) {
        for page_num in scope.pages.drain(..) {
            let pins = &mut self.pins[page_num as usize];
            *pins = pins.saturating_sub(1);
        }
    }

    /// Page number for a new node: a reclaimed page when one is available,
    /// otherwise the next page appended to the file. The page's prior
    /// content (recycled or zeroed) is whatever is on disk; callers must
    /// initialize the node.
    pub fn unused_page_num(&mut self) -> u32 {
        if let Some(page_num) = self.free_list.pop() {
            debug!(page_num, "Reusing freed page.");
            return page_num;
        }
        let page_num = self.num_pages;
        self.num_pages += 1;
        page_num
    }

    /// Returns `page_num` to the free stack and drops it from the cache
    /// without write-back; its bytes are dead.
    pub fn free_page(&mut self, page_num: u32) {
        debug!(page_num, "Freeing page.");
        self.free_list.push(page_num);
        if let Some(slot) = self.resident[page_num as usize].take() {
            self.slots[slot] = None;
            self.lru.remove(page_num);
        }
    }

    /// Writes the free-page header and every resident page, then syncs.
    /// Required for durability; pages evicted earlier are already on disk.
    pub fn close(&mut self) -> Result<(), Error> {
        self.write_header()?;
        let mut flushed = 0;
        for page_num in 0..TABLE_MAX_PAGES as u32 {
            if self.resident[page_num as usize].is_some() {
                self.flush_page(page_num)?;
                flushed += 1;
            }
        }
        // Freed pages are dropped from the cache without write-back, so the
        // file may end short of `num_pages`; pad it out so reopening sees
        // every allocated page number, including the ones on the free stack.
        let full_length = HEADER_SIZE as u64 + self.num_pages as u64 * PAGE_SIZE as u64;
        if self.file_length < full_length {
            self.file.set_len(full_length)?;
            self.file_length = full_length;
        }
        self.file.sync_all()?;
        info!(flushed, "Flushed database file.");
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), Error> {
        let buf = self.free_list.encode()?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)?;
        if self.file_length < HEADER_SIZE as u64 {
            self.file_length = HEADER_SIZE as u64;
        }
        Ok(())
    }

    fn page_offset(page_num: u32) -> u64 {
        HEADER_SIZE as u64 + page_num as u64 * PAGE_SIZE as u64
    }

    fn pages_on_disk(&self) -> u64 {
        self.file_length.saturating_sub(HEADER_SIZE as u64) / PAGE_SIZE as u64
    }
}
