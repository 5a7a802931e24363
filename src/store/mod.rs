//! Page-indexed random access over a memory-mapped file.
//!
//! The whole file is projected into one contiguous writable mapping.
//! Reads copy the page image out of the mapping under a shared lock so a
//! concurrent grow can never dangle a caller's buffer; writes and growth
//! take the lock exclusively. Serialization happens outside the lock.

use std::cmp::max;
use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{PoolError, Result};
use crate::page::{Page, PageId, PAGE_SIZE};

/// Upper bound on the mapped region: 256 MiB, or 65,536 pages.
pub const MAX_MAP_SIZE: u64 = 256 * 1024 * 1024;

struct MapInner {
    file: std::fs::File,
    map: MmapMut,
    len: u64,
}

/// A file of raw 4096-byte page slots addressed by page id, starting at
/// offset 0. The store persists nothing beyond the slots themselves.
pub struct MappedFile {
    inner: RwLock<MapInner>,
}

impl MappedFile {
    /// Opens (creating if absent) the backing file, sizes it to
    /// `initial_pages` slots, and establishes a writable mapping.
    pub fn open(path: impl AsRef<Path>, initial_pages: usize) -> Result<Self> {
        if initial_pages == 0 {
            return Err(PoolError::InvalidInitialPages);
        }
        let len = (initial_pages as u64).saturating_mul(PAGE_SIZE as u64);
        if len > MAX_MAP_SIZE {
            return Err(PoolError::MaxMapSizeExceeded { requested: len });
        }

        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(len)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        debug!(path = %path.display(), pages = initial_pages, bytes = len, "store.open");
        Ok(Self {
            inner: RwLock::new(MapInner { file, map, len }),
        })
    }

    /// Reads and deserializes the page at `page_id`, validating its
    /// checksum. The 4096 bytes are copied out of the mapping before the
    /// shared lock is released.
    pub fn read_page(&self, page_id: PageId) -> Result<Page> {
        let offset = page_offset(page_id)?;
        let mut buf = [0u8; PAGE_SIZE];
        {
            let inner = self.inner.read();
            let end = offset
                .checked_add(PAGE_SIZE as u64)
                .ok_or(PoolError::PageOutOfBounds(page_id))?;
            if end > inner.len {
                return Err(PoolError::PageOutOfBounds(page_id));
            }
            buf.copy_from_slice(&inner.map[offset as usize..end as usize]);
        }
        Page::deserialize(&buf)
    }

    /// Serializes and writes the page into its slot, growing the file if
    /// the slot lies beyond the current end.
    pub fn write_page(&self, page: &Page) -> Result<()> {
        let buf = page.serialize();
        let offset = page_offset(page.header.page_id)?;
        let end = offset
            .checked_add(PAGE_SIZE as u64)
            .ok_or(PoolError::PageOutOfBounds(page.header.page_id))?;

        let mut inner = self.inner.write();
        if end > inner.len {
            grow(&mut inner, end)?;
        }
        inner.map[offset as usize..end as usize].copy_from_slice(&buf);
        Ok(())
    }

    /// Current file length in bytes.
    pub fn len(&self) -> u64 {
        self.inner.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of page slots the file currently holds.
    pub fn page_count(&self) -> u64 {
        self.len() / PAGE_SIZE as u64
    }

    /// Flushes the mapping to disk.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.read();
        inner.map.flush()?;
        Ok(())
    }

    /// Flushes and syncs; the mapping itself is released on drop.
    pub fn close(&self) -> Result<()> {
        let inner = self.inner.read();
        inner.map.flush()?;
        inner.file.sync_all()?;
        Ok(())
    }
}

/// Doubles the mapping (at least to `required`, capped at the limit). The
/// new mapping is established before the old one is retired, so a failed
/// grow leaves the store in its pre-grow state.
fn grow(inner: &mut MapInner, required: u64) -> Result<()> {
    if required > MAX_MAP_SIZE {
        return Err(PoolError::MaxMapSizeExceeded {
            requested: required,
        });
    }
    let new_len = max(inner.len.saturating_mul(2), required).min(MAX_MAP_SIZE);
    inner.file.set_len(new_len)?;
    let map = unsafe { MmapMut::map_mut(&inner.file)? };
    debug!(old_len = inner.len, new_len, "store.grow");
    inner.map = map;
    inner.len = new_len;
    Ok(())
}

fn page_offset(page_id: PageId) -> Result<u64> {
    page_id
        .checked_mul(PAGE_SIZE as u64)
        .ok_or(PoolError::PageOutOfBounds(page_id))
}
