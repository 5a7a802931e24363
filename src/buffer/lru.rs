#![forbid(unsafe_code)]

//! Least-recently-used replacement over intrusive link arrays.
//!
//! Frames are threaded through a doubly linked list by index: evict from
//! the head, install at the tail. Unused frames come from a free list
//! first. Unlike the Clock variant, all descriptor state sits behind one
//! mutex; the directory lock is still taken first so residency changes
//! linearize the same way.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::buffer::directory::FrameDirectory;
use crate::buffer::replacer::{PageHandle, Replacer};
use crate::error::{PoolError, Result};
use crate::page::{Page, PageId};
use crate::store::MappedFile;

const NIL: isize = -1;

struct LruNode {
    page: Option<PageHandle>,
    prev: isize,
    next: isize,
    pin_count: i32,
    dirty: bool,
}

impl LruNode {
    fn empty() -> Self {
        Self {
            page: None,
            prev: NIL,
            next: NIL,
            pin_count: 0,
            dirty: false,
        }
    }
}

struct LruInner {
    nodes: Vec<LruNode>,
    /// Head of the recency list; evicted first.
    head: isize,
    /// Tail of the recency list; most recently installed.
    tail: isize,
    next_free: Vec<isize>,
    free_head: isize,
}

impl LruInner {
    fn new(pool_size: usize) -> Self {
        let mut next_free: Vec<isize> = (1..=pool_size as isize).collect();
        if let Some(last) = next_free.last_mut() {
            *last = NIL;
        }
        Self {
            nodes: (0..pool_size).map(|_| LruNode::empty()).collect(),
            head: NIL,
            tail: NIL,
            next_free,
            free_head: 0,
        }
    }

    fn alloc_from_free(&mut self) -> Option<usize> {
        if self.free_head == NIL {
            return None;
        }
        let idx = self.free_head as usize;
        self.free_head = self.next_free[idx];
        self.next_free[idx] = NIL;
        Some(idx)
    }

    fn push_tail(&mut self, frame_idx: usize) {
        let idx = frame_idx as isize;
        self.nodes[frame_idx].prev = self.tail;
        self.nodes[frame_idx].next = NIL;
        if self.tail != NIL {
            self.nodes[self.tail as usize].next = idx;
        }
        self.tail = idx;
        if self.head == NIL {
            self.head = idx;
        }
    }

    fn unlink(&mut self, frame_idx: usize) {
        let node_prev = self.nodes[frame_idx].prev;
        let node_next = self.nodes[frame_idx].next;
        match (node_prev, node_next) {
            (NIL, NIL) => {
                self.head = NIL;
                self.tail = NIL;
            }
            (NIL, next) => {
                self.head = next;
                self.nodes[next as usize].prev = NIL;
            }
            (prev, NIL) => {
                self.tail = prev;
                self.nodes[prev as usize].next = NIL;
            }
            (prev, next) => {
                self.nodes[prev as usize].next = next;
                self.nodes[next as usize].prev = prev;
            }
        }
        self.nodes[frame_idx].prev = NIL;
        self.nodes[frame_idx].next = NIL;
    }

    /// First unpinned frame from the head of the recency list.
    fn find_victim(&self) -> Option<usize> {
        let mut current = self.head;
        while current != NIL {
            let idx = current as usize;
            if self.nodes[idx].pin_count == 0 {
                return Some(idx);
            }
            current = self.nodes[idx].next;
        }
        None
    }
}

pub struct LruReplacer {
    inner: Mutex<LruInner>,
    directory: Arc<FrameDirectory>,
}

impl LruReplacer {
    pub fn new(pool_size: usize, directory: Arc<FrameDirectory>) -> Self {
        Self {
            inner: Mutex::new(LruInner::new(pool_size)),
            directory,
        }
    }

    fn check_bounds(&self, frame_idx: usize) -> Result<()> {
        if frame_idx >= self.directory.pool_size() {
            return Err(PoolError::FrameOutOfBounds(frame_idx));
        }
        Ok(())
    }
}

impl Replacer for LruReplacer {
    fn request_free(&self, page: Page, store: &MappedFile) -> Result<PageHandle> {
        let page_id = page.header.page_id;

        // Directory first, descriptor state second; same order everywhere.
        let mut dir = self.directory.lock();
        let mut inner = self.inner.lock();

        if let Some(&existing) = dir.get(&page_id) {
            let node = &mut inner.nodes[existing];
            let handle = node
                .page
                .clone()
                .ok_or(PoolError::FrameNotAllocated(existing))?;
            node.pin_count += 1;
            handle.write().header.set_pinned();
            return Ok(handle);
        }

        let frame_idx = match inner.alloc_from_free() {
            Some(idx) => idx,
            None => {
                let victim = inner.find_victim().ok_or(PoolError::NoFreeFrame)?;
                if inner.nodes[victim].dirty {
                    let old_handle = inner.nodes[victim]
                        .page
                        .clone()
                        .ok_or(PoolError::FrameNotAllocated(victim))?;
                    let old_page = old_handle.read();
                    debug!(
                        victim = old_page.header.page_id,
                        incoming = page_id,
                        frame_idx = victim,
                        "buffer.evict.writeback"
                    );
                    if let Err(err) = store.write_page(&old_page) {
                        warn!(frame_idx = victim, error = %err, "buffer.evict.rollback");
                        return Err(err);
                    }
                    inner.nodes[victim].dirty = false;
                }
                if let Some(old_handle) = &inner.nodes[victim].page {
                    let old_id = old_handle.read().header.page_id;
                    dir.remove(&old_id);
                }
                inner.unlink(victim);
                victim
            }
        };

        let handle: PageHandle = Arc::new(RwLock::new(page));
        {
            let node = &mut inner.nodes[frame_idx];
            node.page = Some(handle.clone());
            node.pin_count = 1;
            node.dirty = false;
        }
        inner.push_tail(frame_idx);
        dir.insert(page_id, frame_idx);
        handle.write().header.set_pinned();
        Ok(handle)
    }

    fn pin(&self, frame_idx: usize, page_id: PageId) -> Result<PageHandle> {
        self.check_bounds(frame_idx)?;
        let mut inner = self.inner.lock();
        let node = &mut inner.nodes[frame_idx];
        let handle = node
            .page
            .clone()
            .ok_or(PoolError::FrameNotAllocated(frame_idx))?;
        if handle.read().header.page_id != page_id {
            return Err(PoolError::PageEvicted(page_id));
        }
        node.pin_count += 1;
        handle.write().header.set_pinned();
        Ok(handle)
    }

    fn unpin(&self, page_id: PageId, is_dirty: bool) -> Result<()> {
        let frame_idx = self
            .directory
            .lookup(page_id)
            .ok_or(PoolError::PageNotFound(page_id))?;
        self.check_bounds(frame_idx)?;
        let mut inner = self.inner.lock();
        let node = &mut inner.nodes[frame_idx];
        let handle = node
            .page
            .clone()
            .ok_or(PoolError::FrameNotAllocated(frame_idx))?;
        if node.pin_count <= 0 {
            warn!(page_id, frame_idx, "buffer.unpin.over_release");
            return Err(PoolError::NotPinned(page_id));
        }
        if is_dirty {
            node.dirty = true;
            handle.write().header.set_dirty();
        }
        node.pin_count -= 1;
        if node.pin_count == 0 {
            handle.write().header.clear_pinned();
        }
        Ok(())
    }

    fn get_page(&self, frame_idx: usize) -> Result<PageHandle> {
        self.check_bounds(frame_idx)?;
        self.inner.lock().nodes[frame_idx]
            .page
            .clone()
            .ok_or(PoolError::FrameNotAllocated(frame_idx))
    }

    fn pin_count(&self, frame_idx: usize) -> Result<i32> {
        self.check_bounds(frame_idx)?;
        Ok(self.inner.lock().nodes[frame_idx].pin_count)
    }

    fn reset(&self) {
        self.directory.clear();
        let mut inner = self.inner.lock();
        *inner = LruInner::new(self.directory.pool_size());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn lru(pool_size: usize) -> (LruReplacer, Arc<FrameDirectory>) {
        let directory = Arc::new(FrameDirectory::new(pool_size));
        (LruReplacer::new(pool_size, directory.clone()), directory)
    }

    #[test]
    fn fills_free_frames_before_evicting() {
        let dir = tempdir().unwrap();
        let store = MappedFile::open(dir.path().join("lru.db"), 1).unwrap();
        let (replacer, directory) = lru(3);

        for id in 0..3 {
            replacer.request_free(Page::new(id), &store).unwrap();
        }
        assert_eq!(directory.len(), 3);
        // All three frames came off the free list.
        assert_eq!(replacer.inner.lock().free_head, NIL);
    }

    #[test]
    fn evicts_least_recently_installed_unpinned() {
        let dir = tempdir().unwrap();
        let store = MappedFile::open(dir.path().join("lru.db"), 1).unwrap();
        let (replacer, directory) = lru(2);

        replacer.request_free(Page::new(0), &store).unwrap();
        replacer.request_free(Page::new(1), &store).unwrap();
        replacer.unpin(0, false).unwrap();
        replacer.unpin(1, false).unwrap();

        // Page 0 sits at the head of the recency list.
        replacer.request_free(Page::new(2), &store).unwrap();
        assert!(!directory.contains(0));
        assert!(directory.contains(1));
        assert!(directory.contains(2));
    }

    #[test]
    fn pinned_head_is_skipped() {
        let dir = tempdir().unwrap();
        let store = MappedFile::open(dir.path().join("lru.db"), 1).unwrap();
        let (replacer, directory) = lru(2);

        replacer.request_free(Page::new(0), &store).unwrap();
        replacer.request_free(Page::new(1), &store).unwrap();
        replacer.unpin(1, false).unwrap();

        // Page 0 is still pinned, so the younger page 1 goes instead.
        replacer.request_free(Page::new(2), &store).unwrap();
        assert!(directory.contains(0));
        assert!(!directory.contains(1));
        assert!(directory.contains(2));
    }

    #[test]
    fn everything_pinned_means_no_free_frame() {
        let dir = tempdir().unwrap();
        let store = MappedFile::open(dir.path().join("lru.db"), 1).unwrap();
        let (replacer, _directory) = lru(2);

        replacer.request_free(Page::new(0), &store).unwrap();
        replacer.request_free(Page::new(1), &store).unwrap();
        assert!(matches!(
            replacer.request_free(Page::new(2), &store),
            Err(PoolError::NoFreeFrame)
        ));
    }

    #[test]
    fn dirty_victim_is_written_back() {
        let dir = tempdir().unwrap();
        let store = MappedFile::open(dir.path().join("lru.db"), 1).unwrap();
        let (replacer, _directory) = lru(1);

        let handle = replacer
            .request_free(Page::with_payload(0, b"original"), &store)
            .unwrap();
        handle.write().payload[..7].copy_from_slice(b"UPDATED");
        replacer.unpin(0, true).unwrap();

        replacer.request_free(Page::new(1), &store).unwrap();
        assert_eq!(&store.read_page(0).unwrap().payload[..7], b"UPDATED");
    }

    #[test]
    fn double_install_attaches_to_the_resident_frame() {
        let dir = tempdir().unwrap();
        let store = MappedFile::open(dir.path().join("lru.db"), 1).unwrap();
        let (replacer, directory) = lru(2);

        let first = replacer.request_free(Page::new(0), &store).unwrap();
        let second = replacer.request_free(Page::new(0), &store).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let frame_idx = directory.lookup(0).unwrap();
        assert_eq!(replacer.pin_count(frame_idx).unwrap(), 2);
    }

    #[test]
    fn reset_restores_the_free_list() {
        let dir = tempdir().unwrap();
        let store = MappedFile::open(dir.path().join("lru.db"), 1).unwrap();
        let (replacer, directory) = lru(2);

        replacer.request_free(Page::new(0), &store).unwrap();
        replacer.reset();
        assert!(directory.is_empty());
        let inner = replacer.inner.lock();
        assert_eq!(inner.free_head, 0);
        assert_eq!(inner.head, NIL);
        assert_eq!(inner.tail, NIL);
    }
}
