#![forbid(unsafe_code)]

//! Concurrent Clock (second-chance) replacement.
//!
//! Sweeps, pins, and unpins run lock-free on per-frame atomics; the
//! directory lock is held only from the residency re-check through the
//! install. A reserved negative `ref_count` marks a frame mid-eviction,
//! fusing the exclusion and the counter into one atomic word.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::buffer::directory::FrameDirectory;
use crate::buffer::replacer::{PageHandle, Replacer};
use crate::error::{PoolError, Result};
use crate::page::{Page, PageId};
use crate::store::MappedFile;

/// `ref_count` value while an eviction holds the frame. Pins observe it
/// and fail instead of attaching to a dying residence.
const EVICTING: i32 = -1;

/// Per-frame descriptor. `ref_count` and `usage_count` are owned by
/// whichever thread holds the eviction claim or at least one pin; the
/// slot itself changes only under the directory lock.
struct FrameDesc {
    slot: Mutex<Option<PageHandle>>,
    ref_count: AtomicI32,
    usage_count: AtomicI32,
    dirty: AtomicBool,
}

impl FrameDesc {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ref_count: AtomicI32::new(0),
            usage_count: AtomicI32::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    fn handle(&self) -> Option<PageHandle> {
        self.slot.lock().clone()
    }
}

pub struct ClockReplacer {
    frames: Vec<FrameDesc>,
    directory: Arc<FrameDirectory>,
    /// Clock hand; starts at −1 so the first advance lands on frame 0.
    next_victim_idx: AtomicI64,
    max_loop: i32,
}

impl ClockReplacer {
    pub fn new(pool_size: usize, max_loop: usize, directory: Arc<FrameDirectory>) -> Self {
        Self {
            frames: (0..pool_size).map(|_| FrameDesc::new()).collect(),
            directory,
            next_victim_idx: AtomicI64::new(-1),
            max_loop: max_loop as i32,
        }
    }

    fn frame(&self, frame_idx: usize) -> Result<&FrameDesc> {
        self.frames
            .get(frame_idx)
            .ok_or(PoolError::FrameOutOfBounds(frame_idx))
    }

    /// Advances the hand and returns the frame index under it.
    fn advance_hand(&self) -> usize {
        let hand = self.next_victim_idx.fetch_add(1, Ordering::AcqRel) + 1;
        (hand % self.frames.len() as i64) as usize
    }

    /// Grants a second-chance credit, capped at `max_loop`.
    fn touch(&self, desc: &FrameDesc) {
        let cap = self.max_loop;
        let _ = desc
            .usage_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| {
                (u < cap).then_some(u + 1)
            });
    }
}

impl Replacer for ClockReplacer {
    fn request_free(&self, page: Page, store: &MappedFile) -> Result<PageHandle> {
        let page_id = page.header.page_id;
        let handle: PageHandle = Arc::new(RwLock::new(page));
        let pool_size = self.frames.len();

        // The sweep has no natural bound; cap it so a fully pinned pool
        // surfaces NoFreeFrame instead of livelocking. A frame can resist
        // eviction for at most max_loop sweeps without being re-pinned.
        let max_steps = pool_size
            .saturating_mul(self.max_loop as usize)
            .saturating_mul(pool_size);
        for _ in 0..max_steps {
            let frame_idx = self.advance_hand();
            let desc = &self.frames[frame_idx];

            // Pinned or mid-eviction.
            if desc.ref_count.load(Ordering::Acquire) != 0 {
                continue;
            }
            // Second chance: burn a usage credit and move on.
            if desc
                .usage_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| {
                    (u > 0).then_some(u - 1)
                })
                .is_ok()
            {
                continue;
            }

            let mut dir = self.directory.lock();

            // The miss may have raced with another installer; attach to
            // the winner's frame instead of loading a second copy.
            if let Some(&existing) = dir.get(&page_id) {
                return self.pin(existing, page_id);
            }

            // Claim the frame. Losing the race just resumes the sweep.
            if desc
                .ref_count
                .compare_exchange(0, EVICTING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            let old = desc.handle();
            if desc.dirty.load(Ordering::Acquire) {
                if let Some(old_handle) = &old {
                    let old_page = old_handle.read();
                    debug!(
                        victim = old_page.header.page_id,
                        incoming = page_id,
                        frame_idx,
                        "buffer.evict.writeback"
                    );
                    if let Err(err) = store.write_page(&old_page) {
                        // Roll the eviction back; the frame returns to
                        // its prior installed state and stays dirty.
                        drop(old_page);
                        desc.ref_count.store(0, Ordering::Release);
                        warn!(frame_idx, error = %err, "buffer.evict.rollback");
                        return Err(err);
                    }
                }
                desc.dirty.store(false, Ordering::Release);
            }

            if let Some(old_handle) = &old {
                let old_id = old_handle.read().header.page_id;
                dir.remove(&old_id);
            }
            dir.insert(page_id, frame_idx);
            *desc.slot.lock() = Some(handle.clone());
            desc.dirty.store(false, Ordering::Release);
            desc.usage_count.store(1, Ordering::Release);
            handle.write().header.set_pinned();
            desc.ref_count.store(1, Ordering::Release);
            return Ok(handle);
        }

        Err(PoolError::NoFreeFrame)
    }

    fn pin(&self, frame_idx: usize, page_id: PageId) -> Result<PageHandle> {
        let desc = self.frame(frame_idx)?;

        // Check the sentinel before incrementing: bumping first could
        // push the counter to zero from below and let a second pinner
        // attach to a frame that is being torn down.
        if desc
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c >= 0).then_some(c + 1)
            })
            .is_err()
        {
            return Err(PoolError::PageEvicted(page_id));
        }

        let Some(handle) = desc.handle() else {
            desc.ref_count.fetch_sub(1, Ordering::AcqRel);
            return Err(PoolError::FrameNotAllocated(frame_idx));
        };

        {
            let mut page = handle.write();
            if page.header.page_id != page_id {
                // The frame was recycled between lookup and pin.
                drop(page);
                desc.ref_count.fetch_sub(1, Ordering::AcqRel);
                return Err(PoolError::PageEvicted(page_id));
            }
            page.header.set_pinned();
        }

        self.touch(desc);
        Ok(handle)
    }

    fn unpin(&self, page_id: PageId, is_dirty: bool) -> Result<()> {
        let frame_idx = self
            .directory
            .lookup(page_id)
            .ok_or(PoolError::PageNotFound(page_id))?;
        let desc = self.frame(frame_idx)?;
        let handle = desc
            .handle()
            .ok_or(PoolError::FrameNotAllocated(frame_idx))?;
        if handle.read().header.page_id != page_id {
            // Evicted between lookup and here; the pin this release pairs
            // with no longer exists.
            return Err(PoolError::PageNotFound(page_id));
        }

        if is_dirty {
            desc.dirty.store(true, Ordering::Release);
            handle.write().header.set_dirty();
        }

        match desc
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c > 0).then_some(c - 1)
            }) {
            Ok(previous) => {
                if previous == 1 {
                    handle.write().header.clear_pinned();
                }
                Ok(())
            }
            Err(observed) => {
                warn!(page_id, frame_idx, observed, "buffer.unpin.over_release");
                Err(PoolError::NotPinned(page_id))
            }
        }
    }

    fn get_page(&self, frame_idx: usize) -> Result<PageHandle> {
        self.frame(frame_idx)?
            .handle()
            .ok_or(PoolError::FrameNotAllocated(frame_idx))
    }

    fn pin_count(&self, frame_idx: usize) -> Result<i32> {
        Ok(self.frame(frame_idx)?.ref_count.load(Ordering::Acquire))
    }

    fn reset(&self) {
        self.directory.clear();
        for desc in &self.frames {
            *desc.slot.lock() = None;
            desc.ref_count.store(0, Ordering::Release);
            desc.usage_count.store(0, Ordering::Release);
            desc.dirty.store(false, Ordering::Release);
        }
        self.next_victim_idx.store(-1, Ordering::Release);
    }
}
