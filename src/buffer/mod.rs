//! Buffer pool: a fixed array of frames over the mapped file store, with
//! a pluggable replacement policy.
//!
//! The pool owns the store and the frame directory; the replacer borrows
//! the directory and is handed the store per request. Callers must drop
//! any guard taken on a [`PageHandle`] before invoking further pool
//! operations, release included; holding one across a call can deadlock
//! with an eviction.

mod clock;
mod directory;
mod lru;
mod replacer;

pub use clock::ClockReplacer;
pub use directory::FrameDirectory;
pub use lru::LruReplacer;
pub use replacer::{PageHandle, Replacer};

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::{PoolError, Result};
use crate::page::PageId;
use crate::store::MappedFile;

/// Construction parameters for [`BufferPool::open`].
#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Number of in-memory frames.
    pub pool_size: usize,
    /// Cap on the second-chance usage count; bounds how many sweeps a
    /// frame can survive without being re-pinned.
    pub max_loop: usize,
    /// Initial backing file size in pages.
    pub initial_pages: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            pool_size: 128,
            max_loop: 3,
            initial_pages: 1,
        }
    }
}

impl PoolOptions {
    fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(PoolError::InvalidPoolSize);
        }
        if self.max_loop == 0 {
            return Err(PoolError::InvalidMaxLoop);
        }
        if self.initial_pages == 0 {
            return Err(PoolError::InvalidInitialPages);
        }
        Ok(())
    }
}

pub struct BufferPool {
    store: Arc<MappedFile>,
    directory: Arc<FrameDirectory>,
    replacer: Arc<dyn Replacer>,
}

impl BufferPool {
    /// Opens the backing file and builds a pool with the Clock replacer.
    pub fn open(path: impl AsRef<Path>, options: PoolOptions) -> Result<Self> {
        options.validate()?;
        let store = Arc::new(MappedFile::open(path, options.initial_pages)?);
        let directory = Arc::new(FrameDirectory::new(options.pool_size));
        let replacer = Arc::new(ClockReplacer::new(
            options.pool_size,
            options.max_loop,
            directory.clone(),
        ));
        debug!(
            pool_size = options.pool_size,
            max_loop = options.max_loop,
            "buffer.open"
        );
        Ok(Self::new(store, directory, replacer))
    }

    /// Assembles a pool from parts; used to swap in a different replacer.
    /// The directory handed to the replacer must be the same one given
    /// here.
    pub fn new(
        store: Arc<MappedFile>,
        directory: Arc<FrameDirectory>,
        replacer: Arc<dyn Replacer>,
    ) -> Self {
        Self {
            store,
            directory,
            replacer,
        }
    }

    /// Returns the page pinned, loading it from the store on a miss. The
    /// caller owes exactly one [`release`](Self::release) per successful
    /// call.
    pub fn allocate_frame(&self, page_id: PageId) -> Result<PageHandle> {
        loop {
            if let Some(frame_idx) = self.directory.lookup(page_id) {
                match self.replacer.pin(frame_idx, page_id) {
                    Ok(handle) => return Ok(handle),
                    // Lost a race with an eviction; re-drive the lookup.
                    Err(PoolError::PageEvicted(_)) => continue,
                    Err(err) => return Err(err),
                }
            }
            let page = self.store.read_page(page_id)?;
            return self.replacer.request_free(page, &self.store);
        }
    }

    /// Lookup-only variant of [`allocate_frame`](Self::allocate_frame):
    /// pins on a hit, never touches the store.
    pub fn get_page(&self, page_id: PageId) -> Result<PageHandle> {
        loop {
            let Some(frame_idx) = self.directory.lookup(page_id) else {
                return Err(PoolError::PageNotFound(page_id));
            };
            match self.replacer.pin(frame_idx, page_id) {
                Ok(handle) => return Ok(handle),
                Err(PoolError::PageEvicted(_)) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Drops one pin, optionally marking the page dirty for write-back on
    /// eviction. Pin/release pairing is the caller's responsibility.
    pub fn release(&self, page_id: PageId, is_dirty: bool) -> Result<()> {
        self.replacer.unpin(page_id, is_dirty)
    }

    /// Current reference count for a resident page. Diagnostics.
    pub fn pin_count(&self, page_id: PageId) -> Result<i32> {
        let frame_idx = self
            .directory
            .lookup(page_id)
            .ok_or(PoolError::PageNotFound(page_id))?;
        self.replacer.pin_count(frame_idx)
    }

    /// Whether the page is resident right now.
    pub fn is_resident(&self, page_id: PageId) -> bool {
        self.directory.contains(page_id)
    }

    pub fn store(&self) -> &MappedFile {
        &self.store
    }

    pub fn directory(&self) -> &FrameDirectory {
        &self.directory
    }

    /// Drops every residency and zeroes all descriptors. Test support;
    /// no I/O happens, dirty pages included.
    pub fn reset(&self) {
        self.replacer.reset();
    }
}
