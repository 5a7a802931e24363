#![forbid(unsafe_code)]

use std::collections::HashMap;

use parking_lot::{RwLock, RwLockWriteGuard};

use crate::page::PageId;

/// The shared page-id → frame-index mapping.
///
/// Residency changes (install, evict) happen only under the exclusive
/// guard returned by [`FrameDirectory::lock`]; releasing that guard is the
/// linearization point for them. Lookups are optimistic and must be
/// re-validated against the frame after any state-changing step.
pub struct FrameDirectory {
    map: RwLock<HashMap<PageId, usize>>,
    pool_size: usize,
}

impl FrameDirectory {
    pub fn new(pool_size: usize) -> Self {
        Self {
            map: RwLock::new(HashMap::with_capacity(pool_size)),
            pool_size,
        }
    }

    /// Number of frames in the pool this directory indexes.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Optimistic lookup under the shared lock.
    pub fn lookup(&self, page_id: PageId) -> Option<usize> {
        self.map.read().get(&page_id).copied()
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.map.read().contains_key(&page_id)
    }

    /// Number of resident pages.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Acquires the exclusive directory lock. All insertions and removals
    /// go through this guard.
    pub fn lock(&self) -> RwLockWriteGuard<'_, HashMap<PageId, usize>> {
        self.map.write()
    }

    /// Drops every mapping. Test support; used by replacer reset.
    pub fn clear(&self) {
        self.map.write().clear();
    }
}
