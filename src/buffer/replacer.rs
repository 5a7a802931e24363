#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::page::{Page, PageId};
use crate::store::MappedFile;

/// A resident page, shared between the owning frame and its pinners.
pub type PageHandle = Arc<RwLock<Page>>;

/// Capability set a replacement policy offers the pool.
///
/// Variants differ only in how victims are selected; install, pin
/// accounting, and dirty write-back obligations are identical. The
/// replacer borrows the directory from the pool and never owns it.
pub trait Replacer: Send + Sync {
    /// Installs `page` into a victim frame, pinning it once, and returns
    /// its handle. Writes the victim back first if it is dirty. If the
    /// page id turns out to be resident already (a racing installer won),
    /// the existing frame is pinned and returned instead.
    fn request_free(&self, page: Page, store: &MappedFile) -> Result<PageHandle>;

    /// Pins the frame at `frame_idx`, expecting it to hold `page_id`.
    /// Fails with `PageEvicted` when the frame is mid-eviction or has
    /// been recycled for another page since the caller's lookup.
    fn pin(&self, frame_idx: usize, page_id: PageId) -> Result<PageHandle>;

    /// Drops one pin from the frame holding `page_id`, optionally marking
    /// it dirty. Releasing an unpinned page is an error; the count is
    /// left untouched.
    fn unpin(&self, page_id: PageId, is_dirty: bool) -> Result<()>;

    /// Returns the resident page at `frame_idx` without pinning it.
    fn get_page(&self, frame_idx: usize) -> Result<PageHandle>;

    /// Current reference count of the frame at `frame_idx`. Negative
    /// values mean an eviction is in progress.
    fn pin_count(&self, frame_idx: usize) -> Result<i32>;

    /// Clears the directory and every descriptor. Test support.
    fn reset(&self);
}
