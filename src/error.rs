use std::io;
use thiserror::Error;

use crate::page::{PageId, PAGE_SIZE};

pub type Result<T> = std::result::Result<T, PoolError>;

/// Error surface for the page cache. Every failure mode callers can
/// distinguish gets its own variant; I/O failures carry the source error.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("pool size must be at least one frame")]
    InvalidPoolSize,
    #[error("max loop must be at least one")]
    InvalidMaxLoop,
    #[error("initial pages must be at least one")]
    InvalidInitialPages,
    #[error("page buffer must be exactly {PAGE_SIZE} bytes, got {0}")]
    InvalidPageSize(usize),
    #[error("checksum mismatch on page {page_id}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        page_id: PageId,
        stored: u32,
        computed: u32,
    },
    #[error("page {0} is not resident")]
    PageNotFound(PageId),
    #[error("page {0} lies beyond the end of the file")]
    PageOutOfBounds(PageId),
    #[error("mapping of {requested} bytes exceeds the maximum map size")]
    MaxMapSizeExceeded { requested: u64 },
    #[error("page {0} was evicted between lookup and pin")]
    PageEvicted(PageId),
    #[error("no evictable frame in the pool")]
    NoFreeFrame,
    #[error("frame {0} holds no page")]
    FrameNotAllocated(usize),
    #[error("frame index {0} out of bounds")]
    FrameOutOfBounds(usize),
    #[error("page {0} is not pinned")]
    NotPinned(PageId),
}
