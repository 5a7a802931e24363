#![forbid(unsafe_code)]

//! Fixed 4096-byte page with a 16-byte header and CRC32 integrity.
//!
//! On-disk layout, all fields little-endian:
//!
//! | offset | size | field    |
//! |--------|------|----------|
//! | 0      | 8    | page id  |
//! | 8      | 4    | checksum |
//! | 12     | 2    | flags    |
//! | 14     | 2    | reserved |
//! | 16     | 4080 | payload  |
//!
//! The checksum covers bytes `[0..8)` and `[12..4096)`, i.e. everything
//! except the checksum field itself, which keeps the computation stable
//! regardless of where the checksum lands in the header.

use std::fmt;

use crate::error::{PoolError, Result};

/// Unit of disk I/O and cache residency.
pub const PAGE_SIZE: usize = 4096;
/// Bytes occupied by the serialized header.
pub const PAGE_HEADER_SIZE: usize = 16;
/// Bytes available to the client in each page.
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Page is dirty in memory relative to disk. Advisory on disk; the
/// authoritative dirty state lives in the frame descriptor.
pub const DIRTY_FLAG: u16 = 1 << 0;
/// Page is pinned by at least one caller. Advisory, as above.
pub const PINNED_FLAG: u16 = 1 << 1;

pub type PageId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageHeader {
    pub page_id: PageId,
    pub checksum: u32,
    pub flags: u16,
}

impl PageHeader {
    pub fn set_dirty(&mut self) {
        self.flags |= DIRTY_FLAG;
    }

    pub fn clear_dirty(&mut self) {
        self.flags &= !DIRTY_FLAG;
    }

    pub fn is_dirty(&self) -> bool {
        self.flags & DIRTY_FLAG != 0
    }

    pub fn set_pinned(&mut self) {
        self.flags |= PINNED_FLAG;
    }

    pub fn clear_pinned(&mut self) {
        self.flags &= !PINNED_FLAG;
    }

    pub fn is_pinned(&self) -> bool {
        self.flags & PINNED_FLAG != 0
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    pub header: PageHeader,
    pub payload: [u8; PAGE_PAYLOAD_SIZE],
}

impl Page {
    /// Creates an empty page with the given id.
    pub fn new(page_id: PageId) -> Self {
        Self {
            header: PageHeader {
                page_id,
                checksum: 0,
                flags: 0,
            },
            payload: [0u8; PAGE_PAYLOAD_SIZE],
        }
    }

    /// Creates a page whose payload starts with `data`, truncated to the
    /// payload capacity. The remainder is zero-filled.
    pub fn with_payload(page_id: PageId, data: &[u8]) -> Self {
        let mut page = Self::new(page_id);
        let len = data.len().min(PAGE_PAYLOAD_SIZE);
        page.payload[..len].copy_from_slice(&data[..len]);
        page
    }

    /// Packs the page into its on-disk representation, computing the
    /// checksum over everything but the checksum field.
    pub fn serialize(&self) -> [u8; PAGE_SIZE] {
        let mut buf = [0u8; PAGE_SIZE];
        buf[0..8].copy_from_slice(&self.header.page_id.to_le_bytes());
        buf[12..14].copy_from_slice(&self.header.flags.to_le_bytes());
        buf[PAGE_HEADER_SIZE..].copy_from_slice(&self.payload);
        let crc = page_checksum(&buf);
        buf[8..12].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Unpacks a page from its on-disk representation, validating length
    /// and checksum. Flags are preserved but not acted on.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PAGE_SIZE {
            return Err(PoolError::InvalidPageSize(bytes.len()));
        }
        let page_id = u64::from_le_bytes(bytes[0..8].try_into().expect("8-byte slice"));
        let stored = u32::from_le_bytes(bytes[8..12].try_into().expect("4-byte slice"));
        let computed = page_checksum(bytes);
        if stored != computed {
            return Err(PoolError::ChecksumMismatch {
                page_id,
                stored,
                computed,
            });
        }
        let flags = u16::from_le_bytes(bytes[12..14].try_into().expect("2-byte slice"));
        let mut payload = [0u8; PAGE_PAYLOAD_SIZE];
        payload.copy_from_slice(&bytes[PAGE_HEADER_SIZE..]);
        Ok(Self {
            header: PageHeader {
                page_id,
                checksum: stored,
                flags,
            },
            payload,
        })
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

/// CRC32/IEEE over the page image with the checksum field skipped.
fn page_checksum(buf: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[0..8]);
    hasher.update(&buf[12..]);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_deserialize_roundtrip() {
        let mut page = Page::with_payload(7, b"instructor record: ID=12345");
        page.header.set_dirty();

        let buf = page.serialize();
        let restored = Page::deserialize(&buf).expect("valid page");

        assert_eq!(restored.header.page_id, 7);
        assert_eq!(restored.header.flags, page.header.flags);
        assert_eq!(restored.payload, page.payload);
        assert_eq!(
            restored.header.checksum,
            u32::from_le_bytes(buf[8..12].try_into().unwrap())
        );
    }

    #[test]
    fn deserialize_rejects_wrong_length() {
        let short = [0u8; PAGE_SIZE - 1];
        match Page::deserialize(&short) {
            Err(PoolError::InvalidPageSize(len)) => assert_eq!(len, PAGE_SIZE - 1),
            other => panic!("unexpected result: {other:?}"),
        }
        let long = [0u8; PAGE_SIZE + 1];
        assert!(matches!(
            Page::deserialize(&long),
            Err(PoolError::InvalidPageSize(_))
        ));
    }

    #[test]
    fn single_byte_flips_are_detected() {
        let page = Page::with_payload(3, &[0xAB; 64]);
        let buf = page.serialize();

        // Every offset outside the checksum field itself must trip the CRC.
        for i in (0..PAGE_SIZE).filter(|i| !(8..12).contains(i)) {
            let mut corrupt = buf;
            corrupt[i] ^= 0xFF;
            assert!(
                matches!(
                    Page::deserialize(&corrupt),
                    Err(PoolError::ChecksumMismatch { .. })
                ),
                "flip at offset {i} went undetected"
            );
        }
    }

    #[test]
    fn corrupt_checksum_field_is_detected() {
        let page = Page::new(0);
        let mut buf = page.serialize();
        buf[9] ^= 0x01;
        assert!(matches!(
            Page::deserialize(&buf),
            Err(PoolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn payload_is_truncated_to_capacity() {
        let oversized = vec![0x5A; PAGE_SIZE];
        let page = Page::with_payload(1, &oversized);
        assert!(page.payload.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn flag_helpers_are_idempotent() {
        let mut header = PageHeader::default();
        assert!(!header.is_dirty());
        header.set_dirty();
        header.set_dirty();
        assert!(header.is_dirty());
        assert_eq!(header.flags, DIRTY_FLAG);

        header.set_pinned();
        assert!(header.is_pinned());
        header.clear_dirty();
        header.clear_dirty();
        assert!(!header.is_dirty());
        assert!(header.is_pinned());
        header.clear_pinned();
        assert_eq!(header.flags, 0);
    }
}
