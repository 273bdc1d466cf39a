//! On-disk index entry codec.
//!
//! Fixed 32-byte layout (LE), written verbatim into LBA extents and into the
//! metablock's inline buffer:
//!   [reserved u32 = 0][size u32][block_id u64][recency u64][offset i64]
//!
//! `offset` is flagged: non-negative values are real byte offsets into the
//! data file; NO_OFFSET (-1) means "no value / padding / deleted". Invariant:
//! size > 0 whenever the offset carries a value. Padding entries additionally
//! use block_id = PADDING_BLOCK_ID and are skipped on replay.

use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{ENTRY_SIZE, NO_OFFSET, PADDING_BLOCK_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub block_id: u64,
    pub recency: u64,
    pub offset: i64,
    pub size: u32,
}

impl IndexEntry {
    pub fn new(block_id: u64, recency: u64, offset: i64, size: u32) -> Self {
        debug_assert!(offset >= 0 || offset == NO_OFFSET, "bad flagged offset");
        debug_assert!(offset == NO_OFFSET || size > 0, "valued entry needs size > 0");
        Self {
            block_id,
            recency,
            offset,
            size,
        }
    }

    /// Entry written to fill the active extent up to a device-block boundary.
    pub fn padding() -> Self {
        Self {
            block_id: PADDING_BLOCK_ID,
            recency: 0,
            offset: NO_OFFSET,
            size: 0,
        }
    }

    #[inline]
    pub fn is_padding(&self) -> bool {
        self.block_id == PADDING_BLOCK_ID
    }

    #[inline]
    pub fn has_value(&self) -> bool {
        self.offset != NO_OFFSET
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), ENTRY_SIZE as usize);
        LittleEndian::write_u32(&mut buf[0..4], 0); // reserved
        LittleEndian::write_u32(&mut buf[4..8], self.size);
        LittleEndian::write_u64(&mut buf[8..16], self.block_id);
        LittleEndian::write_u64(&mut buf[16..24], self.recency);
        LittleEndian::write_i64(&mut buf[24..32], self.offset);
    }

    pub fn encode(&self) -> [u8; ENTRY_SIZE as usize] {
        let mut buf = [0u8; ENTRY_SIZE as usize];
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        debug_assert_eq!(buf.len(), ENTRY_SIZE as usize);
        Self {
            size: LittleEndian::read_u32(&buf[4..8]),
            block_id: LittleEndian::read_u64(&buf[8..16]),
            recency: LittleEndian::read_u64(&buf[16..24]),
            offset: LittleEndian::read_i64(&buf[24..32]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_roundtrip() {
        let e = IndexEntry::new(42, 7, 172032, 4096);
        let got = IndexEntry::decode(&e.encode());
        assert_eq!(got, e);
    }

    #[test]
    fn padding_is_recognized() {
        let p = IndexEntry::padding();
        assert!(p.is_padding());
        assert!(!p.has_value());
        let got = IndexEntry::decode(&p.encode());
        assert!(got.is_padding());
    }

    #[test]
    fn deleted_entry_keeps_recency() {
        let e = IndexEntry::new(9, 55, NO_OFFSET, 0);
        let got = IndexEntry::decode(&e.encode());
        assert!(!got.has_value());
        assert_eq!(got.recency, 55);
        assert!(!got.is_padding());
    }

    #[test]
    fn reserved_field_is_zero() {
        let e = IndexEntry::new(1, 2, 3 * 4096, 16);
        let raw = e.encode();
        assert_eq!(&raw[0..4], &[0, 0, 0, 0]);
    }
}
