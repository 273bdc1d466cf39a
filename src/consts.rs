//! Shared format constants (static header, metablock ring, LBA extents).

// -------- Device geometry --------
pub const BLOCK_SIZE: u64 = 4096;

// -------- Static header (block 0) --------
pub const HEADER_MAGIC: &[u8; 16] = b"LBASTOREDATAFILE";
// Fixed-width version strings, NUL padded to 16 bytes.
pub const HEADER_VERSION_CURRENT: &[u8; 16] = b"lbastore-2.0\0\0\0\0";
pub const HEADER_VERSION_OLD: &[u8; 16] = b"lbastore-1.0\0\0\0\0";
pub const HEADER_PAYLOAD_MAX: usize = BLOCK_SIZE as usize - 16 - 16 - 4;

// -------- Metablock ring --------
// Fixed ring of slots right after block 0. A metablock write goes to slot
// (version % META_SLOT_COUNT), so the previously valid record is never
// overwritten before the new one is durable.
pub const META_RING_BASE: u64 = BLOCK_SIZE;
pub const META_SLOT_COUNT: u64 = 8;
pub const META_SLOT_SIZE: u64 = 16 * 1024;
pub const META_RING_SIZE: u64 = META_SLOT_COUNT * META_SLOT_SIZE;

pub const META_MAGIC: &[u8; 8] = b"LBAMETA1";
pub const META_CRC_MARKER: u32 = 0x4352_4332; // "CRC2"
pub const META_VERSION_MARKER: u32 = 0x5645_5231; // "VER1"
// magic8 + crc marker + crc + version marker + version
pub const META_SLOT_HDR_SIZE: usize = 8 + 4 + 4 + 4 + 8;
pub const META_START_VERSION: i64 = 1;

// -------- LBA extents --------
pub const EXTENT_MAGIC: &[u8; 8] = b"LBAEXT01";
pub const SUPERBLOCK_MAGIC: &[u8; 8] = b"LBASUP01";
// Both extent kinds start with {magic8, pad} occupying one entry slot.
pub const EXTENT_HDR_SIZE: u64 = 32;

// On-disk index entry: [reserved u32=0][size u32][block_id u64][recency u64][offset i64]
pub const ENTRY_SIZE: u64 = 32;
// Superblock record: [extent_offset i64][entry_count i64]
pub const SUPERBLOCK_REC_SIZE: u64 = 16;

/// Flagged offset sentinel: "no value / padding / deleted".
pub const NO_OFFSET: i64 = -1;
/// Block id reserved for padding entries (never a real id).
pub const PADDING_BLOCK_ID: u64 = u64::MAX;
/// Sentinel for "no extent" pointers in the metablock.
pub const NO_EXTENT: i64 = -1;

// -------- Block id spaces --------
// Normal and auxiliary (engine metadata) ids are disjoint: auxiliary ids
// have the top bit set.
pub const AUX_ID_BASE: u64 = 1 << 63;

/// First byte offset usable for extents, aligned up to the extent size.
pub fn extent_base(extent_size: u64) -> u64 {
    let end = META_RING_BASE + META_RING_SIZE;
    end.div_ceil(extent_size) * extent_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extent_base_aligned_past_ring() {
        let base = extent_base(64 * 1024);
        assert_eq!(base % (64 * 1024), 0);
        assert!(base >= META_RING_BASE + META_RING_SIZE);
        assert_eq!(base, 196608);
    }

    #[test]
    fn entry_and_slot_geometry() {
        // One header slot plus 2047 entries in a 64 KiB extent.
        assert_eq!((64 * 1024) / ENTRY_SIZE - 1, 2047);
        assert_eq!(META_SLOT_HDR_SIZE, 28);
    }
}
