//! Metablock — the versioned, CRC-protected root record, rotated through a
//! fixed ring of slots.
//!
//! Slot layout (LE):
//!   [magic8][crc_marker u32][crc u32][version_marker u32][version i64][body]
//! Body:
//!   [extent watermark u64][shard_count u32]
//!   per shard: [active_ptr i64][active_count u32][superblock_ptr i64][superblock_count u32]
//!   [inline_capacity u32][inline_count u32][inline entries: capacity x 32 B]
//!   [data-block-manager active extent i64]
//!
//! The CRC is computed over (version ‖ body). Writes go to slot
//! (version % META_SLOT_COUNT) and are globally serialized by the store's
//! state lock, so versions are strictly ordered. Startup scans every slot
//! and picks the highest CRC-valid version; a single corrupt or torn slot is
//! merely stale, never fatal — only a ring with zero valid slots is.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher as Crc32;
use log::{debug, warn};
use std::fs::File;

use crate::consts::{
    ENTRY_SIZE, META_CRC_MARKER, META_MAGIC, META_RING_BASE, META_RING_SIZE, META_SLOT_COUNT,
    META_SLOT_HDR_SIZE, META_SLOT_SIZE, META_START_VERSION, META_VERSION_MARKER, NO_EXTENT,
};
use crate::lba::entry::IndexEntry;
use crate::util::{read_at, write_at, IoAccount};

/// Durable pointers for one LBA shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardPointers {
    pub active_ptr: i64,
    pub active_count: u32,
    pub superblock_ptr: i64,
    pub superblock_count: u32,
}

impl ShardPointers {
    pub fn empty() -> Self {
        Self {
            active_ptr: NO_EXTENT,
            active_count: 0,
            superblock_ptr: NO_EXTENT,
            superblock_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metablock {
    pub version: i64,
    pub extent_watermark: u64,
    pub shards: Vec<ShardPointers>,
    pub inline_capacity: u32,
    pub inline: Vec<IndexEntry>,
    pub dbm_active_extent: i64,
}

impl Metablock {
    pub fn empty(shard_count: u32, inline_capacity: u32) -> Self {
        Self {
            version: 0,
            extent_watermark: 0,
            shards: vec![ShardPointers::empty(); shard_count as usize],
            inline_capacity,
            inline: Vec::new(),
            dbm_active_extent: NO_EXTENT,
        }
    }
}

/// Encoded body size for the given geometry; used to validate that a
/// metablock fits one ring slot.
pub fn encoded_body_size(shard_count: u32, inline_capacity: u32) -> u64 {
    8 + 4 + shard_count as u64 * 24 + 4 + 4 + inline_capacity as u64 * ENTRY_SIZE + 8
}

fn slot_offset(version: i64) -> u64 {
    META_RING_BASE + (version as u64 % META_SLOT_COUNT) * META_SLOT_SIZE
}

fn encode_slot(mb: &Metablock) -> Vec<u8> {
    let body_len = encoded_body_size(mb.shards.len() as u32, mb.inline_capacity) as usize;
    let mut buf = vec![0u8; META_SLOT_HDR_SIZE + body_len];

    // Body first, CRC after.
    let body = &mut buf[META_SLOT_HDR_SIZE..];
    let mut off = 0usize;
    LittleEndian::write_u64(&mut body[off..off + 8], mb.extent_watermark);
    off += 8;
    LittleEndian::write_u32(&mut body[off..off + 4], mb.shards.len() as u32);
    off += 4;
    for sp in &mb.shards {
        LittleEndian::write_i64(&mut body[off..off + 8], sp.active_ptr);
        LittleEndian::write_u32(&mut body[off + 8..off + 12], sp.active_count);
        LittleEndian::write_i64(&mut body[off + 12..off + 20], sp.superblock_ptr);
        LittleEndian::write_u32(&mut body[off + 20..off + 24], sp.superblock_count);
        off += 24;
    }
    LittleEndian::write_u32(&mut body[off..off + 4], mb.inline_capacity);
    off += 4;
    LittleEndian::write_u32(&mut body[off..off + 4], mb.inline.len() as u32);
    off += 4;
    for e in &mb.inline {
        e.encode_into(&mut body[off..off + ENTRY_SIZE as usize]);
        off += ENTRY_SIZE as usize;
    }
    // Unoccupied inline slots stay zero.
    off += (mb.inline_capacity as usize - mb.inline.len()) * ENTRY_SIZE as usize;
    LittleEndian::write_i64(&mut body[off..off + 8], mb.dbm_active_extent);

    let mut version_le = [0u8; 8];
    LittleEndian::write_i64(&mut version_le, mb.version);
    let mut hasher = Crc32::new();
    hasher.update(&version_le);
    hasher.update(&buf[META_SLOT_HDR_SIZE..]);
    let crc = hasher.finalize();

    buf[0..8].copy_from_slice(META_MAGIC);
    LittleEndian::write_u32(&mut buf[8..12], META_CRC_MARKER);
    LittleEndian::write_u32(&mut buf[12..16], crc);
    LittleEndian::write_u32(&mut buf[16..20], META_VERSION_MARKER);
    LittleEndian::write_i64(&mut buf[20..28], mb.version);
    buf
}

/// Decode one ring slot. Any mismatch (magic, markers, bounds, CRC) yields
/// None: the slot is stale, not fatal.
fn decode_slot(slot: &[u8]) -> Option<Metablock> {
    if slot.len() < META_SLOT_HDR_SIZE || &slot[0..8] != META_MAGIC {
        return None;
    }
    if LittleEndian::read_u32(&slot[8..12]) != META_CRC_MARKER
        || LittleEndian::read_u32(&slot[16..20]) != META_VERSION_MARKER
    {
        return None;
    }
    let crc_expected = LittleEndian::read_u32(&slot[12..16]);
    let version = LittleEndian::read_i64(&slot[20..28]);
    if version < META_START_VERSION {
        return None;
    }

    let body = &slot[META_SLOT_HDR_SIZE..];
    if body.len() < 12 {
        return None;
    }
    let shard_count = LittleEndian::read_u32(&body[8..12]);
    let shards_end = 12usize.checked_add(shard_count as usize * 24)?;
    if body.len() < shards_end + 8 {
        return None;
    }
    let inline_capacity = LittleEndian::read_u32(&body[shards_end..shards_end + 4]);
    let body_len = encoded_body_size(shard_count, inline_capacity) as usize;
    if body.len() < body_len {
        return None;
    }
    let body = &body[..body_len];

    let mut version_le = [0u8; 8];
    LittleEndian::write_i64(&mut version_le, version);
    let mut hasher = Crc32::new();
    hasher.update(&version_le);
    hasher.update(body);
    if hasher.finalize() != crc_expected {
        return None;
    }

    let extent_watermark = LittleEndian::read_u64(&body[0..8]);
    let mut off = 12usize;
    let mut shards = Vec::with_capacity(shard_count as usize);
    for _ in 0..shard_count {
        shards.push(ShardPointers {
            active_ptr: LittleEndian::read_i64(&body[off..off + 8]),
            active_count: LittleEndian::read_u32(&body[off + 8..off + 12]),
            superblock_ptr: LittleEndian::read_i64(&body[off + 12..off + 20]),
            superblock_count: LittleEndian::read_u32(&body[off + 20..off + 24]),
        });
        off += 24;
    }
    off += 4; // inline_capacity, already read
    let inline_count = LittleEndian::read_u32(&body[off..off + 4]);
    off += 4;
    if inline_count > inline_capacity {
        return None;
    }
    let mut inline = Vec::with_capacity(inline_count as usize);
    for i in 0..inline_count as usize {
        let at = off + i * ENTRY_SIZE as usize;
        inline.push(IndexEntry::decode(&body[at..at + ENTRY_SIZE as usize]));
    }
    off += inline_capacity as usize * ENTRY_SIZE as usize;
    let dbm_active_extent = LittleEndian::read_i64(&body[off..off + 8]);

    Some(Metablock {
        version,
        extent_watermark,
        shards,
        inline_capacity,
        inline,
        dbm_active_extent,
    })
}

/// Writer over the slot ring. One instance per store; all writes funnel
/// through the store's state lock.
#[derive(Debug)]
pub struct MetaManager {
    next_version: i64,
}

impl MetaManager {
    /// Zero the ring and write the first valid metablock at the start
    /// version.
    pub fn create(file: &mut File, mb: &mut Metablock, io: &IoAccount) -> Result<Self> {
        let zeros = vec![0u8; META_RING_SIZE as usize];
        write_at(file, META_RING_BASE, &zeros).context("zero metablock ring")?;

        mb.version = META_START_VERSION;
        let slot = encode_slot(mb);
        write_at(file, slot_offset(mb.version), &slot)?;
        file.sync_all().context("sync initial metablock")?;
        io.note_write(META_RING_SIZE + slot.len() as u64);
        debug!("metablock: ring created, version {}", mb.version);
        Ok(Self {
            next_version: META_START_VERSION + 1,
        })
    }

    /// Scan the ring for the highest-version record whose CRC matches.
    /// Fails only if no slot is ever valid.
    pub fn start_existing(file: &mut File, io: &IoAccount) -> Result<(Self, Metablock)> {
        let mut best: Option<Metablock> = None;
        let mut slot = vec![0u8; META_SLOT_SIZE as usize];
        for i in 0..META_SLOT_COUNT {
            let off = META_RING_BASE + i * META_SLOT_SIZE;
            read_at(file, off, &mut slot)
                .with_context(|| format!("read metablock slot {}", i))?;
            io.note_read(META_SLOT_SIZE);
            match decode_slot(&slot) {
                Some(mb) => {
                    debug!("metablock: slot {} holds version {}", i, mb.version);
                    if best.as_ref().map_or(true, |b| mb.version > b.version) {
                        best = Some(mb);
                    }
                }
                None => warn!("metablock: slot {} is stale or torn, skipping", i),
            }
        }
        let mb = best.ok_or_else(|| {
            anyhow!("no valid metablock in any ring slot: file is corrupt or was never initialized")
        })?;
        debug!("metablock: selected version {}", mb.version);
        Ok((
            Self {
                next_version: mb.version + 1,
            },
            mb,
        ))
    }

    /// Assign the next monotonic version, write the record to its ring slot
    /// and flush. Returns once durable.
    pub fn write_metablock(
        &mut self,
        file: &mut File,
        mb: &mut Metablock,
        io: &IoAccount,
    ) -> Result<()> {
        mb.version = self.next_version;
        let slot = encode_slot(mb);
        write_at(file, slot_offset(mb.version), &slot)?;
        file.sync_all()
            .with_context(|| format!("sync metablock version {}", mb.version))?;
        io.note_write(slot.len() as u64);
        self.next_version += 1;
        debug!("metablock: wrote version {}", mb.version);
        Ok(())
    }

    pub fn next_version(&self) -> i64 {
        self.next_version
    }
}
