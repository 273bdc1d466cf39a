//! One shard's on-disk index structure: a chain of sealed LBA extents
//! described by a superblock, plus one active (unsealed) extent.
//!
//! LBA extent layout: {magic8 "LBAEXT01", pad to 32 B} then fixed 32 B
//! entries in arrival order. An extent is never rewritten once sealed; the
//! only in-place mutation is device-block padding of the active extent at
//! sync time.
//!
//! Superblock layout: {magic8 "LBASUP01", pad to 32 B} then 16 B records
//! {extent_offset i64, entry_count i64}, one per sealed extent, in seal
//! (= replay) order. Sealing appends a record; GC's destroy_extents
//! rewrites the superblock wholesale into a fresh extent and releases the
//! old one through the caller's transaction.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use std::collections::HashSet;
use std::fs::File;

use crate::consts::{
    ENTRY_SIZE, EXTENT_HDR_SIZE, EXTENT_MAGIC, NO_EXTENT, SUPERBLOCK_MAGIC,
    SUPERBLOCK_REC_SIZE,
};
use crate::extman::{ExtentManager, ExtentTxn};
use crate::lba::entry::IndexEntry;
use crate::lba::index::MemIndex;
use crate::metablock::ShardPointers;
use crate::util::{is_block_aligned, read_at, write_at, IoAccount};

#[derive(Debug, Clone, Copy)]
pub struct SealedExtent {
    pub offset: u64,
    pub entries: u32,
}

#[derive(Debug, Clone, Copy)]
struct ActiveExtent {
    offset: u64,
    count: u32,
}

#[derive(Debug, Clone, Copy)]
struct Superblock {
    offset: u64,
    records: u32,
}

#[derive(Debug)]
pub struct DiskStructure {
    shard: u32,
    extent_size: u64,
    entries_per_extent: u32,
    sealed: Vec<SealedExtent>,
    superblock: Option<Superblock>,
    active: Option<ActiveExtent>,
}

fn write_extent_header(file: &mut File, offset: u64, magic: &[u8; 8], io: &IoAccount) -> Result<()> {
    let mut hdr = [0u8; EXTENT_HDR_SIZE as usize];
    hdr[..8].copy_from_slice(magic);
    write_at(file, offset, &hdr)?;
    io.note_write(EXTENT_HDR_SIZE);
    Ok(())
}

fn check_extent_magic(file: &mut File, offset: u64, magic: &[u8; 8], io: &IoAccount) -> Result<()> {
    let mut hdr = [0u8; 8];
    read_at(file, offset, &mut hdr)
        .with_context(|| format!("read extent header at {}", offset))?;
    io.note_read(8);
    if &hdr != magic {
        return Err(anyhow!(
            "extent at offset {} has a malformed header — data file is corrupt",
            offset
        ));
    }
    Ok(())
}

impl DiskStructure {
    pub fn new_empty(shard: u32, extent_size: u64) -> Self {
        Self {
            shard,
            extent_size,
            entries_per_extent: (extent_size / ENTRY_SIZE - 1) as u32,
            sealed: Vec::new(),
            superblock: None,
            active: None,
        }
    }

    fn superblock_capacity(&self) -> u32 {
        ((self.extent_size - EXTENT_HDR_SIZE) / SUPERBLOCK_REC_SIZE) as u32
    }

    /// Full replay from durable pointers: superblock first, then sealed
    /// extents oldest-first, then the active extent. Every referenced extent
    /// is reserved with the allocator (still in startup mode). Non-padding
    /// entries are applied to the index in arrival order, so the last writer
    /// of an id wins.
    pub fn load(
        file: &mut File,
        extman: &mut ExtentManager,
        index: &mut MemIndex,
        shard: u32,
        extent_size: u64,
        ptrs: &ShardPointers,
        io: &IoAccount,
    ) -> Result<Self> {
        let mut ds = Self::new_empty(shard, extent_size);

        if ptrs.superblock_ptr != NO_EXTENT {
            let sb_off = ptrs.superblock_ptr as u64;
            extman.reserve_extent(sb_off);
            check_extent_magic(file, sb_off, SUPERBLOCK_MAGIC, io)
                .with_context(|| format!("shard {} superblock", shard))?;
            let n = ptrs.superblock_count;
            if n > ds.superblock_capacity() {
                return Err(anyhow!(
                    "shard {} superblock claims {} records, capacity is {}",
                    shard,
                    n,
                    ds.superblock_capacity()
                ));
            }
            let mut recs = vec![0u8; n as usize * SUPERBLOCK_REC_SIZE as usize];
            read_at(file, sb_off + EXTENT_HDR_SIZE, &mut recs)?;
            io.note_read(recs.len() as u64);
            for i in 0..n as usize {
                let at = i * SUPERBLOCK_REC_SIZE as usize;
                let offset = LittleEndian::read_i64(&recs[at..at + 8]);
                let entries = LittleEndian::read_i64(&recs[at + 8..at + 16]);
                if offset < 0 || entries < 0 || entries as u64 > ds.entries_per_extent as u64 {
                    return Err(anyhow!(
                        "shard {} superblock record {} is corrupt (offset {}, entries {})",
                        shard,
                        i,
                        offset,
                        entries
                    ));
                }
                ds.sealed.push(SealedExtent {
                    offset: offset as u64,
                    entries: entries as u32,
                });
            }
            ds.superblock = Some(Superblock {
                offset: sb_off,
                records: n,
            });
        }

        // Sealed extents in superblock (= append) order.
        for se in ds.sealed.clone() {
            extman.reserve_extent(se.offset);
            ds.replay_extent(file, index, se.offset, se.entries, io)
                .with_context(|| format!("shard {} sealed extent at {}", shard, se.offset))?;
        }

        if ptrs.active_ptr != NO_EXTENT {
            let off = ptrs.active_ptr as u64;
            extman.reserve_extent(off);
            ds.replay_extent(file, index, off, ptrs.active_count, io)
                .with_context(|| format!("shard {} active extent at {}", shard, off))?;
            ds.active = Some(ActiveExtent {
                offset: off,
                count: ptrs.active_count,
            });
        }

        debug!(
            "lba shard {}: loaded {} sealed extent(s), active count {}",
            shard,
            ds.sealed.len(),
            ptrs.active_count
        );
        Ok(ds)
    }

    fn replay_extent(
        &self,
        file: &mut File,
        index: &mut MemIndex,
        offset: u64,
        count: u32,
        io: &IoAccount,
    ) -> Result<()> {
        check_extent_magic(file, offset, EXTENT_MAGIC, io)?;
        if count > self.entries_per_extent {
            return Err(anyhow!(
                "extent at {} claims {} entries, capacity is {}",
                offset,
                count,
                self.entries_per_extent
            ));
        }
        if count == 0 {
            return Ok(());
        }
        let mut raw = vec![0u8; count as usize * ENTRY_SIZE as usize];
        read_at(file, offset + EXTENT_HDR_SIZE, &mut raw)?;
        io.note_read(raw.len() as u64);
        for i in 0..count as usize {
            let at = i * ENTRY_SIZE as usize;
            let e = IndexEntry::decode(&raw[at..at + ENTRY_SIZE as usize]);
            if !e.is_padding() {
                index.apply(&e);
            }
        }
        Ok(())
    }

    fn alloc_active(
        &mut self,
        file: &mut File,
        extman: &mut ExtentManager,
        io: &IoAccount,
    ) -> Result<()> {
        let offset = extman.gen_extent(file)?;
        write_extent_header(file, offset, EXTENT_MAGIC, io)?;
        self.active = Some(ActiveExtent { offset, count: 0 });
        Ok(())
    }

    /// Append one entry to the active extent, sealing it first if full.
    pub fn add_entry(
        &mut self,
        file: &mut File,
        extman: &mut ExtentManager,
        txn: &mut ExtentTxn,
        entry: &IndexEntry,
        io: &IoAccount,
    ) -> Result<()> {
        match self.active {
            None => self.alloc_active(file, extman, io)?,
            Some(a) if a.count >= self.entries_per_extent => {
                self.seal_active(file, extman, txn, io)?;
                self.alloc_active(file, extman, io)?;
            }
            Some(_) => {}
        }
        let a = self.active.as_mut().expect("active extent present");
        let at = a.offset + EXTENT_HDR_SIZE + a.count as u64 * ENTRY_SIZE;
        write_at(file, at, &entry.encode())?;
        io.note_write(ENTRY_SIZE);
        a.count += 1;
        Ok(())
    }

    /// Move the (full) active extent onto the sealed list and record it in
    /// the superblock, appending to the existing superblock extent or
    /// rewriting it into a fresh one when full.
    fn seal_active(
        &mut self,
        file: &mut File,
        extman: &mut ExtentManager,
        txn: &mut ExtentTxn,
        io: &IoAccount,
    ) -> Result<()> {
        let a = self.active.take().expect("sealing without an active extent");
        self.sealed.push(SealedExtent {
            offset: a.offset,
            entries: a.count,
        });
        debug!(
            "lba shard {}: sealed extent at {} with {} entries",
            self.shard, a.offset, a.count
        );

        let need_rewrite = match self.superblock {
            None => true,
            Some(sb) => sb.records >= self.superblock_capacity(),
        };
        if need_rewrite {
            self.rewrite_superblock(file, extman, txn, io)?;
        } else {
            let sb = self.superblock.as_mut().expect("superblock present");
            let mut rec = [0u8; SUPERBLOCK_REC_SIZE as usize];
            LittleEndian::write_i64(&mut rec[0..8], a.offset as i64);
            LittleEndian::write_i64(&mut rec[8..16], a.count as i64);
            let at = sb.offset + EXTENT_HDR_SIZE + sb.records as u64 * SUPERBLOCK_REC_SIZE;
            write_at(file, at, &rec)?;
            io.note_write(SUPERBLOCK_REC_SIZE);
            sb.records += 1;
        }
        Ok(())
    }

    /// Write the whole sealed list into a fresh superblock extent and
    /// schedule the previous one (if any) for release in `txn`.
    fn rewrite_superblock(
        &mut self,
        file: &mut File,
        extman: &mut ExtentManager,
        txn: &mut ExtentTxn,
        io: &IoAccount,
    ) -> Result<()> {
        if self.sealed.len() as u32 > self.superblock_capacity() {
            return Err(anyhow!(
                "shard {} has {} sealed extents, superblock capacity is {}",
                self.shard,
                self.sealed.len(),
                self.superblock_capacity()
            ));
        }
        let offset = extman.gen_extent(file)?;
        let mut buf =
            vec![0u8; EXTENT_HDR_SIZE as usize + self.sealed.len() * SUPERBLOCK_REC_SIZE as usize];
        buf[..8].copy_from_slice(SUPERBLOCK_MAGIC);
        for (i, se) in self.sealed.iter().enumerate() {
            let at = EXTENT_HDR_SIZE as usize + i * SUPERBLOCK_REC_SIZE as usize;
            LittleEndian::write_i64(&mut buf[at..at + 8], se.offset as i64);
            LittleEndian::write_i64(&mut buf[at + 8..at + 16], se.entries as i64);
        }
        write_at(file, offset, &buf)?;
        io.note_write(buf.len() as u64);

        if let Some(old) = self.superblock.take() {
            extman.release_extent(txn, old.offset);
        }
        self.superblock = Some(Superblock {
            offset,
            records: self.sealed.len() as u32,
        });
        debug!(
            "lba shard {}: superblock rewritten at {} ({} records)",
            self.shard,
            offset,
            self.sealed.len()
        );
        Ok(())
    }

    /// Pad the active extent to a device-block boundary with padding
    /// entries. The durable flush happens once per sync batch, at the store
    /// level.
    pub fn pad_active(&mut self, file: &mut File, io: &IoAccount) -> Result<()> {
        let Some(a) = self.active.as_mut() else {
            return Ok(());
        };
        let pad = IndexEntry::padding().encode();
        while !is_block_aligned(EXTENT_HDR_SIZE + a.count as u64 * ENTRY_SIZE) {
            debug_assert!(a.count < self.entries_per_extent);
            let at = a.offset + EXTENT_HDR_SIZE + a.count as u64 * ENTRY_SIZE;
            write_at(file, at, &pad)?;
            io.note_write(ENTRY_SIZE);
            a.count += 1;
        }
        Ok(())
    }

    /// GC support: drop the given sealed extents, rewrite the superblock
    /// without them and schedule every removed extent for release in `txn`.
    pub fn destroy_extents(
        &mut self,
        file: &mut File,
        extman: &mut ExtentManager,
        txn: &mut ExtentTxn,
        victims: &HashSet<u64>,
        io: &IoAccount,
    ) -> Result<()> {
        let before = self.sealed.len();
        self.sealed.retain(|se| !victims.contains(&se.offset));
        let removed = before - self.sealed.len();
        debug_assert_eq!(removed, victims.len(), "victim set not fully sealed");
        for &offset in victims {
            extman.release_extent(txn, offset);
        }
        self.rewrite_superblock(file, extman, txn, io)?;
        debug!(
            "lba shard {}: destroyed {} sealed extent(s), {} remain",
            self.shard, removed, before - removed
        );
        Ok(())
    }

    /// Durable pointers for the next metablock.
    pub fn shard_pointers(&self) -> ShardPointers {
        ShardPointers {
            active_ptr: self.active.map_or(NO_EXTENT, |a| a.offset as i64),
            active_count: self.active.map_or(0, |a| a.count),
            superblock_ptr: self.superblock.map_or(NO_EXTENT, |sb| sb.offset as i64),
            superblock_count: self.superblock.map_or(0, |sb| sb.records),
        }
    }

    pub fn sealed_offsets(&self) -> Vec<u64> {
        self.sealed.iter().map(|se| se.offset).collect()
    }

    pub fn sealed_count(&self) -> u32 {
        self.sealed.len() as u32
    }

    pub fn sealed_bytes(&self) -> u64 {
        self.sealed.len() as u64 * self.extent_size
    }

    pub fn active_count(&self) -> u32 {
        self.active.map_or(0, |a| a.count)
    }

    pub fn entries_per_extent(&self) -> u32 {
        self.entries_per_extent
    }
}
