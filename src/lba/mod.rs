//! LBA list — the id -> location index.
//!
//! Shards block ids across N independent disk structures (block_id % N),
//! keeps the shared in-memory index, and stages the most recent writes in a
//! small inline buffer that lives inside the metablock. Hot ids (frequently
//! rewritten metadata blocks) are coalesced in the buffer instead of costing
//! one extent append per update; the buffer drains oldest-first into the
//! owning shards only when it is full.

pub mod disk;
pub mod entry;
pub mod gc;
pub mod index;

use anyhow::{Context, Result};
use log::{debug, info};
use std::fs::File;

use crate::extman::{ExtentManager, ExtentTxn};
use crate::metablock::{Metablock, ShardPointers};
use crate::util::IoAccount;

use disk::DiskStructure;
use entry::IndexEntry;
use index::{BlockInfo, MemIndex};

#[derive(Debug)]
pub struct LbaList {
    shard_count: u32,
    inline_capacity: u32,
    shards: Vec<DiskStructure>,
    index: MemIndex,
    inline: Vec<IndexEntry>,
    ready: bool,
}

impl LbaList {
    /// Fresh store: no extents, empty inline buffer, immediately ready.
    pub fn new_empty(shard_count: u32, extent_size: u64, inline_capacity: u32) -> Self {
        let shards = (0..shard_count)
            .map(|s| DiskStructure::new_empty(s, extent_size))
            .collect();
        Self {
            shard_count,
            inline_capacity,
            shards,
            index: MemIndex::new(),
            inline: Vec::with_capacity(inline_capacity as usize),
            ready: true,
        }
    }

    /// Rebuild everything from a durable metablock: each shard replays its
    /// superblock and extents into the index, then the metablock's inline
    /// buffer is replayed on top (it holds the newest entries). The inline
    /// entries stay staged, they are not yet in any extent.
    ///
    /// Shards are replayed one at a time: the shared index and the
    /// allocator's startup reservation are single-threaded, so replay is
    /// too.
    pub fn start_existing(
        file: &mut File,
        extman: &mut ExtentManager,
        extent_size: u64,
        mb: &Metablock,
        io: &IoAccount,
    ) -> Result<Self> {
        let shard_count = mb.shards.len() as u32;
        let mut index = MemIndex::new();
        let mut shards = Vec::with_capacity(shard_count as usize);
        for (s, ptrs) in mb.shards.iter().enumerate() {
            let ds = DiskStructure::load(
                file,
                extman,
                &mut index,
                s as u32,
                extent_size,
                ptrs,
                io,
            )
            .with_context(|| format!("load LBA shard {}", s))?;
            shards.push(ds);
        }

        for e in &mb.inline {
            debug_assert!(!e.is_padding());
            index.apply(e);
        }

        info!(
            "lba: {} shard(s) loaded, {} inline entr(ies), {} known id(s)",
            shard_count,
            mb.inline.len(),
            index.len()
        );
        Ok(Self {
            shard_count,
            inline_capacity: mb.inline_capacity,
            shards,
            index,
            inline: mb.inline.clone(),
            ready: true,
        })
    }

    #[inline]
    pub fn shard_of(&self, id: u64) -> u32 {
        (id % self.shard_count as u64) as u32
    }

    pub fn get_block_info(&self, id: u64) -> BlockInfo {
        debug_assert!(self.ready, "read before start_existing completed");
        self.index.get_block_info(id)
    }

    pub fn get_block_recency(&self, id: u64) -> u64 {
        self.get_block_info(id).recency
    }

    pub fn get_block_size(&self, id: u64) -> u32 {
        self.get_block_info(id).size
    }

    /// Update the index immediately (read-your-writes), then stage the entry
    /// inline. A full buffer is fully drained — every staged entry pushed,
    /// oldest-first, to its owning shard — before the new entry is staged.
    pub fn set_block_info(
        &mut self,
        file: &mut File,
        extman: &mut ExtentManager,
        txn: &mut ExtentTxn,
        io: &IoAccount,
        id: u64,
        recency: u64,
        offset: i64,
        size: u32,
    ) -> Result<()> {
        debug_assert!(self.ready, "write before start_existing completed");
        self.index.set_block_info(id, recency, offset, size);

        if self.inline.len() as u32 >= self.inline_capacity {
            self.drain_inline(file, extman, txn, io)?;
        }
        self.inline.push(IndexEntry::new(id, recency, offset, size));
        Ok(())
    }

    fn drain_inline(
        &mut self,
        file: &mut File,
        extman: &mut ExtentManager,
        txn: &mut ExtentTxn,
        io: &IoAccount,
    ) -> Result<()> {
        debug!("lba: draining {} inline entr(ies)", self.inline.len());
        for e in std::mem::take(&mut self.inline) {
            let shard = self.shard_of(e.block_id) as usize;
            self.shards[shard].add_entry(file, extman, txn, &e, io)?;
        }
        Ok(())
    }

    /// Pad every shard's active extent to a device-block boundary and flush.
    /// Durable once this returns; the caller follows up with a metablock
    /// write to cover the new extent counts.
    pub fn sync(&mut self, file: &mut File, io: &IoAccount) -> Result<()> {
        for ds in &mut self.shards {
            ds.pad_active(file, io)?;
        }
        file.sync_all().context("sync LBA extents")?;
        Ok(())
    }

    /// Durable pointers for the next metablock.
    pub fn shard_pointers(&self) -> Vec<ShardPointers> {
        self.shards.iter().map(|ds| ds.shard_pointers()).collect()
    }

    pub fn inline_entries(&self) -> &[IndexEntry] {
        &self.inline
    }

    pub fn inline_capacity(&self) -> u32 {
        self.inline_capacity
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn index(&self) -> &MemIndex {
        &self.index
    }

    pub(crate) fn shard(&self, s: u32) -> &DiskStructure {
        &self.shards[s as usize]
    }

    pub(crate) fn shard_mut(&mut self, s: u32) -> &mut DiskStructure {
        &mut self.shards[s as usize]
    }
}
