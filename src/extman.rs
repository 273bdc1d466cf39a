//! Extent manager — transactional allocator for fixed-size file extents.
//!
//! Free lists live only in RAM and are reconstructed at startup: the
//! metablock records the grow watermark (extents ever created), startup
//! reserves every extent the metablock still references, and whatever is
//! left below the watermark becomes free. Extents are spread across zones;
//! gen_extent round-robins zone free lists before growing the file.
//!
//! Releases are transactional: release_extent parks the extent as pending
//! inside a transaction, and only commit_transaction returns it to a free
//! list. Callers commit only after the metablock that stopped referencing
//! those extents is durable, so a crash can never see a reused extent that
//! an older (still-selected) metablock points into.
//!
//! Lifecycle violations (double reservation, freeing a free extent,
//! misaligned offsets) are bugs, not runtime conditions, and panic.

use anyhow::{Context, Result};
use log::{debug, info};
use std::collections::HashMap;
use std::fs::File;

use crate::consts::extent_base;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtentState {
    Free,
    InUse,
    /// Released into a transaction that has not committed yet.
    PendingRelease,
}

/// Pending extent releases tied to one metablock-write cycle.
#[derive(Debug, Default)]
pub struct ExtentTxn {
    pending: Vec<u64>,
}

impl ExtentTxn {
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug)]
pub struct ExtentManager {
    extent_size: u64,
    base: u64,
    zone_count: u32,
    /// Per-zone free lists (extent offsets).
    zones: Vec<Vec<u64>>,
    /// Round-robin cursor over zones for gen_extent.
    next_zone: usize,
    /// Number of extents ever created; persisted in the metablock.
    watermark: u64,
    states: HashMap<u64, ExtentState>,
    /// reserve_extent is legal only between new() and finish_startup().
    startup: bool,
}

impl ExtentManager {
    pub fn new(extent_size: u64, zone_count: u32, watermark: u64) -> Self {
        Self {
            extent_size,
            base: extent_base(extent_size),
            zone_count,
            zones: vec![Vec::new(); zone_count as usize],
            next_zone: 0,
            watermark,
            states: HashMap::new(),
            startup: true,
        }
    }

    #[inline]
    fn assert_aligned(&self, offset: u64) {
        assert!(
            offset >= self.base && (offset - self.base) % self.extent_size == 0,
            "extent offset {} violates alignment (base {}, size {})",
            offset,
            self.base,
            self.extent_size
        );
    }

    #[inline]
    fn zone_of(&self, offset: u64) -> usize {
        (((offset - self.base) / self.extent_size) % self.zone_count as u64) as usize
    }

    fn extent_offset(&self, ordinal: u64) -> u64 {
        self.base + ordinal * self.extent_size
    }

    /// Startup-only: mark a metablock-referenced extent as in use before the
    /// free lists exist. Double reservation is a corrupt-metablock bug.
    pub fn reserve_extent(&mut self, offset: u64) {
        assert!(self.startup, "reserve_extent outside startup");
        self.assert_aligned(offset);
        let ordinal = (offset - self.base) / self.extent_size;
        assert!(
            ordinal < self.watermark,
            "reserved extent {} beyond watermark {}",
            offset,
            self.watermark
        );
        let prev = self.states.insert(offset, ExtentState::InUse);
        assert!(
            prev.is_none(),
            "extent {} reserved twice during startup",
            offset
        );
    }

    /// Seal startup: every unreserved extent below the watermark joins its
    /// zone's free list.
    pub fn finish_startup(&mut self) {
        assert!(self.startup, "finish_startup called twice");
        let mut freed = 0usize;
        for ordinal in 0..self.watermark {
            let offset = self.extent_offset(ordinal);
            if !self.states.contains_key(&offset) {
                self.states.insert(offset, ExtentState::Free);
                let z = self.zone_of(offset);
                self.zones[z].push(offset);
                freed += 1;
            }
        }
        self.startup = false;
        debug!(
            "extman: startup done, watermark {}, {} free",
            self.watermark, freed
        );
    }

    pub fn begin_transaction(&self) -> ExtentTxn {
        ExtentTxn::default()
    }

    /// Pop a zone free list (round-robin) or grow the file by one extent.
    pub fn gen_extent(&mut self, file: &mut File) -> Result<u64> {
        assert!(!self.startup, "gen_extent during startup");
        for probe in 0..self.zone_count as usize {
            let z = (self.next_zone + probe) % self.zone_count as usize;
            if let Some(offset) = self.zones[z].pop() {
                self.next_zone = (z + 1) % self.zone_count as usize;
                let prev = self.states.insert(offset, ExtentState::InUse);
                assert_eq!(
                    prev,
                    Some(ExtentState::Free),
                    "free list returned non-free extent {}",
                    offset
                );
                debug!("extman: reuse extent {} from zone {}", offset, z);
                return Ok(offset);
            }
        }
        // Every zone exhausted: grow the file by one extent.
        let offset = self.extent_offset(self.watermark);
        file.set_len(offset + self.extent_size)
            .context("out of disk space: cannot grow data file by one extent")?;
        self.watermark += 1;
        self.next_zone = (self.next_zone + 1) % self.zone_count as usize;
        self.states.insert(offset, ExtentState::InUse);
        debug!("extman: grew file, new extent {} (watermark {})", offset, self.watermark);
        Ok(offset)
    }

    /// Record a pending release; the extent stays unusable until the
    /// transaction commits.
    pub fn release_extent(&mut self, txn: &mut ExtentTxn, offset: u64) {
        assert!(!self.startup, "release_extent during startup");
        self.assert_aligned(offset);
        let state = self.states.get_mut(&offset);
        match state {
            Some(s @ ExtentState::InUse) => *s = ExtentState::PendingRelease,
            other => panic!("release of extent {} in state {:?}", offset, other),
        }
        txn.pending.push(offset);
    }

    /// Move the transaction's pending releases into the free lists. Legal
    /// only after the metablock that stopped referencing them is durable;
    /// that ordering is the caller's responsibility.
    pub fn commit_transaction(&mut self, txn: ExtentTxn) {
        let n = txn.pending.len();
        for offset in txn.pending {
            let state = self.states.get_mut(&offset);
            match state {
                Some(s @ ExtentState::PendingRelease) => *s = ExtentState::Free,
                other => panic!("commit of extent {} in state {:?}", offset, other),
            }
            let z = self.zone_of(offset);
            self.zones[z].push(offset);
        }
        if n > 0 {
            info!("extman: committed release of {} extent(s)", n);
        }
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    pub fn free_count(&self) -> u64 {
        self.zones.iter().map(|z| z.len() as u64).sum()
    }

    pub fn extent_size(&self) -> u64 {
        self.extent_size
    }

    pub fn base(&self) -> u64 {
        self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn tmp_file(tag: &str) -> File {
        let path = std::env::temp_dir().join(format!(
            "lbastore-extman-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)
            .unwrap()
    }

    const ES: u64 = 64 * 1024;

    #[test]
    fn grow_then_reuse_after_commit() {
        let mut f = tmp_file("grow");
        let mut m = ExtentManager::new(ES, 1, 0);
        m.finish_startup();

        let a = m.gen_extent(&mut f).unwrap();
        let b = m.gen_extent(&mut f).unwrap();
        assert_eq!(b, a + ES);
        assert_eq!(m.watermark(), 2);

        let mut txn = m.begin_transaction();
        m.release_extent(&mut txn, a);
        // Pending releases are invisible to the allocator.
        let c = m.gen_extent(&mut f).unwrap();
        assert_ne!(c, a);

        m.commit_transaction(txn);
        let d = m.gen_extent(&mut f).unwrap();
        assert_eq!(d, a);
    }

    #[test]
    fn startup_reservation_excludes_from_free() {
        let mut f = tmp_file("resv");
        let base = extent_base(ES);
        let mut m = ExtentManager::new(ES, 1, 3);
        m.reserve_extent(base + ES); // ordinal 1 in use
        m.finish_startup();
        assert_eq!(m.free_count(), 2);
        // Ordinals 0 and 2 come back before any growth.
        let x = m.gen_extent(&mut f).unwrap();
        let y = m.gen_extent(&mut f).unwrap();
        let mut got = vec![x, y];
        got.sort_unstable();
        assert_eq!(got, vec![base, base + 2 * ES]);
        assert_eq!(m.watermark(), 3);
    }

    #[test]
    fn zones_round_robin() {
        let mut f = tmp_file("zones");
        let mut m = ExtentManager::new(ES, 2, 0);
        m.finish_startup();
        // Growth alternates the cursor; offsets are sequential regardless.
        let a = m.gen_extent(&mut f).unwrap();
        let b = m.gen_extent(&mut f).unwrap();
        let mut txn = m.begin_transaction();
        m.release_extent(&mut txn, a);
        m.release_extent(&mut txn, b);
        m.commit_transaction(txn);
        assert_eq!(m.free_count(), 2);
        // Both zones are drained before the file grows again.
        let c = m.gen_extent(&mut f).unwrap();
        let d = m.gen_extent(&mut f).unwrap();
        assert_ne!(c, d);
        assert_eq!(m.watermark(), 2);
    }

    #[test]
    #[should_panic(expected = "reserved twice")]
    fn double_reservation_panics() {
        let base = extent_base(ES);
        let mut m = ExtentManager::new(ES, 1, 1);
        m.reserve_extent(base);
        m.reserve_extent(base);
    }

    #[test]
    #[should_panic(expected = "release of extent")]
    fn releasing_free_extent_panics() {
        let mut f = tmp_file("badfree");
        let mut m = ExtentManager::new(ES, 1, 0);
        m.finish_startup();
        let a = m.gen_extent(&mut f).unwrap();
        let mut txn = m.begin_transaction();
        m.release_extent(&mut txn, a);
        m.commit_transaction(txn);
        // Now free: a second release must trip the state machine.
        let mut txn2 = m.begin_transaction();
        m.release_extent(&mut txn2, a);
    }
}
