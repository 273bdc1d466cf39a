//! In-memory block index.
//!
//! Sparse map block_id -> latest (offset, recency, size). Never persisted:
//! it is derived purely by replaying sealed extents, the active extent and
//! the metablock's inline buffer, in that order. Also tracks, per id space,
//! the smallest id strictly greater than every known id, to bound iteration.

use std::collections::HashMap;

use crate::consts::{AUX_ID_BASE, NO_OFFSET};
use crate::lba::entry::IndexEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub offset: i64,
    pub recency: u64,
    pub size: u32,
}

impl BlockInfo {
    /// Default returned for ids that were never set.
    pub fn unused() -> Self {
        Self {
            offset: NO_OFFSET,
            recency: 0,
            size: 0,
        }
    }

    #[inline]
    pub fn has_value(&self) -> bool {
        self.offset != NO_OFFSET
    }
}

#[derive(Debug)]
pub struct MemIndex {
    map: HashMap<u64, BlockInfo>,
    normal_end_id: u64,
    aux_end_id: u64,
}

impl MemIndex {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            normal_end_id: 0,
            aux_end_id: AUX_ID_BASE,
        }
    }

    pub fn get_block_info(&self, id: u64) -> BlockInfo {
        self.map.get(&id).copied().unwrap_or_else(BlockInfo::unused)
    }

    /// Overwrite the entry for `id`. Idempotent under repeated identical
    /// replay; advances the owning id space's end id when `id` is new.
    pub fn set_block_info(&mut self, id: u64, recency: u64, offset: i64, size: u32) {
        debug_assert!(offset >= 0 || offset == NO_OFFSET, "bad flagged offset");
        debug_assert!(offset == NO_OFFSET || size > 0, "valued entry needs size > 0");
        self.map.insert(
            id,
            BlockInfo {
                offset,
                recency,
                size,
            },
        );
        if id >= AUX_ID_BASE {
            if id + 1 > self.aux_end_id {
                self.aux_end_id = id + 1;
            }
        } else if id + 1 > self.normal_end_id {
            self.normal_end_id = id + 1;
        }
    }

    pub fn apply(&mut self, e: &IndexEntry) {
        debug_assert!(!e.is_padding());
        self.set_block_info(e.block_id, e.recency, e.offset, e.size);
    }

    /// End of the normal id space (smallest id above every known normal id).
    pub fn normal_end_id(&self) -> u64 {
        self.normal_end_id
    }

    /// End of the auxiliary id space.
    pub fn aux_end_id(&self) -> u64 {
        self.aux_end_id
    }

    /// Known ids across both spaces; upper bound for GC's live estimate.
    pub fn known_id_span(&self) -> u64 {
        self.normal_end_id + (self.aux_end_id - AUX_ID_BASE)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Ids currently present that belong to the given shard.
    pub fn shard_ids(&self, shard: u32, shard_count: u32) -> Vec<u64> {
        self.map
            .keys()
            .copied()
            .filter(|id| (id % shard_count as u64) as u32 == shard)
            .collect()
    }
}

impl Default for MemIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_id_reads_unused() {
        let idx = MemIndex::new();
        let info = idx.get_block_info(123);
        assert!(!info.has_value());
        assert_eq!(info.recency, 0);
    }

    #[test]
    fn set_overwrites_and_advances_end() {
        let mut idx = MemIndex::new();
        idx.set_block_info(5, 1, 4096, 100);
        idx.set_block_info(5, 2, 8192, 200);
        let info = idx.get_block_info(5);
        assert_eq!(info.offset, 8192);
        assert_eq!(info.recency, 2);
        assert_eq!(idx.normal_end_id(), 6);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn aux_space_is_tracked_separately() {
        let mut idx = MemIndex::new();
        idx.set_block_info(AUX_ID_BASE + 3, 1, 4096, 16);
        idx.set_block_info(10, 1, 8192, 16);
        assert_eq!(idx.normal_end_id(), 11);
        assert_eq!(idx.aux_end_id(), AUX_ID_BASE + 4);
        assert_eq!(idx.known_id_span(), 11 + 4);
    }

    #[test]
    fn replay_is_idempotent() {
        let mut idx = MemIndex::new();
        let e = IndexEntry::new(7, 9, 12288, 64);
        idx.apply(&e);
        idx.apply(&e);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.get_block_info(7).recency, 9);
        assert_eq!(idx.normal_end_id(), 8);
    }

    #[test]
    fn shard_ids_filters_by_modulo() {
        let mut idx = MemIndex::new();
        for id in 0..20 {
            idx.set_block_info(id, id, (id as i64) * 4096, 8);
        }
        let mut ids = idx.shard_ids(3, 8);
        ids.sort_unstable();
        assert_eq!(ids, vec![3, 11, 19]);
    }
}
