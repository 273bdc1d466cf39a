//! Centralized configuration and builder for lbastore.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - StoreConfig::from_env() reads the LBA_* env vars; the builder overrides
//!   specific fields on top.
//! - GC thresholds are tunables, not format constants: the on-disk layout is
//!   unaffected by any value here except extent_size, which is pinned in the
//!   static header at create time.

use anyhow::{anyhow, Result};
use std::fmt;

use crate::consts::{BLOCK_SIZE, ENTRY_SIZE, META_SLOT_HDR_SIZE, META_SLOT_SIZE};

/// Top-level configuration for a store.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Extent size in bytes; power of two, multiple of the 4 KiB device block.
    /// Env: LBA_EXTENT_SIZE (default 65536)
    pub extent_size: u64,

    /// Number of independent LBA shards (block_id % shard_count).
    /// Env: LBA_SHARDS (default 8)
    pub shard_count: u32,

    /// Capacity of the inline entry buffer embedded in the metablock.
    /// Env: LBA_INLINE_CAP (default 128)
    pub inline_capacity: u32,

    /// Allocator zones; gen_extent round-robins across them.
    /// Env: LBA_ZONES (default 1)
    pub zone_count: u32,

    /// GC is skipped while a shard's sealed extents total fewer bytes.
    /// Env: LBA_GC_MIN_SEALED_BYTES (default 1 MiB)
    pub gc_min_sealed_bytes: u64,

    /// GC runs when live/capacity for a shard drops below this fraction.
    /// Env: LBA_GC_LIVE_FRACTION (default 0.5)
    pub gc_live_fraction: f64,

    /// Live entries rewritten per GC batch (each batch ends with a durable
    /// metablock, bounding both blocking and the crash-loss window).
    /// Env: LBA_GC_BATCH (default 1024)
    pub gc_batch_entries: usize,

    /// Background GC poll interval in milliseconds.
    /// Env: LBA_GC_INTERVAL_MS (default 500)
    pub gc_interval_ms: u64,

    /// Spawn the background GC driver on open.
    /// Env: LBA_GC_AUTO (default false)
    pub gc_auto: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            extent_size: 64 * 1024,
            shard_count: 8,
            inline_capacity: 128,
            zone_count: 1,
            gc_min_sealed_bytes: 1024 * 1024,
            gc_live_fraction: 0.5,
            gc_batch_entries: 1024,
            gc_interval_ms: 500,
            gc_auto: false,
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        let s = v.trim().to_ascii_lowercase();
        s == "1" || s == "true" || s == "yes" || s == "on"
    })
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl StoreConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(n) = env_parse::<u64>("LBA_EXTENT_SIZE") {
            cfg.extent_size = n;
        }
        if let Some(n) = env_parse::<u32>("LBA_SHARDS") {
            cfg.shard_count = n;
        }
        if let Some(n) = env_parse::<u32>("LBA_INLINE_CAP") {
            cfg.inline_capacity = n;
        }
        if let Some(n) = env_parse::<u32>("LBA_ZONES") {
            cfg.zone_count = n;
        }
        if let Some(n) = env_parse::<u64>("LBA_GC_MIN_SEALED_BYTES") {
            cfg.gc_min_sealed_bytes = n;
        }
        if let Some(n) = env_parse::<f64>("LBA_GC_LIVE_FRACTION") {
            cfg.gc_live_fraction = n;
        }
        if let Some(n) = env_parse::<usize>("LBA_GC_BATCH") {
            cfg.gc_batch_entries = n;
        }
        if let Some(n) = env_parse::<u64>("LBA_GC_INTERVAL_MS") {
            cfg.gc_interval_ms = n;
        }
        if let Some(b) = env_bool("LBA_GC_AUTO") {
            cfg.gc_auto = b;
        }
        cfg
    }

    /// Reject configurations the on-disk format cannot carry.
    pub fn validate(&self) -> Result<()> {
        let es = self.extent_size;
        if es < BLOCK_SIZE || es % BLOCK_SIZE != 0 || (es & (es - 1)) != 0 {
            return Err(anyhow!(
                "extent_size must be a power of two multiple of {}, got {}",
                BLOCK_SIZE,
                es
            ));
        }
        if self.shard_count == 0 || self.shard_count > 64 {
            return Err(anyhow!(
                "shard_count must be in 1..=64, got {}",
                self.shard_count
            ));
        }
        if self.zone_count == 0 {
            return Err(anyhow!("zone_count must be >= 1"));
        }
        if self.inline_capacity == 0 {
            return Err(anyhow!("inline_capacity must be >= 1"));
        }
        // The encoded metablock body must fit one ring slot.
        let body = crate::metablock::encoded_body_size(self.shard_count, self.inline_capacity);
        let slot_need = META_SLOT_HDR_SIZE as u64 + body;
        if slot_need > META_SLOT_SIZE {
            return Err(anyhow!(
                "metablock does not fit a ring slot ({} > {}); lower shard_count or inline_capacity",
                slot_need,
                META_SLOT_SIZE
            ));
        }
        if !(0.0..=1.0).contains(&self.gc_live_fraction) {
            return Err(anyhow!(
                "gc_live_fraction must be within [0, 1], got {}",
                self.gc_live_fraction
            ));
        }
        if self.gc_batch_entries == 0 {
            return Err(anyhow!("gc_batch_entries must be >= 1"));
        }
        Ok(())
    }

    /// Index entries one extent can hold (first slot is the header).
    pub fn entries_per_extent(&self) -> u32 {
        (self.extent_size / ENTRY_SIZE - 1) as u32
    }

    // Fluent setters (builder-style) to override specific fields.

    pub fn with_extent_size(mut self, bytes: u64) -> Self {
        self.extent_size = bytes;
        self
    }

    pub fn with_shard_count(mut self, n: u32) -> Self {
        self.shard_count = n;
        self
    }

    pub fn with_inline_capacity(mut self, n: u32) -> Self {
        self.inline_capacity = n;
        self
    }

    pub fn with_zone_count(mut self, n: u32) -> Self {
        self.zone_count = n;
        self
    }

    pub fn with_gc_min_sealed_bytes(mut self, bytes: u64) -> Self {
        self.gc_min_sealed_bytes = bytes;
        self
    }

    pub fn with_gc_live_fraction(mut self, f: f64) -> Self {
        self.gc_live_fraction = f;
        self
    }

    pub fn with_gc_batch_entries(mut self, n: usize) -> Self {
        self.gc_batch_entries = n;
        self
    }

    pub fn with_gc_interval_ms(mut self, ms: u64) -> Self {
        self.gc_interval_ms = ms;
        self
    }

    pub fn with_gc_auto(mut self, on: bool) -> Self {
        self.gc_auto = on;
        self
    }
}

impl fmt::Display for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoreConfig {{ extent_size: {}, shard_count: {}, inline_capacity: {}, \
             zone_count: {}, gc_min_sealed_bytes: {}, gc_live_fraction: {}, \
             gc_batch_entries: {}, gc_interval_ms: {}, gc_auto: {} }}",
            self.extent_size,
            self.shard_count,
            self.inline_capacity,
            self.zone_count,
            self.gc_min_sealed_bytes,
            self.gc_live_fraction,
            self.gc_batch_entries,
            self.gc_interval_ms,
            self.gc_auto,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        StoreConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_extent_size() {
        assert!(StoreConfig::default().with_extent_size(5000).validate().is_err());
        assert!(StoreConfig::default().with_extent_size(2048).validate().is_err());
        assert!(StoreConfig::default()
            .with_extent_size(96 * 1024)
            .validate()
            .is_err()); // not a power of two
    }

    #[test]
    fn rejects_oversized_inline_buffer() {
        // 16 KiB slot cannot hold thousands of 32 B inline entries.
        assert!(StoreConfig::default()
            .with_inline_capacity(4096)
            .validate()
            .is_err());
    }

    #[test]
    fn entries_per_extent_matches_geometry() {
        let cfg = StoreConfig::default().with_extent_size(64 * 1024);
        assert_eq!(cfg.entries_per_extent(), 2047);
    }
}
