//! Store — top-level coordinator over one data file.
//!
//! Owns the file handle, the extent allocator, the metablock writer and the
//! LBA list behind a single state mutex: operations run to completion under
//! the lock, suspending only for the file I/O they issue, so index mutations
//! never interleave. Background GC takes the same lock per batch.
//!
//! Startup: static header check -> metablock ring scan -> per-shard extent
//! replay -> inline buffer replay -> ready. On write the in-memory index is
//! updated immediately and the entry staged inline; `sync()` makes staged
//! state durable (pad + flush extents, then a fresh metablock) and commits
//! the extent releases that metablock stopped covering.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::{info, warn};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::StoreConfig;
use crate::consts::NO_EXTENT;
use crate::extman::{ExtentManager, ExtentTxn};
use crate::header;
use crate::lba::gc::GcDriver;
use crate::lba::index::BlockInfo;
use crate::lba::LbaList;
use crate::lock::{try_acquire_exclusive_lock, LockGuard};
use crate::metablock::{Metablock, MetaManager};
use crate::util::{IoAccount, IoSnapshot};

pub(crate) struct Inner {
    pub(crate) file: File,
    pub(crate) extman: ExtentManager,
    pub(crate) meta: MetaManager,
    pub(crate) lba: LbaList,
    /// Pending extent releases for the current metablock-write cycle.
    pub(crate) txn: ExtentTxn,
    /// Collaborator state carried through metablocks for the data-block
    /// manager layer.
    pub(crate) dbm_active_extent: i64,
}

pub(crate) struct StoreShared {
    pub(crate) cfg: StoreConfig,
    pub(crate) path: PathBuf,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) io: IoAccount,
    /// At most one GC cycle at a time.
    pub(crate) gc_running: AtomicBool,
    /// Drain signal: GC finishes its current batch and stops.
    pub(crate) shutdown: AtomicBool,
    /// Fatal error from the background GC thread. Sticky: once set, every
    /// subsequent write and sync fails with it so the caller cannot miss it.
    pub(crate) gc_failure: Mutex<Option<String>>,
    _lock: LockGuard,
}

pub struct Store {
    pub(crate) shared: Arc<StoreShared>,
    gc_driver: Option<GcDriver>,
}

/// Static-header payload: the geometry pinned at create time.
fn encode_header_payload(extent_size: u64) -> Vec<u8> {
    let mut p = vec![0u8; 16];
    LittleEndian::write_u64(&mut p[0..8], extent_size);
    // bytes 8..16 reserved
    p
}

fn decode_header_payload(p: &[u8]) -> Result<u64> {
    if p.len() < 16 {
        return Err(anyhow!("corrupt static header payload ({} bytes)", p.len()));
    }
    Ok(LittleEndian::read_u64(&p[0..8]))
}

pub(crate) fn snapshot_metablock(inner: &Inner) -> Metablock {
    Metablock {
        version: 0, // assigned by write_metablock
        extent_watermark: inner.extman.watermark(),
        shards: inner.lba.shard_pointers(),
        inline_capacity: inner.lba.inline_capacity(),
        inline: inner.lba.inline_entries().to_vec(),
        dbm_active_extent: inner.dbm_active_extent,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardStats {
    pub sealed_extents: u32,
    pub sealed_bytes: u64,
    pub active_entries: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub path: String,
    pub meta_version: i64,
    pub extent_size: u64,
    pub extent_watermark: u64,
    pub free_extents: u64,
    pub shard_count: u32,
    pub inline_len: u32,
    pub inline_capacity: u32,
    pub known_ids: u64,
    pub normal_end_id: u64,
    pub shards: Vec<ShardStats>,
    pub io: IoSnapshot,
}

impl Store {
    /// Open an existing store or create a fresh one at `path`.
    pub fn open(path: &Path, cfg: StoreConfig) -> Result<Self> {
        if path.exists() {
            Self::start_existing(path, cfg)
        } else {
            Self::create(path, cfg)
        }
    }

    /// Initialize a new data file: static header, zeroed metablock ring and
    /// the first valid metablock.
    pub fn create(path: &Path, cfg: StoreConfig) -> Result<Self> {
        cfg.validate()?;
        let lock = try_acquire_exclusive_lock(path)?;
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("create data file {}", path.display()))?;

        let io = IoAccount::new();
        header::write(&mut file, &encode_header_payload(cfg.extent_size))?;
        let mut mb = Metablock::empty(cfg.shard_count, cfg.inline_capacity);
        let meta = MetaManager::create(&mut file, &mut mb, &io)?;

        let mut extman = ExtentManager::new(cfg.extent_size, cfg.zone_count, 0);
        extman.finish_startup();
        let lba = LbaList::new_empty(cfg.shard_count, cfg.extent_size, cfg.inline_capacity);
        let txn = extman.begin_transaction();

        info!("store: created {} ({})", path.display(), cfg);
        Self::finish_open(path, cfg, lock, io, Inner {
            file,
            extman,
            meta,
            lba,
            txn,
            dbm_active_extent: NO_EXTENT,
        })
    }

    /// Load an existing data file without any full-data rescan: the newest
    /// valid metablock alone names every extent that matters.
    pub fn start_existing(path: &Path, cfg: StoreConfig) -> Result<Self> {
        cfg.validate()?;
        let lock = try_acquire_exclusive_lock(path)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open data file {}", path.display()))?;

        let hdr = header::read(&mut file)?;
        if hdr.needs_migration {
            info!("store: migrating static header of {}", path.display());
            header::write(&mut file, &hdr.payload)?;
        }
        let extent_size = decode_header_payload(&hdr.payload)?;
        let mut cfg = cfg;
        if extent_size != cfg.extent_size {
            warn!(
                "store: configured extent_size {} ignored, file uses {}",
                cfg.extent_size, extent_size
            );
            cfg.extent_size = extent_size;
            cfg.validate()?;
        }

        let io = IoAccount::new();
        let (meta, mb) = MetaManager::start_existing(&mut file, &io)?;

        let mut extman = ExtentManager::new(extent_size, cfg.zone_count, mb.extent_watermark);
        if mb.dbm_active_extent != NO_EXTENT {
            extman.reserve_extent(mb.dbm_active_extent as u64);
        }
        let lba = LbaList::start_existing(&mut file, &mut extman, extent_size, &mb, &io)?;
        extman.finish_startup();
        let txn = extman.begin_transaction();

        info!(
            "store: opened {} at metablock version {}",
            path.display(),
            mb.version
        );
        let dbm_active_extent = mb.dbm_active_extent;
        Self::finish_open(path, cfg, lock, io, Inner {
            file,
            extman,
            meta,
            lba,
            txn,
            dbm_active_extent,
        })
    }

    fn finish_open(
        path: &Path,
        cfg: StoreConfig,
        lock: LockGuard,
        io: IoAccount,
        inner: Inner,
    ) -> Result<Self> {
        let gc_auto = cfg.gc_auto;
        let shared = Arc::new(StoreShared {
            cfg,
            path: path.to_path_buf(),
            inner: Mutex::new(inner),
            io,
            gc_running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            gc_failure: Mutex::new(None),
            _lock: lock,
        });
        let gc_driver = if gc_auto {
            Some(GcDriver::spawn(Arc::clone(&shared))?)
        } else {
            None
        };
        Ok(Self { shared, gc_driver })
    }

    pub(crate) fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.shared.inner.lock().expect("store state lock poisoned")
    }

    /// A failed background GC cycle (out of disk space, I/O error) must not
    /// stay invisible: it is re-raised on every following write and sync.
    fn check_gc_failure(&self) -> Result<()> {
        let failure = self
            .shared
            .gc_failure
            .lock()
            .expect("gc failure lock poisoned");
        match failure.as_ref() {
            Some(msg) => Err(anyhow!("background GC failed, refusing writes: {}", msg)),
            None => Ok(()),
        }
    }

    // ---------------- index reads ----------------

    pub fn get_block_info(&self, id: u64) -> BlockInfo {
        self.lock_inner().lba.get_block_info(id)
    }

    pub fn get_block_recency(&self, id: u64) -> u64 {
        self.lock_inner().lba.get_block_recency(id)
    }

    pub fn get_block_size(&self, id: u64) -> u32 {
        self.lock_inner().lba.get_block_size(id)
    }

    // ---------------- index writes ----------------

    /// Record the latest location of `id`. Visible to reads immediately;
    /// durable after the next `sync()`.
    pub fn set_block_info(&self, id: u64, recency: u64, offset: i64, size: u32) -> Result<()> {
        self.check_gc_failure()?;
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        let Inner {
            file,
            extman,
            lba,
            txn,
            ..
        } = inner;
        lba.set_block_info(file, extman, txn, &self.shared.io, id, recency, offset, size)
    }

    /// Make everything staged durable: pad and flush all extents, then write
    /// a fresh metablock, then commit the releases that metablock stopped
    /// covering. Returns once the metablock is durable.
    pub fn sync(&self) -> Result<()> {
        self.check_gc_failure()?;
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        inner.lba.sync(&mut inner.file, &self.shared.io)?;
        let mut mb = snapshot_metablock(inner);
        inner
            .meta
            .write_metablock(&mut inner.file, &mut mb, &self.shared.io)?;
        let txn = std::mem::take(&mut inner.txn);
        inner.extman.commit_transaction(txn);
        Ok(())
    }

    // ---------------- allocator surface (data-block manager) ----------------

    pub fn begin_transaction(&self) -> ExtentTxn {
        self.lock_inner().extman.begin_transaction()
    }

    pub fn gen_extent(&self) -> Result<u64> {
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        inner.extman.gen_extent(&mut inner.file)
    }

    pub fn release_extent(&self, txn: &mut ExtentTxn, offset: u64) {
        self.lock_inner().extman.release_extent(txn, offset);
    }

    /// Callers must only commit after a metablock that no longer references
    /// the released extents is durable (usually: after `sync()`).
    pub fn commit_transaction(&self, txn: ExtentTxn) {
        self.lock_inner().extman.commit_transaction(txn);
    }

    /// Record the data-block manager's active extent; carried in every
    /// subsequent metablock.
    pub fn set_dbm_active_extent(&self, offset: i64) {
        self.lock_inner().dbm_active_extent = offset;
    }

    pub fn dbm_active_extent(&self) -> i64 {
        self.lock_inner().dbm_active_extent
    }

    // ---------------- observability ----------------

    pub fn stats(&self) -> Stats {
        let inner = self.lock_inner();
        let shards = (0..inner.lba.shard_count())
            .map(|s| {
                let ds = inner.lba.shard(s);
                ShardStats {
                    sealed_extents: ds.sealed_count(),
                    sealed_bytes: ds.sealed_bytes(),
                    active_entries: ds.active_count(),
                }
            })
            .collect();
        Stats {
            path: self.shared.path.display().to_string(),
            meta_version: inner.meta.next_version() - 1,
            extent_size: inner.extman.extent_size(),
            extent_watermark: inner.extman.watermark(),
            free_extents: inner.extman.free_count(),
            shard_count: inner.lba.shard_count(),
            inline_len: inner.lba.inline_entries().len() as u32,
            inline_capacity: inner.lba.inline_capacity(),
            known_ids: inner.lba.index().len() as u64,
            normal_end_id: inner.lba.index().normal_end_id(),
            shards,
            io: self.shared.io.snapshot(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.cfg
    }

    pub fn io_account(&self) -> &IoAccount {
        &self.shared.io
    }

    /// Flush, stop background GC after its current batch and release the
    /// lock.
    pub fn close(mut self) -> Result<()> {
        self.sync()?;
        self.stop_gc();
        Ok(())
    }

    fn stop_gc(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(driver) = self.gc_driver.take() {
            driver.join();
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // No implicit sync: dropping without close() models a crash in
        // tests. GC is still drained so its thread never outlives the lock.
        self.stop_gc();
    }
}
