//! LBA garbage collection.
//!
//! Sealed extents accumulate dead entries as ids get rewritten. GC picks one
//! shard, snapshots its sealed extents as victims, re-appends the current
//! location of every live id owned by the shard, then destroys the victims.
//! Replay order makes this safe: the copies land after the originals, so
//! they win, and they carry the same values the index already holds.
//!
//! Copying runs in batches. Each batch takes the store lock, appends up to
//! `gc_batch_entries` entries under a sub-transaction, flushes, writes a
//! fresh metablock and commits the sub-transaction. Foreground writes
//! interleave between batches; a shutdown request lands between batches too,
//! aborting the cycle without destroying anything (the victims simply stay,
//! still fully covered by the last metablock).
//!
//! Victim extents are released through a transaction held across the whole
//! cycle and committed only after the final metablock (which no longer
//! references them) is durable.

use anyhow::{Context, Result};
use log::{error, info};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::lba::entry::IndexEntry;
use crate::store::{snapshot_metablock, Inner, Store, StoreShared};

#[derive(Debug, Clone)]
pub struct GcReport {
    pub shard: u32,
    pub live_copied: u64,
    pub extents_destroyed: u32,
    pub batches: u32,
    pub aborted: bool,
}

/// Sealed state worth collecting: enough sealed bytes, and a live-entry
/// population small enough that most of the sealed capacity is garbage.
fn shard_eligible(shared: &StoreShared, inner: &Inner, shard: u32) -> bool {
    let ds = inner.lba.shard(shard);
    if ds.sealed_count() == 0 {
        return false;
    }
    if ds.sealed_bytes() < shared.cfg.gc_min_sealed_bytes {
        return false;
    }
    let capacity = ds.sealed_count() as u64 * ds.entries_per_extent() as u64;
    let live = inner.lba.index().known_id_span() / inner.lba.shard_count() as u64;
    (live as f64) < capacity as f64 * shared.cfg.gc_live_fraction
}

/// Clears the running flag when the cycle ends, normally or by error.
struct RunningGuard<'a>(&'a StoreShared);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.gc_running.store(false, Ordering::SeqCst);
    }
}

fn try_begin(shared: &StoreShared) -> Option<RunningGuard<'_>> {
    if shared.shutdown.load(Ordering::SeqCst) {
        return None;
    }
    shared
        .gc_running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .ok()
        .map(|_| RunningGuard(shared))
}

/// Run one full GC cycle on `shard`. Caller holds the running guard.
fn run_cycle(shared: &StoreShared, shard: u32) -> Result<GcReport> {
    let started = Instant::now();
    let mut report = GcReport {
        shard,
        live_copied: 0,
        extents_destroyed: 0,
        batches: 0,
        aborted: false,
    };

    // Snapshot victims and the live id population under the lock. Entries
    // written after this point land in fresh extents, never in a victim.
    let (victims, live_ids, mut main_txn) = {
        let inner = lock(shared);
        let ds = inner.lba.shard(shard);
        if ds.sealed_count() == 0 {
            return Ok(report);
        }
        let victims = ds.sealed_offsets();
        let ids = inner
            .lba
            .index()
            .shard_ids(shard, inner.lba.shard_count());
        (victims, ids, inner.extman.begin_transaction())
    };

    let batch = shared.cfg.gc_batch_entries.max(1);
    for chunk in live_ids.chunks(batch) {
        if shared.shutdown.load(Ordering::SeqCst) {
            info!(
                "gc: shard {} aborted by shutdown after {} batch(es)",
                shard, report.batches
            );
            report.aborted = true;
            return Ok(report);
        }

        let mut guard = lock(shared);
        let inner = &mut *guard;
        let mut sub = inner.extman.begin_transaction();
        {
            let Inner {
                file, extman, lba, ..
            } = inner;
            for &id in chunk {
                // Latest position wins, even if the id was rewritten since
                // the snapshot.
                let info = lba.index().get_block_info(id);
                let e = IndexEntry::new(id, info.recency, info.offset, info.size);
                lba.shard_mut(shard)
                    .add_entry(file, extman, &mut sub, &e, &shared.io)?;
            }
            lba.sync(file, &shared.io).context("flush GC batch")?;
        }
        let mut mb = snapshot_metablock(inner);
        inner
            .meta
            .write_metablock(&mut inner.file, &mut mb, &shared.io)?;
        inner.extman.commit_transaction(sub);

        report.live_copied += chunk.len() as u64;
        report.batches += 1;
    }

    // Every live entry is re-homed and covered; drop the victims.
    {
        let mut guard = lock(shared);
        let inner = &mut *guard;
        let victim_set: HashSet<u64> = victims.iter().copied().collect();
        {
            let Inner {
                file, extman, lba, ..
            } = inner;
            lba.shard_mut(shard)
                .destroy_extents(file, extman, &mut main_txn, &victim_set, &shared.io)?;
            lba.sync(file, &shared.io)?;
        }
        let mut mb = snapshot_metablock(inner);
        inner
            .meta
            .write_metablock(&mut inner.file, &mut mb, &shared.io)?;
        inner.extman.commit_transaction(main_txn);
        report.extents_destroyed = victims.len() as u32;
    }

    info!(
        "gc: shard {} done in {:?}: {} live entr(ies) copied, {} extent(s) destroyed, {} batch(es)",
        shard,
        started.elapsed(),
        report.live_copied,
        report.extents_destroyed,
        report.batches
    );
    Ok(report)
}

fn lock(shared: &StoreShared) -> std::sync::MutexGuard<'_, Inner> {
    shared.inner.lock().expect("store state lock poisoned")
}

/// Policy-driven entry point: collect the first eligible shard, if any.
pub(crate) fn consider(shared: &StoreShared) -> Result<Option<GcReport>> {
    let Some(_guard) = try_begin(shared) else {
        return Ok(None);
    };
    let candidate = {
        let inner = lock(shared);
        (0..inner.lba.shard_count()).find(|&s| shard_eligible(shared, &inner, s))
    };
    match candidate {
        Some(shard) => run_cycle(shared, shard).map(Some),
        None => Ok(None),
    }
}

impl Store {
    /// Evaluate the GC policy once and collect at most one shard.
    pub fn consider_gc(&self) -> Result<Option<GcReport>> {
        consider(&self.shared)
    }

    /// Force a GC cycle on one shard, bypassing the eligibility thresholds.
    /// `None` when another cycle is already running or shutdown has begun;
    /// a zeroed report when the shard has nothing sealed.
    pub fn gc_shard(&self, shard: u32) -> Result<Option<GcReport>> {
        let Some(_guard) = try_begin(&self.shared) else {
            return Ok(None);
        };
        let report = run_cycle(&self.shared, shard)?;
        Ok(Some(report))
    }
}

/// Background thread polling the GC policy at a fixed interval.
pub(crate) struct GcDriver {
    handle: thread::JoinHandle<()>,
}

impl GcDriver {
    pub(crate) fn spawn(shared: Arc<StoreShared>) -> Result<Self> {
        let handle = thread::Builder::new()
            .name("lbastore-gc".into())
            .spawn(move || {
                let interval = Duration::from_millis(shared.cfg.gc_interval_ms.max(1));
                loop {
                    // Sleep in short slices so shutdown is picked up quickly.
                    let deadline = Instant::now() + interval;
                    while Instant::now() < deadline {
                        if shared.shutdown.load(Ordering::SeqCst) {
                            return;
                        }
                        thread::sleep(Duration::from_millis(20).min(interval));
                    }
                    match consider(&shared) {
                        Ok(Some(report)) => {
                            if report.aborted {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!("gc: background cycle failed: {:#}", e);
                            // Sticky failure: the store re-raises it on the
                            // next write/sync, so the error reaches a caller.
                            *shared
                                .gc_failure
                                .lock()
                                .expect("gc failure lock poisoned") = Some(format!("{:#}", e));
                            return;
                        }
                    }
                }
            })
            .context("spawn GC thread")?;
        Ok(Self { handle })
    }

    pub(crate) fn join(self) {
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Store, StoreConfig};
    use std::path::PathBuf;

    fn unique_path(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "lbastore-gc-{}-{}-{}.lba",
            tag,
            std::process::id(),
            nanos
        ))
    }

    fn small_config() -> StoreConfig {
        StoreConfig::default()
            .with_shard_count(1)
            .with_inline_capacity(2)
            .with_extent_size(4096)
    }

    fn churn(store: &Store, rounds: u64, ids: u64) {
        for round in 0..rounds {
            for id in 0..ids {
                store
                    .set_block_info(id, round * ids + id, (round as i64 + 1) * 4096, 4096)
                    .unwrap();
            }
        }
    }

    #[test]
    fn shutdown_aborts_cycle_without_destroying_extents() {
        let path = unique_path("abort");
        let cfg = small_config().with_gc_batch_entries(16);
        let store = Store::create(&path, cfg.clone()).unwrap();
        churn(&store, 5, 300);
        store.sync().unwrap();
        let sealed_before = store.stats().shards[0].sealed_extents;
        assert!(sealed_before > 0);

        store.shared.shutdown.store(true, Ordering::SeqCst);
        // The public entry refuses to start a new cycle during shutdown.
        assert!(store.gc_shard(0).unwrap().is_none());
        // A cycle already past its snapshot aborts at the next batch
        // boundary, leaving every victim in place.
        let report = run_cycle(&store.shared, 0).unwrap();
        assert!(report.aborted);
        assert_eq!(report.batches, 0);
        assert_eq!(report.extents_destroyed, 0);
        assert_eq!(store.stats().shards[0].sealed_extents, sealed_before);
        store.shared.shutdown.store(false, Ordering::SeqCst);

        for id in 0..300u64 {
            let info = store.get_block_info(id);
            assert_eq!(info.offset, 5 * 4096, "id {}", id);
            assert_eq!(info.recency, 4 * 300 + id);
        }
        store.close().unwrap();

        let store = Store::start_existing(&path, cfg).unwrap();
        for id in 0..300u64 {
            let info = store.get_block_info(id);
            assert_eq!(info.offset, 5 * 4096, "id {}", id);
            assert_eq!(info.recency, 4 * 300 + id);
        }
        store.close().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn shutdown_mid_cycle_finishes_batch_and_preserves_values() {
        let path = unique_path("midcycle");
        let cfg = small_config().with_gc_batch_entries(16);
        let store = Store::create(&path, cfg.clone()).unwrap();
        churn(&store, 4, 2000);
        store.sync().unwrap();
        let sealed_before = store.stats().shards[0].sealed_extents;
        assert!(sealed_before > 0);

        let shared = Arc::clone(&store.shared);
        let worker = thread::spawn(move || run_cycle(&shared, 0));
        thread::sleep(Duration::from_millis(25));
        store.shared.shutdown.store(true, Ordering::SeqCst);
        let report = worker.join().unwrap().unwrap();

        if report.aborted {
            // Stopped between batches: no victim was destroyed, the copies
            // made so far only added sealed extents.
            assert_eq!(report.extents_destroyed, 0);
            assert!(store.stats().shards[0].sealed_extents >= sealed_before);
        } else {
            // The cycle beat the shutdown request; victims are gone.
            assert_eq!(report.extents_destroyed, sealed_before);
        }
        store.shared.shutdown.store(false, Ordering::SeqCst);

        // Either way every id reads its latest value, now and after restart.
        for id in (0..2000u64).step_by(41) {
            let info = store.get_block_info(id);
            assert_eq!(info.offset, 4 * 4096, "id {}", id);
            assert_eq!(info.recency, 3 * 2000 + id);
        }
        store.close().unwrap();

        let store = Store::start_existing(&path, cfg).unwrap();
        for id in (0..2000u64).step_by(41) {
            let info = store.get_block_info(id);
            assert_eq!(info.offset, 4 * 4096, "id {}", id);
            assert_eq!(info.recency, 3 * 2000 + id);
        }
        store.close().unwrap();
        std::fs::remove_file(&path).ok();
    }
}
