use anyhow::Result;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use lbastore::consts::{META_RING_BASE, META_SLOT_COUNT, META_SLOT_HDR_SIZE, META_SLOT_SIZE};
use lbastore::{Store, StoreConfig};

fn unique_path(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("lbastore-{}-{}-{}.lba", tag, std::process::id(), nanos))
}

fn flip_byte(path: &PathBuf, at: u64) -> Result<()> {
    let mut f = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    let mut b = [0u8; 1];
    f.seek(SeekFrom::Start(at))?;
    f.read_exact(&mut b)?;
    b[0] ^= 0x01;
    f.seek(SeekFrom::Start(at))?;
    f.write_all(&b)?;
    f.sync_all()?;
    Ok(())
}

#[test]
fn versions_are_monotonic_across_restarts_and_ring_wrap() -> Result<()> {
    let path = unique_path("monotonic");
    let cfg = StoreConfig::default();

    let store = Store::create(&path, cfg.clone())?;
    assert_eq!(store.stats().meta_version, 1);
    // More syncs than ring slots, so versions wrap around the ring.
    for _ in 0..(META_SLOT_COUNT + 2) {
        store.sync()?;
    }
    let v = store.stats().meta_version;
    assert_eq!(v, 1 + (META_SLOT_COUNT + 2) as i64);
    store.close()?; // one more sync

    let store = Store::start_existing(&path, cfg)?;
    assert_eq!(store.stats().meta_version, v + 1);
    store.sync()?;
    assert_eq!(store.stats().meta_version, v + 2);
    store.close()?;
    std::fs::remove_file(&path).ok();
    Ok(())
}

#[test]
fn torn_newest_slot_falls_back_to_previous_version() -> Result<()> {
    let path = unique_path("torn");
    let cfg = StoreConfig::default();

    let store = Store::create(&path, cfg.clone())?;
    for id in 0..100u64 {
        store.set_block_info(id, id, id as i64 * 4096, 128)?;
    }
    store.sync()?; // version 2 covers everything
    store.sync()?; // version 3, identical coverage
    assert_eq!(store.stats().meta_version, 3);
    drop(store); // no close: close would write another version

    // Tear the newest slot by flipping one body byte.
    let slot = META_RING_BASE + (3 % META_SLOT_COUNT) * META_SLOT_SIZE;
    flip_byte(&path, slot + META_SLOT_HDR_SIZE as u64 + 5)?;

    let store = Store::start_existing(&path, cfg)?;
    assert_eq!(store.stats().meta_version, 2);
    for id in (0..100u64).step_by(13) {
        let info = store.get_block_info(id);
        assert_eq!(info.offset, id as i64 * 4096, "id {}", id);
    }
    store.close()?;
    std::fs::remove_file(&path).ok();
    Ok(())
}

#[test]
fn fully_zeroed_ring_refuses_to_open() -> Result<()> {
    let path = unique_path("deadring");
    let store = Store::create(&path, StoreConfig::default())?;
    store.sync()?;
    drop(store);

    // Zero every slot.
    {
        let mut f = std::fs::OpenOptions::new().write(true).open(&path)?;
        f.seek(SeekFrom::Start(META_RING_BASE))?;
        f.write_all(&vec![0u8; (META_SLOT_COUNT * META_SLOT_SIZE) as usize])?;
        f.sync_all()?;
    }

    let err = Store::start_existing(&path, StoreConfig::default());
    assert!(err.is_err());
    std::fs::remove_file(&path).ok();
    Ok(())
}
