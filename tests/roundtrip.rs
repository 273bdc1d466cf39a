use anyhow::Result;
use std::path::PathBuf;

use lbastore::{Store, StoreConfig};

fn unique_path(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("lbastore-{}-{}-{}.lba", tag, std::process::id(), nanos))
}

#[test]
fn ten_thousand_ids_survive_restart() -> Result<()> {
    let path = unique_path("roundtrip");
    let cfg = StoreConfig::default().with_shard_count(8).with_inline_capacity(32);

    let store = Store::create(&path, cfg.clone())?;
    for id in 0..10_000u64 {
        store.set_block_info(id, id, id as i64 * 4096, 4096)?;
    }
    store.sync()?;

    let info = store.get_block_info(42);
    assert_eq!(info.offset, 172_032);
    assert_eq!(info.recency, 42);
    assert_eq!(info.size, 4096);
    store.close()?;

    let store = Store::start_existing(&path, cfg)?;
    let info = store.get_block_info(42);
    assert_eq!(info.offset, 172_032);
    assert_eq!(info.recency, 42);
    for id in (0..10_000u64).step_by(997) {
        let info = store.get_block_info(id);
        assert_eq!(info.offset, id as i64 * 4096, "id {}", id);
        assert_eq!(info.recency, id);
    }
    assert_eq!(store.stats().known_ids, 10_000);
    store.close()?;
    std::fs::remove_file(&path).ok();
    Ok(())
}

#[test]
fn last_write_wins_before_and_after_restart() -> Result<()> {
    let path = unique_path("lastwin");
    let cfg = StoreConfig::default();

    let store = Store::create(&path, cfg.clone())?;
    store.set_block_info(7, 1, 8192, 512)?;
    store.set_block_info(7, 2, 20480, 1024)?;

    // Visible immediately, before any sync.
    let info = store.get_block_info(7);
    assert_eq!(info.offset, 20480);
    assert_eq!(info.recency, 2);
    assert_eq!(info.size, 1024);

    store.sync()?;
    store.close()?;

    let store = Store::start_existing(&path, cfg)?;
    let info = store.get_block_info(7);
    assert_eq!(info.offset, 20480);
    assert_eq!(info.recency, 2);
    assert_eq!(store.stats().known_ids, 1);
    store.close()?;
    std::fs::remove_file(&path).ok();
    Ok(())
}

#[test]
fn unset_ids_read_as_unused() -> Result<()> {
    let path = unique_path("unset");
    let store = Store::create(&path, StoreConfig::default())?;
    let info = store.get_block_info(123_456);
    assert!(!info.has_value());
    assert_eq!(info.recency, 0);
    assert_eq!(store.get_block_size(123_456), 0);
    store.close()?;
    std::fs::remove_file(&path).ok();
    Ok(())
}

#[test]
fn deletion_keeps_recency() -> Result<()> {
    let path = unique_path("delete");
    let cfg = StoreConfig::default();
    let store = Store::create(&path, cfg.clone())?;
    store.set_block_info(9, 5, 40960, 256)?;
    store.set_block_info(9, 6, lbastore::consts::NO_OFFSET, 0)?;
    let info = store.get_block_info(9);
    assert!(!info.has_value());
    assert_eq!(info.recency, 6);
    store.sync()?;
    store.close()?;

    let store = Store::start_existing(&path, cfg)?;
    let info = store.get_block_info(9);
    assert!(!info.has_value());
    assert_eq!(info.recency, 6);
    store.close()?;
    std::fs::remove_file(&path).ok();
    Ok(())
}

#[test]
fn unsynced_writes_are_lost_on_crash() -> Result<()> {
    let path = unique_path("crash");
    let cfg = StoreConfig::default().with_inline_capacity(4);

    let store = Store::create(&path, cfg.clone())?;
    store.set_block_info(1, 1, 4096, 64)?;
    store.sync()?;
    // Past the durable point: staged inline and drained to extents, but no
    // covering metablock.
    for id in 100..150u64 {
        store.set_block_info(id, id, id as i64 * 4096, 64)?;
    }
    drop(store); // crash: no close(), no sync()

    let store = Store::start_existing(&path, cfg)?;
    assert_eq!(store.get_block_info(1).offset, 4096);
    for id in 100..150u64 {
        assert!(!store.get_block_info(id).has_value(), "id {} leaked", id);
    }
    store.close()?;
    std::fs::remove_file(&path).ok();
    Ok(())
}

#[test]
fn second_opener_is_rejected() -> Result<()> {
    let path = unique_path("lock");
    let store = Store::create(&path, StoreConfig::default())?;
    assert!(Store::start_existing(&path, StoreConfig::default()).is_err());
    store.close()?;
    // Lock released with the store.
    let store = Store::start_existing(&path, StoreConfig::default())?;
    store.close()?;
    std::fs::remove_file(&path).ok();
    Ok(())
}
