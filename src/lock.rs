//! File-based locking for single-writer safety.
//!
//! Cross-platform (fs2) advisory lock on a `<file>.lock` sibling. The store
//! holds the exclusive lock for its whole lifetime; it is released on Drop.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

pub struct LockGuard {
    file: std::fs::File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // fs2 unlock errors on drop are ignored deliberately.
        let _ = self.file.unlock();
    }
}

fn lock_file_path(data_file: &Path) -> PathBuf {
    let mut os = data_file.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

/// Take the exclusive lock for the given data file, failing fast if another
/// process already holds it.
pub fn try_acquire_exclusive_lock(data_file: &Path) -> Result<LockGuard> {
    let path = lock_file_path(data_file);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("open lock file {}", path.display()))?;
    file.try_lock_exclusive()
        .with_context(|| format!("try_lock_exclusive failed: {}", path.display()))?;
    Ok(LockGuard { file, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_locker_is_rejected() {
        let data = std::env::temp_dir().join(format!(
            "lbastore-lock-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let g1 = try_acquire_exclusive_lock(&data).unwrap();
        assert!(try_acquire_exclusive_lock(&data).is_err());
        drop(g1);
        let g2 = try_acquire_exclusive_lock(&data).unwrap();
        drop(g2);
    }
}
