//! util — raw positioned file I/O plus small shared helpers.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::consts::BLOCK_SIZE;

pub fn read_at(f: &mut File, offset: u64, buf: &mut [u8]) -> Result<()> {
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(buf)
        .with_context(|| format!("read {} bytes at offset {}", buf.len(), offset))?;
    Ok(())
}

pub fn write_at(f: &mut File, offset: u64, buf: &[u8]) -> Result<()> {
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(buf)
        .with_context(|| format!("write {} bytes at offset {}", buf.len(), offset))?;
    Ok(())
}

#[inline]
pub fn is_block_aligned(offset: u64) -> bool {
    offset % BLOCK_SIZE == 0
}

/// Per-caller I/O accounting. Sync and GC paths charge their reads/writes
/// here; `lbactl status` surfaces the totals.
#[derive(Debug, Default)]
pub struct IoAccount {
    reads: AtomicU64,
    writes: AtomicU64,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct IoSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

impl IoAccount {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn note_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn note_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.write_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IoSnapshot {
        IoSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_alignment() {
        assert!(is_block_aligned(0));
        assert!(is_block_aligned(8192));
        assert!(!is_block_aligned(8193));
    }

    #[test]
    fn io_account_counts() {
        let io = IoAccount::new();
        io.note_read(100);
        io.note_write(32);
        io.note_write(32);
        let s = io.snapshot();
        assert_eq!(s.reads, 1);
        assert_eq!(s.read_bytes, 100);
        assert_eq!(s.writes, 2);
        assert_eq!(s.write_bytes, 64);
    }
}
