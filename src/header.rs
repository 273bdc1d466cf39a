//! Static header — block 0 of the data file.
//!
//! Layout (LE):
//!   [magic 16 B]["lbastore-2.0" version string, NUL padded to 16 B]
//!   [payload_len u32][payload]
//!
//! Read once at startup. The payload pins the file geometry (extent size)
//! chosen at create time. A recognized old version string sets
//! `needs_migration`: the caller rewrites the header before normal operation;
//! index data itself needs no rewrite.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;

use crate::consts::{
    BLOCK_SIZE, HEADER_MAGIC, HEADER_PAYLOAD_MAX, HEADER_VERSION_CURRENT, HEADER_VERSION_OLD,
};
use crate::util::{read_at, write_at};

#[derive(Debug, Clone)]
pub struct StaticHeader {
    pub payload: Vec<u8>,
    pub needs_migration: bool,
}

fn version_str(raw: &[u8; 16]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// True iff block zero begins with the engine magic.
pub fn check(f: &mut File) -> Result<bool> {
    if f.metadata()?.len() < BLOCK_SIZE {
        return Ok(false);
    }
    let mut magic = [0u8; 16];
    read_at(f, 0, &mut magic)?;
    Ok(&magic == HEADER_MAGIC)
}

/// Write magic + current version + payload to block zero and flush.
pub fn write(f: &mut File, payload: &[u8]) -> Result<()> {
    if payload.len() > HEADER_PAYLOAD_MAX {
        return Err(anyhow!(
            "static header payload too large: {} > {}",
            payload.len(),
            HEADER_PAYLOAD_MAX
        ));
    }
    let mut block = vec![0u8; BLOCK_SIZE as usize];
    block[..16].copy_from_slice(HEADER_MAGIC);
    block[16..32].copy_from_slice(HEADER_VERSION_CURRENT);
    LittleEndian::write_u32(&mut block[32..36], payload.len() as u32);
    block[36..36 + payload.len()].copy_from_slice(payload);
    write_at(f, 0, &block)?;
    f.sync_all().context("sync static header")?;
    Ok(())
}

/// Read and validate block zero.
pub fn read(f: &mut File) -> Result<StaticHeader> {
    let mut block = vec![0u8; BLOCK_SIZE as usize];
    read_at(f, 0, &mut block).context("read static header block")?;

    if &block[..16] != HEADER_MAGIC {
        return Err(anyhow!("not a recognized lbastore data file (bad magic)"));
    }

    let mut version = [0u8; 16];
    version.copy_from_slice(&block[16..32]);

    let needs_migration = if &version == HEADER_VERSION_CURRENT {
        false
    } else if &version == HEADER_VERSION_OLD {
        true
    } else {
        return Err(anyhow!(
            "data file version mismatch: file has \"{}\", this build expects \"{}\" \
             (no migration path from that version)",
            version_str(&version),
            version_str(HEADER_VERSION_CURRENT)
        ));
    };

    let len = LittleEndian::read_u32(&block[32..36]) as usize;
    if len > HEADER_PAYLOAD_MAX {
        return Err(anyhow!("corrupt static header: payload length {}", len));
    }
    Ok(StaticHeader {
        payload: block[36..36 + len].to_vec(),
        needs_migration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write as _;

    fn tmp_file(tag: &str) -> (std::path::PathBuf, File) {
        let path = std::env::temp_dir().join(format!(
            "lbastore-hdr-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let f = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        (path, f)
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (_p, mut f) = tmp_file("rt");
        write(&mut f, b"geometry").unwrap();
        assert!(check(&mut f).unwrap());
        let h = read(&mut f).unwrap();
        assert_eq!(h.payload, b"geometry");
        assert!(!h.needs_migration);
    }

    #[test]
    fn old_version_requests_migration() {
        let (_p, mut f) = tmp_file("old");
        write(&mut f, b"x").unwrap();
        // Patch the version string to the known-old value.
        write_at(&mut f, 16, HEADER_VERSION_OLD).unwrap();
        let h = read(&mut f).unwrap();
        assert!(h.needs_migration);
    }

    #[test]
    fn unknown_version_is_fatal_and_names_both() {
        let (_p, mut f) = tmp_file("bad");
        write(&mut f, b"x").unwrap();
        write_at(&mut f, 16, b"lbastore-9.9\0\0\0\0").unwrap();
        let err = read(&mut f).unwrap_err().to_string();
        assert!(err.contains("lbastore-9.9"));
        assert!(err.contains("lbastore-2.0"));
    }

    #[test]
    fn foreign_file_is_rejected() {
        let (_p, mut f) = tmp_file("foreign");
        f.write_all(&vec![0x5au8; BLOCK_SIZE as usize]).unwrap();
        assert!(!check(&mut f).unwrap());
        assert!(read(&mut f).is_err());
    }
}
