//! lbastore — persistent block-location index on a log-structured data file.
//!
//! The store maps 64-bit block ids to their current byte offset, recency
//! counter and size. Updates are staged in a small inline buffer, spill into
//! append-only per-shard extents, and become crash-durable through a
//! versioned, CRC-protected metablock ring. No full-data scan is ever needed
//! at startup: the newest valid metablock names every extent that matters.
//!
//! ```no_run
//! use lbastore::{Store, StoreConfig};
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let store = Store::open(Path::new("/data/blocks.lba"), StoreConfig::default())?;
//! store.set_block_info(42, 1, 172032, 4096)?;
//! store.sync()?;
//! assert_eq!(store.get_block_info(42).offset, 172032);
//! store.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consts;
pub mod extman;
pub mod header;
pub mod lba;
pub mod lock;
pub mod metablock;
pub mod store;
pub mod util;

pub use config::StoreConfig;
pub use extman::{ExtentManager, ExtentTxn};
pub use lba::entry::IndexEntry;
pub use lba::gc::GcReport;
pub use lba::index::BlockInfo;
pub use lba::LbaList;
pub use metablock::Metablock;
pub use store::{Stats, Store};
pub use util::{IoAccount, IoSnapshot};
