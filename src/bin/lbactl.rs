use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use lbastore::{Store, StoreConfig};

/// Minimal CLI for lbastore data files
#[derive(Parser, Debug)]
#[command(name = "lbactl", version, about = "lbastore admin CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Initialize a new data file (static header + metablock ring)
    Init {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = 65536)]
        extent_size: u64,
        #[arg(long, default_value_t = 8)]
        shards: u32,
        #[arg(long, default_value_t = 128)]
        inline_cap: u32,
        #[arg(long, default_value_t = 1)]
        zones: u32,
    },
    /// Print store stats (metablock version, extents, per-shard counters)
    Status {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Force a GC cycle on one shard (all shards when omitted)
    Gc {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        shard: Option<u32>,
    },
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Init {
            path,
            extent_size,
            shards,
            inline_cap,
            zones,
        } => {
            let cfg = StoreConfig::from_env()
                .with_extent_size(extent_size)
                .with_shard_count(shards)
                .with_inline_capacity(inline_cap)
                .with_zone_count(zones);
            let store = Store::create(&path, cfg)?;
            println!("initialized {}", path.display());
            store.close()
        }

        Cmd::Status { path, json } => {
            let store = Store::start_existing(&path, StoreConfig::from_env())?;
            let stats = store.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("path:             {}", stats.path);
                println!("meta version:     {}", stats.meta_version);
                println!("extent size:      {}", stats.extent_size);
                println!("extent watermark: {}", stats.extent_watermark);
                println!("free extents:     {}", stats.free_extents);
                println!(
                    "inline buffer:    {}/{}",
                    stats.inline_len, stats.inline_capacity
                );
                println!("known ids:        {}", stats.known_ids);
                for (s, sh) in stats.shards.iter().enumerate() {
                    println!(
                        "shard {:>3}:        sealed={} ({} B) active_entries={}",
                        s, sh.sealed_extents, sh.sealed_bytes, sh.active_entries
                    );
                }
            }
            store.close()
        }

        Cmd::Gc { path, shard } => {
            let store = Store::start_existing(&path, StoreConfig::from_env())?;
            let shards: Vec<u32> = match shard {
                Some(s) => {
                    if s >= store.stats().shard_count {
                        return Err(anyhow!("shard {} out of range", s));
                    }
                    vec![s]
                }
                None => (0..store.stats().shard_count).collect(),
            };
            for s in shards {
                match store.gc_shard(s)? {
                    Some(r) => println!(
                        "shard {}: copied {} live entries, destroyed {} extents in {} batches",
                        s, r.live_copied, r.extents_destroyed, r.batches
                    ),
                    None => println!("shard {}: nothing to collect", s),
                }
            }
            store.close()
        }
    }
}
