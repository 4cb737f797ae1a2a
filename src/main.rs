//! vibegraph - operator tool for a vibegraph store directory

use anyhow::{bail, Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use std::path::{Path, PathBuf};
use vibegraph::storage::meta::StoreMeta;
use vibegraph::storage::wal::{RecordBody, WalConfig, WalManager};
use vibegraph::transaction::decode_batch;
use vibegraph::{GraphStore, StoreConfig};

/// vibegraph - inspect, recover and checkpoint a graph store
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Store directory
    #[arg(short = 'D', long, default_value = "./vibegraph_data")]
    data_dir: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Page size of store files
    #[arg(long, default_value = "8192")]
    page_size: usize,

    /// Number of page cache frames
    #[arg(short = 'c', long, default_value = "64")]
    cache_frames: usize,

    /// Lock manager implementation (community, wait-die)
    #[arg(long, default_value = "")]
    lock_manager: String,

    /// Drop log records covered by the checkpoint
    #[arg(long)]
    compact: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show store identity, checkpoint and log summary without recovering
    Info,
    /// Open the store read-write, replaying any unapplied log tail
    Recover,
    /// Recover, then write a checkpoint
    Checkpoint,
    /// Print every valid log record
    DumpLog,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match args.command {
        Command::Info => info(&args.data_dir),
        Command::DumpLog => dump_log(&args.data_dir),
        Command::Recover => {
            let store = GraphStore::open(config(&args)).context("Failed to open store")?;
            let stats = store.recovery_stats().clone();
            println!("Recovered store {}", store.store_id());
            println!("  records scanned:       {}", stats.records_scanned);
            println!("  transactions replayed: {}", stats.transactions_replayed);
            println!("  torn tail bytes:       {}", stats.truncated_bytes);
            println!("  log continues after:   {}", stats.end_position);
            store.close().context("Failed to close store")?;
            Ok(())
        }
        Command::Checkpoint => {
            let store = GraphStore::open(config(&args)).context("Failed to open store")?;
            let outcome = store.checkpoint().context("Checkpoint failed")?;
            println!(
                "Checkpoint at {} covers {}",
                outcome.record_position, outcome.applied_position
            );
            if let Some(bytes) = outcome.compacted_bytes {
                println!("Compaction dropped {} log bytes", bytes);
            }
            store.close().context("Failed to close store")?;
            Ok(())
        }
    }
}

fn config(args: &Args) -> StoreConfig {
    StoreConfig::new(&args.data_dir)
        .with_page_size(args.page_size)
        .with_cache_frames(args.cache_frames)
        .with_lock_manager(args.lock_manager.clone())
        .with_compact_log_on_checkpoint(args.compact)
}

fn read_only_log(dir: &Path) -> Result<(StoreMeta, WalManager)> {
    let Some(meta) = StoreMeta::load(dir).context("Failed to read store metadata")? else {
        bail!("No store found at {}", dir.display());
    };
    let config = WalConfig { read_only: true };
    let wal = WalManager::open(dir, meta.store_id, config).context("Failed to open log")?;
    Ok((meta, wal))
}

fn info(dir: &Path) -> Result<()> {
    let (meta, wal) = read_only_log(dir)?;
    let scan = wal.scan().context("Failed to scan log")?;

    println!("Store:            {}", meta.store_id);
    println!("Checkpoint:       {}", meta.checkpoint_position);
    println!("Last tx id:       {}", meta.last_tx_id.max(scan.max_tx_id()));
    println!("Log records:      {}", scan.records.len());
    println!("Last position:    {}", scan.last_position());
    match &scan.torn_tail {
        Some(torn) => println!(
            "Torn tail:        {} bytes at offset {} ({})",
            torn.discarded_bytes, torn.offset, torn.reason
        ),
        None => println!("Torn tail:        none"),
    }
    Ok(())
}

fn dump_log(dir: &Path) -> Result<()> {
    let (_, wal) = read_only_log(dir)?;
    let scan = wal.scan().context("Failed to scan log")?;
    for record in &scan.records {
        match &record.body {
            RecordBody::Transaction(payload) => {
                let commands = decode_batch(payload)
                    .with_context(|| format!("Undecodable batch at {}", record.position))?;
                println!("{} Tx{} {} commands", record.position, record.tx_id, commands.len());
                for command in commands {
                    println!("    {:?}", command);
                }
            }
            RecordBody::Checkpoint(marker) => println!(
                "{} checkpoint applied={} last_tx={}",
                record.position, marker.applied_position, marker.last_tx_id
            ),
        }
    }
    if let Some(torn) = &scan.torn_tail {
        println!("-- torn tail at offset {}: {}", torn.offset, torn.reason);
    }
    Ok(())
}
