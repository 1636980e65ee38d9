// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Quill CLI
//!
//! Entry point for the `quill` binary. Parses arguments, sets up logging and
//! runs one command against the log in `--dir`.
//!
//! - `init`    : create the log and its signing key
//! - `append`  : append blocks
//! - `get`     : print a block
//! - `truncate`: cut the log back
//! - `info`    : print the head as JSON
//! - `version` : print build version information

mod cli;
mod logging;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use quill_core::crypto::KeyPair;
use quill_core::storage::{CoreStorage, DiskStorage};
use quill_core::{Batch, BatchOptions, CoreInfo, Writer};

use cli::{AppendArgs, Commands, GetArgs, InitArgs, QuillCli, TruncateArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = QuillCli::parse();
    logging::init_logging("quill=info,quill_core=info", cli.log_format);

    match cli.command {
        Commands::Init(args) => init_log(&cli.dir, args),
        Commands::Append(args) => append(&cli.dir, args).await,
        Commands::Get(args) => get(&cli.dir, args),
        Commands::Truncate(args) => truncate(&cli.dir, args).await,
        Commands::Info => info(&cli.dir),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn open_storage(dir: &Path) -> Result<Arc<DiskStorage>> {
    let storage = DiskStorage::open(dir)
        .with_context(|| format!("failed to open log storage at {}", dir.display()))?;
    Ok(Arc::new(storage))
}

/// Opens an existing log with the key stored alongside it.
fn open_writer(dir: &Path) -> Result<Writer> {
    let storage = open_storage(dir)?;
    if storage.read_batch().get_core_auth()?.is_none() {
        bail!("no log at {} (run `quill init` first)", dir.display());
    }
    Writer::resume(storage).with_context(|| format!("failed to open log at {}", dir.display()))
}

fn init_log(dir: &Path, args: InitArgs) -> Result<()> {
    let storage = open_storage(dir)?;
    if storage.read_batch().get_core_auth()?.is_some() {
        bail!("a log already exists at {}", dir.display());
    }

    let key_pair = match args.secret_key {
        Some(hex_seed) => KeyPair::from_hex(&hex_seed).context("invalid --secret-key")?,
        None => KeyPair::generate(),
    };
    let writer = Writer::open(storage, key_pair)?;

    tracing::info!(dir = %dir.display(), key = %writer.key(), "log initialized");
    println!("Log initialized.");
    println!("  Directory     : {}", dir.display());
    println!("  Public key    : {}", writer.key().to_hex());
    println!("  Discovery key : {}", hex::encode(writer.discovery_key()));
    Ok(())
}

async fn append(dir: &Path, args: AppendArgs) -> Result<()> {
    let writer = Arc::new(open_writer(dir)?);

    let blocks = args
        .values
        .iter()
        .map(|v| {
            if args.hex {
                hex::decode(v)
                    .map(Bytes::from)
                    .with_context(|| format!("not hex: {v}"))
            } else {
                Ok(Bytes::copy_from_slice(v.as_bytes()))
            }
        })
        .collect::<Result<Vec<_>>>()?;

    let batch = Batch::with_options(writer.clone(), BatchOptions { auto_close: true })?;
    let start = batch.length();
    let length = batch.append(blocks)?;
    if !batch.flush(None).await? {
        bail!("log moved while appending, nothing was written");
    }
    writer.close().await?;

    println!("appended [{start}, {length})");
    Ok(())
}

fn get(dir: &Path, args: GetArgs) -> Result<()> {
    let writer = open_writer(dir)?;
    let Some(block) = writer.get(args.index)? else {
        bail!("block {} not available (length {})", args.index, writer.length());
    };
    if args.hex {
        println!("{}", hex::encode(&block));
    } else {
        println!("{}", String::from_utf8_lossy(&block));
    }
    Ok(())
}

async fn truncate(dir: &Path, args: TruncateArgs) -> Result<()> {
    let writer = open_writer(dir)?;
    let before = writer.length();
    writer.truncate(args.length, args.fork).await?;
    writer.close().await?;
    println!(
        "truncated {before} -> {} (fork {})",
        writer.length(),
        writer.fork()
    );
    Ok(())
}

/// JSON shape printed by `quill info`.
#[derive(Debug, Serialize)]
struct InfoReport {
    key: String,
    discovery_key: String,
    length: u64,
    byte_length: u64,
    fork: u64,
    root_hash: String,
    writable: bool,
}

impl From<CoreInfo> for InfoReport {
    fn from(info: CoreInfo) -> Self {
        Self {
            key: info.key.to_hex(),
            discovery_key: hex::encode(info.discovery_key),
            length: info.length,
            byte_length: info.byte_length,
            fork: info.fork,
            root_hash: hex::encode(info.root_hash),
            writable: info.writable,
        }
    }
}

fn info(dir: &Path) -> Result<()> {
    let writer = open_writer(dir)?;
    let report = InfoReport::from(writer.info());
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_version() {
    println!("quill   {}", env!("CARGO_PKG_VERSION"));
    println!("storage {}", quill_core::config::STORAGE_VERSION);
}
