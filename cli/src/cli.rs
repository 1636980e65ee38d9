//! # CLI Interface
//!
//! Argument structure for the `quill` binary, built with `clap` derive.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Operator tool for Quill logs.
///
/// Every command works on one log stored in `--dir`.
#[derive(Parser, Debug)]
#[command(name = "quill", about = "Quill append-only log tool", version, propagate_version = true)]
pub struct QuillCli {
    /// Directory holding the log.
    #[arg(long, short = 'd', env = "QUILL_DIR", default_value = "./quill-data", global = true)]
    pub dir: PathBuf,

    /// Log output format.
    #[arg(long, value_enum, env = "QUILL_LOG_FORMAT", default_value = "pretty", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a new log and its signing key.
    Init(InitArgs),
    /// Append one block per value.
    Append(AppendArgs),
    /// Print one block.
    Get(GetArgs),
    /// Cut the log back to a shorter length.
    Truncate(TruncateArgs),
    /// Print the log's head as JSON.
    Info,
    /// Print version information and exit.
    Version,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Hex-encoded 32-byte Ed25519 seed. A fresh key is generated when omitted.
    #[arg(long, env = "QUILL_SECRET_KEY")]
    pub secret_key: Option<String>,
}

#[derive(Args, Debug)]
pub struct AppendArgs {
    /// Values to append, one block each.
    #[arg(required = true)]
    pub values: Vec<String>,

    /// Treat values as hex instead of UTF-8.
    #[arg(long)]
    pub hex: bool,
}

#[derive(Args, Debug)]
pub struct GetArgs {
    /// Block index.
    pub index: u64,

    /// Print the block hex-encoded.
    #[arg(long)]
    pub hex: bool,
}

#[derive(Args, Debug)]
pub struct TruncateArgs {
    /// New length.
    pub length: u64,

    /// Fork to move to. Defaults to the current fork plus one.
    #[arg(long)]
    pub fork: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        QuillCli::command().debug_assert();
    }

    #[test]
    fn parses_append_with_global_dir() {
        let cli = QuillCli::try_parse_from(["quill", "append", "a", "b", "--dir", "/tmp/log"]).unwrap();
        assert_eq!(cli.dir, PathBuf::from("/tmp/log"));
        match cli.command {
            Commands::Append(args) => {
                assert_eq!(args.values, vec!["a", "b"]);
                assert!(!args.hex);
            }
            other => panic!("expected append, got {other:?}"),
        }
    }

    #[test]
    fn append_needs_a_value() {
        assert!(QuillCli::try_parse_from(["quill", "append"]).is_err());
    }

    #[test]
    fn parses_json_log_format() {
        let cli = QuillCli::try_parse_from(["quill", "--log-format", "json", "info"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Commands::Info));
    }
}
