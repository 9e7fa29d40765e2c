use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Admin CLI for a RowQuiver data file. `--path` is the base name:
/// `<path>.data`, `<path>.backup` and `<path>.lck` live next to each other.
#[derive(Parser, Debug)]
#[command(name = "rowquiver", version, about = "RowQuiver data file CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as Parser>::parse()
    }
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Create a new data file (settings not given here come from RQ_* env)
    Init {
        #[arg(long)]
        path: PathBuf,
        /// Scale unit: 1 or a power of two in 8..=1024
        #[arg(long)]
        scale: Option<u32>,
        /// Use the simple free-list allocator instead of file blocks
        #[arg(long, default_value_t = false)]
        simple: bool,
        /// Compressed full backup at checkpoints instead of the shadow log
        #[arg(long, default_value_t = false)]
        full_backup: bool,
        /// File block size of the blocks allocator, MiB
        #[arg(long)]
        block_mb: Option<u32>,
    },
    /// Store a value as a new row and print its position
    Put {
        #[arg(long)]
        path: PathBuf,
        /// Literal (UTF-8), `hex:..`, `@file` or `-` for stdin. Ignored if --value-file is set.
        #[arg(long)]
        value: Option<String>,
        #[arg(long)]
        value_file: Option<PathBuf>,
        /// Table space id (0 = default)
        #[arg(long, default_value_t = 0)]
        space: u32,
    },
    /// Read the row stored at a position
    Get {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        pos: u64,
        /// Write the raw value into this file
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Header, cache and allocator summary. --json prints one JSON object.
    Status {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Open, checkpoint and close cleanly
    Checkpoint {
        #[arg(long)]
        path: PathBuf,
    },
}
