use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::constants::{RETENTION_1_MONTH, RETENTION_1_WEEK, RETENTION_3_DAYS, RETENTION_UNLIMITED};

#[derive(Parser, Debug)]
#[command(name = "shadow-stream")]
#[command(version)]
#[command(about = "Stream remote chat media to a local player through a caching HTTP gateway", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "SHADOW_STREAM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Gateway port (0 picks a free one)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory holding `<chat_id>/<message_id>.<ext>` media
    #[arg(long)]
    pub media_root: Option<PathBuf>,

    /// Cache directory
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the gateway until Ctrl-C (default)
    Serve,
    /// Print a stream URL for one message, then serve until Ctrl-C
    Url {
        #[arg(allow_negative_numbers = true)]
        chat_id: i64,
        message_id: i64,
    },
    /// Inspect or manage the local cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Initialize configuration
    Init,
    /// Show configuration, cache and gateway status
    Status,
    /// Show version information
    Version,
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Show usage statistics
    Stats,
    /// Apply the eviction policy now
    Cleanup,
    /// Delete every cached file
    Clear,
    /// Show which size limits fit on this disk
    Limits,
    /// Change cache settings and save them to the config file
    Set {
        /// Size limit in GB
        #[arg(long)]
        limit_gb: Option<u64>,
        /// How long unused files are kept
        #[arg(long, value_enum)]
        retention: Option<RetentionPreset>,
        /// Evict automatically when files are added
        #[arg(long)]
        auto_cleanup: Option<bool>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RetentionPreset {
    #[value(name = "3d")]
    ThreeDays,
    #[value(name = "1w")]
    OneWeek,
    #[value(name = "1m")]
    OneMonth,
    Unlimited,
}

impl RetentionPreset {
    pub fn seconds(self) -> i64 {
        match self {
            RetentionPreset::ThreeDays => RETENTION_3_DAYS,
            RetentionPreset::OneWeek => RETENTION_1_WEEK,
            RetentionPreset::OneMonth => RETENTION_1_MONTH,
            RetentionPreset::Unlimited => RETENTION_UNLIMITED,
        }
    }
}
