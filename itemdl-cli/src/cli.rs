use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "itemdl",
    version,
    about = "Download multi-part media items with bounded concurrency"
)]
pub struct Args {
    /// JSON configuration file
    #[arg(short, long, global = true, env = "ITEMDL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding queue state between runs
    #[arg(long, global = true, env = "ITEMDL_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Maximum parts transferring at once
    #[arg(long, global = true)]
    pub max_concurrent: Option<usize>,

    /// Watch loop period in milliseconds
    #[arg(long, global = true)]
    pub poll_interval_ms: Option<u64>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queue the items of a manifest and download until the queue drains
    Run {
        /// JSON manifest listing the items to download
        manifest: PathBuf,
    },
    /// Restore saved items, restart their paused and failed parts, and download
    Resume,
    /// List saved items
    List {
        /// Print items as JSON
        #[arg(long)]
        json: bool,
    },
    /// Cancel a saved item
    Cancel {
        item_id: String,

        /// Also delete downloaded files
        #[arg(long)]
        delete_files: bool,
    },
}
