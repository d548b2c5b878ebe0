//! `gmt-runtime`: boots one node of the cluster and blocks until killed.
//!
//! Precedence for every tunable is CLI flag > `GMT_*` environment variable >
//! `gmt.toml` file > built-in default, expressed as one explicit merge
//! rather than per-call-site overrides.

use clap::Parser;
use gmt_core::{Config, Runtime};

#[derive(Parser)]
#[command(
    name = "gmt-runtime",
    version,
    about = "Boot one node of the GMT global-memory-and-threading runtime"
)]
struct Cli {
    /// Path to a gmt.toml config file; flags and GMT_* env vars still take
    /// precedence over whatever it sets.
    #[arg(long, env = "GMT_CONFIG")]
    config: Option<String>,

    /// This process's index into `--addresses` (spec.md §6 "node_id").
    #[arg(long)]
    node_id: Option<u32>,

    /// Comma-separated `host:port` list, one per node, in rank order.
    #[arg(long, value_delimiter = ',')]
    addresses: Option<Vec<String>>,

    #[arg(long)]
    num_workers: Option<u32>,

    #[arg(long)]
    num_helpers: Option<u32>,

    #[arg(long)]
    num_uthreads_per_worker: Option<u32>,

    #[arg(long)]
    max_nesting: Option<u32>,

    #[arg(long)]
    comm_buffer_size: Option<usize>,

    #[arg(long)]
    cmd_block_size: Option<usize>,

    #[arg(long)]
    max_handles_per_node: Option<u32>,
}

fn main() {
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path).unwrap_or_else(|e| {
                eprintln!("gmt-runtime: failed to read {path}: {e}");
                std::process::exit(1);
            });
            Config::from_toml_str(&raw).unwrap_or_else(|e| {
                eprintln!("gmt-runtime: invalid config file {path}: {e}");
                std::process::exit(1);
            })
        }
        None => Config::default(),
    }
    .merge_env();

    if let Some(v) = cli.node_id {
        cfg.node_id = v;
    }
    if let Some(v) = cli.addresses {
        cfg.addresses = v;
    }
    if let Some(v) = cli.num_workers {
        cfg.num_workers = v;
    }
    if let Some(v) = cli.num_helpers {
        cfg.num_helpers = v;
    }
    if let Some(v) = cli.num_uthreads_per_worker {
        cfg.num_uthreads_per_worker = v;
    }
    if let Some(v) = cli.max_nesting {
        cfg.max_nesting = v;
    }
    if let Some(v) = cli.comm_buffer_size {
        cfg.comm_buffer_size = v;
    }
    if let Some(v) = cli.cmd_block_size {
        cfg.cmd_block_size = v;
    }
    if let Some(v) = cli.max_handles_per_node {
        cfg.max_handles_per_node = v;
    }

    let node_id = cfg.node_id;
    let _runtime = Runtime::start(cfg).unwrap_or_else(|e| {
        eprintln!("gmt-runtime: node {node_id} failed to start: {e}");
        std::process::exit(1);
    });

    tracing::info!(node_id, "node up, serving forever");
    // A node has no natural end of life short of a signal; park this thread
    // and let the worker/helper/comm threads do the actual work. `_runtime`
    // stays alive in this frame so its threads aren't torn down by `Drop`.
    loop {
        std::thread::park();
    }
}
