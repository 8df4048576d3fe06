//! CLI argument definitions

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "perfpipe",
    version,
    about = "Merge, process and stream capture events to a collector",
    after_help = "\
EXAMPLES:
    perfpipe collect --captures 3 --duration 5         Run a collector for three 5s captures
    perfpipe produce                                   Stream synthetic samples to the default collector
    perfpipe produce --address 127.0.0.1:9000 -o 8     Eight origins over TCP
    perfpipe produce --config perfpipe.json            Settings from a JSON file"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Produce synthetic capture events and stream them to a collector
    Produce(ProduceArgs),

    /// Accept producers and drive capture cycles
    Collect(CollectArgs),
}

#[derive(ClapArgs)]
pub struct ProduceArgs {
    /// JSON config file (flags below override it)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Collector address (`unix:/path` or `host:port`)
    #[arg(short, long)]
    pub address: Option<String>,

    /// Delay between connection attempts in milliseconds
    #[arg(long, value_name = "MS")]
    pub reconnect_delay_ms: Option<u64>,

    /// Minimum number of serialization workers
    #[arg(long)]
    pub min_workers: Option<usize>,

    /// Maximum number of serialization workers
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Idle time before surplus workers retire, in milliseconds
    #[arg(long, value_name = "MS")]
    pub idle_ttl_ms: Option<u64>,

    /// Number of ordered event origins to simulate
    #[arg(short, long, default_value = "4")]
    pub origins: usize,

    /// Maximum events per origin per 10ms tick
    #[arg(long, default_value = "64")]
    pub events_per_tick: usize,

    /// Seed for the synthetic source
    #[arg(long, default_value = "1")]
    pub seed: u64,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,
}

#[derive(ClapArgs)]
pub struct CollectArgs {
    /// Address to listen on (`unix:/path` or `host:port`)
    #[arg(short, long, default_value = perfpipe_common::DEFAULT_PRODUCER_SIDE_ADDRESS)]
    pub listen: String,

    /// Number of producers to wait for before the first capture
    #[arg(long, default_value = "1")]
    pub producers: u64,

    /// Length of each capture in seconds
    #[arg(long, default_value = "5")]
    pub duration: u64,

    /// Number of captures to run
    #[arg(long, default_value = "1")]
    pub captures: u64,

    /// Seconds to wait for producers to connect and to flush
    #[arg(long, default_value = "30")]
    pub timeout: u64,
}
