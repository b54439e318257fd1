mod workload;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use corobus_core::BusConfig;
use tokio::task::LocalSet;

use crate::workload::Workload;

/// Corobus demo options
#[derive(Parser)]
struct Opts {
    /// Channel capacity, 0 for a rendezvous channel
    #[arg(short, long, default_value = "4")]
    capacity: usize,

    /// Number of producer tasks
    #[arg(short, long, default_value = "3")]
    producers: u32,

    /// Number of consumer tasks
    #[arg(long, default_value = "2")]
    consumers: u32,

    /// Messages sent by each producer
    #[arg(short, long, default_value = "1000")]
    messages: u32,

    /// Send in batches of this size instead of one value at a time
    #[arg(short, long)]
    batch: Option<usize>,

    /// JSON file with bus settings
    #[arg(long)]
    config: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<BusConfig> {
    let Some(path) = path else {
        return Ok(BusConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    BusConfig::from_json_str(&json).with_context(|| format!("Invalid config {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opts = Opts::parse();
    let config = load_config(opts.config.as_ref())?;

    let workload = Workload {
        capacity: opts.capacity,
        producers: opts.producers,
        consumers: opts.consumers,
        messages: opts.messages,
        batch: opts.batch,
    };
    log::info!(
        "Running {} producers and {} consumers over a channel of capacity {}",
        workload.producers,
        workload.consumers,
        workload.capacity
    );

    // All tasks share one thread, which is what the bus expects.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;
    let summary = LocalSet::new().block_on(&runtime, workload.run(config))?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if !summary.in_order {
        anyhow::bail!("Values from one producer arrived out of order");
    }
    Ok(())
}
