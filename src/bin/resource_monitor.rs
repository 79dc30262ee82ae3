//! Standalone resource monitor
//!
//! Headless sampler over the runtime's resource monitor: prints CPU,
//! memory, disk IO, and network usage at a fixed interval, as a text
//! table or JSON lines for piping into dashboards.

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arbbot_core::config::RuntimeConfig;
use arbbot_core::resource::ResourceManager;

#[derive(Parser, Debug)]
#[command(name = "arb-resource-monitor", about = "Live resource usage sampler")]
struct Args {
    /// Path to a runtime config TOML (defaults to ARBBOT_CONFIG_PATH).
    #[arg(long)]
    config: Option<String>,

    /// Sampling interval in milliseconds.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Emit JSON lines instead of a text table.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::from_env(),
    };

    let manager = ResourceManager::new(config);
    manager.start();

    if !args.json {
        println!(
            "{:<24} {:>7} {:>7} {:>14} {:>14} {:>14} {:>14}",
            "timestamp", "cpu%", "mem%", "io_read", "io_write", "net_rx", "net_tx"
        );
    }

    let interval = Duration::from_millis(args.interval_ms.max(100));
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        let usage = manager.get_resource_usage();
        if args.json {
            println!("{}", serde_json::to_string(&usage)?);
        } else {
            println!(
                "{:<24} {:>7.2} {:>7.2} {:>14} {:>14} {:>14} {:>14}",
                usage.timestamp,
                usage.cpu_percent,
                usage.memory_percent,
                usage.io_read_bytes,
                usage.io_write_bytes,
                usage.net_recv_bytes,
                usage.net_sent_bytes,
            );
        }
    }

    manager.stop().await;
    Ok(())
}
