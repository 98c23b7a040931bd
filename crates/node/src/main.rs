use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use advtrain_node::config::{self, Device, NodeConfig};
use advtrain_node::worker::NodeContext;

fn parse_device(s: &str) -> Result<Device, String> {
    s.parse()
}

#[derive(Debug, Parser)]
#[command(name = "advtrain-node", version, about = "Worker node for distributed adversarial training")]
struct Cli {
    /// Execution server address (`host[:port]`).
    #[arg(default_value = "127.0.0.1:8080", value_parser = config::parse_host)]
    host: String,

    /// Device to run perturbation on (`cuda[:N]`, `mps`, `cpu`, `tpu`, `xpu`).
    #[arg(default_value = "cpu", value_parser = parse_device)]
    device: Device,

    /// JSON config file with `host` and `device`, instead of arguments.
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Give up after this many transport retries (default: retry forever).
    #[arg(long, env = "ADVTRAIN_MAX_RETRIES")]
    max_retries: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let (host, device) = match &cli.config {
        Some(path) => {
            let config = NodeConfig::load(path)?;
            (config.host, config.device)
        }
        None => (cli.host, cli.device),
    };

    tracing::info!(%host, %device, "worker node starting");
    let mut node = NodeContext::connect(&host, device, cli.max_retries)?;

    tokio::select! {
        res = node.run() => res?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown requested"),
    }
    Ok(())
}
