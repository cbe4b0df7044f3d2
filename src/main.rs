use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use relayd::bootstrap::Server;
use relayd::config::Config;
use relayd::telemetry::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(name = "relayd")]
#[command(author, version, about = "Multi-threaded L4 reverse proxy")]
struct Args {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Validate config and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;

    init_tracing(&TracingConfig {
        log_level: config.telemetry.log_level.clone(),
        json_logs: config.telemetry.json_logs,
    })?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        listeners = config.listeners.len(),
        "starting relayd"
    );

    if args.validate {
        info!("configuration is valid");
        return Ok(());
    }

    let server = Server::new(config)?;
    server.run().await?;

    Ok(())
}
