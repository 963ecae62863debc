//! mqmesh entry point.

mod app;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use mqmesh_core::Config;

#[derive(Debug, Parser)]
#[command(name = "mqmesh", about = "MQTT broker mesh for IoT devices", version)]
struct Args {
    /// Data directory (overrides DATA_DIR).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log)),
        )
        .init();

    let mut config = Config::from_env();
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    app::run(config).await
}
