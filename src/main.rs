//! Worker binary: runs the supervisor loop until interrupted.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use skrapp::config::{init_tracing, Config};
use skrapp::store::Store;
use skrapp::worker::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "skrapp-worker", about = "Documentation-site crawler worker")]
struct Args {
    /// Path to the TOML config file; defaults plus env overrides when absent
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    init_tracing(&config.logging);

    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.output_dir)?;
    let store = Arc::new(Store::open(&config.data_dir.join("skrapp.db"))?);

    let supervisor = Supervisor::new(store, Arc::new(config));
    let shutdown = Arc::new(AtomicBool::new(false));

    let signal_flag = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_flag.store(true, Ordering::Relaxed);
        }
    });

    supervisor.run(shutdown).await;
    Ok(())
}
