//! Pipeline Runtime
//!
//! Consumes machine telemetry from the configured topic, stores it in the
//! chunked store and keeps the rollups and retention running until CTRL+C.
//!
//! Usage:
//!   cargo run --release --bin pipeline_runtime
//!
//! Environment variables: see `PipelineConfig::from_env`.

use cncflow::pipeline::{PipelineConfig, PipelineCoordinator, SystemClock};
use dotenv::dotenv;
use log::{error, info};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 cncflow pipeline runtime");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let config = PipelineConfig::from_env()?;
    info!("✅ Configuration loaded");
    info!("   ├─ Queue: {} (topic {})", config.queue_path.display(), config.topic);
    info!("   ├─ Consumer group: {} (start {})", config.consumer_group, config.start_position);
    info!("   ├─ Store: {}", config.store_path.display());
    info!("   └─ Batch size: {}", config.batch_size);

    let coordinator = match PipelineCoordinator::open(config, Arc::new(SystemClock)) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!("❌ {}", e);
            return Err(e.into());
        }
    };
    let mut handle = coordinator.start()?;

    info!("🔄 Press CTRL+C to shutdown gracefully");

    let fatal = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    info!("");
                    info!("⚠️  Received CTRL+C, shutting down...");
                }
                Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
            }
            None
        }
        e = handle.fatal_error() => {
            error!("❌ Fatal pipeline error: {}", e);
            Some(e)
        }
    };

    let snapshot = handle.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    match fatal {
        Some(e) => Err(e.into()),
        None => {
            info!("✅ Pipeline runtime stopped");
            Ok(())
        }
    }
}
