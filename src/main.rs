//! Main entry point for Cobalt Infer
//!
//! Builds the node pool from configuration, runs the load balancer and
//! statistics loops, and shuts everything down on Ctrl+C.

use cobalt_infer::{
    config::Config,
    init_scheduler,
    utils::{format_bytes, format_duration, init_logging},
    Result, VERSION,
};
use std::time::Instant;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Using default configuration");
        Config::default()
    });

    if let Err(e) = init_logging(&config.logging.level, &config.logging.format) {
        eprintln!("Failed to initialize logging: {}", e);
        return Err(e);
    }

    info!("Starting Cobalt Infer v{}", VERSION);
    info!("  Compute nodes: {}", config.nodes.len());
    for node in &config.nodes {
        info!(
            "    {} on device {}: {}, {} models, {} streams",
            node.node_id,
            node.device_id,
            format_bytes(cobalt_infer::mb_to_bytes(node.memory_limit_mb)),
            node.max_concurrent_models,
            node.num_streams
        );
    }
    info!("  Queue capacity: {}", config.scheduler.queue_capacity);

    let start_time = Instant::now();
    let scheduler = match init_scheduler(&config) {
        Ok(scheduler) => {
            info!(
                "Scheduler initialized in {}",
                format_duration(start_time.elapsed())
            );
            scheduler
        }
        Err(e) => {
            error!("Failed to initialize scheduler: {}", e);
            return Err(e);
        }
    };
    scheduler.start()?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Received shutdown signal, cleaning up...");
    scheduler.shutdown().await;

    match serde_json::to_string_pretty(&scheduler.status_report()) {
        Ok(report) => info!("Final status:\n{}", report),
        Err(e) => warn!("Failed to render final status: {}", e),
    }
    info!("Shutdown complete");
    Ok(())
}
