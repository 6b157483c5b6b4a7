use std::sync::Arc;

use clap::Parser;

use stagehand::{config::Config, logging::FileLogger, orchestration::DeploymentRuntime};

/// Deployment runtime: turns a manifest of artifact bundles into a live
/// service graph.
#[derive(Parser)]
#[command(name = "stagehand", version)]
struct Args {
    /// Path to the deployment manifest
    #[arg(short, long, default_value = "stagehand.yaml")]
    conf: String,
}

#[tokio::main]
async fn main() {
    // Read command-line arguments
    let args = Args::parse();

    // Load configuration
    let config = Config::load_from_yaml(&args.conf).expect("Failed to load configuration");

    // Initialize logging, through the async file writer when configured
    let log_handle = match config.log.clone() {
        Some(log_config) => Some(FileLogger::new(log_config).start()),
        None => {
            env_logger::init();
            None
        }
    };

    // Deploy the manifest
    log::info!("Deploying manifest...");
    let runtime = Arc::new(DeploymentRuntime::new());
    match runtime.deploy_manifest(&config).await {
        Ok(report) if report.all_up() => {
            log::info!("All {} services are up", report.started.len())
        }
        Ok(report) => log::warn!(
            "Deployed with {} failed and {} quarantined services",
            report.failed.len(),
            report.missing.len()
        ),
        Err(err) => {
            log::error!("Deployment failed: {err}");
            std::process::exit(1);
        }
    }

    // Run until interrupted
    log::info!("Running. Press Ctrl-C to shut down.");
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");

    log::info!("Shutting down...");
    runtime.shutdown().await;

    if let Some(handle) = log_handle {
        handle.shutdown().await;
    }
}
