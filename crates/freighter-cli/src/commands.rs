//! Command implementations

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use freighter_core::pipeline::Pipeline;
use freighter_core::ratelimit::RateLimiterRegistry;
use freighter_core::{request, storage};

use crate::config::FileConfig;
use crate::error::{CliError, Result};

/// `freighter run`: execute the transport described by a config file.
pub async fn run(config_path: &Path, workers: Option<usize>, dry_run: bool) -> Result<()> {
    let config = FileConfig::load(config_path)?;

    if dry_run {
        return flatten_only(&config);
    }

    let mut storages = Vec::with_capacity(config.storage.len());
    for conn in &config.storage {
        storages.push(storage::connect(conn).await?);
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let mut pipeline = Pipeline::new(config.url.clone(), config.rate_limit)
        .with_cancellation(cancel);

    for request in config.requests {
        pipeline = pipeline.with_request(request);
    }
    for storage in storages {
        pipeline = pipeline.with_storage(storage);
    }
    if let Some(workers) = workers.or(config.workers) {
        pipeline = pipeline.with_workers(workers);
    }

    pipeline.run().await?;
    info!("transport complete");
    Ok(())
}

/// `freighter validate`: load and validate without running.
pub fn validate(config_path: &Path) -> Result<()> {
    let config = FileConfig::load(config_path)?;
    println!(
        "{}: ok ({} requests, {} backends)",
        config_path.display(),
        config.requests.len(),
        config.storage.len()
    );
    Ok(())
}

/// Flatten the configured requests and print the resulting jobs.
fn flatten_only(config: &FileConfig) -> Result<()> {
    let registry = RateLimiterRegistry::new(&config.rate_limit)
        .map_err(|err| CliError::ConfigInvalid(err.to_string()))?;

    let jobs = request::flatten_requests(&config.url, &config.requests, &registry)
        .map_err(|err| CliError::ConfigInvalid(err.to_string()))?;

    for job in &jobs {
        println!("{} {} -> {}", job.method, job.url, job.table);
    }
    println!("{} jobs", jobs.len());
    Ok(())
}

/// Cancel the run on ctrl-c so every backend rolls back cleanly.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling run");
            cancel.cancel();
        }
    });
}
