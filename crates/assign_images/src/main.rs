mod config;

use crate::config::{Config, SourceKind};
use anyhow::Context;
use clap::Parser;
use gvi::features::PointLayer;
use gvi::{
    AssignmentEngine, AssignmentRegistry, Backoff, EngineConfig, ImageSource, LocalImageSource,
    LocalSourceConfig, PipelineMetrics, RemoteImageSource, RemoteSourceConfig, RetryPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROGRESS_EVERY: usize = 100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Initialization ---
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
    let config = Config::parse();
    tracing::info!(config = ?config, "assign_images starting with configuration");

    let metrics = Arc::new(PipelineMetrics::new());

    // --- 2. Optional metrics server ---
    if let Some(addr) = config.metrics_listen_addr {
        let router = metrics.router();
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!(addr = %addr, error = %e, "Failed to bind metrics listener");
                    return;
                }
            };
            tracing::info!(addr = %addr, "Metrics server started");
            if let Err(e) = axum::serve(listener, router.into_make_service()).await {
                tracing::error!(error = %e, "Metrics server exited with an error");
            }
        });
    }

    // --- 3. Inputs and image source ---
    let mut layer = PointLayer::read(&config.input)
        .with_context(|| format!("Failed to load points from '{}'", config.input.display()))?;

    let registry = Arc::new(AssignmentRegistry::new());
    let source = build_source(&config, registry).await?;

    // --- 4. Assignment run, cancellable as a whole ---
    let engine = AssignmentEngine::new(
        EngineConfig {
            concurrency: config.concurrency,
            progress_every: PROGRESS_EVERY,
        },
        metrics.clone(),
    );

    let results = tokio::select! {
        results = engine.run(layer.points(), source) => results,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Shutdown signal received; abandoning assignment run");
            anyhow::bail!("assignment run cancelled");
        }
    };

    // --- 5. Output ---
    layer.apply_assignments(&results);
    layer
        .write(&config.output)
        .with_context(|| format!("Failed to write '{}'", config.output.display()))?;

    tracing::info!(output = %config.output.display(), "assign_images finished");
    Ok(())
}

async fn build_source(
    config: &Config,
    registry: Arc<AssignmentRegistry>,
) -> anyhow::Result<Arc<dyn ImageSource>> {
    match config.source {
        SourceKind::Local => {
            let local = LocalSourceConfig {
                images_dir: config.images_dir.clone(),
                max_distance_m: config.max_distance_m,
            };
            // EXIF indexing is blocking, rayon-parallel work.
            let source = tokio::task::spawn_blocking(move || LocalImageSource::scan(&local, registry))
                .await
                .context("Local image indexing task failed")?
                .context("Failed to index local images")?;
            Ok(Arc::new(source))
        }
        SourceKind::Remote => {
            let token = config
                .access_token
                .as_ref()
                .map(|t| t.0.clone())
                .unwrap_or_default();
            let remote = RemoteSourceConfig {
                base_url: config.api_base_url.clone(),
                access_token: token,
                images_dir: config.images_dir.clone(),
                max_distance_m: config.max_distance_m,
                request_timeout: Duration::from_secs(config.request_timeout_secs),
                retry: RetryPolicy::new(
                    config.max_attempts,
                    Backoff::exponential(Duration::from_millis(250), Duration::from_secs(5)),
                ),
            };
            let client = RemoteImageSource::http_client(CONNECT_TIMEOUT)?;
            let source = RemoteImageSource::new(remote, client, registry)
                .context("Failed to set up remote image source")?;
            Ok(Arc::new(source))
        }
    }
}
