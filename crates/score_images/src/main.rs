mod config;

use crate::config::{Config, Method};
use anyhow::{Context, Result};
use clap::Parser;
use gvi::features::PointLayer;
use gvi::scoring::CommandSegmenter;
use gvi::{score_batch, PipelineMetrics, PixelThresholdScorer, ScoringMethod, SegmentationScorer};
use std::time::Instant;
use tracing_subscriber::{fmt, EnvFilter};

fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
    let config = Config::parse();
    tracing::info!(config = ?config, "score_images starting with configuration");

    if let Some(threads) = config.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("Failed to configure scoring thread pool")?;
    }

    let method: Box<dyn ScoringMethod> = match config.method {
        Method::PixelThreshold => Box::new(PixelThresholdScorer::new()),
        Method::Segmentation => {
            let program = config
                .segmenter_program
                .clone()
                .context("--segmenter-program is required for segmentation scoring")?;
            Box::new(SegmentationScorer::new(CommandSegmenter::new(
                program,
                config.segmenter_args.clone(),
            )))
        }
    };

    let mut layer = PointLayer::read(&config.input)
        .with_context(|| format!("Failed to load points from '{}'", config.input.display()))?;

    let started = Instant::now();
    let metrics = PipelineMetrics::new();
    let scores = score_batch(method.as_ref(), &layer.score_jobs(), &metrics);
    tracing::info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        scored = scores.iter().filter(|s| s.score.is_some()).count(),
        failed = scores.iter().filter(|s| s.error.is_some()).count(),
        "Scoring pass complete"
    );

    layer.apply_scores(&scores);
    layer
        .write(&config.output)
        .with_context(|| format!("Failed to write '{}'", config.output.display()))?;

    tracing::info!(output = %config.output.display(), "score_images finished");
    Ok(())
}
