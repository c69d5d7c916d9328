//! Vegetation scoring strategies.
//!
//! A [`ScoringMethod`] turns one image into a 0–100 score. Failures are soft:
//! [`ScoringMethod::score`] logs and returns `None`, and [`score_batch`] turns
//! a failing or panicking image into an empty score for that point only.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

use image::RgbImage;
use rayon::prelude::*;

use crate::error::{panic_message, ScoringError};
use crate::metrics::PipelineMetrics;

pub mod pixel;
pub mod segmentation;

pub use pixel::PixelThresholdScorer;
pub use segmentation::{CommandSegmenter, LabelMap, SegmentationScorer, Segmenter};

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreResult {
    pub image_id: String,
    /// Name of the [`ScoringMethod`] that produced the score.
    pub method: &'static str,
    /// Percentage of vegetation pixels, 0–100.
    pub score: f64,
    /// Per-region scores, for methods that split the image.
    pub regions: Option<Vec<f64>>,
}

pub trait ScoringMethod: Send + Sync {
    /// Stable name written next to the score.
    fn name(&self) -> &'static str;

    fn evaluate(&self, image_path: &Path) -> Result<ScoreResult, ScoringError>;

    fn score(&self, image_path: &Path) -> Option<ScoreResult> {
        match self.evaluate(image_path) {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!(method = self.name(), path = %image_path.display(), error = %e, "Scoring failed");
                None
            }
        }
    }
}

/// One image to score. Points whose assignment produced no file carry `None`.
#[derive(Debug, Clone)]
pub struct ScoreJob {
    pub point_id: usize,
    /// Id assigned to the image; when absent the file stem is used.
    pub image_id: Option<String>,
    pub image_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointScore {
    pub point_id: usize,
    pub score: Option<ScoreResult>,
    pub error: Option<String>,
}

/// Scores every job on the rayon pool. Output has one entry per job, in order.
pub fn score_batch(
    method: &dyn ScoringMethod,
    jobs: &[ScoreJob],
    metrics: &PipelineMetrics,
) -> Vec<PointScore> {
    tracing::info!(method = method.name(), images = jobs.len(), "Scoring images");

    let scores: Vec<PointScore> = jobs
        .par_iter()
        .map(|job| {
            let Some(path) = job.image_path.as_deref() else {
                return PointScore {
                    point_id: job.point_id,
                    score: None,
                    error: None,
                };
            };

            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| method.evaluate(path)))
                .unwrap_or_else(|payload| Err(ScoringError::Panicked(panic_message(&*payload))));
            metrics.record_score(method.name(), outcome.is_ok());

            match outcome {
                Ok(mut result) => {
                    if let Some(id) = &job.image_id {
                        result.image_id.clone_from(id);
                    }
                    PointScore {
                        point_id: job.point_id,
                        score: Some(result),
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::warn!(point_id = job.point_id, path = %path.display(), error = %e, "Scoring failed");
                    PointScore {
                        point_id: job.point_id,
                        score: None,
                        error: Some(format!("ScoringError: {e}")),
                    }
                }
            }
        })
        .collect();

    let scored = scores.iter().filter(|s| s.score.is_some()).count();
    tracing::info!(method = method.name(), scored, total = scores.len(), "Scoring finished");
    scores
}

/// File stem of an image path, the id of an image scored on its own.
pub(crate) fn image_id_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Decodes any supported format into 8-bit RGB, sniffing the content rather
/// than trusting the extension.
pub(crate) fn load_rgb(path: &Path) -> Result<RgbImage, ScoringError> {
    let decode_err = |source: image::ImageError| ScoringError::Decode {
        path: path.to_path_buf(),
        source,
    };
    let image = image::ImageReader::open(path)
        .map_err(|e| decode_err(image::ImageError::IoError(e)))?
        .with_guessed_format()
        .map_err(|e| decode_err(image::ImageError::IoError(e)))?
        .decode()
        .map_err(decode_err)?;

    let rgb = image.to_rgb8();
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(ScoringError::EmptyImage(path.to_path_buf()));
    }
    Ok(rgb)
}
