//! GVI: street-level Green View Index estimation.
//!
//! - Assigns every input point the nearest unclaimed panorama within a distance
//!   bound, from a local geotagged directory or a remote image-search API.
//! - Scores each assigned image for visible vegetation (ExG + Otsu, or an
//!   external semantic segmenter).
//! - Aggregates per-point scores onto H3 cells.
//!
//! Per-point failures are data (`AssignmentResult::error`, `PointScore::error`);
//! only [`error::ConfigError`] aborts a run, and it does so before any point is
//! processed.

pub mod engine;
pub mod error;
pub mod features;
pub mod geo;
pub mod hex;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod scoring;
pub mod source;
pub mod types;

pub use engine::{AssignmentEngine, EngineConfig};
pub use error::{ConfigError, PointError, ScoringError};
pub use geo::LatLon;
pub use hex::{aggregate, HexCell};
pub use metrics::PipelineMetrics;
pub use registry::AssignmentRegistry;
pub use retry::{Backoff, RetryPolicy};
pub use scoring::{
    score_batch, PixelThresholdScorer, PointScore, ScoreJob, ScoreResult, ScoringMethod,
    SegmentationScorer,
};
pub use source::{
    local::{LocalImageSource, LocalSourceConfig},
    remote::{RemoteImageSource, RemoteSourceConfig},
    ImageSource,
};
pub use types::{AssignmentResult, ImageRecord, SpatialPoint};
