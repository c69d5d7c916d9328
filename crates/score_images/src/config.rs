use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Method {
    /// Excess-green index with an Otsu threshold. No model required.
    PixelThreshold,
    /// Semantic segmentation by an external program; vegetation share per quadrant.
    Segmentation,
}

/// `score_images` - score every assigned image for visible vegetation.
///
/// Reads the output of `assign_images` and adds `gvi_score` and `gvi_method`
/// (plus `gvi_regions` for segmentation) to each feature.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// GeoJSON written by `assign_images`.
    #[arg(long, env = "GVI_ASSIGNED_POINTS")]
    pub input: PathBuf,

    #[arg(long, env = "GVI_SCORED_POINTS")]
    pub output: PathBuf,

    #[arg(long, value_enum, default_value_t = Method::PixelThreshold, env = "GVI_SCORING_METHOD")]
    pub method: Method,

    /// Segmentation program, invoked as `program [args...] <input.png> <labels.png>`.
    #[arg(long, env = "GVI_SEGMENTER_PROGRAM", required_if_eq("method", "segmentation"))]
    pub segmenter_program: Option<PathBuf>,

    /// Extra leading argument for the segmentation program. Repeatable.
    #[arg(long = "segmenter-arg", allow_hyphen_values = true)]
    pub segmenter_args: Vec<String>,

    /// Scoring threads; defaults to one per core.
    #[arg(long, env = "GVI_SCORING_THREADS")]
    pub threads: Option<usize>,
}
