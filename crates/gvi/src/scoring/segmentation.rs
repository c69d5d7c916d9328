use std::path::{Path, PathBuf};
use std::process::Command;

use image::{imageops, RgbImage};

use crate::error::ScoringError;
use crate::scoring::{image_id_from_path, load_rgb, ScoreResult, ScoringMethod};

/// Cityscapes train id for "vegetation".
pub const VEGETATION_LABEL: u8 = 8;

const QUADRANTS: u32 = 4;

/// Per-pixel class labels, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    pub width: u32,
    pub height: u32,
    pub labels: Vec<u8>,
}

impl LabelMap {
    pub fn new(width: u32, height: u32, labels: Vec<u8>) -> Result<Self, ScoringError> {
        if labels.len() != width as usize * height as usize {
            return Err(ScoringError::Segmentation(format!(
                "label map has {} entries, expected {width}x{height}",
                labels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            labels,
        })
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.labels[y as usize * self.width as usize + x as usize]
    }
}

/// Semantic segmentation collaborator: one label per input pixel.
pub trait Segmenter: Send + Sync {
    fn segment(&self, image: &RgbImage) -> Result<LabelMap, ScoringError>;
}

/// Share of vegetation pixels in a semantically segmented panorama.
///
/// The bottom fifth of the image (capture vehicle, road surface) is cut off
/// before segmentation. The label map is then split into four equal-width
/// vertical quadrants, each restricted to rows `[H/4, H)`. The overall score
/// weighs every counted pixel equally, see [`weighted_score`].
pub struct SegmentationScorer {
    segmenter: Box<dyn Segmenter>,
}

/// Overall and per-quadrant vegetation percentages of one image.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadrantScores {
    pub score: f64,
    pub regions: Vec<f64>,
}

impl SegmentationScorer {
    pub fn new(segmenter: impl Segmenter + 'static) -> Self {
        Self {
            segmenter: Box::new(segmenter),
        }
    }

    pub fn score_rgb(&self, image: &RgbImage) -> Result<QuadrantScores, ScoringError> {
        let (width, height) = image.dimensions();
        let kept_height = height - height / 5;
        if width == 0 || kept_height == 0 {
            return Err(ScoringError::Segmentation(format!(
                "image {width}x{height} too small to segment"
            )));
        }

        let cropped = imageops::crop_imm(image, 0, 0, width, kept_height).to_image();
        let labels = self.segmenter.segment(&cropped)?;
        if (labels.width, labels.height) != (width, kept_height) {
            return Err(ScoringError::Segmentation(format!(
                "segmenter returned {}x{} labels for a {width}x{kept_height} image",
                labels.width, labels.height
            )));
        }

        let counts = quadrant_counts(&labels);
        let score = weighted_score(&counts).ok_or_else(|| {
            ScoringError::Segmentation(format!(
                "no pixels to count in {}x{} label map",
                labels.width, labels.height
            ))
        })?;
        Ok(QuadrantScores {
            score,
            regions: counts.iter().map(RegionCount::percent).collect(),
        })
    }
}

impl ScoringMethod for SegmentationScorer {
    fn name(&self) -> &'static str {
        "segmentation"
    }

    fn evaluate(&self, image_path: &Path) -> Result<ScoreResult, ScoringError> {
        let image = load_rgb(image_path)?;
        let QuadrantScores { score, regions } = self.score_rgb(&image)?;
        tracing::debug!(path = %image_path.display(), score, regions = ?regions, "Segmentation score");
        Ok(ScoreResult {
            image_id: image_id_from_path(image_path),
            method: self.name(),
            score,
            regions: Some(regions),
        })
    }
}

/// Vegetation and total pixel counts of one image region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionCount {
    pub vegetation: u64,
    pub total: u64,
}

impl RegionCount {
    /// Vegetation percentage; an empty region scores 0.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.vegetation as f64 / self.total as f64
        }
    }
}

/// Counts vegetation in four quadrants of width `W/4` (leftover columns on the
/// right are dropped), over rows `[H/4, H)`.
pub fn quadrant_counts(labels: &LabelMap) -> [RegionCount; QUADRANTS as usize] {
    let (width, height) = (labels.width, labels.height);
    let quadrant_width = width / QUADRANTS;
    let first_row = height / 4;

    let mut counts = [RegionCount::default(); QUADRANTS as usize];
    for (q, count) in (0..QUADRANTS).zip(counts.iter_mut()) {
        let x0 = q * quadrant_width;
        let x1 = x0 + quadrant_width;
        for y in first_row..height {
            for x in x0..x1 {
                if labels.get(x, y) == VEGETATION_LABEL {
                    count.vegetation += 1;
                }
            }
        }
        count.total = u64::from(quadrant_width) * u64::from(height - first_row);
    }
    counts
}

/// Σvegetation / Σtotal × 100 over all regions. Not the mean of the region
/// percentages when region sizes differ. `None` if nothing was counted.
pub fn weighted_score(regions: &[RegionCount]) -> Option<f64> {
    let (vegetation, total) = regions
        .iter()
        .fold((0u64, 0u64), |(v, t), r| (v + r.vegetation, t + r.total));
    (total > 0).then(|| 100.0 * vegetation as f64 / total as f64)
}

/// Runs an external segmentation program:
/// `program [args...] <input.png> <labels.png>`.
///
/// The program must write an 8-bit single-channel PNG of the same size as the
/// input, one class id per pixel.
#[derive(Debug, Clone)]
pub struct CommandSegmenter {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSegmenter {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Segmenter for CommandSegmenter {
    fn segment(&self, image: &RgbImage) -> Result<LabelMap, ScoringError> {
        let fail = |what: &str, e: &dyn std::fmt::Display| {
            ScoringError::Segmentation(format!("{what} ({}): {e}", self.program.display()))
        };

        let scratch = tempfile::tempdir().map_err(|e| fail("creating scratch dir", &e))?;
        let input = scratch.path().join("input.png");
        let output = scratch.path().join("labels.png");
        image
            .save_with_format(&input, image::ImageFormat::Png)
            .map_err(|e| fail("writing segmenter input", &e))?;

        let out = Command::new(&self.program)
            .args(&self.args)
            .arg(&input)
            .arg(&output)
            .output()
            .map_err(|e| fail("launching segmenter", &e))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(fail(
                "segmenter exited unsuccessfully",
                &format!("{}: {}", out.status, stderr.trim()),
            ));
        }

        let labels = image::open(&output)
            .map_err(|e| fail("reading segmenter output", &e))?
            .to_luma8();
        let (width, height) = labels.dimensions();
        LabelMap::new(width, height, labels.into_raw())
    }
}
