use std::path::Path;

use image::RgbImage;

use crate::error::ScoringError;
use crate::scoring::{image_id_from_path, load_rgb, ScoreResult, ScoringMethod};

const OTSU_BINS: usize = 256;

/// Excess-green index thresholded with Otsu's method.
///
/// Every pixel gets `exg = 2g - r - b` on RGB normalised to [0, 1]; the score
/// is the share of pixels above the Otsu threshold of the `exg` histogram.
#[derive(Debug, Clone, Copy, Default)]
pub struct PixelThresholdScorer;

impl PixelThresholdScorer {
    pub fn new() -> Self {
        Self
    }

    pub fn score_rgb(&self, image: &RgbImage) -> f64 {
        let exg = excess_green(image);
        if exg.is_empty() {
            return 0.0;
        }
        let threshold = otsu_threshold(&exg).unwrap_or(0.0);
        let green = exg.iter().filter(|&&v| v > threshold).count();
        100.0 * green as f64 / exg.len() as f64
    }
}

impl ScoringMethod for PixelThresholdScorer {
    fn name(&self) -> &'static str {
        "pixel-threshold"
    }

    fn evaluate(&self, image_path: &Path) -> Result<ScoreResult, ScoringError> {
        let image = load_rgb(image_path)?;
        let score = self.score_rgb(&image);
        tracing::debug!(path = %image_path.display(), score, "Pixel-threshold score");
        Ok(ScoreResult {
            image_id: image_id_from_path(image_path),
            method: self.name(),
            score,
            regions: None,
        })
    }
}

fn excess_green(image: &RgbImage) -> Vec<f64> {
    image
        .pixels()
        .map(|p| {
            let [r, g, b] = p.0.map(|c| f64::from(c) / 255.0);
            2.0 * g - r - b
        })
        .collect()
}

/// Otsu threshold over a 256-bin histogram spanning `[min, max]` of the data.
///
/// Returns the centre of the bin that maximises between-class variance, the
/// first such bin on ties. `None` when every value is identical.
pub fn otsu_threshold(values: &[f64]) -> Option<f64> {
    let (min, max) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if max <= min {
        return None;
    }

    let width = (max - min) / OTSU_BINS as f64;
    let mut hist = [0u64; OTSU_BINS];
    for &v in values.iter().filter(|v| v.is_finite()) {
        // Last edge is inclusive.
        let bin = (((v - min) / width) as usize).min(OTSU_BINS - 1);
        hist[bin] += 1;
    }
    let centers: Vec<f64> = (0..OTSU_BINS)
        .map(|i| min + width * (i as f64 + 0.5))
        .collect();

    // Cumulative weights and means from the low end (class 1) and the high end (class 2).
    let mut weight1 = [0f64; OTSU_BINS];
    let mut mean1 = [0f64; OTSU_BINS];
    let (mut w, mut s) = (0.0, 0.0);
    for i in 0..OTSU_BINS {
        w += hist[i] as f64;
        s += hist[i] as f64 * centers[i];
        weight1[i] = w;
        mean1[i] = if w > 0.0 { s / w } else { 0.0 };
    }

    let mut weight2 = [0f64; OTSU_BINS];
    let mut mean2 = [0f64; OTSU_BINS];
    let (mut w, mut s) = (0.0, 0.0);
    for i in (0..OTSU_BINS).rev() {
        w += hist[i] as f64;
        s += hist[i] as f64 * centers[i];
        weight2[i] = w;
        mean2[i] = if w > 0.0 { s / w } else { 0.0 };
    }

    let mut best = (0usize, f64::NEG_INFINITY);
    for i in 0..OTSU_BINS - 1 {
        let diff = mean1[i] - mean2[i + 1];
        let variance = weight1[i] * weight2[i + 1] * diff * diff;
        if variance > best.1 {
            best = (i, variance);
        }
    }
    Some(centers[best.0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
    const RED: Rgb<u8> = Rgb([255, 0, 0]);

    #[test]
    fn pure_green_and_pure_red() {
        let scorer = PixelThresholdScorer::new();
        assert_eq!(scorer.score_rgb(&RgbImage::from_pixel(8, 8, GREEN)), 100.0);
        assert_eq!(scorer.score_rgb(&RgbImage::from_pixel(8, 8, RED)), 0.0);
    }

    #[test]
    fn half_green_scores_fifty() {
        let image = RgbImage::from_fn(10, 10, |x, _| if x < 5 { GREEN } else { RED });
        assert_eq!(PixelThresholdScorer::new().score_rgb(&image), 50.0);
    }

    #[test]
    fn bimodal_threshold_separates_modes() {
        let mut values = vec![0.1; 300];
        values.extend(std::iter::repeat(0.9).take(100));
        let t = otsu_threshold(&values).unwrap();
        assert!(t > 0.1 && t < 0.9, "threshold {t}");
        assert_eq!(otsu_threshold(&[0.5; 10]), None);
    }

    #[test]
    fn identical_files_score_identically() {
        let dir = tempfile::tempdir().unwrap();
        let image = RgbImage::from_fn(32, 16, |x, y| {
            Rgb([(x * 7 % 256) as u8, ((x + y) * 11 % 256) as u8, (y * 13 % 256) as u8])
        });
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        image.save(&a).unwrap();
        image.save(&b).unwrap();

        let scorer = PixelThresholdScorer::new();
        let first = scorer.evaluate(&a).unwrap();
        let second = scorer.evaluate(&b).unwrap();
        assert_eq!(first.score, second.score);
        assert_eq!(first, scorer.evaluate(&a).unwrap());
        assert!((0.0..=100.0).contains(&first.score));

        assert_eq!((first.image_id.as_str(), first.method), ("a", "pixel-threshold"));
        assert_eq!(second.image_id, "b");
        assert_eq!(first.regions, None);
    }

    #[test]
    fn unreadable_file_is_a_soft_failure() {
        let scorer = PixelThresholdScorer::new();
        assert!(scorer.score(Path::new("/no/such/image.jpg")).is_none());
    }
}
