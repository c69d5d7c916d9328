use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use exif::{In, Tag, Value};
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::error::ConfigError;
use crate::geo::LatLon;
use crate::registry::AssignmentRegistry;
use crate::source::ImageSource;
use crate::types::{AssignmentResult, ImageOrigin, ImageRecord, SpatialPoint};

#[derive(Debug, Clone)]
pub struct LocalSourceConfig {
    pub images_dir: PathBuf,
    pub max_distance_m: f64,
}

/// Pre-indexed directory of geotagged JPEGs.
///
/// The index is built once from EXIF GPS tags; lookups are a linear scan over
/// the records, which is fine for the thousands of images a survey produces.
pub struct LocalImageSource {
    records: Vec<ImageRecord>,
    max_distance_m: f64,
    registry: Arc<AssignmentRegistry>,
}

impl LocalImageSource {
    /// Walks `images_dir` for `.jpg`/`.jpeg` files and indexes every one that
    /// carries a GPS position. Fails if the directory is missing or nothing
    /// usable is found.
    pub fn scan(
        config: &LocalSourceConfig,
        registry: Arc<AssignmentRegistry>,
    ) -> Result<Self, ConfigError> {
        let root = &config.images_dir;
        if !root.is_dir() {
            return Err(ConfigError::MissingImageDir(root.clone()));
        }

        let mut paths: Vec<PathBuf> = WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| is_jpeg(path))
            .collect();
        // Iteration order is the tie-break order, keep it stable across runs.
        paths.sort();

        tracing::info!(dir = %root.display(), files = paths.len(), "Indexing local images");

        let ids = assign_ids(root, &paths);
        let records: Vec<ImageRecord> = paths
            .par_iter()
            .zip(ids)
            .filter_map(|(path, id)| match read_gps(path) {
                Ok(location) => Some(ImageRecord {
                    id,
                    location,
                    origin: ImageOrigin::Local(
                        std::fs::canonicalize(path).unwrap_or_else(|_| path.clone()),
                    ),
                }),
                Err(reason) => {
                    tracing::warn!(path = %path.display(), reason, "Skipping image without usable GPS");
                    None
                }
            })
            .collect();

        if records.is_empty() {
            return Err(ConfigError::NoUsableImages(root.clone()));
        }

        tracing::info!(images = records.len(), "Local image index ready");
        tracing::debug!(?records, "Images in directory");

        Ok(Self::from_records(records, config.max_distance_m, registry))
    }

    /// Builds a source over an already-indexed set of images.
    pub fn from_records(
        records: Vec<ImageRecord>,
        max_distance_m: f64,
        registry: Arc<AssignmentRegistry>,
    ) -> Self {
        Self {
            records,
            max_distance_m,
            registry,
        }
    }
}

#[async_trait]
impl ImageSource for LocalImageSource {
    fn name(&self) -> &'static str {
        "local"
    }

    fn max_distance_m(&self) -> f64 {
        self.max_distance_m
    }

    async fn find_nearest_unassigned(&self, point: &SpatialPoint) -> AssignmentResult {
        let here = point.location();
        tracing::debug!(point_id = point.id, lat = point.lat, lon = point.lon, "Local lookup");

        let candidates: Vec<(&ImageRecord, f64)> = self
            .records
            .iter()
            .filter(|record| !self.registry.is_claimed(&record.id))
            .map(|record| (record, here.distance_m(&record.location)))
            .filter(|(_, residual)| *residual <= self.max_distance_m)
            .collect();

        match self.registry.claim_nearest(candidates) {
            Some((record, residual)) => {
                tracing::debug!(point_id = point.id, image_id = %record.id, residual, "Closest image");
                let path = match &record.origin {
                    ImageOrigin::Local(path) => Some(path.clone()),
                    ImageOrigin::Remote(_) => None,
                };
                AssignmentResult::assigned(point.id, record, residual, path, None)
            }
            None => {
                tracing::debug!(point_id = point.id, "No unassigned image in range");
                AssignmentResult::not_found(point.id)
            }
        }
    }
}

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
        .unwrap_or(false)
}

/// Relative path without extension, `/`-separated. For files directly in the
/// root this is just the file stem.
fn image_id_for(root: &Path, path: &Path) -> String {
    slash_joined(&path.strip_prefix(root).unwrap_or(path).with_extension(""))
}

fn slash_joined(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// One id per path, see [`image_id_for`]. Paths whose id would be shared
/// (`x.jpg` next to `x.jpeg`) keep their extension instead.
fn assign_ids(root: &Path, paths: &[PathBuf]) -> Vec<String> {
    let stems: Vec<String> = paths.iter().map(|p| image_id_for(root, p)).collect();
    let mut uses: HashMap<&str, usize> = HashMap::new();
    for stem in &stems {
        *uses.entry(stem.as_str()).or_default() += 1;
    }

    paths
        .iter()
        .zip(&stems)
        .map(|(path, stem)| {
            if uses[stem.as_str()] < 2 {
                return stem.clone();
            }
            let id = slash_joined(path.strip_prefix(root).unwrap_or(path));
            tracing::warn!(path = %path.display(), image_id = %id, "Duplicate image id, keeping the extension");
            id
        })
        .collect()
}

/// Reads the EXIF GPS position of a JPEG.
pub fn read_gps(path: &Path) -> Result<LatLon, String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    let mut reader = BufReader::new(file);
    let exif = exif::Reader::new()
        .read_from_container(&mut reader)
        .map_err(|e| e.to_string())?;

    let coordinate = |value_tag: Tag, ref_tag: Tag, negative: u8| -> Result<f64, String> {
        let value = exif
            .get_field(value_tag, In::PRIMARY)
            .ok_or_else(|| format!("missing {value_tag}"))?;
        let degrees = dms_to_degrees(&value.value).ok_or_else(|| format!("malformed {value_tag}"))?;

        let hemisphere = exif
            .get_field(ref_tag, In::PRIMARY)
            .and_then(|f| match &f.value {
                Value::Ascii(parts) => parts.first().and_then(|p| p.first()).copied(),
                _ => None,
            })
            .ok_or_else(|| format!("missing {ref_tag}"))?;

        Ok(if hemisphere.eq_ignore_ascii_case(&negative) {
            -degrees
        } else {
            degrees
        })
    };

    let lat = coordinate(Tag::GPSLatitude, Tag::GPSLatitudeRef, b'S')?;
    let lon = coordinate(Tag::GPSLongitude, Tag::GPSLongitudeRef, b'W')?;
    let location = LatLon::new(lat, lon);
    if !location.is_finite() || lat.abs() > 90.0 || lon.abs() > 180.0 {
        return Err(format!("out-of-range GPS position {lat}, {lon}"));
    }
    Ok(location)
}

/// Degrees, minutes, seconds rationals to decimal degrees.
fn dms_to_degrees(value: &Value) -> Option<f64> {
    match value {
        Value::Rational(parts) if !parts.is_empty() => {
            let mut degrees = 0.0;
            for (part, scale) in parts.iter().zip([1.0, 60.0, 3600.0]) {
                if part.denom == 0 {
                    return None;
                }
                degrees += part.to_f64() / scale;
            }
            Some(degrees)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exif::Rational;

    fn record(id: &str, lat: f64, lon: f64) -> ImageRecord {
        ImageRecord {
            id: id.to_string(),
            location: LatLon::new(lat, lon),
            origin: ImageOrigin::Local(PathBuf::from(format!("/images/{id}.jpg"))),
        }
    }

    #[test]
    fn dms_conversion() {
        let value = Value::Rational(vec![
            Rational::from((47, 1)),
            Rational::from((30, 1)),
            Rational::from((36, 1)),
        ]);
        let degrees = dms_to_degrees(&value).unwrap();
        assert!((degrees - 47.51).abs() < 1e-9);
        assert!(dms_to_degrees(&Value::Rational(vec![Rational::from((1, 0))])).is_none());
    }

    #[test]
    fn ids_are_relative_paths_without_extension() {
        let root = Path::new("/data/images");
        assert_eq!(image_id_for(root, Path::new("/data/images/abc.jpg")), "abc");
        assert_eq!(image_id_for(root, Path::new("/data/images/run1/abc.JPEG")), "run1/abc");
    }

    #[test]
    fn same_stem_with_different_extensions_gets_distinct_ids() {
        let root = Path::new("/data/images");
        let paths: Vec<PathBuf> = ["a.jpg", "run1/x.jpeg", "run1/x.jpg", "x.jpg"]
            .iter()
            .map(|p| root.join(p))
            .collect();

        let ids = assign_ids(root, &paths);

        assert_eq!(ids, vec!["a", "run1/x.jpeg", "run1/x.jpg", "x"]);
    }

    #[test]
    fn scan_rejects_missing_and_empty_dirs() {
        let registry = Arc::new(AssignmentRegistry::new());
        let missing = LocalSourceConfig {
            images_dir: PathBuf::from("/definitely/not/here"),
            max_distance_m: 10.0,
        };
        assert!(matches!(
            LocalImageSource::scan(&missing, registry.clone()),
            Err(ConfigError::MissingImageDir(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"not an image").unwrap();
        std::fs::write(dir.path().join("broken.jpg"), b"not a jpeg either").unwrap();
        let empty = LocalSourceConfig {
            images_dir: dir.path().to_path_buf(),
            max_distance_m: 10.0,
        };
        assert!(matches!(
            LocalImageSource::scan(&empty, registry),
            Err(ConfigError::NoUsableImages(_))
        ));
    }

    #[tokio::test]
    async fn picks_closest_unclaimed_within_bound() {
        let registry = Arc::new(AssignmentRegistry::new());
        // ~1.1 m and ~5.6 m north of the query point, plus one far away.
        let source = LocalImageSource::from_records(
            vec![
                record("near", 45.00001, 7.0),
                record("mid", 45.00005, 7.0),
                record("far", 45.01, 7.0),
            ],
            10.0,
            registry.clone(),
        );
        let point = SpatialPoint::new(0, 45.0, 7.0);

        let first = source.find_nearest_unassigned(&point).await;
        assert_eq!(first.image_id.as_deref(), Some("near"));
        assert!(first.residual_m.unwrap() <= 10.0);
        assert_eq!(first.image_path, Some(PathBuf::from("/images/near.jpg")));

        let second = source.find_nearest_unassigned(&point).await;
        assert_eq!(second.image_id.as_deref(), Some("mid"));

        let third = source.find_nearest_unassigned(&point).await;
        assert!(third.is_not_found());
        assert!(!registry.is_claimed("far"));
    }
}
