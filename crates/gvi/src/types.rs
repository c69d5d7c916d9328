use std::path::PathBuf;

use crate::error::PointError;
use crate::geo::LatLon;

/// An input location to be matched to an image. `id` is the point's position
/// in the input collection and is how results are tied back to it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialPoint {
    pub id: usize,
    pub lat: f64,
    pub lon: f64,
}

impl SpatialPoint {
    pub fn new(id: usize, lat: f64, lon: f64) -> Self {
        Self { id, lat, lon }
    }

    pub fn location(&self) -> LatLon {
        LatLon::new(self.lat, self.lon)
    }
}

/// Where an indexed image's bytes live.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageOrigin {
    Local(PathBuf),
    Remote(String),
}

/// One candidate image known to an image source. Read-only after indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub id: String,
    pub location: LatLon,
    pub origin: ImageOrigin,
}

/// Outcome of matching one point. Built once, never mutated.
///
/// - Assigned: `image_id`, `image_location`, `residual_m` set; `image_path` set
///   unless retrieval failed, in which case `error` says why.
/// - Not found: every field `None`, no error.
/// - Failed before a claim: only `error` set.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentResult {
    pub point_id: usize,
    pub image_id: Option<String>,
    pub image_location: Option<LatLon>,
    pub residual_m: Option<f64>,
    pub image_path: Option<PathBuf>,
    pub error: Option<PointError>,
}

impl AssignmentResult {
    pub fn not_found(point_id: usize) -> Self {
        Self {
            point_id,
            image_id: None,
            image_location: None,
            residual_m: None,
            image_path: None,
            error: None,
        }
    }

    pub fn failed(point_id: usize, error: PointError) -> Self {
        Self {
            error: Some(error),
            ..Self::not_found(point_id)
        }
    }

    pub fn assigned(
        point_id: usize,
        record: &ImageRecord,
        residual_m: f64,
        image_path: Option<PathBuf>,
        error: Option<PointError>,
    ) -> Self {
        Self {
            point_id,
            image_id: Some(record.id.clone()),
            image_location: Some(record.location),
            residual_m: Some(residual_m),
            image_path,
            error,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.image_id.is_some()
    }

    pub fn is_not_found(&self) -> bool {
        self.image_id.is_none() && self.error.is_none()
    }
}
