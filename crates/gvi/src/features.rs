//! GeoJSON point layers: read input points, write back assignment, score and
//! hexagon results. Unknown members and properties are carried through.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use crate::error::ConfigError;
use crate::geo::LatLon;
use crate::hex::HexCell;
use crate::scoring::{PointScore, ScoreJob};
use crate::types::{AssignmentResult, SpatialPoint};

/// A FeatureCollection of Point features. Feature `i` is point id `i`.
#[derive(Debug, Clone)]
pub struct PointLayer {
    root: Map<String, Value>,
    features: Vec<Map<String, Value>>,
    locations: Vec<LatLon>,
}

impl PointLayer {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path).map_err(|source| ConfigError::Io {
            context: format!("opening {}", path.display()),
            source,
        })?;
        let value: Value = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| malformed(path, e.to_string()))?;
        let layer = Self::from_value(value, path)?;
        tracing::info!(path = %path.display(), points = layer.len(), "Loaded point layer");
        Ok(layer)
    }

    /// `origin` is only used in error messages.
    pub fn from_value(value: Value, origin: &Path) -> Result<Self, ConfigError> {
        let Value::Object(mut root) = value else {
            return Err(malformed(origin, "top level is not an object"));
        };
        if root.get("type").and_then(Value::as_str) != Some("FeatureCollection") {
            return Err(malformed(origin, "not a FeatureCollection"));
        }
        let Some(Value::Array(raw)) = root.remove("features") else {
            return Err(malformed(origin, "missing features array"));
        };

        let mut features = Vec::with_capacity(raw.len());
        let mut locations = Vec::with_capacity(raw.len());
        for (i, feature) in raw.into_iter().enumerate() {
            let Value::Object(mut feature) = feature else {
                return Err(malformed(origin, format!("feature {i} is not an object")));
            };
            let location = point_location(&feature)
                .ok_or_else(|| malformed(origin, format!("feature {i} is not a Point with [lon, lat]")))?;
            if !matches!(feature.get("properties"), Some(Value::Object(_))) {
                feature.insert("properties".into(), Value::Object(Map::new()));
            }
            features.push(feature);
            locations.push(location);
        }

        Ok(Self {
            root,
            features,
            locations,
        })
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn points(&self) -> Vec<SpatialPoint> {
        self.locations
            .iter()
            .enumerate()
            .map(|(id, loc)| SpatialPoint::new(id, loc.lat, loc.lon))
            .collect()
    }

    pub fn property(&self, point_id: usize, key: &str) -> Option<&Value> {
        self.features
            .get(point_id)
            .and_then(|f| f.get("properties"))
            .and_then(|p| p.get(key))
    }

    fn properties_mut(&mut self, point_id: usize) -> Option<&mut Map<String, Value>> {
        self.features
            .get_mut(point_id)
            .and_then(|f| f.get_mut("properties"))
            .and_then(Value::as_object_mut)
    }

    pub fn apply_assignments(&mut self, results: &[AssignmentResult]) {
        for result in results {
            let Some(props) = self.properties_mut(result.point_id) else {
                tracing::warn!(point_id = result.point_id, "Assignment for unknown point");
                continue;
            };
            props.insert("image_id".into(), json!(result.image_id));
            props.insert("image_lat".into(), json!(result.image_location.map(|l| l.lat)));
            props.insert("image_lon".into(), json!(result.image_location.map(|l| l.lon)));
            props.insert("residual".into(), json!(result.residual_m));
            props.insert(
                "image_path".into(),
                json!(result
                    .image_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned())),
            );
            props.insert(
                "error".into(),
                json!(result.error.as_ref().map(ToString::to_string)),
            );
        }
    }

    /// One job per feature, from the `image_id` and `image_path` properties
    /// written at assignment.
    pub fn score_jobs(&self) -> Vec<ScoreJob> {
        (0..self.len())
            .map(|point_id| ScoreJob {
                point_id,
                image_id: self
                    .property(point_id, "image_id")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                image_path: self
                    .property(point_id, "image_path")
                    .and_then(Value::as_str)
                    .map(PathBuf::from),
            })
            .collect()
    }

    /// Writes `gvi_score` and `gvi_method` (null when unscored), plus
    /// `gvi_regions` and the scoring `error` when present.
    pub fn apply_scores(&mut self, scores: &[PointScore]) {
        for score in scores {
            let Some(props) = self.properties_mut(score.point_id) else {
                tracing::warn!(point_id = score.point_id, "Score for unknown point");
                continue;
            };
            props.insert("gvi_score".into(), json!(score.score.as_ref().map(|s| s.score)));
            props.insert("gvi_method".into(), json!(score.score.as_ref().map(|s| s.method)));
            if let Some(regions) = score.score.as_ref().and_then(|s| s.regions.as_ref()) {
                props.insert("gvi_regions".into(), json!(regions));
            }
            if let Some(error) = &score.error {
                props.insert("error".into(), json!(error));
            }
        }
    }

    /// Point locations paired with their `gvi_score`, if any.
    pub fn scored_locations(&self) -> Vec<(LatLon, Option<f64>)> {
        self.locations
            .iter()
            .enumerate()
            .map(|(id, loc)| (*loc, self.property(id, "gvi_score").and_then(Value::as_f64)))
            .collect()
    }

    pub fn to_value(&self) -> Value {
        let mut root = self.root.clone();
        root.insert(
            "features".into(),
            Value::Array(self.features.iter().cloned().map(Value::Object).collect()),
        );
        Value::Object(root)
    }

    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        write_json(path, &self.to_value())?;
        tracing::info!(path = %path.display(), points = self.len(), "Wrote point layer");
        Ok(())
    }
}

/// Hexagons as a FeatureCollection of closed Polygons.
pub fn hex_cells_to_value(cells: &[HexCell]) -> Value {
    let features: Vec<Value> = cells
        .iter()
        .map(|cell| {
            let mut ring: Vec<[f64; 2]> = cell.boundary.iter().map(|v| [v.lon, v.lat]).collect();
            if let Some(first) = ring.first().copied() {
                ring.push(first);
            }
            json!({
                "type": "Feature",
                "geometry": { "type": "Polygon", "coordinates": [ring] },
                "properties": {
                    "cell_id": cell.cell_id(),
                    "gvi_score_mean": cell.mean_score,
                    "point_count": cell.point_count,
                },
            })
        })
        .collect();
    json!({ "type": "FeatureCollection", "features": features })
}

pub fn write_hex_cells(path: &Path, cells: &[HexCell]) -> Result<(), ConfigError> {
    write_json(path, &hex_cells_to_value(cells))?;
    tracing::info!(path = %path.display(), cells = cells.len(), "Wrote hexagon layer");
    Ok(())
}

fn write_json(path: &Path, value: &Value) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        context: format!("writing {}", path.display()),
        source,
    };
    let file = File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value).map_err(|e| io_err(e.into()))?;
    writer.flush().map_err(io_err)
}

fn point_location(feature: &Map<String, Value>) -> Option<LatLon> {
    let geometry = feature.get("geometry")?;
    if geometry.get("type")?.as_str()? != "Point" {
        return None;
    }
    let coords = geometry.get("coordinates")?.as_array()?;
    let lon = coords.first()?.as_f64()?;
    let lat = coords.get(1)?.as_f64()?;
    Some(LatLon::new(lat, lon))
}

fn malformed(path: &Path, reason: impl Into<String>) -> ConfigError {
    ConfigError::MalformedInput {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}
