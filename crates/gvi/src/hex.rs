use std::collections::BTreeMap;

use h3o::{CellIndex, LatLng, Resolution};

use crate::error::ConfigError;
use crate::geo::LatLon;

/// Mean score of the points that fall into one H3 cell.
#[derive(Debug, Clone, PartialEq)]
pub struct HexCell {
    pub cell: CellIndex,
    pub mean_score: f64,
    pub point_count: usize,
    /// Cell outline, counter-clockwise, not closed.
    pub boundary: Vec<LatLon>,
}

impl HexCell {
    pub fn cell_id(&self) -> String {
        self.cell.to_string()
    }
}

/// Buckets scored points into H3 cells at `resolution` and averages each cell.
///
/// Unscored points are dropped. Cells come back ordered by index.
pub fn aggregate(
    points: &[(LatLon, Option<f64>)],
    resolution: u8,
) -> Result<Vec<HexCell>, ConfigError> {
    let resolution =
        Resolution::try_from(resolution).map_err(|_| ConfigError::InvalidResolution(resolution))?;

    let mut sums: BTreeMap<u64, (CellIndex, f64, usize)> = BTreeMap::new();
    let mut skipped = 0usize;
    for (location, score) in points {
        let Some(score) = score.filter(|s| s.is_finite()) else {
            continue;
        };
        let cell = match LatLng::new(location.lat, location.lon) {
            Ok(ll) => ll.to_cell(resolution),
            Err(e) => {
                tracing::warn!(lat = location.lat, lon = location.lon, error = %e, "Skipping point with invalid coordinates");
                skipped += 1;
                continue;
            }
        };
        let entry = sums.entry(u64::from(cell)).or_insert((cell, 0.0, 0));
        entry.1 += score;
        entry.2 += 1;
    }

    let cells: Vec<HexCell> = sums
        .into_values()
        .map(|(cell, sum, count)| HexCell {
            cell,
            mean_score: sum / count as f64,
            point_count: count,
            boundary: cell
                .boundary()
                .iter()
                .map(|v| LatLon::new(v.lat(), v.lng()))
                .collect(),
        })
        .collect();

    tracing::info!(
        resolution = u8::from(resolution),
        cells = cells.len(),
        skipped,
        "Aggregated scores onto hexagons"
    );
    Ok(cells)
}
