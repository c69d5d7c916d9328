//! Geodesy helpers: WGS-84 geodesic distance and search boxes.
//!
//! All math is f64 degrees in, metres out.

use serde::{Deserialize, Serialize};

/// Fixed metres-per-degree approximation used to turn a search radius into a
/// degree box for the remote image-search API.
pub const METERS_PER_DEGREE: f64 = 111_111.0;

pub mod wgs84 {
    /// Semi-major axis (equatorial radius) in meters.
    pub const A: f64 = 6_378_137.0;

    /// Flattening factor (1 / 298.257223563).
    pub const F: f64 = 1.0 / 298.257_223_563;

    /// Semi-minor axis (polar radius) in meters.
    pub const B: f64 = A * (1.0 - F);

    /// Mean radius (2A + B) / 3, used when the ellipsoidal solution does not converge.
    pub const MEAN_RADIUS: f64 = (2.0 * A + B) / 3.0;
}

/// A geographic coordinate in WGS-84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    /// Latitude in degrees, -90 to +90.
    pub lat: f64,
    /// Longitude in degrees, -180 to +180.
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lon.is_finite()
    }

    /// Geodesic distance to `other` on the WGS-84 ellipsoid, in metres.
    #[inline]
    pub fn distance_m(&self, other: &LatLon) -> f64 {
        geodesic_distance_m(*self, *other)
    }
}

/// Axis-aligned box in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub lon_min: f64,
    pub lat_min: f64,
    pub lon_max: f64,
    pub lat_max: f64,
}

impl BoundingBox {
    /// Square box of side `2 * radius_m` centred on `center`, using the fixed
    /// [`METERS_PER_DEGREE`] conversion on both axes.
    pub fn around(center: LatLon, radius_m: f64) -> Self {
        let pad = radius_m / METERS_PER_DEGREE;
        Self {
            lon_min: center.lon - pad,
            lat_min: center.lat - pad,
            lon_max: center.lon + pad,
            lat_max: center.lat + pad,
        }
    }

    /// `left,bottom,right,top`, the order image-search APIs expect.
    pub fn to_query_param(&self) -> String {
        format!("{},{},{},{}", self.lon_min, self.lat_min, self.lon_max, self.lat_max)
    }
}

/// Vincenty inverse solution on WGS-84.
///
/// Falls back to a great-circle distance on the mean radius for the nearly
/// antipodal pairs where the iteration does not converge.
pub fn geodesic_distance_m(p1: LatLon, p2: LatLon) -> f64 {
    const MAX_ITERATIONS: usize = 200;
    const TOLERANCE: f64 = 1e-12;

    let f = wgs84::F;
    let a = wgs84::A;
    let b = wgs84::B;

    let l = (p2.lon - p1.lon).to_radians();
    let u1 = ((1.0 - f) * p1.lat.to_radians().tan()).atan();
    let u2 = ((1.0 - f) * p2.lat.to_radians().tan()).atan();
    let (sin_u1, cos_u1) = u1.sin_cos();
    let (sin_u2, cos_u2) = u2.sin_cos();

    let mut lambda = l;
    for _ in 0..MAX_ITERATIONS {
        let (sin_lambda, cos_lambda) = lambda.sin_cos();

        let sin_sigma = ((cos_u2 * sin_lambda).powi(2)
            + (cos_u1 * sin_u2 - sin_u1 * cos_u2 * cos_lambda).powi(2))
        .sqrt();

        // Coincident points
        if sin_sigma == 0.0 {
            return 0.0;
        }

        let cos_sigma = sin_u1 * sin_u2 + cos_u1 * cos_u2 * cos_lambda;
        let sigma = sin_sigma.atan2(cos_sigma);
        let sin_alpha = cos_u1 * cos_u2 * sin_lambda / sin_sigma;
        let cos_sq_alpha = 1.0 - sin_alpha * sin_alpha;

        // Equatorial line: cos_sq_alpha == 0
        let cos_2sigma_m = if cos_sq_alpha != 0.0 {
            cos_sigma - 2.0 * sin_u1 * sin_u2 / cos_sq_alpha
        } else {
            0.0
        };

        let c = f / 16.0 * cos_sq_alpha * (4.0 + f * (4.0 - 3.0 * cos_sq_alpha));
        let lambda_prev = lambda;
        lambda = l
            + (1.0 - c)
                * f
                * sin_alpha
                * (sigma
                    + c * sin_sigma
                        * (cos_2sigma_m + c * cos_sigma * (-1.0 + 2.0 * cos_2sigma_m * cos_2sigma_m)));

        if (lambda - lambda_prev).abs() < TOLERANCE {
            let u_sq = cos_sq_alpha * (a * a - b * b) / (b * b);
            let big_a =
                1.0 + u_sq / 16384.0 * (4096.0 + u_sq * (-768.0 + u_sq * (320.0 - 175.0 * u_sq)));
            let big_b = u_sq / 1024.0 * (256.0 + u_sq * (-128.0 + u_sq * (74.0 - 47.0 * u_sq)));
            let delta_sigma = big_b
                * sin_sigma
                * (cos_2sigma_m
                    + big_b / 4.0
                        * (cos_sigma * (-1.0 + 2.0 * cos_2sigma_m * cos_2sigma_m)
                            - big_b / 6.0
                                * cos_2sigma_m
                                * (-3.0 + 4.0 * sin_sigma * sin_sigma)
                                * (-3.0 + 4.0 * cos_2sigma_m * cos_2sigma_m)));

            return b * big_a * (sigma - delta_sigma);
        }
    }

    tracing::debug!(?p1, ?p2, "Vincenty did not converge; using great-circle distance");
    haversine_m(p1, p2)
}

fn haversine_m(p1: LatLon, p2: LatLon) -> f64 {
    let d_lat = (p2.lat - p1.lat).to_radians();
    let d_lon = (p2.lon - p1.lon).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + p1.lat.to_radians().cos() * p2.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * wgs84::MEAN_RADIUS * h.sqrt().min(1.0).asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_degree_along_equator() {
        let d = geodesic_distance_m(LatLon::new(0.0, 0.0), LatLon::new(0.0, 1.0));
        assert!((d - 111_319.4908).abs() < 0.01, "got {d}");
    }

    #[test]
    fn one_degree_along_meridian() {
        let d = geodesic_distance_m(LatLon::new(0.0, 0.0), LatLon::new(1.0, 0.0));
        assert!((d - 110_574.3886).abs() < 0.01, "got {d}");
    }

    #[test]
    fn coincident_and_symmetric() {
        let a = LatLon::new(47.617663, -122.169819);
        let b = LatLon::new(47.617700, -122.169900);
        assert_eq!(a.distance_m(&a), 0.0);
        assert!((a.distance_m(&b) - b.distance_m(&a)).abs() < 1e-9);
        assert!(a.distance_m(&b) > 0.0 && a.distance_m(&b) < 10.0);
    }

    #[test]
    fn antipodal_falls_back_to_great_circle() {
        let d = geodesic_distance_m(LatLon::new(0.0, 0.0), LatLon::new(0.0, 180.0));
        assert!(d.is_finite());
        assert!(d > 19_900_000.0 && d < 20_100_000.0, "got {d}");
    }

    #[test]
    fn search_box_is_centered() {
        let center = LatLon::new(45.0, 7.0);
        let bbox = BoundingBox::around(center, 10.0);
        let pad = 10.0 / METERS_PER_DEGREE;
        assert!((bbox.lat_max - bbox.lat_min - 2.0 * pad).abs() < 1e-12);
        assert!((bbox.lon_max - bbox.lon_min - 2.0 * pad).abs() < 1e-12);
        assert!(((bbox.lat_min + bbox.lat_max) / 2.0 - center.lat).abs() < 1e-12);
        assert!(((bbox.lon_min + bbox.lon_max) / 2.0 - center.lon).abs() < 1e-12);
        // 0.001 deg of latitude is ~111 m, well outside a 10 m box.
        assert!(bbox.lat_max < 45.001);
        assert_eq!(bbox.to_query_param().split(',').count(), 4);
    }
}
