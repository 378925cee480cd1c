//! Great-circle distance and travel-time helpers shared by every component.

use serde::{Deserialize, Serialize};

use crate::model::PositionSample;

/// Mean Earth radius used by the haversine formula.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A WGS-84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Linear interpolation towards `other`; `fraction` 0 is `self`, 1 is `other`.
    #[must_use]
    pub fn lerp(self, other: Self, fraction: f64) -> Self {
        Self {
            latitude: (other.latitude - self.latitude).mul_add(fraction, self.latitude),
            longitude: (other.longitude - self.longitude).mul_add(fraction, self.longitude),
        }
    }

    /// Offsets both axes by the given number of degrees.
    #[must_use]
    pub fn offset(self, d_lat: f64, d_lon: f64) -> Self {
        Self { latitude: self.latitude + d_lat, longitude: self.longitude + d_lon }
    }

    #[must_use]
    pub const fn is_finite(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }
}

impl std::fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}, {:.6}", self.latitude, self.longitude)
    }
}

/// Haversine great-circle distance in kilometres.
///
/// Ignores ellipsoidal correction; error is within the usual haversine bounds
/// (≈0.5%).
#[must_use]
pub fn distance_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();

    let sin_lat = (d_lat / 2.0).sin().powi(2);
    let sin_lon = (d_lon / 2.0).sin().powi(2);
    let h = (lat1.cos() * lat2.cos()).mul_add(sin_lon, sin_lat);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_KM * c
}

/// Whole minutes needed to cover `distance_km` at `speed_kmh`.
///
/// A stopped vehicle yields 0. Callers must read 0 with a zero speed as
/// "unknown / at rest", not "arriving now".
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn eta_minutes(distance_km: f64, speed_kmh: f64) -> i64 {
    if speed_kmh == 0.0 || !speed_kmh.is_finite() {
        return 0;
    }
    (distance_km / speed_kmh * 60.0).round() as i64
}

/// Whether `point` lies within `radius_km` of `stop`.
#[must_use]
pub fn is_near(point: GeoPoint, stop: GeoPoint, radius_km: f64) -> bool {
    distance_km(point, stop) <= radius_km
}

/// Average speed over a chronological sequence of samples, in km/h.
///
/// Segments with non-positive elapsed time are ignored. Returns `fallback_kmh`
/// when fewer than two samples or no elapsed time are available, otherwise the
/// result is clamped into `[min_kmh, max_kmh]`.
#[must_use]
pub fn average_speed(
    samples: &[PositionSample], fallback_kmh: f64, min_kmh: f64, max_kmh: f64,
) -> f64 {
    if samples.len() < 2 {
        return fallback_kmh;
    }

    let mut total_km = 0.0;
    let mut total_hours = 0.0;
    for pair in samples.windows(2) {
        let hours = elapsed_hours(&pair[0], &pair[1]);
        if hours > 0.0 {
            total_km += distance_km(pair[0].position, pair[1].position);
            total_hours += hours;
        }
    }

    if total_hours == 0.0 {
        return fallback_kmh;
    }
    (total_km / total_hours).clamp(min_kmh, max_kmh)
}

/// Speed implied by moving from `prev` to `next`, in km/h.
///
/// `None` when no time elapsed.
#[must_use]
pub fn implied_speed(prev: &PositionSample, next: &PositionSample) -> Option<f64> {
    let hours = elapsed_hours(prev, next);
    (hours > 0.0).then(|| distance_km(prev.position, next.position) / hours)
}

#[allow(clippy::cast_precision_loss)]
fn elapsed_hours(prev: &PositionSample, next: &PositionSample) -> f64 {
    (next.captured_at - prev.captured_at).num_milliseconds() as f64 / 3_600_000.0
}
