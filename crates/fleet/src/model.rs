//! Domain records shared by the motion model, ETA estimator, sweeper and store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::geo::GeoPoint;

/// A stop on a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stop {
    pub id: String,
    pub name: String,
    pub location: GeoPoint,
    /// Zero-based position of the stop along its route.
    pub sequence: usize,
}

impl Stop {
    #[must_use]
    pub fn new(
        id: impl Into<String>, name: impl Into<String>, location: GeoPoint, sequence: usize,
    ) -> Self {
        Self { id: id.into(), name: name.into(), location, sequence }
    }
}

/// An ordered, immutable list of stops. Edits replace the whole route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RouteDoc")]
pub struct Route {
    id: String,
    name: String,
    stops: Vec<Stop>,
}

impl Route {
    /// Builds a route, ordering stops by sequence.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRoute`] when the route has fewer than two stops,
    /// when sequence indices are not contiguous from 0, or when a stop has a
    /// non-finite coordinate.
    pub fn new(
        id: impl Into<String>, name: impl Into<String>, mut stops: Vec<Stop>,
    ) -> Result<Self, Error> {
        let id = id.into();
        if stops.len() < 2 {
            return Err(Error::InvalidRoute(format!(
                "route {id} has {} stops, at least 2 required",
                stops.len()
            )));
        }

        stops.sort_by_key(|stop| stop.sequence);
        for (expected, stop) in stops.iter().enumerate() {
            if stop.sequence != expected {
                return Err(Error::InvalidRoute(format!(
                    "route {id}: stop {} has sequence {}, expected {expected}",
                    stop.id, stop.sequence
                )));
            }
            if !stop.location.is_finite() {
                return Err(Error::InvalidRoute(format!(
                    "route {id}: stop {} has an invalid location",
                    stop.id
                )));
            }
        }

        Ok(Self { id, name: name.into(), stops })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn stops(&self) -> &[Stop] {
        &self.stops
    }

    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.stops.len()
    }

    /// The stop at `index`, wrapping around the end of the route.
    #[must_use]
    pub fn stop_wrapping(&self, index: usize) -> &Stop {
        &self.stops[index % self.stops.len()]
    }

    #[must_use]
    pub fn stop(&self, index: usize) -> Option<&Stop> {
        self.stops.get(index)
    }

    /// Index of the stop following `index`, wrapping to the first stop.
    #[must_use]
    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.stops.len()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouteDoc {
    id: String,
    #[serde(default)]
    name: String,
    stops: Vec<Stop>,
}

impl TryFrom<RouteDoc> for Route {
    type Error = Error;

    fn try_from(doc: RouteDoc) -> Result<Self, Self::Error> {
        Self::new(doc.id, doc.name, doc.stops)
    }
}

/// Persisted state of a tracked vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub id: String,
    pub route_id: String,
    pub location: GeoPoint,
    /// Current speed in km/h, never negative.
    pub speed_kmh: f64,
    pub active: bool,
    pub last_updated: DateTime<Utc>,
    pub current_stop_index: usize,
    /// Always `(current_stop_index + 1) % stop_count`.
    pub target_stop_index: usize,
    /// Fraction of the current leg covered, in `[0, 1)`.
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stop: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_stop: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Vehicle {
    /// Merges a partial update into the vehicle. Absent fields are untouched.
    pub fn apply(&mut self, patch: &VehiclePatch) {
        if let Some(route_id) = &patch.route_id {
            self.route_id.clone_from(route_id);
        }
        if let Some(location) = patch.location {
            self.location = location;
        }
        if let Some(speed) = patch.speed_kmh {
            self.speed_kmh = speed;
        }
        if let Some(active) = patch.active {
            self.active = active;
        }
        if let Some(last_updated) = patch.last_updated {
            self.last_updated = last_updated;
        }
        if let Some(index) = patch.current_stop_index {
            self.current_stop_index = index;
        }
        if let Some(index) = patch.target_stop_index {
            self.target_stop_index = index;
        }
        if let Some(progress) = patch.progress {
            self.progress = progress;
        }
        if let Some(name) = &patch.current_stop {
            self.current_stop = Some(name.clone());
        }
        if let Some(name) = &patch.next_stop {
            self.next_stop = Some(name.clone());
        }
        if let Some(last_seen) = patch.last_seen {
            self.last_seen = Some(last_seen);
        }
    }

    /// Full-document patch, used when a vehicle is first registered.
    #[must_use]
    pub fn to_patch(&self) -> VehiclePatch {
        VehiclePatch {
            route_id: Some(self.route_id.clone()),
            location: Some(self.location),
            speed_kmh: Some(self.speed_kmh),
            active: Some(self.active),
            last_updated: Some(self.last_updated),
            current_stop_index: Some(self.current_stop_index),
            target_stop_index: Some(self.target_stop_index),
            progress: Some(self.progress),
            current_stop: self.current_stop.clone(),
            next_stop: self.next_stop.clone(),
            last_seen: self.last_seen,
        }
    }

    /// Builds a vehicle from a full patch. `None` when a required field is missing.
    #[must_use]
    pub fn from_patch(id: &str, patch: &VehiclePatch) -> Option<Self> {
        Some(Self {
            id: id.to_string(),
            route_id: patch.route_id.clone()?,
            location: patch.location?,
            speed_kmh: patch.speed_kmh.unwrap_or_default(),
            active: patch.active.unwrap_or(true),
            last_updated: patch.last_updated?,
            current_stop_index: patch.current_stop_index.unwrap_or_default(),
            target_stop_index: patch.target_stop_index.unwrap_or(1),
            progress: patch.progress.unwrap_or_default(),
            current_stop: patch.current_stop.clone(),
            next_stop: patch.next_stop.clone(),
            last_seen: patch.last_seen,
        })
    }

    /// The consumer-facing projection of this vehicle.
    #[must_use]
    pub fn summary(&self) -> VehicleSummary {
        VehicleSummary {
            id: self.id.clone(),
            location: self.location,
            speed_kmh: self.speed_kmh,
            active: self.active,
            next_stop: self.next_stop.clone(),
            last_updated: self.last_updated,
        }
    }
}

/// Partial vehicle update. Only `Some` fields are written (last write wins per field).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehiclePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stop_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_stop_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stop: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_stop: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl VehiclePatch {
    /// Marks a vehicle inactive, stamping when it was last seen.
    #[must_use]
    pub fn deactivate(last_seen: DateTime<Utc>) -> Self {
        Self { active: Some(false), last_seen: Some(last_seen), ..Self::default() }
    }
}

/// A single observed or simulated position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSample {
    pub vehicle_id: String,
    pub position: GeoPoint,
    pub speed_kmh: f64,
    pub captured_at: DateTime<Utc>,
}

/// A position reported by an on-board device.
///
/// Devices do not always report speed; when absent it is derived from the
/// previous report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReport {
    pub vehicle_id: String,
    pub position: GeoPoint,
    #[serde(default)]
    pub speed_kmh: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

/// Estimated arrival of a vehicle at a stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtaRecord {
    pub id: String,
    pub vehicle_id: String,
    pub stop_id: String,
    pub route_id: String,
    pub estimated_arrival: DateTime<Utc>,
    pub distance_km: f64,
    pub minutes: i64,
    pub computed_at: DateTime<Utc>,
}

/// What UI consumers see of a vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleSummary {
    pub id: String,
    pub location: GeoPoint,
    pub speed_kmh: f64,
    pub active: bool,
    pub next_stop: Option<String>,
    pub last_updated: DateTime<Utc>,
}
