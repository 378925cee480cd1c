//! # ETA Estimator
//!
//! Arrival estimates for the next few stops ahead of a vehicle, plus the
//! ranking and formatting used by stop arrival boards.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use uuid::Uuid;

use crate::config::Config;
use crate::error::Error;
use crate::geo;
use crate::model::{EtaRecord, Route, Vehicle};
use crate::store::FleetStore;

/// Default number of arrivals shown for a stop.
pub const DEFAULT_BOARD_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EtaEstimator {
    lookahead: usize,
    fallback_speed_kmh: f64,
}

impl EtaEstimator {
    #[must_use]
    pub const fn new(lookahead: usize, fallback_speed_kmh: f64) -> Self {
        Self { lookahead, fallback_speed_kmh }
    }

    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self::new(config.lookahead, config.fallback_speed_kmh)
    }

    /// Estimates arrival at the stops following the vehicle's current stop.
    ///
    /// Stops wrap around the end of the route. A route never yields more
    /// estimates than it has other stops, so no stop is estimated twice.
    /// Stationary vehicles are assumed to move at the fallback speed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRoute`] when the vehicle is not on `route` or
    /// its current stop lies outside it.
    pub fn estimate(
        &self, vehicle: &Vehicle, route: &Route, now: DateTime<Utc>,
    ) -> Result<Vec<EtaRecord>, Error> {
        if vehicle.route_id != route.id() {
            return Err(Error::InvalidRoute(format!(
                "vehicle {} is on route {}, not {}",
                vehicle.id,
                vehicle.route_id,
                route.id()
            )));
        }
        if vehicle.current_stop_index >= route.stop_count() {
            return Err(Error::InvalidRoute(format!(
                "vehicle {} is at stop {} but route {} has {} stops",
                vehicle.id,
                vehicle.current_stop_index,
                route.id(),
                route.stop_count()
            )));
        }

        let speed =
            if vehicle.speed_kmh > 0.0 { vehicle.speed_kmh } else { self.fallback_speed_kmh };
        let ahead = self.lookahead.min(route.stop_count() - 1);

        let records = (1..=ahead)
            .map(|offset| {
                let stop = route.stop_wrapping(vehicle.current_stop_index + offset);
                let distance_km = geo::distance_km(vehicle.location, stop.location);
                let minutes = geo::eta_minutes(distance_km, speed);
                EtaRecord {
                    id: Uuid::new_v4().to_string(),
                    vehicle_id: vehicle.id.clone(),
                    stop_id: stop.id.clone(),
                    route_id: route.id().to_string(),
                    estimated_arrival: now + Duration::minutes(minutes),
                    distance_km,
                    minutes,
                    computed_at: now,
                }
            })
            .collect();

        Ok(records)
    }
}

/// Orders ETA records for a stop board.
///
/// Only the most recently computed record per vehicle is considered, and
/// only if its arrival is still in the future. Results are sorted by
/// arrival and truncated to `limit`.
#[must_use]
pub fn rank_for_stop(
    records: Vec<EtaRecord>, now: DateTime<Utc>, limit: usize,
) -> Vec<EtaRecord> {
    let mut latest: HashMap<String, EtaRecord> = HashMap::new();
    for record in records {
        match latest.get(&record.vehicle_id) {
            Some(held) if (held.computed_at, &held.id) >= (record.computed_at, &record.id) => {}
            _ => {
                latest.insert(record.vehicle_id.clone(), record);
            }
        }
    }

    let mut ranked: Vec<EtaRecord> =
        latest.into_values().filter(|record| record.estimated_arrival > now).collect();
    ranked.sort_by(|a, b| {
        a.estimated_arrival
            .cmp(&b.estimated_arrival)
            .then_with(|| a.vehicle_id.cmp(&b.vehicle_id))
    });
    ranked.truncate(limit);
    ranked
}

/// Reads a stop's ETA records from the store and ranks them.
///
/// # Errors
///
/// Returns the store error if the records cannot be read.
pub async fn ranked_etas_for_stop<S>(
    store: &S, stop_id: &str, now: DateTime<Utc>, limit: usize,
) -> anyhow::Result<Vec<EtaRecord>>
where
    S: FleetStore + ?Sized,
{
    let records = store.etas_for_stop(stop_id).await?;
    Ok(rank_for_stop(records, now, limit))
}

/// One line of a stop arrival board.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Arrival {
    pub vehicle_id: String,
    pub route_id: String,
    pub estimated_arrival: DateTime<Utc>,
    pub distance_km: f64,
    /// Arrival as shown to passengers, e.g. "4 min".
    pub display: String,
}

/// Renders ranked records for display in `timezone`.
#[must_use]
pub fn arrivals(records: &[EtaRecord], now: DateTime<Utc>, timezone: Tz) -> Vec<Arrival> {
    records
        .iter()
        .map(|record| Arrival {
            vehicle_id: record.vehicle_id.clone(),
            route_id: record.route_id.clone(),
            estimated_arrival: record.estimated_arrival,
            distance_km: record.distance_km,
            display: format_eta(Some(record.estimated_arrival), now, timezone),
        })
        .collect()
}

/// Human-readable arrival time relative to `now`.
#[must_use]
pub fn format_eta(arrival: Option<DateTime<Utc>>, now: DateTime<Utc>, timezone: Tz) -> String {
    let Some(arrival) = arrival else {
        return "Unknown".to_string();
    };

    let seconds = (arrival - now).num_seconds();
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let minutes = (seconds as f64 / 60.0).round() as i64;

    match minutes {
        ..=0 => "Arriving now".to_string(),
        1..60 => format!("{minutes} min"),
        60..1440 => format!("{}h {}m", minutes / 60, minutes % 60),
        _ => arrival.with_timezone(&timezone).format("%H:%M").to_string(),
    }
}
