//! Demo routes and buses used to seed a fresh deployment.

use crate::error::Error;
use crate::geo::GeoPoint;
use crate::model::{Route, Stop};
use crate::motion::Registration;

const CITY_TO_AIRPORT: [(&str, &str, f64, f64); 5] = [
    ("stop-1", "City Center", 28.6139, 77.2090),
    ("stop-2", "Mall Junction", 28.6169, 77.2155),
    ("stop-3", "University Gate", 28.6199, 77.2220),
    ("stop-4", "Metro Station", 28.6229, 77.2285),
    ("stop-5", "Airport Terminal", 28.6259, 77.2350),
];

const NORTH_TO_SOUTH: [(&str, &str, f64, f64); 5] = [
    ("stop-6", "North Station", 28.6200, 77.2090),
    ("stop-7", "Central Park", 28.6150, 77.2090),
    ("stop-8", "Market Square", 28.6100, 77.2090),
    ("stop-9", "Hospital", 28.6050, 77.2090),
    ("stop-10", "South Terminal", 28.6000, 77.2090),
];

/// The two demo routes, "101" and "102".
///
/// # Errors
///
/// Returns [`Error::InvalidRoute`] only if the built-in stop tables are
/// malformed.
pub fn routes() -> Result<Vec<Route>, Error> {
    Ok(vec![
        route("route-1", "City Center to Airport", &CITY_TO_AIRPORT)?,
        route("route-2", "North to South Line", &NORTH_TO_SOUTH)?,
    ])
}

/// The three demo buses, two on route 101 and one on route 102.
#[must_use]
pub fn buses() -> Vec<Registration> {
    [
        ("bus-101-1", "route-1", 25.0, 0),
        ("bus-101-2", "route-1", 30.0, 2),
        ("bus-102-1", "route-2", 20.0, 1),
    ]
    .into_iter()
        .map(|(vehicle_id, route_id, base_speed_kmh, start_stop_index)| Registration {
            vehicle_id: vehicle_id.to_string(),
            route_id: route_id.to_string(),
            start_stop_index,
            base_speed_kmh,
        })
        .collect()
}

fn route(id: &str, name: &str, stops: &[(&str, &str, f64, f64)]) -> Result<Route, Error> {
    let stops = stops
        .iter()
        .enumerate()
        .map(|(sequence, (stop_id, stop_name, lat, lon))| {
            Stop::new(*stop_id, *stop_name, GeoPoint::new(*lat, *lon), sequence)
        })
        .collect();
    Route::new(id, name, stops)
}
