#![allow(missing_docs)]
#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use fleet::{Config, GeoPoint, ManualClock, MemoryStore, Registration, Route, Simulator, Stop};

pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

/// Two stops one degree of longitude apart on the equator.
pub fn equator_route() -> Route {
    Route::new(
        "equator",
        "Equator Shuttle",
        vec![
            Stop::new("a", "A", GeoPoint::new(0.0, 0.0), 0),
            Stop::new("b", "B", GeoPoint::new(0.0, 1.0), 1),
        ],
    )
    .expect("route should be valid")
}

pub fn registration(vehicle_id: &str, base_speed_kmh: f64) -> Registration {
    Registration {
        vehicle_id: vehicle_id.to_string(),
        route_id: "equator".to_string(),
        start_stop_index: 0,
        base_speed_kmh,
    }
}

pub struct Harness {
    pub store: MemoryStore,
    pub clock: ManualClock,
    pub simulator: Arc<Simulator<MemoryStore, ManualClock>>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let store = MemoryStore::new();
        let clock = ManualClock::new(epoch());
        let simulator =
            Arc::new(Simulator::new(config, Arc::new(store.clone()), Arc::new(clock.clone())));
        simulator.add_route(equator_route());
        Self { store, clock, simulator }
    }
}
