//! # Motion Model
//!
//! Advances each tracked vehicle along its route one tick at a time, and
//! folds device-reported positions into the same vehicle state.
//!
//! A vehicle is always en route from `current_stop_index` to
//! `target_stop_index`. Each tick adds the configured step to `progress`;
//! reaching 1 moves the vehicle onto the target stop and starts the next leg.
//! Position is a straight-line interpolation between the two stops plus a
//! small amount of GPS-style noise. The noise only touches the reported
//! coordinate, never `progress`, so advancement stays monotonic.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Error;
use crate::geo::{self, GeoPoint};
use crate::model::{DeviceReport, PositionSample, Route, Vehicle};

/// Absorbs floating-point drift so that `n` steps of `1/n` complete a leg.
const PROGRESS_EPSILON: f64 = 1e-9;

/// Device-implied speeds at or above this are treated as GPS glitches.
const MAX_IMPLIED_SPEED_KMH: f64 = 200.0;

/// Device reports kept per vehicle for speed derivation.
const REPORT_HISTORY: usize = 10;

/// Request to start tracking a vehicle on a route.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub vehicle_id: String,
    pub route_id: String,
    pub start_stop_index: usize,
    /// Speed the simulator varies around, in km/h.
    pub base_speed_kmh: f64,
}

#[derive(Debug, Clone)]
struct Track {
    vehicle: Vehicle,
    base_speed_kmh: f64,
    reports: VecDeque<PositionSample>,
}

/// Owns the transient motion state of every tracked vehicle.
#[derive(Debug)]
pub struct MotionModel {
    config: Config,
    routes: HashMap<String, Arc<Route>>,
    tracks: BTreeMap<String, Track>,
    rng: SmallRng,
}

impl MotionModel {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let rng = config.rng_seed.map_or_else(SmallRng::from_entropy, SmallRng::seed_from_u64);
        Self { config, routes: HashMap::new(), tracks: BTreeMap::new(), rng }
    }

    /// Adds a route, replacing any route with the same id.
    pub fn add_route(&mut self, route: Route) {
        debug!(route_id = %route.id(), stops = route.stop_count(), "route loaded");
        self.routes.insert(route.id().to_string(), Arc::new(route));
    }

    #[must_use]
    pub fn route(&self, route_id: &str) -> Option<Arc<Route>> {
        self.routes.get(route_id).cloned()
    }

    /// Starts tracking a vehicle, positioned at its starting stop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the model's configuration is out
    /// of range, [`Error::UnknownRoute`] if the route has not been added and
    /// [`Error::InvalidRoute`] if the starting stop is outside the route or
    /// the base speed is unusable.
    pub fn register(
        &mut self, registration: Registration, now: DateTime<Utc>,
    ) -> Result<Vehicle, Error> {
        self.config.validate()?;
        let route = self.routes.get(&registration.route_id).cloned().ok_or_else(|| {
            Error::UnknownRoute(format!(
                "vehicle {} references route {}",
                registration.vehicle_id, registration.route_id
            ))
        })?;

        let Some(start) = route.stop(registration.start_stop_index) else {
            return Err(Error::InvalidRoute(format!(
                "vehicle {} starts at stop {} but route {} has {} stops",
                registration.vehicle_id,
                registration.start_stop_index,
                route.id(),
                route.stop_count()
            )));
        };
        if !registration.base_speed_kmh.is_finite() || registration.base_speed_kmh < 0.0 {
            return Err(Error::InvalidRoute(format!(
                "vehicle {} has base speed {}",
                registration.vehicle_id, registration.base_speed_kmh
            )));
        }

        let target_index = route.next_index(start.sequence);
        let location = self.jitter(start.location);
        let vehicle = Vehicle {
            id: registration.vehicle_id.clone(),
            route_id: route.id().to_string(),
            location,
            speed_kmh: self.clamp_speed(registration.base_speed_kmh),
            active: true,
            last_updated: now,
            current_stop_index: start.sequence,
            target_stop_index: target_index,
            progress: 0.0,
            current_stop: Some(start.name.clone()),
            next_stop: Some(route.stop_wrapping(target_index).name.clone()),
            last_seen: None,
        };

        self.tracks.insert(
            registration.vehicle_id,
            Track {
                vehicle: vehicle.clone(),
                base_speed_kmh: registration.base_speed_kmh,
                reports: VecDeque::new(),
            },
        );
        Ok(vehicle)
    }

    /// Stops tracking a vehicle, returning its last known state.
    pub fn deregister(&mut self, vehicle_id: &str) -> Option<Vehicle> {
        self.tracks.remove(vehicle_id).map(|track| track.vehicle)
    }

    #[must_use]
    pub fn vehicle(&self, vehicle_id: &str) -> Option<&Vehicle> {
        self.tracks.get(vehicle_id).map(|track| &track.vehicle)
    }

    pub fn vehicles(&self) -> impl Iterator<Item = &Vehicle> {
        self.tracks.values().map(|track| &track.vehicle)
    }

    /// Ids of vehicles that take part in ticks.
    #[must_use]
    pub fn active_ids(&self) -> Vec<String> {
        self.tracks
            .values()
            .filter(|track| track.vehicle.active)
            .map(|track| track.vehicle.id.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Flags a vehicle active or inactive without moving it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownVehicle`] if the vehicle is not tracked.
    pub fn set_active(&mut self, vehicle_id: &str, active: bool) -> Result<&Vehicle, Error> {
        let track = self.track_mut(vehicle_id)?;
        track.vehicle.active = active;
        Ok(&track.vehicle)
    }

    /// Runs one simulated tick for a vehicle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownVehicle`] if the vehicle is not tracked,
    /// [`Error::UnknownRoute`] if its route has gone, and
    /// [`Error::InvalidRoute`] if its stop indices no longer fit the route.
    pub fn advance(
        &mut self, vehicle_id: &str, now: DateTime<Utc>,
    ) -> Result<(Vehicle, Arc<Route>), Error> {
        let step = self.config.step_fraction;
        let (route_id, base_speed) = {
            let track = self.track(vehicle_id)?;
            (track.vehicle.route_id.clone(), track.base_speed_kmh)
        };
        let route = self.route_for(vehicle_id, &route_id)?;

        let (current, target, progress) = {
            let vehicle = &self.track(vehicle_id)?.vehicle;
            if vehicle.current_stop_index >= route.stop_count()
                || vehicle.target_stop_index >= route.stop_count()
            {
                return Err(Error::InvalidRoute(format!(
                    "vehicle {vehicle_id} is between stops {} and {} but route {} has {} stops",
                    vehicle.current_stop_index,
                    vehicle.target_stop_index,
                    route.id(),
                    route.stop_count()
                )));
            }
            (vehicle.current_stop_index, vehicle.target_stop_index, vehicle.progress + step)
        };

        let (current, target, progress, exact) = if progress >= 1.0 - PROGRESS_EPSILON {
            let arrived = &route.stops()[target];
            (target, route.next_index(target), 0.0, arrived.location)
        } else {
            let from = route.stops()[current].location;
            let to = route.stops()[target].location;
            (current, target, progress, from.lerp(to, progress))
        };

        let location = self.jitter(exact);
        let speed = self.vary_speed(base_speed);

        let track = self.track_mut(vehicle_id)?;
        let vehicle = &mut track.vehicle;
        vehicle.current_stop_index = current;
        vehicle.target_stop_index = target;
        vehicle.progress = progress;
        vehicle.location = location;
        vehicle.speed_kmh = speed;
        vehicle.last_updated = now;
        vehicle.active = true;
        vehicle.current_stop = Some(route.stops()[current].name.clone());
        vehicle.next_stop = Some(route.stops()[target].name.clone());

        Ok((vehicle.clone(), route))
    }

    /// Replaces a vehicle's derived position with a device report.
    ///
    /// Stop indices and progress are kept unless the report lies within the
    /// snap radius of a stop, in which case the vehicle is placed on that
    /// stop. A report older than the vehicle's last update is ignored and
    /// `None` is returned. Any report reactivates the vehicle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownVehicle`] if the vehicle is not tracked and
    /// [`Error::InvalidFormat`] if the reported coordinate is not finite.
    pub fn apply_report(
        &mut self, report: &DeviceReport,
    ) -> Result<Option<(Vehicle, Arc<Route>)>, Error> {
        if !report.position.is_finite() {
            return Err(Error::InvalidFormat(format!(
                "vehicle {} reported position {}",
                report.vehicle_id, report.position
            )));
        }

        let (route_id, last_updated, history) = {
            let track = self.track(&report.vehicle_id)?;
            let vehicle = &track.vehicle;
            let history: Vec<PositionSample> = track.reports.iter().cloned().collect();
            (vehicle.route_id.clone(), vehicle.last_updated, history)
        };
        if report.captured_at < last_updated {
            warn!(
                vehicle_id = %report.vehicle_id,
                captured_at = %report.captured_at,
                last_updated = %last_updated,
                "Ignoring out-of-order position report"
            );
            return Ok(None);
        }
        let route = self.route_for(&report.vehicle_id, &route_id)?;

        let mut sample = PositionSample {
            vehicle_id: report.vehicle_id.clone(),
            position: report.position,
            speed_kmh: 0.0,
            captured_at: report.captured_at,
        };
        sample.speed_kmh = self.reported_speed(report.speed_kmh, &history, &sample);

        let snapped = self.nearest_stop(&route, report.position);

        let track = self.track_mut(&report.vehicle_id)?;
        let vehicle = &mut track.vehicle;
        vehicle.location = sample.position;
        vehicle.speed_kmh = sample.speed_kmh;
        vehicle.last_updated = sample.captured_at;
        vehicle.active = true;
        if let Some(index) = snapped {
            vehicle.current_stop_index = index;
            vehicle.target_stop_index = route.next_index(index);
            vehicle.progress = 0.0;
        }
        if let (Some(current), Some(target)) =
            (route.stop(vehicle.current_stop_index), route.stop(vehicle.target_stop_index))
        {
            vehicle.current_stop = Some(current.name.clone());
            vehicle.next_stop = Some(target.name.clone());
        }
        if track.reports.len() == REPORT_HISTORY {
            track.reports.pop_front();
        }
        track.reports.push_back(sample);

        Ok(Some((track.vehicle.clone(), route)))
    }

    fn reported_speed(
        &self, reported: Option<f64>, history: &[PositionSample], sample: &PositionSample,
    ) -> f64 {
        if let Some(speed) = reported.filter(|speed| speed.is_finite() && *speed >= 0.0) {
            return speed;
        }

        // A glitched or missing step falls back to the average over recent reports.
        history
            .last()
            .and_then(|previous| geo::implied_speed(previous, sample))
            .filter(|speed| *speed > 0.0 && *speed < MAX_IMPLIED_SPEED_KMH)
            .map_or_else(
                || {
                    geo::average_speed(
                        history,
                        self.config.fallback_speed_kmh,
                        self.config.min_speed_kmh,
                        self.config.max_speed_kmh,
                    )
                },
                |speed| self.clamp_speed(speed),
            )
    }

    fn nearest_stop(&self, route: &Route, position: GeoPoint) -> Option<usize> {
        if self.config.snap_radius_km <= 0.0 {
            return None;
        }
        route
            .stops()
            .iter()
            .filter(|stop| geo::is_near(position, stop.location, self.config.snap_radius_km))
            .map(|stop| (stop.sequence, geo::distance_km(position, stop.location)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(index, _)| index)
    }

    fn vary_speed(&mut self, base_kmh: f64) -> f64 {
        let band = self.config.speed_jitter_kmh;
        if band <= 0.0 {
            return self.clamp_speed(base_kmh);
        }
        let speed = base_kmh + self.rng.gen_range(-band / 2.0..=band / 2.0);
        self.clamp_speed(speed)
    }

    fn clamp_speed(&self, speed: f64) -> f64 {
        speed.clamp(self.config.min_speed_kmh, self.config.max_speed_kmh)
    }

    fn jitter(&mut self, point: GeoPoint) -> GeoPoint {
        let width = self.config.position_jitter_deg;
        if width <= 0.0 {
            return point;
        }
        let half = width / 2.0;
        point.offset(self.rng.gen_range(-half..=half), self.rng.gen_range(-half..=half))
    }

    fn route_for(&self, vehicle_id: &str, route_id: &str) -> Result<Arc<Route>, Error> {
        self.route(route_id).ok_or_else(|| {
            Error::UnknownRoute(format!("vehicle {vehicle_id} references route {route_id}"))
        })
    }

    fn track(&self, vehicle_id: &str) -> Result<&Track, Error> {
        self.tracks
            .get(vehicle_id)
            .ok_or_else(|| Error::UnknownVehicle(format!("vehicle {vehicle_id} is not tracked")))
    }

    fn track_mut(&mut self, vehicle_id: &str) -> Result<&mut Track, Error> {
        self.tracks
            .get_mut(vehicle_id)
            .ok_or_else(|| Error::UnknownVehicle(format!("vehicle {vehicle_id} is not tracked")))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::model::Stop;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn two_stop_route() -> Route {
        Route::new(
            "r1",
            "Shuttle",
            vec![
                Stop::new("a", "A", GeoPoint::new(0.0, 0.0), 0),
                Stop::new("b", "B", GeoPoint::new(0.0, 1.0), 1),
            ],
        )
        .unwrap()
    }

    fn model(config: Config) -> MotionModel {
        let mut model = MotionModel::new(config);
        model.add_route(two_stop_route());
        model
            .register(
                Registration {
                    vehicle_id: "bus".to_string(),
                    route_id: "r1".to_string(),
                    start_stop_index: 0,
                    base_speed_kmh: 30.0,
                },
                now(),
            )
            .unwrap();
        model
    }

    #[test]
    fn registration_rejects_invalid_config() {
        let config = Config { position_jitter_deg: f64::NAN, ..Config::default() };
        let mut model = MotionModel::new(config);
        model.add_route(two_stop_route());

        let err = model
            .register(
                Registration {
                    vehicle_id: "bus".to_string(),
                    route_id: "r1".to_string(),
                    start_stop_index: 0,
                    base_speed_kmh: 30.0,
                },
                now(),
            )
            .unwrap_err();

        assert_eq!(err.code(), "invalid_config");
        assert!(model.is_empty());
    }

    #[test]
    fn leg_completes_after_inverse_step_ticks() {
        let mut model = model(Config::deterministic());

        for tick in 1..10 {
            let (vehicle, _) = model.advance("bus", now()).unwrap();
            assert_eq!(vehicle.current_stop_index, 0, "tick {tick}");
        }
        let (vehicle, _) = model.advance("bus", now()).unwrap();

        assert_eq!(vehicle.current_stop_index, 1);
        assert_eq!(vehicle.target_stop_index, 0);
        assert!(vehicle.progress.abs() < f64::EPSILON);
        assert_eq!(vehicle.location, GeoPoint::new(0.0, 1.0));
        assert_eq!(vehicle.next_stop.as_deref(), Some("A"));
    }

    #[test]
    fn interpolates_linearly_without_jitter() {
        let mut model = model(Config::deterministic());
        for _ in 0..3 {
            model.advance("bus", now()).unwrap();
        }
        let vehicle = model.vehicle("bus").unwrap();
        assert!((vehicle.location.longitude - 0.3).abs() < 1e-9);
        assert!(vehicle.location.latitude.abs() < 1e-12);
    }

    #[test]
    fn jitter_is_bounded_and_progress_monotonic() {
        let config = Config { rng_seed: Some(7), ..Config::default() };
        let mut model = model(config);

        let mut last_progress = 0.0;
        for _ in 0..9 {
            let (vehicle, _) = model.advance("bus", now()).unwrap();
            assert!(vehicle.progress > last_progress);
            last_progress = vehicle.progress;

            let exact = GeoPoint::new(0.0, 0.0).lerp(GeoPoint::new(0.0, 1.0), vehicle.progress);
            assert!((vehicle.location.latitude - exact.latitude).abs() <= 0.00005 + 1e-12);
            assert!((vehicle.location.longitude - exact.longitude).abs() <= 0.00005 + 1e-12);
            assert!((27.5..=32.5).contains(&vehicle.speed_kmh));
        }
    }

    #[test]
    fn speed_is_clamped_to_band() {
        let mut model = MotionModel::new(Config::deterministic());
        model.add_route(two_stop_route());
        model
            .register(
                Registration {
                    vehicle_id: "racer".to_string(),
                    route_id: "r1".to_string(),
                    start_stop_index: 1,
                    base_speed_kmh: 95.0,
                },
                now(),
            )
            .unwrap();

        let (vehicle, _) = model.advance("racer", now()).unwrap();
        assert!((vehicle.speed_kmh - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn registration_is_validated() {
        let mut model = MotionModel::new(Config::deterministic());
        let registration = Registration {
            vehicle_id: "bus".to_string(),
            route_id: "missing".to_string(),
            start_stop_index: 0,
            base_speed_kmh: 20.0,
        };
        let err = model.register(registration.clone(), now()).unwrap_err();
        assert_eq!(err.code(), "unknown_route");

        model.add_route(two_stop_route());
        let out_of_range =
            Registration { route_id: "r1".to_string(), start_stop_index: 5, ..registration };
        assert_eq!(model.register(out_of_range, now()).unwrap_err().code(), "invalid_route");
        assert!(model.is_empty());
    }

    #[test]
    fn device_report_replaces_position_but_not_progress() {
        let config = Config { snap_radius_km: 0.0, ..Config::deterministic() };
        let mut model = model(config);
        model.advance("bus", now()).unwrap();

        let report = DeviceReport {
            vehicle_id: "bus".to_string(),
            position: GeoPoint::new(0.2, 0.5),
            speed_kmh: Some(17.0),
            captured_at: now() + Duration::seconds(5),
        };
        let (vehicle, _) = model.apply_report(&report).unwrap().unwrap();

        assert_eq!(vehicle.location, GeoPoint::new(0.2, 0.5));
        assert!((vehicle.speed_kmh - 17.0).abs() < f64::EPSILON);
        assert_eq!(vehicle.last_updated, report.captured_at);
        assert_eq!(vehicle.current_stop_index, 0);
        assert!((vehicle.progress - 0.1).abs() < 1e-9);
    }

    #[test]
    fn device_report_near_stop_snaps() {
        let mut model = model(Config::deterministic());
        let report = DeviceReport {
            vehicle_id: "bus".to_string(),
            position: GeoPoint::new(0.0001, 0.9999),
            speed_kmh: Some(12.0),
            captured_at: now(),
        };
        let (vehicle, _) = model.apply_report(&report).unwrap().unwrap();

        assert_eq!(vehicle.current_stop_index, 1);
        assert_eq!(vehicle.target_stop_index, 0);
        assert_eq!(vehicle.current_stop.as_deref(), Some("B"));
    }

    #[test]
    fn device_speed_derived_from_previous_report() {
        let config = Config { snap_radius_km: 0.0, ..Config::deterministic() };
        let mut model = model(config);

        let first = DeviceReport {
            vehicle_id: "bus".to_string(),
            position: GeoPoint::new(0.0, 0.1),
            speed_kmh: None,
            captured_at: now(),
        };
        let (vehicle, _) = model.apply_report(&first).unwrap().unwrap();
        assert!((vehicle.speed_kmh - 25.0).abs() < f64::EPSILON, "no history uses fallback");

        let second = DeviceReport {
            position: GeoPoint::new(0.0, 0.11),
            captured_at: now() + Duration::seconds(120),
            ..first
        };
        let (vehicle, _) = model.apply_report(&second).unwrap().unwrap();
        assert!((vehicle.speed_kmh - 33.36).abs() < 0.1, "got {}", vehicle.speed_kmh);

        let glitch = DeviceReport {
            position: GeoPoint::new(0.0, 5.0),
            captured_at: now() + Duration::seconds(180),
            ..second
        };
        let (vehicle, _) = model.apply_report(&glitch).unwrap().unwrap();
        assert!((vehicle.speed_kmh - 33.36).abs() < 0.1, "averaged {}", vehicle.speed_kmh);
    }

    #[test]
    fn stale_report_is_ignored_and_inactive_vehicle_revives() {
        let mut model = model(Config::deterministic());
        model.set_active("bus", false).unwrap();

        let late = DeviceReport {
            vehicle_id: "bus".to_string(),
            position: GeoPoint::new(0.0, 0.5),
            speed_kmh: Some(20.0),
            captured_at: now() - Duration::seconds(30),
        };
        assert!(model.apply_report(&late).unwrap().is_none());

        let fresh = DeviceReport { captured_at: now() + Duration::seconds(30), ..late };
        let (vehicle, _) = model.apply_report(&fresh).unwrap().unwrap();
        assert!(vehicle.active);
        assert_eq!(model.active_ids(), vec!["bus".to_string()]);
    }

    #[test]
    fn report_for_unknown_vehicle_fails() {
        let mut model = model(Config::deterministic());
        let report = DeviceReport {
            vehicle_id: "ghost".to_string(),
            position: GeoPoint::new(0.0, 0.0),
            speed_kmh: None,
            captured_at: now(),
        };
        assert_eq!(model.apply_report(&report).unwrap_err().code(), "unknown_vehicle");
    }
}
