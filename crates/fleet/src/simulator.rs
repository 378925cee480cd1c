//! # Simulator
//!
//! The owned fleet controller. Holds the motion model, drives it on a tick,
//! writes every change to the store and falls back to the replay queue when
//! the store is unreachable.
//!
//! Store writes for different vehicles run concurrently within a tick. Writes
//! for a vehicle that still has queued operations are queued behind them so
//! per-vehicle order is preserved across outages.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::Error;
use crate::eta::{self, Arrival, EtaEstimator};
use crate::model::{DeviceReport, EtaRecord, Route, Vehicle, VehiclePatch, VehicleSummary};
use crate::motion::{MotionModel, Registration};
use crate::replay::OfflineQueue;
use crate::store::FleetStore;

/// Where a vehicle write ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Stored,
    Queued,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub running: bool,
    pub vehicle_count: usize,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub stored: usize,
    pub queued: usize,
    pub failed: usize,
    /// Vehicles that could not be advanced.
    pub skipped: usize,
    pub etas: usize,
}

struct TickTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Simulator<S, C> {
    config: Config,
    store: Arc<S>,
    clock: Arc<C>,
    queue: OfflineQueue,
    estimator: EtaEstimator,
    model: Mutex<MotionModel>,
    task: Mutex<Option<TickTask>>,
}

impl<S, C> Simulator<S, C>
where
    S: FleetStore,
    C: Clock + 'static,
{
    #[must_use]
    pub fn new(config: Config, store: Arc<S>, clock: Arc<C>) -> Self {
        let queue_clock: Arc<dyn Clock> = Arc::clone(&clock) as Arc<dyn Clock>;
        let queue = OfflineQueue::from_config(&config, queue_clock);
        Self {
            estimator: EtaEstimator::from_config(&config),
            model: Mutex::new(MotionModel::new(config.clone())),
            task: Mutex::new(None),
            config,
            store,
            clock,
            queue,
        }
    }

    /// Handle to the queue holding writes made while the store was down.
    #[must_use]
    pub const fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn add_route(&self, route: Route) {
        self.model().add_route(route);
    }

    /// Starts tracking a vehicle and writes its initial document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRoute`] or [`Error::InvalidRoute`] when the
    /// registration does not fit a loaded route. Nothing is written then.
    pub async fn register(&self, registration: Registration) -> Result<Vehicle, Error> {
        let now = self.clock.now_utc();
        let vehicle = self.model().register(registration, now)?;
        let route = self.model().route(&vehicle.route_id);

        info!(vehicle_id = %vehicle.id, route_id = %vehicle.route_id, "vehicle registered");
        if let Some(route) = route {
            self.publish(&vehicle, &route, now).await;
        }
        Ok(vehicle)
    }

    /// Stops tracking a vehicle, marking it inactive in the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownVehicle`] if the vehicle is not tracked.
    pub async fn retire(&self, vehicle_id: &str) -> Result<Delivery, Error> {
        let now = self.clock.now_utc();
        self.model()
            .deregister(vehicle_id)
            .ok_or_else(|| Error::UnknownVehicle(format!("vehicle {vehicle_id} is not tracked")))?;
        info!(vehicle_id, "vehicle retired");
        Ok(self.persist(vehicle_id, VehiclePatch::deactivate(now)).await)
    }

    /// Applies a device position report and publishes the result.
    ///
    /// Returns `None` when the report was older than the vehicle's state and
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownVehicle`] for untracked vehicles and
    /// [`Error::InvalidFormat`] for unusable coordinates.
    pub async fn report(&self, report: DeviceReport) -> Result<Option<Vehicle>, Error> {
        let now = self.clock.now_utc();
        let applied = self.model().apply_report(&report)?;
        let Some((vehicle, route)) = applied else {
            return Ok(None);
        };
        self.publish(&vehicle, &route, now).await;
        Ok(Some(vehicle))
    }

    /// Advances every active vehicle one step and writes the results.
    pub async fn tick(&self) -> TickReport {
        let now = self.clock.now_utc();
        let mut report = TickReport::default();

        let moved: Vec<(Vehicle, Arc<Route>)> = {
            let mut model = self.model();
            let ids = model.active_ids();
            ids.iter()
                .filter_map(|id| match model.advance(id, now) {
                    Ok(moved) => Some(moved),
                    Err(err) => {
                        warn!(vehicle_id = %id, error = %err, "skipping vehicle this tick");
                        report.skipped += 1;
                        None
                    }
                })
                .collect()
        };

        let outcomes =
            join_all(moved.iter().map(|(vehicle, route)| self.publish(vehicle, route, now))).await;
        for (delivery, etas) in outcomes {
            match delivery {
                Delivery::Stored => report.stored += 1,
                Delivery::Queued => report.queued += 1,
                Delivery::Failed => report.failed += 1,
            }
            report.etas += etas;
        }

        debug!(
            monotonic_counter.ticks = 1,
            stored = report.stored,
            queued = report.queued,
            skipped = report.skipped,
            "tick complete"
        );
        report
    }

    /// Starts ticking on the configured interval. The first tick runs
    /// immediately. Returns `false` if already running.
    ///
    /// The tick task holds only a weak reference; dropping the last
    /// `Arc<Simulator>` ends it.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut slot = self.task_slot();
        if slot.is_some() {
            return false;
        }

        let (stop, mut stopped) = oneshot::channel();
        let simulator: Weak<Self> = Arc::downgrade(self);
        let period = self.config.tick_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stopped => break,
                    _ = interval.tick() => {
                        let Some(simulator) = simulator.upgrade() else {
                            break;
                        };
                        simulator.tick().await;
                    }
                }
            }
        });

        *slot = Some(TickTask { stop, handle });
        info!(interval = ?period, "simulation started");
        true
    }

    /// Stops ticking and marks every active vehicle inactive.
    ///
    /// Once this returns no further tick runs. Calling it again only
    /// re-issues deactivation for vehicles that became active since.
    pub async fn stop(&self) -> Vec<(String, Delivery)> {
        let task = self.task_slot().take();
        if let Some(task) = task {
            // the receiver is gone only if the task already ended
            let _ = task.stop.send(());
            if let Err(err) = task.handle.await {
                warn!(error = %err, "tick task ended abnormally");
            }
        }

        let now = self.clock.now_utc();
        let ids = {
            let mut model = self.model();
            let ids = model.active_ids();
            for id in &ids {
                if let Err(err) = model.set_active(id, false) {
                    warn!(vehicle_id = %id, error = %err, "could not deactivate vehicle");
                }
            }
            ids
        };

        let deliveries =
            join_all(ids.iter().map(|id| self.persist(id, VehiclePatch::deactivate(now)))).await;
        info!(vehicles = ids.len(), "simulation stopped");
        ids.into_iter().zip(deliveries).collect()
    }

    #[must_use]
    pub fn status(&self) -> Status {
        Status {
            running: self.task_slot().as_ref().is_some_and(|task| !task.handle.is_finished()),
            vehicle_count: self.model().len(),
        }
    }

    /// Current state of every tracked vehicle, ordered by id.
    #[must_use]
    pub fn vehicles(&self) -> Vec<VehicleSummary> {
        self.model().vehicles().map(Vehicle::summary).collect()
    }

    #[must_use]
    pub fn vehicle(&self, vehicle_id: &str) -> Option<Vehicle> {
        self.model().vehicle(vehicle_id).cloned()
    }

    /// Upcoming arrivals at a stop, soonest first.
    ///
    /// # Errors
    ///
    /// Returns the store error if ETA records cannot be read.
    pub async fn ranked_etas_for_stop(
        &self, stop_id: &str, limit: usize,
    ) -> anyhow::Result<Vec<EtaRecord>> {
        let now = self.clock.now_utc();
        eta::ranked_etas_for_stop(self.store.as_ref(), stop_id, now, limit).await
    }

    /// Upcoming arrivals at a stop, rendered in the clock's timezone.
    ///
    /// # Errors
    ///
    /// Returns the store error if ETA records cannot be read.
    pub async fn arrival_board(&self, stop_id: &str, limit: usize) -> anyhow::Result<Vec<Arrival>> {
        let now = self.clock.now_utc();
        let ranked = eta::ranked_etas_for_stop(self.store.as_ref(), stop_id, now, limit).await?;
        Ok(eta::arrivals(&ranked, now, self.clock.timezone()))
    }

    async fn publish(
        &self, vehicle: &Vehicle, route: &Route, now: DateTime<Utc>,
    ) -> (Delivery, usize) {
        let delivery = self.persist(&vehicle.id, vehicle.to_patch()).await;
        if delivery != Delivery::Stored {
            return (delivery, 0);
        }

        let records = match self.estimator.estimate(vehicle, route, now) {
            Ok(records) => records,
            Err(err) => {
                warn!(vehicle_id = %vehicle.id, error = %err, "cannot estimate arrivals");
                return (delivery, 0);
            }
        };

        let results = join_all(records.iter().map(|record| self.store.append_eta(record))).await;
        let mut written = 0;
        for (record, result) in records.iter().zip(results) {
            match result {
                Ok(()) => written += 1,
                Err(err) => warn!(
                    vehicle_id = %vehicle.id,
                    stop_id = %record.stop_id,
                    error = %err,
                    "eta not recorded"
                ),
            }
        }
        (delivery, written)
    }

    /// Writes a vehicle patch, queueing it if the store is unreachable or
    /// the vehicle already has writes waiting.
    async fn persist(&self, vehicle_id: &str, patch: VehiclePatch) -> Delivery {
        if self.queue.has_pending(vehicle_id) {
            self.queue.enqueue_upsert(Arc::clone(&self.store), vehicle_id, patch);
            return Delivery::Queued;
        }

        match self.store.upsert_vehicle(vehicle_id, &patch).await {
            Ok(()) => Delivery::Stored,
            Err(err) if Error::is_transient_anyhow(&err) => {
                debug!(vehicle_id, error = %err, "store unreachable; queueing write");
                self.queue.enqueue_upsert(Arc::clone(&self.store), vehicle_id, patch);
                Delivery::Queued
            }
            Err(err) => {
                warn!(vehicle_id, error = %err, "vehicle write failed");
                Delivery::Failed
            }
        }
    }

    fn model(&self) -> MutexGuard<'_, MotionModel> {
        self.model.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<TickTask>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
