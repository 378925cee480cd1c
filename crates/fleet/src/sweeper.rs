//! # Staleness Sweeper
//!
//! Two periodic housekeeping jobs against the store:
//!
//! - the liveness sweep flags vehicles that have stopped reporting as inactive;
//! - the retention sweep deletes ETA records older than the retention window.
//!
//! Both are idempotent. Failures are logged and never stop the schedule.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::model::VehiclePatch;
use crate::store::{FleetStore, StaleQuery};

/// Most mutations the store accepts in one batch.
pub const BATCH_LIMIT: usize = 500;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Documents the stale query returned.
    pub matched: usize,
    pub applied: usize,
    /// Documents whose mutation failed, including whole failed batches.
    pub failed: Vec<String>,
}

pub struct Sweeper<S, C> {
    config: Config,
    store: Arc<S>,
    clock: Arc<C>,
}

impl<S, C> Sweeper<S, C>
where
    S: FleetStore,
    C: Clock + 'static,
{
    #[must_use]
    pub const fn new(config: Config, store: Arc<S>, clock: Arc<C>) -> Self {
        Self { config, store, clock }
    }

    /// Marks vehicles silent for longer than the liveness threshold inactive.
    pub async fn sweep_vehicles(&self) -> SweepReport {
        let now = self.clock.now_utc();
        let cutoff = cutoff(now, self.config.liveness_threshold);
        let query = StaleQuery::SilentVehicles { last_report_before: cutoff };

        let ids = match self.store.query_stale(&query).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, cutoff = %cutoff, "liveness sweep query failed");
                return SweepReport::default();
            }
        };

        let mut report = SweepReport { matched: ids.len(), ..SweepReport::default() };
        for chunk in ids.chunks(BATCH_LIMIT) {
            let updates: Vec<(String, VehiclePatch)> =
                chunk.iter().map(|id| (id.clone(), VehiclePatch::deactivate(now))).collect();
            match self.store.batch_update(&updates).await {
                Ok(batch) => {
                    report.applied += batch.applied;
                    report.failed.extend(batch.failed);
                }
                Err(err) => {
                    warn!(error = %err, size = chunk.len(), "liveness batch failed");
                    report.failed.extend(chunk.iter().cloned());
                }
            }
        }

        if !report.failed.is_empty() {
            warn!(failed = ?report.failed, "liveness sweep left vehicles active");
        }
        info!(
            monotonic_counter.vehicles_deactivated = report.applied,
            matched = report.matched,
            "liveness sweep complete"
        );
        report
    }

    /// Deletes ETA records computed before the retention window.
    pub async fn sweep_etas(&self) -> SweepReport {
        let now = self.clock.now_utc();
        let cutoff = cutoff(now, self.config.eta_retention);
        let query = StaleQuery::ExpiredEtas { computed_before: cutoff };

        let ids = match self.store.query_stale(&query).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, cutoff = %cutoff, "retention sweep query failed");
                return SweepReport::default();
            }
        };

        let mut report = SweepReport { matched: ids.len(), ..SweepReport::default() };
        for chunk in ids.chunks(BATCH_LIMIT) {
            match self.store.batch_delete(chunk).await {
                Ok(batch) => {
                    report.applied += batch.applied;
                    report.failed.extend(batch.failed);
                }
                Err(err) => {
                    warn!(error = %err, size = chunk.len(), "retention batch failed");
                    report.failed.extend(chunk.iter().cloned());
                }
            }
        }

        if !report.failed.is_empty() {
            warn!(failed = report.failed.len(), "retention sweep left expired records");
        }
        info!(
            monotonic_counter.etas_deleted = report.applied,
            matched = report.matched,
            "retention sweep complete"
        );
        report
    }

    /// Runs both sweeps on their intervals until `shutdown` turns true or
    /// its sender is dropped. The first sweep of each kind happens one
    /// interval after start.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut liveness = schedule(self.config.liveness_sweep_interval);
        let mut retention = schedule(self.config.eta_sweep_interval);
        debug!("sweeper started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = liveness.tick() => {
                    self.sweep_vehicles().await;
                }
                _ = retention.tick() => {
                    self.sweep_etas().await;
                }
            }
        }
        debug!("sweeper stopped");
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age).map_or(DateTime::<Utc>::MIN_UTC, |age| now - age)
}

fn schedule(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
