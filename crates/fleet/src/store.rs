//! # Store
//!
//! The persistence collaborator, seen by the core as a key-value
//! read/write/subscribe interface. The store is the system of record for
//! vehicle and ETA state; writes are last-write-wins per field.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::error::Error;
use crate::model::{EtaRecord, Vehicle, VehiclePatch};

/// Receives the full active-vehicle list whenever it changes.
pub type VehicleCallback = Arc<dyn Fn(Vec<Vehicle>) + Send + Sync>;

/// Store-side filters used by the sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleQuery {
    /// Active vehicles whose last report is strictly before the cutoff.
    SilentVehicles { last_report_before: DateTime<Utc> },
    /// ETA records computed strictly before the cutoff.
    ExpiredEtas { computed_before: DateTime<Utc> },
}

/// Outcome of a batched write. Items in `failed` were not applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub applied: usize,
    pub failed: Vec<String>,
}

impl BatchReport {
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[async_trait]
pub trait FleetStore: Send + Sync + 'static {
    /// Merges `patch` into the vehicle document `id`, creating it when the
    /// patch carries every required field.
    async fn upsert_vehicle(&self, id: &str, patch: &VehiclePatch) -> Result<()>;

    /// Every vehicle document, active or not.
    async fn vehicles(&self) -> Result<Vec<Vehicle>>;

    /// Registers `callback` for active-vehicle list changes. The callback is
    /// invoked once with the current list. Dropping the handle unsubscribes.
    fn subscribe_active_vehicles(&self, callback: VehicleCallback) -> Subscription;

    /// Document ids matching `query`.
    async fn query_stale(&self, query: &StaleQuery) -> Result<Vec<String>>;

    /// Applies vehicle patches as one batch.
    async fn batch_update(&self, updates: &[(String, VehiclePatch)]) -> Result<BatchReport>;

    /// Deletes ETA records as one batch.
    async fn batch_delete(&self, eta_ids: &[String]) -> Result<BatchReport>;

    async fn append_eta(&self, record: &EtaRecord) -> Result<()>;

    /// Every live ETA record for a stop, in no particular order.
    async fn etas_for_stop(&self, stop_id: &str) -> Result<Vec<EtaRecord>>;
}

/// Handle returned by [`FleetStore::subscribe_active_vehicles`].
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { cancel: Some(Box::new(cancel)) }
    }

    /// Stops further callbacks.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("active", &self.cancel.is_some()).finish()
    }
}

/// In-process store used for demos and tests.
///
/// Can be switched offline to emulate an unreachable backend, and told to
/// reject writes for particular documents to emulate partial batch failures.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    vehicles: DashMap<String, Vehicle>,
    etas: DashMap<String, EtaRecord>,
    subscribers: Arc<DashMap<u64, VehicleCallback>>,
    next_subscriber: AtomicU64,
    offline: AtomicBool,
    rejected: RwLock<HashSet<String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with [`Error::Unavailable`].
    pub fn set_online(&self, online: bool) {
        self.inner.offline.store(!online, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        !self.inner.offline.load(Ordering::SeqCst)
    }

    /// Writes touching document `id` fail with a non-transient error.
    pub fn reject(&self, id: impl Into<String>) {
        if let Ok(mut rejected) = self.inner.rejected.write() {
            rejected.insert(id.into());
        }
    }

    pub fn clear_rejections(&self) {
        if let Ok(mut rejected) = self.inner.rejected.write() {
            rejected.clear();
        }
    }

    #[must_use]
    pub fn vehicle(&self, id: &str) -> Option<Vehicle> {
        self.inner.vehicles.get(id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn eta_count(&self) -> usize {
        self.inner.etas.len()
    }

    #[must_use]
    pub fn etas(&self) -> Vec<EtaRecord> {
        self.inner.etas.iter().map(|entry| entry.value().clone()).collect()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(Error::Unavailable("memory store is offline".to_string()).into())
        }
    }

    fn is_rejected(&self, id: &str) -> bool {
        self.inner.rejected.read().is_ok_and(|rejected| rejected.contains(id))
    }

    fn active_vehicles(&self) -> Vec<Vehicle> {
        let mut active: Vec<Vehicle> = self
            .inner
            .vehicles
            .iter()
            .filter(|entry| entry.value().active)
            .map(|entry| entry.value().clone())
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    fn notify(&self) {
        let callbacks: Vec<VehicleCallback> =
            self.inner.subscribers.iter().map(|entry| Arc::clone(entry.value())).collect();
        if callbacks.is_empty() {
            return;
        }
        let active = self.active_vehicles();
        for callback in callbacks {
            callback(active.clone());
        }
    }

    fn write_vehicle(&self, id: &str, patch: &VehiclePatch) -> Result<()> {
        if self.is_rejected(id) {
            return Err(anyhow!("write to vehicle {id} rejected"));
        }

        if let Some(mut existing) = self.inner.vehicles.get_mut(id) {
            existing.apply(patch);
            return Ok(());
        }

        let vehicle = Vehicle::from_patch(id, patch)
            .ok_or_else(|| Error::UnknownVehicle(format!("vehicle {id} does not exist")))?;
        self.inner.vehicles.insert(id.to_string(), vehicle);
        Ok(())
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("vehicles", &self.inner.vehicles.len())
            .field("etas", &self.inner.etas.len())
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl FleetStore for MemoryStore {
    async fn upsert_vehicle(&self, id: &str, patch: &VehiclePatch) -> Result<()> {
        self.ensure_online()?;
        self.write_vehicle(id, patch)?;
        self.notify();
        Ok(())
    }

    async fn vehicles(&self) -> Result<Vec<Vehicle>> {
        self.ensure_online()?;
        let mut vehicles: Vec<Vehicle> =
            self.inner.vehicles.iter().map(|entry| entry.value().clone()).collect();
        vehicles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(vehicles)
    }

    fn subscribe_active_vehicles(&self, callback: VehicleCallback) -> Subscription {
        let key = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        callback(self.active_vehicles());
        self.inner.subscribers.insert(key, callback);
        debug!(subscriber = key, "active vehicle subscription added");

        let subscribers = Arc::clone(&self.inner.subscribers);
        Subscription::new(move || {
            subscribers.remove(&key);
        })
    }

    async fn query_stale(&self, query: &StaleQuery) -> Result<Vec<String>> {
        self.ensure_online()?;
        let mut ids: Vec<String> = match *query {
            StaleQuery::SilentVehicles { last_report_before } => self
                .inner
                .vehicles
                .iter()
                .filter(|entry| entry.active && entry.last_updated < last_report_before)
                .map(|entry| entry.key().clone())
                .collect(),
            StaleQuery::ExpiredEtas { computed_before } => self
                .inner
                .etas
                .iter()
                .filter(|entry| entry.computed_at < computed_before)
                .map(|entry| entry.key().clone())
                .collect(),
        };
        ids.sort();
        Ok(ids)
    }

    async fn batch_update(&self, updates: &[(String, VehiclePatch)]) -> Result<BatchReport> {
        self.ensure_online()?;
        let mut report = BatchReport::default();
        for (id, patch) in updates {
            match self.write_vehicle(id, patch) {
                Ok(()) => report.applied += 1,
                Err(_) => report.failed.push(id.clone()),
            }
        }
        if report.applied > 0 {
            self.notify();
        }
        Ok(report)
    }

    async fn batch_delete(&self, eta_ids: &[String]) -> Result<BatchReport> {
        self.ensure_online()?;
        let mut report = BatchReport::default();
        for id in eta_ids {
            if self.is_rejected(id) || self.inner.etas.remove(id).is_none() {
                report.failed.push(id.clone());
            } else {
                report.applied += 1;
            }
        }
        Ok(report)
    }

    async fn append_eta(&self, record: &EtaRecord) -> Result<()> {
        self.ensure_online()?;
        if self.is_rejected(&record.vehicle_id) {
            return Err(anyhow!("eta for vehicle {} rejected", record.vehicle_id));
        }
        self.inner.etas.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn etas_for_stop(&self, stop_id: &str) -> Result<Vec<EtaRecord>> {
        self.ensure_online()?;
        Ok(self
            .inner
            .etas
            .iter()
            .filter(|entry| entry.stop_id == stop_id)
            .map(|entry| entry.value().clone())
            .collect())
    }
}
