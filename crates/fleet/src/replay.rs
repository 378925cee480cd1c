//! # Offline Replay Queue
//!
//! Buffers store mutations that could not be delivered and replays them when
//! connectivity returns.
//!
//! Operations are kept in submission order. A flush replays each vehicle's
//! operations strictly in order while different vehicles replay
//! concurrently. One failing operation never aborts the flush: under
//! [`ReplayPolicy::SkipAndContinue`] it is dropped, under
//! [`ReplayPolicy::HaltVehicle`] it stays queued together with everything
//! behind it for the same vehicle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, join_all};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{Config, ReplayPolicy};
use crate::model::VehiclePatch;
use crate::store::FleetStore;

/// A replayable store mutation. It may be invoked more than once when the
/// queue holds failed operations for a later flush.
pub type Operation = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Upper bound on back-to-back passes within one flush.
pub const MAX_FLUSH_PASSES: usize = 4;

struct Queued {
    vehicle_id: String,
    label: String,
    enqueued_at: DateTime<Utc>,
    operation: Operation,
}

/// An operation that failed during a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayFailure {
    pub vehicle_id: String,
    pub label: String,
    pub error: String,
}

/// Outcome of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    /// Failed operations, whether dropped or retained.
    pub failures: Vec<ReplayFailure>,
    /// Operations left queued for the next flush.
    pub retained: usize,
    /// Operations discarded for exceeding the maximum queue age.
    pub expired: usize,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Queued>,
    replaying: HashSet<String>,
}

/// Shared handle to the replay queue. Clones see the same queue.
#[derive(Clone)]
pub struct OfflineQueue {
    state: Arc<Mutex<QueueState>>,
    flush_lock: Arc<tokio::sync::Mutex<()>>,
    clock: Arc<dyn Clock>,
    policy: ReplayPolicy,
    max_age: Duration,
}

impl OfflineQueue {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, policy: ReplayPolicy, max_age: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            flush_lock: Arc::new(tokio::sync::Mutex::new(())),
            clock,
            policy,
            max_age,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Self {
        Self::new(clock, config.replay_policy, config.queue_max_age)
    }

    #[must_use]
    pub const fn policy(&self) -> ReplayPolicy {
        self.policy
    }

    /// Appends an operation for `vehicle_id`. Never fails.
    pub fn enqueue(
        &self, vehicle_id: impl Into<String>, label: impl Into<String>, operation: Operation,
    ) {
        let queued = Queued {
            vehicle_id: vehicle_id.into(),
            label: label.into(),
            enqueued_at: self.clock.now_utc(),
            operation,
        };
        debug!(vehicle_id = %queued.vehicle_id, label = %queued.label, "operation queued");
        self.state().pending.push_back(queued);
    }

    /// Queues a vehicle upsert against `store`.
    pub fn enqueue_upsert<S>(&self, store: Arc<S>, vehicle_id: &str, patch: VehiclePatch)
    where
        S: FleetStore + ?Sized,
    {
        let id = vehicle_id.to_string();
        let operation: Operation = Arc::new(move || -> BoxFuture<'static, anyhow::Result<()>> {
            let store = Arc::clone(&store);
            let id = id.clone();
            let patch = patch.clone();
            Box::pin(async move { store.upsert_vehicle(&id, &patch).await })
        });
        self.enqueue(vehicle_id, "upsert_vehicle", operation);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state().pending.is_empty()
    }

    /// Whether `vehicle_id` has operations queued or being replayed. New
    /// writes for such a vehicle must be queued behind them.
    #[must_use]
    pub fn has_pending(&self, vehicle_id: &str) -> bool {
        let state = self.state();
        state.replaying.contains(vehicle_id)
            || state.pending.iter().any(|queued| queued.vehicle_id == vehicle_id)
    }

    /// Drops every queued operation without running it, returning how many
    /// were discarded.
    pub fn clear(&self) -> usize {
        let mut state = self.state();
        let dropped = state.pending.len();
        state.pending.clear();
        if dropped > 0 {
            warn!(dropped, "replay queue cleared");
        }
        dropped
    }

    /// Replays queued operations.
    ///
    /// Operations queued while a pass is running are picked up by a further
    /// pass, up to [`MAX_FLUSH_PASSES`]. Concurrent calls are serialised.
    pub async fn flush(&self) -> FlushReport {
        let _guard = self.flush_lock.lock().await;
        let mut report = FlushReport::default();

        for pass in 1..=MAX_FLUSH_PASSES {
            let applied_before = report.applied;
            let arrived = self.flush_pass(&mut report).await;
            if arrived == 0 || report.applied == applied_before {
                break;
            }
            debug!(pass, arrived, "operations queued during flush");
        }

        report.retained = self.len();
        info!(
            monotonic_counter.operations_replayed = report.applied,
            failed = report.failures.len(),
            retained = report.retained,
            expired = report.expired,
            "replay queue flushed"
        );
        report
    }

    /// Replays everything currently queued once. Returns how many operations
    /// were queued while the pass ran.
    async fn flush_pass(&self, report: &mut FlushReport) -> usize {
        let now = self.clock.now_utc();
        let max_age = chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::MAX);

        let lanes = {
            let mut state = self.state();
            let drained: Vec<Queued> = state.pending.drain(..).collect();

            let mut order: Vec<String> = Vec::new();
            let mut lanes: HashMap<String, Vec<Queued>> = HashMap::new();
            for queued in drained {
                if now - queued.enqueued_at > max_age {
                    warn!(
                        vehicle_id = %queued.vehicle_id,
                        label = %queued.label,
                        enqueued_at = %queued.enqueued_at,
                        "dropping expired operation"
                    );
                    report.expired += 1;
                    continue;
                }
                if !lanes.contains_key(&queued.vehicle_id) {
                    order.push(queued.vehicle_id.clone());
                }
                lanes.entry(queued.vehicle_id.clone()).or_default().push(queued);
            }
            state.replaying.extend(order.iter().cloned());

            order
                .into_iter()
                .filter_map(|vehicle_id| lanes.remove(&vehicle_id))
                .collect::<Vec<_>>()
        };

        if lanes.is_empty() {
            return 0;
        }
        debug!(lanes = lanes.len(), "flushing replay queue");

        let outcomes = join_all(lanes.into_iter().map(|lane| self.replay_lane(lane))).await;

        let mut retained: Vec<Queued> = Vec::new();
        for outcome in outcomes {
            report.applied += outcome.applied;
            report.failures.extend(outcome.failures);
            retained.extend(outcome.retained);
        }

        let mut state = self.state();
        state.replaying.clear();
        let arrived = state.pending.len();
        retained.sort_by_key(|queued| queued.enqueued_at);
        for queued in retained.into_iter().rev() {
            state.pending.push_front(queued);
        }
        arrived
    }

    async fn replay_lane(&self, lane: Vec<Queued>) -> LaneOutcome {
        let mut outcome = LaneOutcome::default();
        let mut remaining = lane.into_iter();

        while let Some(queued) = remaining.next() {
            match (queued.operation)().await {
                Ok(()) => outcome.applied += 1,
                Err(err) => {
                    warn!(
                        vehicle_id = %queued.vehicle_id,
                        label = %queued.label,
                        error = %err,
                        "replayed operation failed"
                    );
                    outcome.failures.push(ReplayFailure {
                        vehicle_id: queued.vehicle_id.clone(),
                        label: queued.label.clone(),
                        error: format!("{err:#}"),
                    });
                    if self.policy == ReplayPolicy::HaltVehicle {
                        outcome.retained.push(queued);
                        outcome.retained.extend(remaining);
                        break;
                    }
                }
            }
        }
        outcome
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("len", &self.len())
            .field("policy", &self.policy)
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct LaneOutcome {
    applied: usize,
    failures: Vec<ReplayFailure>,
    retained: Vec<Queued>,
}

/// Flushes `queue` whenever `online` is signalled as online while operations
/// are queued. Returns when the sender side is dropped.
///
/// The flag is read as a level, not an edge: a watch channel only keeps the
/// latest value, so an offline signal followed by an online one can arrive as
/// a single wake-up.
pub async fn flush_on_reconnect(queue: OfflineQueue, mut online: watch::Receiver<bool>) {
    let mut was_online = *online.borrow_and_update();
    if was_online && !queue.is_empty() {
        queue.flush().await;
    }

    while online.changed().await.is_ok() {
        let is_online = *online.borrow_and_update();
        if !is_online {
            if was_online {
                info!("connectivity lost; queueing store writes");
            }
        } else if !queue.is_empty() {
            info!(queued = queue.len(), restored = !was_online, "store reachable; replaying queue");
            queue.flush().await;
        }
        was_online = is_online;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::clock::ManualClock;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(log: &Log, name: &str, fail: bool) -> Operation {
        let log = Arc::clone(log);
        let name = name.to_string();
        Arc::new(move || -> BoxFuture<'static, anyhow::Result<()>> {
            let log = Arc::clone(&log);
            let name = name.clone();
            Box::pin(async move {
                if fail {
                    return Err(anyhow!("{name} rejected"));
                }
                log.lock().unwrap().push(name);
                Ok(())
            })
        })
    }

    fn queue(policy: ReplayPolicy) -> (OfflineQueue, ManualClock) {
        let clock = ManualClock::new(now());
        let queue = OfflineQueue::new(Arc::new(clock.clone()), policy, Duration::from_secs(3600));
        (queue, clock)
    }

    #[tokio::test]
    async fn skip_policy_continues_past_failure() {
        let (queue, _) = queue(ReplayPolicy::SkipAndContinue);
        let log = Log::default();
        queue.enqueue("bus", "op1", recording(&log, "op1", false));
        queue.enqueue("bus", "op2", recording(&log, "op2", true));
        queue.enqueue("bus", "op3", recording(&log, "op3", false));

        let report = queue.flush().await;

        assert_eq!(*log.lock().unwrap(), vec!["op1", "op3"]);
        assert_eq!(report.applied, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].label, "op2");
        assert!(report.failures[0].error.contains("op2 rejected"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn halt_policy_keeps_vehicle_backlog() {
        let (queue, _) = queue(ReplayPolicy::HaltVehicle);
        let log = Log::default();
        let flaky = Arc::new(AtomicUsize::new(0));

        let attempts = Arc::clone(&flaky);
        let log_for_op2 = Arc::clone(&log);
        let op2: Operation = Arc::new(move || -> BoxFuture<'static, anyhow::Result<()>> {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            let log = Arc::clone(&log_for_op2);
            Box::pin(async move {
                if attempt == 0 {
                    return Err(anyhow!("store unavailable"));
                }
                log.lock().unwrap().push("a2".to_string());
                Ok(())
            })
        });

        queue.enqueue("a", "a1", recording(&log, "a1", false));
        queue.enqueue("a", "a2", op2);
        queue.enqueue("b", "b1", recording(&log, "b1", false));
        queue.enqueue("a", "a3", recording(&log, "a3", false));

        let first = queue.flush().await;
        assert_eq!(first.applied, 2);
        assert_eq!(first.retained, 2);
        assert!(queue.has_pending("a"));
        assert!(!queue.has_pending("b"));

        let second = queue.flush().await;
        assert_eq!(second.applied, 2);
        assert!(queue.is_empty());

        let log = log.lock().unwrap().clone();
        let a_order: Vec<_> = log.iter().filter(|name| name.starts_with('a')).cloned().collect();
        assert_eq!(a_order, vec!["a1", "a2", "a3"]);
    }

    #[tokio::test]
    async fn expired_operations_are_dropped() {
        let (queue, clock) = queue(ReplayPolicy::SkipAndContinue);
        let log = Log::default();
        queue.enqueue("bus", "old", recording(&log, "old", false));
        clock.advance(chrono::Duration::minutes(90));
        queue.enqueue("bus", "new", recording(&log, "new", false));

        let report = queue.flush().await;

        assert_eq!(report.expired, 1);
        assert_eq!(*log.lock().unwrap(), vec!["new"]);
    }

    #[tokio::test]
    async fn clear_discards_everything() {
        let (queue, _) = queue(ReplayPolicy::SkipAndContinue);
        let log = Log::default();
        queue.enqueue("bus", "op", recording(&log, "op", false));
        queue.enqueue("car", "op", recording(&log, "op", false));

        assert_eq!(queue.clear(), 2);
        assert_eq!(queue.flush().await, FlushReport::default());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconnect_triggers_flush() -> anyhow::Result<()> {
        let (queue, _) = queue(ReplayPolicy::SkipAndContinue);
        let log = Log::default();
        queue.enqueue("bus", "op", recording(&log, "op", false));

        let (online, rx) = watch::channel(false);
        let watcher = tokio::spawn(flush_on_reconnect(queue.clone(), rx));
        tokio::task::yield_now().await;
        assert_eq!(queue.len(), 1);

        online.send(true)?;
        drop(online);
        watcher.await?;

        assert_eq!(*log.lock().unwrap(), vec!["op"]);
        assert!(queue.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn outage_signals_seen_together_still_flush() -> anyhow::Result<()> {
        let (queue, _) = queue(ReplayPolicy::SkipAndContinue);
        let log = Log::default();

        let (online, rx) = watch::channel(true);
        let watcher = tokio::spawn(flush_on_reconnect(queue.clone(), rx));
        tokio::task::yield_now().await;

        queue.enqueue("bus", "op", recording(&log, "op", false));
        online.send(false)?;
        online.send(true)?;
        drop(online);
        watcher.await?;

        assert_eq!(*log.lock().unwrap(), vec!["op"]);
        assert!(queue.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn queue_left_from_before_start_flushes() -> anyhow::Result<()> {
        let (queue, _) = queue(ReplayPolicy::SkipAndContinue);
        let log = Log::default();
        queue.enqueue("bus", "op", recording(&log, "op", false));

        let (online, rx) = watch::channel(true);
        drop(online);
        flush_on_reconnect(queue.clone(), rx).await;

        assert_eq!(*log.lock().unwrap(), vec!["op"]);
        Ok(())
    }
}
