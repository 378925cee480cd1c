//! # Bus Tracker
//!
//! Process runtime for the fleet core. Seeds the demo fleet, drives the
//! simulation tick and the two housekeeping sweeps, and flushes queued store
//! writes whenever the store becomes reachable again.

mod http;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet::{
    Clock, Config, FleetStore, OfflineQueue, Simulator, Sweeper, SystemClock, demo,
    flush_on_reconnect,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub use self::http::ReqwestClient;

/// Adds the demo routes and registers the demo buses.
///
/// # Errors
///
/// Returns an error if a demo bus does not fit its route.
pub async fn seed_demo<S, C>(simulator: &Simulator<S, C>) -> Result<()>
where
    S: FleetStore,
    C: Clock + 'static,
{
    for route in demo::routes().context("loading demo routes")? {
        simulator.add_route(route);
    }
    for bus in demo::buses() {
        let vehicle_id = bus.vehicle_id.clone();
        simulator.register(bus).await.with_context(|| format!("registering {vehicle_id}"))?;
    }
    info!(vehicles = simulator.status().vehicle_count, "demo fleet seeded");
    Ok(())
}

/// Owns the simulator and every background task around it.
pub struct Runtime<S: FleetStore> {
    config: Config,
    simulator: Arc<Simulator<S, SystemClock>>,
    sweeper: Arc<Sweeper<S, SystemClock>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: FleetStore> Runtime<S> {
    #[must_use]
    pub fn new(config: Config, store: Arc<S>) -> Self {
        let clock = Arc::new(SystemClock::from_config(&config));
        let simulator =
            Arc::new(Simulator::new(config.clone(), Arc::clone(&store), Arc::clone(&clock)));
        let sweeper = Arc::new(Sweeper::new(config.clone(), store, clock));
        let (shutdown, _) = watch::channel(false);
        Self { config, simulator, sweeper, shutdown, tasks: Vec::new() }
    }

    #[must_use]
    pub const fn simulator(&self) -> &Arc<Simulator<S, SystemClock>> {
        &self.simulator
    }

    /// Seeds the demo fleet and starts the tick, sweeps and replay.
    ///
    /// # Errors
    ///
    /// Returns an error if the demo fleet cannot be registered.
    pub async fn start(&mut self) -> Result<()> {
        seed_demo(&self.simulator).await?;

        let (online, online_rx) = watch::channel(true);
        let queue = self.simulator.queue().clone();
        self.tasks.push(tokio::spawn(flush_on_reconnect(queue, online_rx)));
        self.tasks.push(tokio::spawn(monitor_connectivity(
            Arc::clone(self.simulator.store()),
            self.simulator.queue().clone(),
            online,
            self.config.tick_interval,
            self.shutdown.subscribe(),
        )));
        self.tasks.push(tokio::spawn(Arc::clone(&self.sweeper).run(self.shutdown.subscribe())));

        self.simulator.start();
        Ok(())
    }

    /// Stops the simulation, marks the fleet inactive and ends every task.
    pub async fn shutdown(self) {
        self.simulator.stop().await;
        self.shutdown.send_replace(true);
        for task in self.tasks {
            task.abort();
            if let Err(err) = task.await
                && !err.is_cancelled()
            {
                warn!(error = %err, "background task failed");
            }
        }

        let queue = self.simulator.queue();
        if !queue.is_empty() {
            queue.flush().await;
        }
        if !queue.is_empty() {
            warn!(unsent = queue.len(), "exiting with unsent store writes");
        }
        info!("runtime stopped");
    }
}

/// Publishes store reachability while writes are queued.
///
/// Queued writes mean an outage was seen, so the flag drops to offline; it
/// returns to online as soon as a check read succeeds, which triggers a
/// flush.
pub async fn monitor_connectivity<S>(
    store: Arc<S>, queue: OfflineQueue, online: watch::Sender<bool>, period: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    S: FleetStore,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                if queue.is_empty() {
                    continue;
                }
                online.send_if_modified(|state| std::mem::replace(state, false));
                match store.vehicles().await {
                    Ok(_) => {
                        debug!(queued = queue.len(), "store reachable");
                        online.send_replace(true);
                    }
                    Err(err) => debug!(error = %err, "store still unreachable"),
                }
            }
        }
    }
}
