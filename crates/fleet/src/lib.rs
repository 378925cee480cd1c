//! # Fleet
//!
//! Position tracking and ETA estimation core for city bus fleets. Ingests
//! periodic position reports (from devices or the built-in simulator),
//! advances each vehicle along its route, derives arrival estimates for
//! upcoming stops, retires stale vehicles, and buffers store mutations while
//! the store is unreachable.

pub mod clock;
pub mod config;
pub mod demo;
pub mod eta;
pub mod geo;
pub mod model;
pub mod motion;
pub mod replay;
pub mod simulator;
pub mod store;
pub mod sweeper;

mod error;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::config::{Config, ReplayPolicy};
pub use self::error::Error;
pub use self::eta::{Arrival, EtaEstimator, format_eta, ranked_etas_for_stop};
pub use self::geo::GeoPoint;
pub use self::model::*;
pub use self::motion::{MotionModel, Registration};
pub use self::replay::{FlushReport, OfflineQueue, Operation, flush_on_reconnect};
pub use self::simulator::{Delivery, Simulator, Status, TickReport};
pub use self::store::{
    BatchReport, FleetStore, MemoryStore, StaleQuery, Subscription, VehicleCallback,
};
pub use self::sweeper::{SweepReport, Sweeper};

