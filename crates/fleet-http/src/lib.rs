//! # Fleet HTTP
//!
//! Networked implementation of [`fleet::FleetStore`] backed by a JSON
//! document API. Requests go through a host-provided [`HttpRequest`] client so
//! the store can be exercised without a network.

mod config;
mod provider;
mod store;

pub use self::config::StoreConfig;
pub use self::provider::HttpRequest;
pub use self::store::HttpStore;
