//! # Fleet Errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Domain level error type returned by the fleet core.
#[derive(Error, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    /// Route data breaks a structural invariant (stop count, sequencing).
    #[error("code: invalid_route, description: {0}")]
    InvalidRoute(String),

    /// The referenced route is not known to the motion model.
    #[error("code: unknown_route, description: {0}")]
    UnknownRoute(String),

    /// The referenced vehicle is not tracked.
    #[error("code: unknown_vehicle, description: {0}")]
    UnknownVehicle(String),

    /// A configuration value is out of range.
    #[error("code: invalid_config, description: {0}")]
    InvalidConfig(String),

    /// The store (or the network in front of it) could not be reached.
    #[error("code: unavailable, description: {0}")]
    Unavailable(String),

    /// A payload could not be encoded or decoded.
    #[error("code: invalid_format, description: {0}")]
    InvalidFormat(String),

    /// Any other failure.
    #[error("code: server_error, description: {0}")]
    ServerError(String),
}

impl Error {
    /// Returns the error code.
    #[must_use]
    pub const fn code(&self) -> &str {
        match self {
            Self::InvalidRoute(_) => "invalid_route",
            Self::UnknownRoute(_) => "unknown_route",
            Self::UnknownVehicle(_) => "unknown_vehicle",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Unavailable(_) => "unavailable",
            Self::InvalidFormat(_) => "invalid_format",
            Self::ServerError(_) => "server_error",
        }
    }

    /// Returns the error description.
    #[must_use]
    pub fn description(&self) -> String {
        self.to_string()
    }

    /// Whether the failure is worth retrying once connectivity returns.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Classifies a collaborator error, looking through any added context.
    #[must_use]
    pub fn is_transient_anyhow(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| cause.downcast_ref::<Self>().is_some_and(Self::is_transient))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<Self>() {
            Some(Self::InvalidRoute(e)) => Self::InvalidRoute(format!("{err}: {e}")),
            Some(Self::UnknownRoute(e)) => Self::UnknownRoute(format!("{err}: {e}")),
            Some(Self::UnknownVehicle(e)) => Self::UnknownVehicle(format!("{err}: {e}")),
            Some(Self::InvalidConfig(e)) => Self::InvalidConfig(format!("{err}: {e}")),
            Some(Self::Unavailable(e)) => Self::Unavailable(format!("{err}: {e}")),
            Some(Self::InvalidFormat(e)) => Self::InvalidFormat(format!("{err}: {e}")),
            Some(Self::ServerError(e)) => Self::ServerError(format!("{err}: {e}")),
            None => {
                let stack = err.chain().fold(String::new(), |cause, e| format!("{cause} -> {e}"));
                let stack = stack.trim_start_matches(" -> ").to_string();
                Self::ServerError(stack)
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidFormat(err.to_string())
    }
}
