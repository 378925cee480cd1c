//! Time sources. Everything that stamps or compares times reads a [`Clock`]
//! so that tests can drive time explicitly.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::config::Config;

pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
    fn timezone(&self) -> Tz;
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    timezone: Tz,
}

impl SystemClock {
    #[must_use]
    pub const fn from_timezone(timezone: Tz) -> Self {
        Self { timezone }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        match config.timezone.parse::<Tz>() {
            Ok(tz) => Self::from_timezone(tz),
            Err(err) => {
                warn!(
                    timezone = %config.timezone,
                    error = %err,
                    "Invalid timezone; defaulting to UTC"
                );
                Self::from_timezone(chrono_tz::UTC)
            }
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::from_timezone(chrono_tz::UTC)
    }
}

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn timezone(&self) -> Tz {
        self.timezone
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
    timezone: Tz,
}

impl ManualClock {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(now)), timezone: chrono_tz::UTC }
    }

    #[must_use]
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut slot) = self.now.lock() {
            *slot = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut slot) = self.now.lock() {
            *slot += by;
        }
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.now.lock().map_or_else(|poisoned| *poisoned.into_inner(), |now| *now)
    }

    fn timezone(&self) -> Tz {
        self.timezone
    }
}
