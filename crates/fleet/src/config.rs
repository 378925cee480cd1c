use std::borrow::Cow;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// What a flush does with an operation that fails to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayPolicy {
    /// Log the failure, drop the operation and keep going. Accepts data loss.
    #[default]
    SkipAndContinue,
    /// Leave the failed operation (and everything queued behind it for the
    /// same vehicle) in place for the next flush.
    HaltVehicle,
}

impl FromStr for ReplayPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" | "skip-and-continue" => Ok(Self::SkipAndContinue),
            "halt" | "halt-vehicle" => Ok(Self::HaltVehicle),
            other => Err(Error::InvalidConfig(format!("unknown replay policy {other}"))),
        }
    }
}

/// Tuning for the motion model, ETA estimator, sweeper and replay queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub tick_interval: Duration,
    /// Fraction of a leg covered per tick.
    pub step_fraction: f64,
    pub liveness_threshold: Duration,
    pub liveness_sweep_interval: Duration,
    pub eta_retention: Duration,
    pub eta_sweep_interval: Duration,
    /// Speed assumed for ETAs when a vehicle reports 0 km/h.
    pub fallback_speed_kmh: f64,
    /// Number of upcoming stops to estimate.
    pub lookahead: usize,
    /// Width of the band simulated speed is drawn from, centred on the base speed.
    pub speed_jitter_kmh: f64,
    /// Width of the per-axis GPS noise band, centred on the true position.
    pub position_jitter_deg: f64,
    pub min_speed_kmh: f64,
    pub max_speed_kmh: f64,
    pub replay_policy: ReplayPolicy,
    pub queue_max_age: Duration,
    /// Device reports this close to a stop move the vehicle onto that stop. 0 disables.
    pub snap_radius_km: f64,
    pub timezone: Cow<'static, str>,
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            step_fraction: 0.1,
            liveness_threshold: Duration::from_secs(5 * 60),
            liveness_sweep_interval: Duration::from_secs(5 * 60),
            eta_retention: Duration::from_secs(2 * 60 * 60),
            eta_sweep_interval: Duration::from_secs(60 * 60),
            fallback_speed_kmh: 25.0,
            lookahead: 3,
            speed_jitter_kmh: 5.0,
            position_jitter_deg: 0.0001,
            min_speed_kmh: 5.0,
            max_speed_kmh: 60.0,
            replay_policy: ReplayPolicy::SkipAndContinue,
            queue_max_age: Duration::from_secs(24 * 60 * 60),
            snap_radius_km: 0.1,
            timezone: Cow::Borrowed("UTC"),
            rng_seed: None,
        }
    }
}

impl Config {
    /// Defaults overridden by any recognised environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when an override cannot be parsed or
    /// the resulting configuration is out of range.
    pub fn from_env() -> Result<Self, Error> {
        let defaults = Self::default();
        let config = Self {
            tick_interval: env_millis("TICK_INTERVAL_MS", defaults.tick_interval)?,
            step_fraction: env_parse("STEP_FRACTION", defaults.step_fraction)?,
            liveness_threshold: env_millis("LIVENESS_THRESHOLD_MS", defaults.liveness_threshold)?,
            liveness_sweep_interval: env_millis(
                "LIVENESS_SWEEP_INTERVAL_MS",
                defaults.liveness_sweep_interval,
            )?,
            eta_retention: env_millis("ETA_RETENTION_MS", defaults.eta_retention)?,
            eta_sweep_interval: env_millis("ETA_SWEEP_INTERVAL_MS", defaults.eta_sweep_interval)?,
            fallback_speed_kmh: env_parse("FALLBACK_SPEED_KMH", defaults.fallback_speed_kmh)?,
            lookahead: env_parse("ETA_LOOKAHEAD", defaults.lookahead)?,
            speed_jitter_kmh: env_parse("SPEED_JITTER_KMH", defaults.speed_jitter_kmh)?,
            position_jitter_deg: env_parse("POSITION_JITTER_DEG", defaults.position_jitter_deg)?,
            min_speed_kmh: env_parse("MIN_SPEED_KMH", defaults.min_speed_kmh)?,
            max_speed_kmh: env_parse("MAX_SPEED_KMH", defaults.max_speed_kmh)?,
            replay_policy: env_parse("REPLAY_POLICY", defaults.replay_policy)?,
            queue_max_age: env_millis("QUEUE_MAX_AGE_MS", defaults.queue_max_age)?,
            snap_radius_km: env_parse("SNAP_RADIUS_KM", defaults.snap_radius_km)?,
            timezone: env::var("TIMEZONE").map_or(defaults.timezone, Cow::Owned),
            rng_seed: env::var("RNG_SEED").ok().and_then(|value| value.parse().ok()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the core cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first offending value.
    pub fn validate(&self) -> Result<(), Error> {
        if self.tick_interval.is_zero() {
            return Err(Error::InvalidConfig("tick interval must be positive".to_string()));
        }
        if !(self.step_fraction > 0.0 && self.step_fraction <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "step fraction {} must be in (0, 1]",
                self.step_fraction
            )));
        }
        if self.lookahead == 0 {
            return Err(Error::InvalidConfig("lookahead must be at least 1".to_string()));
        }
        for (name, value) in [
            ("min speed", self.min_speed_kmh),
            ("max speed", self.max_speed_kmh),
            ("speed jitter", self.speed_jitter_kmh),
            ("position jitter", self.position_jitter_deg),
            ("snap radius", self.snap_radius_km),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(Error::InvalidConfig(format!(
                    "{name} {value} must be finite and not negative"
                )));
            }
        }
        if self.min_speed_kmh > self.max_speed_kmh {
            return Err(Error::InvalidConfig(format!(
                "speed band {}..{} is inverted",
                self.min_speed_kmh, self.max_speed_kmh
            )));
        }
        if !(self.fallback_speed_kmh.is_finite() && self.fallback_speed_kmh > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "fallback speed {} must be positive",
                self.fallback_speed_kmh
            )));
        }
        Ok(())
    }

    /// Config with all randomness switched off, for reproducible runs.
    #[must_use]
    pub fn deterministic() -> Self {
        Self {
            speed_jitter_kmh: 0.0,
            position_jitter_deg: 0.0,
            rng_seed: Some(0),
            ..Self::default()
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, Error> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| Error::InvalidConfig(format!("{key}={value} could not be parsed"))),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, Error> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|err| Error::InvalidConfig(format!("{key}={value}: {err}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().expect("defaults should validate");
        assert_eq!(config.tick_interval, Duration::from_secs(10));
        assert_eq!(config.lookahead, 3);
        assert_eq!(config.eta_retention, Duration::from_secs(7200));
    }

    #[test]
    fn rejects_out_of_range() {
        let config = Config { step_fraction: 0.0, ..Config::default() };
        assert_eq!(config.validate().unwrap_err().code(), "invalid_config");

        let config = Config { lookahead: 0, ..Config::default() };
        assert!(config.validate().is_err());

        let config = Config { min_speed_kmh: 70.0, ..Config::default() };
        assert!(config.validate().is_err());

        let config = Config { tick_interval: Duration::ZERO, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_finite_tuning() {
        let invalid = [
            Config { position_jitter_deg: f64::NAN, ..Config::default() },
            Config { speed_jitter_kmh: f64::INFINITY, ..Config::default() },
            Config { max_speed_kmh: f64::INFINITY, ..Config::default() },
            Config { min_speed_kmh: f64::NAN, ..Config::default() },
            Config { snap_radius_km: f64::NAN, ..Config::default() },
            Config { step_fraction: f64::NAN, ..Config::default() },
            Config { fallback_speed_kmh: f64::NAN, ..Config::default() },
        ];
        for config in invalid {
            let err = config.validate().unwrap_err();
            assert_eq!(err.code(), "invalid_config", "{config:?}");
        }
    }

    #[test]
    fn rejects_stationary_fallback_speed() {
        let config = Config { fallback_speed_kmh: 0.0, ..Config::default() };
        assert!(config.validate().unwrap_err().to_string().contains("fallback speed"));

        let config = Config { fallback_speed_kmh: -5.0, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn replay_policy_names() {
        assert_eq!("skip".parse::<ReplayPolicy>().unwrap(), ReplayPolicy::SkipAndContinue);
        assert_eq!("HALT".parse::<ReplayPolicy>().unwrap(), ReplayPolicy::HaltVehicle);
        assert!("retry".parse::<ReplayPolicy>().is_err());
    }
}
