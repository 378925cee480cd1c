use std::env;
use std::time::Duration;

use fleet::Error;

const DEFAULT_POLL: Duration = Duration::from_secs(3);

/// Location and cadence of the document API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Base URL without a trailing slash, e.g. `https://store.example/api`.
    pub base_url: String,
    /// How often active-vehicle subscriptions poll for changes.
    pub poll_interval: Duration,
}

impl StoreConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, poll_interval: DEFAULT_POLL }
    }

    /// Reads `STORE_URL` and `STORE_POLL_MS`. `None` when no store URL is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when `STORE_POLL_MS` is not a
    /// positive integer.
    pub fn from_env() -> Result<Option<Self>, Error> {
        let Some(base_url) = env::var("STORE_URL").ok().filter(|url| !url.trim().is_empty()) else {
            return Ok(None);
        };

        let mut config = Self::new(base_url);
        if let Ok(value) = env::var("STORE_POLL_MS") {
            let millis = value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|millis| *millis > 0)
                .ok_or_else(|| Error::InvalidConfig(format!("STORE_POLL_MS={value} is invalid")))?;
            config.poll_interval = Duration::from_millis(millis);
        }
        Ok(Some(config))
    }
}
