use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use fleet::{
    BatchReport, EtaRecord, Error, FleetStore, StaleQuery, Subscription, Vehicle, VehicleCallback,
    VehiclePatch,
};
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{Method, Request, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::provider::HttpRequest;

/// [`FleetStore`] over a JSON document API.
///
/// Requests that get no response, and responses with a 408, 429 or 5xx
/// status, fail with [`Error::Unavailable`] so callers can queue and retry.
pub struct HttpStore<H>
where
    H: HttpRequest + ?Sized,
{
    config: StoreConfig,
    http: Arc<H>,
}

impl<H> HttpStore<H>
where
    H: HttpRequest + ?Sized,
{
    #[must_use]
    pub const fn new(config: StoreConfig, http: Arc<H>) -> Self {
        Self { config, http }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url)
    }

    async fn send(&self, method: Method, path: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        let url = self.url(path);
        let request = Request::builder()
            .method(method.clone())
            .uri(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .body(body)
            .with_context(|| format!("building {method} {url}"))?;

        let response = match self.http.fetch(request).await {
            Ok(response) => response,
            Err(err) => {
                return Err(Error::Unavailable(format!("{method} {url}: {err:#}")).into());
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response.into_body());
        }

        let detail = String::from_utf8_lossy(response.body()).into_owned();
        debug!(%method, %url, %status, detail = %detail, "store request rejected");
        if is_transient(status) {
            return Err(Error::Unavailable(format!("{method} {url} returned {status}")).into());
        }
        if status == StatusCode::NOT_FOUND {
            return Err(Error::UnknownVehicle(format!("{method} {url} returned {status}")).into());
        }
        Err(anyhow!("{method} {url} returned {status}: {detail}"))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self.send(Method::GET, path, Vec::new()).await?;
        decode(path, &body)
    }

    async fn post<B, T>(&self, path: &str, payload: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let body = serde_json::to_vec(payload).context("encoding request body")?;
        let response = self.send(Method::POST, path, body).await?;
        decode(path, &response)
    }

    async fn active_vehicles(&self) -> Result<Vec<Vehicle>> {
        let mut active: Vec<Vehicle> = self.get("vehicles?active=true").await?;
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }

    async fn poll_active(self, callback: VehicleCallback) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last: Option<Vec<Vehicle>> = None;

        loop {
            interval.tick().await;
            match self.active_vehicles().await {
                Ok(active) if last.as_ref() != Some(&active) => {
                    callback(active.clone());
                    last = Some(active);
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "active vehicle poll failed"),
            }
        }
    }
}

impl<H> Clone for HttpStore<H>
where
    H: HttpRequest + ?Sized,
{
    fn clone(&self) -> Self {
        Self { config: self.config.clone(), http: Arc::clone(&self.http) }
    }
}

impl<H> fmt::Debug for HttpStore<H>
where
    H: HttpRequest + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStore").field("config", &self.config).finish_non_exhaustive()
    }
}

#[async_trait]
impl<H> FleetStore for HttpStore<H>
where
    H: HttpRequest + ?Sized,
{
    async fn upsert_vehicle(&self, id: &str, patch: &VehiclePatch) -> Result<()> {
        let path = format!("vehicles/{}", urlencoding::encode(id));
        let body = serde_json::to_vec(patch).context("encoding vehicle patch")?;
        self.send(Method::PATCH, &path, body).await?;
        Ok(())
    }

    async fn vehicles(&self) -> Result<Vec<Vehicle>> {
        self.get("vehicles").await
    }

    fn subscribe_active_vehicles(&self, callback: VehicleCallback) -> Subscription {
        let poller = tokio::spawn(self.clone().poll_active(callback));
        Subscription::new(move || poller.abort())
    }

    async fn query_stale(&self, query: &StaleQuery) -> Result<Vec<String>> {
        match *query {
            StaleQuery::SilentVehicles { last_report_before } => {
                let cutoff = timestamp(last_report_before);
                let path = format!("vehicles?active=true&lastUpdatedBefore={cutoff}");
                let vehicles: Vec<Vehicle> = self.get(&path).await?;
                Ok(vehicles.into_iter().map(|vehicle| vehicle.id).collect())
            }
            StaleQuery::ExpiredEtas { computed_before } => {
                let path = format!("etas?computedBefore={}", timestamp(computed_before));
                let records: Vec<EtaRecord> = self.get(&path).await?;
                Ok(records.into_iter().map(|record| record.id).collect())
            }
        }
    }

    async fn batch_update(&self, updates: &[(String, VehiclePatch)]) -> Result<BatchReport> {
        if updates.is_empty() {
            return Ok(BatchReport::default());
        }
        let payload = BatchUpdate {
            updates: updates.iter().map(|(id, patch)| VehicleUpdate { id, patch }).collect(),
        };
        let outcome: BatchOutcome = self.post("vehicles:batchUpdate", &payload).await?;
        Ok(outcome.into())
    }

    async fn batch_delete(&self, eta_ids: &[String]) -> Result<BatchReport> {
        if eta_ids.is_empty() {
            return Ok(BatchReport::default());
        }
        let payload = BatchDelete { ids: eta_ids };
        let outcome: BatchOutcome = self.post("etas:batchDelete", &payload).await?;
        Ok(outcome.into())
    }

    async fn append_eta(&self, record: &EtaRecord) -> Result<()> {
        let body = serde_json::to_vec(record).context("encoding eta record")?;
        self.send(Method::POST, "etas", body).await?;
        Ok(())
    }

    async fn etas_for_stop(&self, stop_id: &str) -> Result<Vec<EtaRecord>> {
        self.get(&format!("etas?stopId={}", urlencoding::encode(stop_id))).await
    }
}

#[derive(Serialize)]
struct BatchUpdate<'a> {
    updates: Vec<VehicleUpdate<'a>>,
}

#[derive(Serialize)]
struct VehicleUpdate<'a> {
    id: &'a str,
    patch: &'a VehiclePatch,
}

#[derive(Serialize)]
struct BatchDelete<'a> {
    ids: &'a [String],
}

#[derive(Deserialize)]
struct BatchOutcome {
    #[serde(default)]
    applied: usize,
    #[serde(default)]
    failed: Vec<String>,
}

impl From<BatchOutcome> for BatchReport {
    fn from(outcome: BatchOutcome) -> Self {
        Self { applied: outcome.applied, failed: outcome.failed }
    }
}

fn decode<T: DeserializeOwned>(path: &str, body: &[u8]) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|err| Error::InvalidFormat(format!("response from {path}: {err}")).into())
}

fn timestamp(at: DateTime<Utc>) -> String {
    urlencoding::encode(&at.to_rfc3339_opts(SecondsFormat::Millis, true)).into_owned()
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}
