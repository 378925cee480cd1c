//! Request shapes and failure classification of the HTTP-backed store.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fleet::{Error, FleetStore, GeoPoint, StaleQuery, Vehicle, VehiclePatch};
use fleet_http::{HttpRequest, HttpStore, StoreConfig};
use http::{Method, Request, Response, StatusCode};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq)]
struct Seen {
    method: Method,
    uri: String,
    body: Option<Value>,
}

/// Replies from a script, falling back to the last scripted reply.
#[derive(Default)]
struct MockHttp {
    replies: Mutex<VecDeque<Option<(StatusCode, String)>>>,
    seen: Mutex<Vec<Seen>>,
}

impl MockHttp {
    fn replying(replies: Vec<Option<(StatusCode, &str)>>) -> Arc<Self> {
        let replies =
            replies.into_iter().map(|reply| reply.map(|(status, body)| (status, body.to_string())));
        Arc::new(Self { replies: Mutex::new(replies.collect()), seen: Mutex::default() })
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpRequest for MockHttp {
    async fn fetch(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
        let body = request.body();
        self.seen.lock().unwrap().push(Seen {
            method: request.method().clone(),
            uri: request.uri().to_string(),
            body: if body.is_empty() { None } else { Some(serde_json::from_slice(body)?) },
        });

        let reply = {
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.pop_front().flatten()
            } else {
                replies.front().cloned().flatten()
            }
        };
        let (status, body) = reply.ok_or_else(|| anyhow!("connection refused"))?;
        Ok(Response::builder().status(status).body(body.into_bytes())?)
    }
}

fn store(http: &Arc<MockHttp>) -> HttpStore<MockHttp> {
    let mut config = StoreConfig::new("https://store.test/v1/");
    config.poll_interval = Duration::from_secs(3);
    HttpStore::new(config, Arc::clone(http))
}

fn at() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

fn vehicle_json(id: &str) -> Value {
    json!({
        "id": id,
        "routeId": "route-1",
        "location": {"latitude": 28.6139, "longitude": 77.209},
        "speedKmh": 25.0,
        "active": true,
        "lastUpdated": "2023-11-14T22:13:20Z",
        "currentStopIndex": 0,
        "targetStopIndex": 1,
        "progress": 0.0
    })
}

#[tokio::test]
async fn upsert_patches_sparse_document() -> Result<()> {
    let http = MockHttp::replying(vec![Some((StatusCode::NO_CONTENT, ""))]);
    let patch = VehiclePatch {
        location: Some(GeoPoint::new(1.5, 2.5)),
        active: Some(true),
        ..VehiclePatch::default()
    };

    store(&http).upsert_vehicle("bus 7", &patch).await?;

    assert_eq!(
        http.seen(),
        vec![Seen {
            method: Method::PATCH,
            uri: "https://store.test/v1/vehicles/bus%207".to_string(),
            body: Some(json!({"location": {"latitude": 1.5, "longitude": 2.5}, "active": true})),
        }]
    );
    Ok(())
}

#[tokio::test]
async fn failures_are_classified() {
    let unreachable = MockHttp::replying(vec![None]);
    let err = store(&unreachable).vehicles().await.unwrap_err();
    assert!(Error::is_transient_anyhow(&err));

    let overloaded = MockHttp::replying(vec![Some((StatusCode::SERVICE_UNAVAILABLE, "busy"))]);
    let err = store(&overloaded).vehicles().await.unwrap_err();
    assert!(Error::is_transient_anyhow(&err));

    let missing = MockHttp::replying(vec![Some((StatusCode::NOT_FOUND, ""))]);
    let err = store(&missing).upsert_vehicle("ghost", &VehiclePatch::default()).await.unwrap_err();
    assert!(!Error::is_transient_anyhow(&err));
    assert_eq!(Error::from(err).code(), "unknown_vehicle");

    let rejected = MockHttp::replying(vec![Some((StatusCode::BAD_REQUEST, "bad patch"))]);
    let err = store(&rejected).upsert_vehicle("bus", &VehiclePatch::default()).await.unwrap_err();
    assert!(!Error::is_transient_anyhow(&err));
    assert!(err.to_string().contains("bad patch"));

    let garbled = MockHttp::replying(vec![Some((StatusCode::OK, "<html>"))]);
    let err = store(&garbled).vehicles().await.unwrap_err();
    assert_eq!(Error::from(err).code(), "invalid_format");
}

#[tokio::test]
async fn stale_queries_filter_server_side() -> Result<()> {
    let listing = json!([vehicle_json("bus-1"), vehicle_json("bus-2")]).to_string();
    let http = MockHttp::replying(vec![Some((StatusCode::OK, &listing))]);

    let ids = store(&http)
        .query_stale(&StaleQuery::SilentVehicles { last_report_before: at() })
        .await?;

    assert_eq!(ids, vec!["bus-1".to_string(), "bus-2".to_string()]);
    assert_eq!(
        http.seen()[0].uri,
        "https://store.test/v1/vehicles?active=true&lastUpdatedBefore=2023-11-14T22%3A13%3A20.000Z"
    );
    Ok(())
}

#[tokio::test]
async fn batches_report_partial_failure() -> Result<()> {
    let http = MockHttp::replying(vec![Some((StatusCode::OK, r#"{"applied":1,"failed":["b"]}"#))]);
    let store = store(&http);

    let report = store
        .batch_update(&[
            ("a".to_string(), VehiclePatch::deactivate(at())),
            ("b".to_string(), VehiclePatch::deactivate(at())),
        ])
        .await?;
    assert_eq!(report.applied, 1);
    assert_eq!(report.failed, vec!["b".to_string()]);

    let seen = http.seen();
    assert_eq!(seen[0].uri, "https://store.test/v1/vehicles:batchUpdate");
    assert_eq!(seen[0].body.as_ref().unwrap()["updates"][1]["id"], json!("b"));

    assert!(store.batch_delete(&[]).await?.is_complete());
    assert_eq!(http.seen().len(), 1, "empty batch sends nothing");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn subscription_polls_until_dropped() -> Result<()> {
    let one = json!([vehicle_json("bus-1")]).to_string();
    let two = json!([vehicle_json("bus-2"), vehicle_json("bus-1")]).to_string();
    let http = MockHttp::replying(vec![
        Some((StatusCode::OK, &one)),
        Some((StatusCode::OK, &one)),
        None,
        Some((StatusCode::OK, &two)),
    ]);

    let calls: Arc<Mutex<Vec<Vec<String>>>> = Arc::default();
    let sink = Arc::clone(&calls);
    let subscription = store(&http).subscribe_active_vehicles(Arc::new(move |active: Vec<Vehicle>| {
        sink.lock().unwrap().push(active.into_iter().map(|vehicle| vehicle.id).collect());
    }));

    // polls at 0s, 3s, 6s and 9s
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(
        *calls.lock().unwrap(),
        vec![vec!["bus-1".to_string()], vec!["bus-1".to_string(), "bus-2".to_string()]]
    );

    subscription.unsubscribe();
    let polls = http.seen().len();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(http.seen().len(), polls);
    Ok(())
}
