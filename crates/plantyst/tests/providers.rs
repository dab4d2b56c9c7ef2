//! Metadata provider integration tests
//!
//! Runs each provider against a scripted bridge and a shared cache:
//! - downtime code expiry and per-culture batching
//! - subscription refresh window and cached progress
//! - measurement listings served from cache then refreshed
//! - metric multi-queries deduplicated and matched by identity

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use plantyst::providers::downtime;
use plantyst::providers::Quota;
use plantyst::*;
use serde_json::{json, Value};

// ── Scripted bridge ──

type Responder = Box<dyn Fn(&BridgeRequest) -> Result<Value, BridgeError> + Send + Sync>;

struct MockBridge {
    calls: AtomicUsize,
    requests: Mutex<Vec<BridgeRequest>>,
    responder: Responder,
}

impl MockBridge {
    fn new(responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            responder,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn requests(&self) -> Vec<BridgeRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Bridge for MockBridge {
    async fn send(&self, request: BridgeRequest) -> Result<Value, BridgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        (self.responder)(&request)
    }
}

fn failing() -> Responder {
    Box::new(|_| Err(BridgeError::Other("connection reset".into())))
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 1, 8, 0, 0).unwrap()
}

fn context_at(bridge: &Arc<MockBridge>, cache: &KeyValueCache, now: DateTime<Utc>) -> SdkContext {
    SdkContext::new(cache.clone(), bridge.clone()).with_clock(Arc::new(FixedClock(now)))
}

fn params(request: &BridgeRequest, name: &str) -> Vec<String> {
    request
        .params
        .iter()
        .filter(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
        .collect()
}

// ── Downtime codes ──

/// One code per requested measurement, titled after the culture.
fn dictionary() -> Responder {
    Box::new(|request| {
        let culture = params(request, "culture").join("");
        let ids = params(request, "ids[]");
        let codes: Vec<Value> = ids
            .iter()
            .map(|id| {
                json!({"key": format!("C{id}"), "code": format!("{culture}-{id}"),
                       "_links": {"self": {"href": format!("/dc/{id}")}}})
            })
            .collect();
        let measurements: Vec<Value> = ids
            .iter()
            .map(|id| {
                json!({"measurementId": id.parse::<i64>().unwrap(),
                       "_links": {"downtimeCode": {"href": format!("/dc/{id}")}}})
            })
            .collect();
        Ok(json!({"_embedded": {"downtimeCode": codes, "measurementDowntimeCode": measurements}}))
    })
}

fn downtime_at(bridge: &Arc<MockBridge>, cache: &KeyValueCache, now: DateTime<Utc>) -> DowntimeCodesProvider {
    DowntimeCodesProvider::new(context_at(bridge, cache, now), EngineConfig::default())
}

#[tokio::test]
async fn test_downtime_codes_expire_after_ten_days() {
    let bridge = MockBridge::new(dictionary());
    let cache = KeyValueCache::default();

    let codes = downtime_at(&bridge, &cache, t0()).fetch(10, "en").result().await.unwrap();
    assert_eq!(codes[0].code, "C10");
    assert_eq!(codes[0].title, "en-10");
    assert_eq!(bridge.calls(), 1);
    assert!(cache.get("plantyst.downtimeCodes.10").is_some());

    // Still fresh on the tenth day.
    for later in [Duration::hours(1), Duration::days(downtime::DEFAULT_EXPIRY_DAYS)] {
        let provider = downtime_at(&bridge, &cache, t0() + later);
        let cached = provider.fetch(10, "en").result().await.unwrap();
        assert_eq!(cached, codes);
        assert_eq!(bridge.calls(), 1);
    }

    let expired = downtime_at(&bridge, &cache, t0() + Duration::days(10) + Duration::seconds(1));
    expired.fetch(10, "en").result().await.unwrap();
    assert_eq!(bridge.calls(), 2);

    // The refetch restarted the expiry window.
    let refreshed = downtime_at(&bridge, &cache, t0() + Duration::days(15));
    refreshed.fetch(10, "en").result().await.unwrap();
    assert_eq!(bridge.calls(), 2);
}

#[tokio::test]
async fn test_downtime_codes_cached_per_culture() {
    let bridge = MockBridge::new(dictionary());
    let cache = KeyValueCache::default();
    let provider = downtime_at(&bridge, &cache, t0());

    provider.fetch(10, "en").result().await.unwrap();
    let czech = provider.fetch(10, "cs").result().await.unwrap();
    assert_eq!(czech[0].title, "cs-10");
    assert_eq!(bridge.calls(), 2);

    let english = provider.fetch(10, "en").result().await.unwrap();
    assert_eq!(english[0].title, "en-10");
    assert_eq!(bridge.calls(), 2);
}

#[tokio::test]
async fn test_downtime_requests_grouped_by_culture() {
    let bridge = MockBridge::new(dictionary());
    let provider = downtime_at(&bridge, &KeyValueCache::default(), t0());

    let a = provider.fetch(10, "en");
    let b = provider.fetch(11, "en");
    let c = provider.fetch(10, "en");
    let d = provider.fetch(10, "cs");
    let (a, b, c, d) = tokio::join!(a.result(), b.result(), c.result(), d.result());
    assert_eq!(a.unwrap()[0].title, "en-10");
    assert_eq!(b.unwrap()[0].title, "en-11");
    assert_eq!(c.unwrap()[0].title, "en-10");
    assert_eq!(d.unwrap()[0].title, "cs-10");

    let mut requests = bridge.requests();
    assert_eq!(requests.len(), 2);
    requests.sort_by_key(|r| params(r, "culture"));
    assert_eq!(requests[0].endpoint, downtime::ENDPOINT);
    assert_eq!(params(&requests[0], "ids[]"), vec!["10"]);
    assert_eq!(params(&requests[1], "culture"), vec!["en"]);
    assert_eq!(params(&requests[1], "ids[]"), vec!["10", "11"]);
}

#[tokio::test]
async fn test_downtime_failure_rejects_and_caches_nothing() {
    let bridge = MockBridge::new(failing());
    let cache = KeyValueCache::default();
    let provider = downtime_at(&bridge, &cache, t0());

    let result = provider.fetch(10, "en").result().await;
    assert!(matches!(result, Err(FetchError::Network(_))));
    assert!(cache.get("plantyst.downtimeCodes.10").is_none());
}

// ── Subscriptions ──

fn subscriptions_response() -> Responder {
    Box::new(|_| {
        Ok(json!({
            "_links": {"currentSubscription": {"href": "/s/2"}},
            "_embedded": {"subscription": [
                {"subscriptionId": 1, "title": "Trial", "_links": {"self": {"href": "/s/1"}}},
                {"subscriptionId": 2, "title": "Pro", "_links": {"self": {"href": "/s/2"}}}
            ]}
        }))
    })
}

fn subscriptions_at(bridge: &Arc<MockBridge>, cache: &KeyValueCache, now: DateTime<Utc>) -> SubscriptionProvider {
    SubscriptionProvider::new(context_at(bridge, cache, now))
}

#[tokio::test]
async fn test_subscriptions_refresh_window() {
    let bridge = MockBridge::new(subscriptions_response());
    let cache = KeyValueCache::default();

    let first = subscriptions_at(&bridge, &cache, t0()).fetch("alice").result().await.unwrap();
    assert_eq!(first.subscriptions.len(), 2);
    assert_eq!(
        first.active_subscription.and_then(|s| s.title),
        Some("Pro".to_string())
    );
    assert_eq!(bridge.calls(), 1);

    // Inside the window the cached response is the answer.
    let mut handle = subscriptions_at(&bridge, &cache, t0() + Duration::minutes(5)).fetch("alice");
    assert!(matches!(handle.next_event().await, Some(FetchEvent::Resolved(_))));
    assert_eq!(bridge.calls(), 1);

    // Past it, cached data comes first as progress, then the server answer.
    let mut handle = subscriptions_at(&bridge, &cache, t0() + Duration::minutes(6)).fetch("alice");
    assert!(matches!(handle.next_event().await, Some(FetchEvent::Progress(_))));
    assert!(matches!(handle.next_event().await, Some(FetchEvent::Resolved(_))));
    assert_eq!(bridge.calls(), 2);
    assert_eq!(bridge.requests()[1].endpoint, "Subscriptions");
}

#[tokio::test]
async fn test_subscriptions_custom_refresh_interval() {
    let bridge = MockBridge::new(subscriptions_response());
    let cache = KeyValueCache::default();
    subscriptions_at(&bridge, &cache, t0()).fetch("bob").result().await.unwrap();

    let eager = subscriptions_at(&bridge, &cache, t0() + Duration::seconds(2))
        .with_refresh_interval(Duration::seconds(1));
    eager.fetch("bob").result().await.unwrap();
    assert_eq!(bridge.calls(), 2);

    // Other users never share an entry.
    subscriptions_at(&bridge, &cache, t0()).fetch("carol").result().await.unwrap();
    assert_eq!(bridge.calls(), 3);
}

#[tokio::test]
async fn test_subscriptions_failure() {
    let bridge = MockBridge::new(failing());
    let cache = KeyValueCache::default();
    let result = subscriptions_at(&bridge, &cache, t0()).fetch("alice").result().await;
    assert!(matches!(result, Err(FetchError::Network(_))));
    assert!(cache.get("plantyst.subscriptions.alice").is_none());
}

// ── Measurements ──

#[tokio::test]
async fn test_measurements_progress_from_cache_then_server() {
    let bridge = MockBridge::new(Box::new(|_| {
        Ok(json!({"_embedded": {"measurement": [{"measurementId": 3, "title": "Oven"}]}}))
    }));
    let cache = KeyValueCache::default();
    let provider = MeasurementProvider::new(context_at(&bridge, &cache, t0()));

    let mut handle = provider.fetch("alice");
    match handle.next_event().await {
        Some(FetchEvent::Resolved(list)) => assert_eq!(list[0].measurement_id, 3),
        other => panic!("unexpected event {other:?}"),
    }

    let mut handle = provider.fetch("alice");
    match handle.next_event().await {
        Some(FetchEvent::Progress(list)) => assert_eq!(list[0].title.as_deref(), Some("Oven")),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(handle.next_event().await, Some(FetchEvent::Resolved(_))));
    assert_eq!(bridge.calls(), 2);
}

// ── Multi-query endpoints ──

fn metrics(id: i64, maximum_count: u32) -> MetricsQuery {
    MetricsQuery {
        measurement_id: id,
        from: t0(),
        to: t0() + Duration::hours(1),
        maximum_count,
    }
}

/// Answers every query except those for measurement 99.
fn echo_metrics() -> Responder {
    Box::new(|request| {
        let results: Vec<Value> = request.body["Queries"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|q| q["measurementId"] != json!(99))
            .map(|q| json!({"query": q, "results": [{"name": "Count", "value": q["measurementId"]}]}))
            .collect();
        Ok(json!({ "results": results }))
    })
}

#[tokio::test]
async fn test_metrics_deduplicated_and_matched() {
    let bridge = MockBridge::new(echo_metrics());
    let provider = MetricsProvider::new(context_at(&bridge, &KeyValueCache::default(), t0()), EngineConfig::default());

    let a = provider.fetch(metrics(1, 5));
    let b = provider.fetch(metrics(1, 5));
    let c = provider.fetch(metrics(2, 5));
    let missing = provider.fetch(metrics(99, 5));
    let (a, b, c, missing) = tokio::join!(a.result(), b.result(), c.result(), missing.result());

    assert_eq!(a.unwrap()[0].value, json!(1));
    assert_eq!(b.unwrap()[0].value, json!(1));
    assert_eq!(c.unwrap()[0].value, json!(2));
    assert_eq!(missing, Err(FetchError::MissingResult));

    let requests = bridge.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].endpoint, "MeasurementMetricsQuery");
    assert_eq!(requests[0].body["Queries"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_metrics_network_failure_rejects_batch() {
    let bridge = MockBridge::new(failing());
    let provider = MetricsProvider::new(context_at(&bridge, &KeyValueCache::default(), t0()), EngineConfig::default());
    let (a, b) = tokio::join!(provider.fetch(metrics(1, 5)).result(), provider.fetch(metrics(2, 5)).result());
    assert!(matches!(a, Err(FetchError::Network(_))));
    assert!(matches!(b, Err(FetchError::Network(_))));
    assert_eq!(bridge.calls(), 1);
}

#[tokio::test]
async fn test_quota_fetch_and_update() {
    let bridge = MockBridge::new(Box::new(|request| match request.endpoint.as_str() {
        "MeasurementMetricQuotasQuery" => {
            let q = &request.body["Queries"][0];
            Ok(json!({"results": [{"query": q, "result": {"totalQuota": 120.0}}]}))
        }
        _ => Ok(json!({})),
    }));
    let provider = QuotaProvider::new(context_at(&bridge, &KeyValueCache::default(), t0()), EngineConfig::default());

    let quota = provider
        .fetch(QuotaQuery {
            measurement_id: 4,
            from: t0(),
            to: t0() + Duration::days(1),
            metric_name: "Scrap".into(),
        })
        .result()
        .await
        .unwrap();
    assert_eq!(quota, Quota { total_quota: Some(120.0) });

    provider
        .set_quota(&QuotaUpdate {
            measurement_id: 4,
            from: t0(),
            timespan: "1.00:00:00".into(),
            metric_name: "Scrap".into(),
            value: 150.0,
        })
        .await
        .unwrap();
    let set = &bridge.requests()[1];
    assert_eq!(set.endpoint, "MeasurementMetricQuotas");
    assert_eq!(
        set.body,
        json!({"measurementId": 4, "from": "2020-01-01T08:00:00Z", "timespan": "1.00:00:00",
               "metricName": "Scrap", "value": 150.0})
    );
}
