//! End-to-end behaviour of `ResilientClient` over a scripted transport.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bioetl_http::{
    fetch_ordered, CacheConfig, CircuitStatus, FallbackReason, HttpClientConfig, HttpRequest, HttpResponse, Method,
    RequestOutcome, ResilientClient, Transport, TransportError,
};
use bioetl_test_utils::{ok_json, status, status_with_retry_after, timeout, ScriptedTransport};
use tokio::time::Instant;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

fn config() -> HttpClientConfig {
    let mut cfg = HttpClientConfig::default().with_base_url("https://api.example.org");
    cfg.retry.backoff_initial_ms = 100;
    cfg.retry.backoff_max_ms = 5_000;
    cfg.rate_limit.max_calls = 0;
    cfg
}

fn no_cache() -> CacheConfig {
    CacheConfig { enabled: false, ..CacheConfig::default() }
}

fn client(cfg: &HttpClientConfig, cache: &CacheConfig, transport: Arc<ScriptedTransport>) -> ResilientClient {
    ResilientClient::with_transport("test", cfg, cache, transport).unwrap()
}

/// Events emitted while the layer is the thread's default subscriber.
#[derive(Clone, Default)]
struct CapturedEvents(Arc<Mutex<Vec<CapturedEvent>>>);

#[derive(Debug, Default)]
struct CapturedEvent {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for CapturedEvent {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.fields.insert(field.name().to_string(), rendered);
        }
    }
}

impl<S: Subscriber> Layer<S> for CapturedEvents {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut captured = CapturedEvent::default();
        event.record(&mut captured);
        self.0.lock().unwrap().push(captured);
    }
}

impl CapturedEvents {
    fn field_of(&self, message: &str, field: &str) -> Option<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.message == message)
            .and_then(|e| e.fields.get(field).cloned())
    }
}

/// Never answers requests whose URL contains `stall`; everything else goes
/// to the scripted transport.
struct StallingTransport(Arc<ScriptedTransport>);

#[async_trait]
impl Transport for StallingTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        if request.url.contains("stall") {
            std::future::pending::<()>().await;
        }
        self.0.send(request).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_throttled_twice_then_success_has_no_fallback() {
    let transport = Arc::new(ScriptedTransport::with_replies([
        status(429),
        status(429),
        ok_json(serde_json::json!({"ok": true})),
    ]));
    let c = client(&config(), &no_cache(), transport.clone());
    let events = CapturedEvents::default();
    let _default = tracing::subscriber::set_default(tracing_subscriber::registry().with(events.clone()));

    let outcome = c.get("works", &[]).await;
    let resp = outcome.into_result().expect("no fallback expected");
    assert_eq!(resp.status, 200);
    // Two retries, three attempts.
    assert_eq!(transport.calls(), 3);
    assert_eq!(events.field_of("Request succeeded after retries", "retries").as_deref(), Some("2"));
    assert_eq!(c.breaker().status(), CircuitStatus::Closed);
    assert_eq!(c.breaker().snapshot().consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_throttling_retried_when_not_listed_in_statuses() {
    let mut cfg = config();
    cfg.retry.statuses = vec![500, 502, 503, 504];
    let transport = Arc::new(ScriptedTransport::with_replies([
        status(429),
        ok_json(serde_json::json!({"ok": true})),
    ]));
    let c = client(&cfg, &no_cache(), transport.clone());

    let outcome = c.get("works", &[]).await;
    assert!(!outcome.is_fallback(), "429 must be retried, got {outcome:?}");
    assert_eq!(transport.calls(), 2);
    assert_eq!(c.breaker().snapshot().consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_5xx_yields_fallback_and_next_request_proceeds() {
    let transport = Arc::new(ScriptedTransport::with_replies(
        std::iter::repeat_with(|| status(500))
            .take(5)
            .chain([ok_json(serde_json::json!({"id": 2}))]),
    ));
    let c = client(&config(), &no_cache(), transport.clone());

    let first = c.get("activity/1", &[]).await;
    let fb = match first {
        RequestOutcome::Fallback(fb) => fb,
        other => panic!("expected fallback, got {other:?}"),
    };
    assert_eq!(fb.reason, FallbackReason::MaxRetriesExceeded);
    assert_eq!(fb.error_type, "TransientNetworkError");
    assert_eq!(fb.http_status, Some(500));
    assert_eq!(fb.attempts, 5);
    assert_eq!(fb.retries, 4);
    assert_eq!(transport.calls(), 5);

    let second = c.get("activity/2", &[]).await;
    assert!(!second.is_fallback());
    assert_eq!(transport.calls(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_and_respects_retry_after() {
    let transport = Arc::new(ScriptedTransport::with_replies([
        status_with_retry_after(429, 3),
        status(503),
        ok_json(serde_json::json!({})),
    ]));
    let c = client(&config(), &no_cache(), transport.clone());

    let start = Instant::now();
    assert!(!c.get("x", &[]).await.is_fallback());
    // 3 s from Retry-After, then 200 ms from the second backoff step.
    assert_eq!(start.elapsed(), Duration::from_millis(3_200));
}

#[tokio::test(start_paused = true)]
async fn test_client_error_is_not_retried_and_not_counted() {
    let transport = Arc::new(ScriptedTransport::with_replies([status(404)]));
    let mut cfg = config();
    cfg.circuit_breaker.failure_threshold = 1;
    let c = client(&cfg, &no_cache(), transport.clone());

    match c.get("missing", &[]).await {
        RequestOutcome::Fallback(fb) => {
            assert_eq!(fb.reason, FallbackReason::HttpError);
            assert_eq!(fb.http_status, Some(404));
            assert_eq!(fb.attempts, 1);
        }
        other => panic!("expected fallback, got {other:?}"),
    }
    assert_eq!(transport.calls(), 1);
    assert_eq!(c.breaker().status(), CircuitStatus::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_short_circuits_then_single_trial() {
    let mut cfg = config();
    cfg.retry.max_attempts = 1;
    cfg.circuit_breaker.failure_threshold = 2;
    cfg.circuit_breaker.cooldown_secs = 10;

    let transport = Arc::new(ScriptedTransport::with_replies([
        status(502),
        timeout(),
        ok_json(serde_json::json!({"ok": true})),
    ]));
    let c = client(&cfg, &no_cache(), transport.clone());

    assert!(c.get("a", &[]).await.is_fallback());
    assert!(c.get("b", &[]).await.is_fallback());
    assert_eq!(c.breaker().status(), CircuitStatus::Open);

    // No I/O while open.
    match c.get("c", &[]).await {
        RequestOutcome::Fallback(fb) => {
            assert_eq!(fb.reason, FallbackReason::CircuitOpen);
            assert_eq!(fb.attempts, 0);
        }
        other => panic!("expected circuit_open, got {other:?}"),
    }
    assert_eq!(transport.calls(), 2);

    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(!c.get("d", &[]).await.is_fallback());
    assert_eq!(transport.calls(), 3);
    assert_eq!(c.breaker().status(), CircuitStatus::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_gets_one_attempt_and_reopens() {
    let mut cfg = config();
    cfg.circuit_breaker.failure_threshold = 1;
    cfg.circuit_breaker.cooldown_secs = 5;

    let transport = Arc::new(ScriptedTransport::with_replies(
        std::iter::repeat_with(|| status(500)).take(6),
    ));
    let c = client(&cfg, &no_cache(), transport.clone());

    assert!(c.get("a", &[]).await.is_fallback());
    assert_eq!(transport.calls(), 5);
    assert_eq!(c.breaker().status(), CircuitStatus::Open);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(c.get("b", &[]).await.is_fallback());
    assert_eq!(transport.calls(), 6, "trial must not retry");
    assert_eq!(c.breaker().status(), CircuitStatus::Open);
}

#[tokio::test(start_paused = true)]
async fn test_successful_gets_are_cached_per_release() {
    let transport = Arc::new(ScriptedTransport::new().route(
        "activity",
        [ok_json(serde_json::json!({"activities": [1]}))],
    ));
    let c = client(&config(), &CacheConfig::default(), transport.clone());

    // Nothing is cached before the release is known.
    c.get("activity.json", &[("limit", "1")]).await;
    c.get("activity.json", &[("limit", "1")]).await;
    assert_eq!(transport.calls(), 2);

    c.bind_release("ChEMBL_34").unwrap();
    c.get("activity.json", &[("limit", "1")]).await;
    c.get("activity.json", &[("limit", "1")]).await;
    assert_eq!(transport.calls(), 3);

    // POSTs always go upstream.
    c.request(Method::POST, "activity.json", &[]).await;
    c.request(Method::POST, "activity.json", &[]).await;
    assert_eq!(transport.calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_fallbacks_are_never_cached() {
    let transport = Arc::new(ScriptedTransport::with_replies([status(404), ok_json(serde_json::json!({}))]));
    let c = client(&config(), &CacheConfig::default(), transport.clone());
    c.bind_release("r1").unwrap();

    assert!(c.get("doc", &[]).await.is_fallback());
    assert!(!c.get("doc", &[]).await.is_fallback());
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_worker_pool_keeps_issue_order() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .route("/1", [ok_json(serde_json::json!({"id": 1}))])
            .route("/2", [status(404)])
            .route("/3", [ok_json(serde_json::json!({"id": 3}))]),
    );
    let c = client(&config(), &no_cache(), transport);

    let outcomes = fetch_ordered(vec!["1", "2", "3"], 3, |id| {
        let c = &c;
        async move { c.get(&format!("item/{id}"), &[]).await }
    })
    .await;

    assert!(!outcomes[0].is_fallback());
    assert!(outcomes[1].is_fallback());
    assert_eq!(outcomes[2].response().map(|r| r.body.as_str()), Some(r#"{"id":3}"#));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_client_spreads_calls() {
    let mut cfg = config();
    cfg.rate_limit.max_calls = 2;
    cfg.rate_limit.period_ms = 1_000;
    let transport = Arc::new(ScriptedTransport::new().route("", [ok_json(serde_json::json!({}))]));
    let c = client(&cfg, &no_cache(), transport);

    let start = Instant::now();
    for i in 0..5 {
        c.get(&format!("n/{i}"), &[]).await;
    }
    assert_eq!(start.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_trial_request_frees_the_trial_slot() {
    let mut cfg = config();
    cfg.retry.max_attempts = 1;
    cfg.circuit_breaker.failure_threshold = 1;
    cfg.circuit_breaker.cooldown_secs = 5;

    let scripted = Arc::new(ScriptedTransport::with_replies([
        status(500),
        ok_json(serde_json::json!({"ok": true})),
    ]));
    let transport = Arc::new(StallingTransport(scripted.clone()));
    let c = ResilientClient::with_transport("test", &cfg, &no_cache(), transport).unwrap();

    assert!(c.get("a", &[]).await.is_fallback());
    assert_eq!(c.breaker().status(), CircuitStatus::Open);
    tokio::time::advance(Duration::from_secs(5)).await;

    // The trial hangs and its caller gives up.
    let abandoned = tokio::time::timeout(Duration::from_secs(1), c.get("stall", &[])).await;
    assert!(abandoned.is_err());
    assert_eq!(c.breaker().status(), CircuitStatus::HalfOpen);
    assert!(!c.breaker().snapshot().trial_in_flight);

    // The next caller gets the trial instead of a permanent short-circuit.
    assert!(!c.get("b", &[]).await.is_fallback());
    assert_eq!(scripted.calls(), 2);
    assert_eq!(c.breaker().status(), CircuitStatus::Closed);
}
