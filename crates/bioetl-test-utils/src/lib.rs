//! bioetl-test-utils — Fixtures shared by the workspace's tests.
//!
//! - [`ScriptedTransport`]: a [`Transport`] that replays canned replies and
//!   records every request it sees
//! - record builders for the common dataset shapes
//! - a fixed clock start so cache and run timestamps are reproducible

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bioetl_common::{Record, Value};
use bioetl_http::{HttpRequest, HttpResponse, Transport, TransportError};
use chrono::{DateTime, TimeZone, Utc};

pub type Reply = Result<HttpResponse, TransportError>;

/// Replays scripted replies.
///
/// Requests are matched against routes (URL substring) in registration
/// order; the last reply of a route repeats forever. Requests no route
/// matches consume the default queue, and fail with a transport error once
/// it is empty.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<(String, VecDeque<Reply>)>>,
    queue: Mutex<VecDeque<Reply>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue replies for any unrouted request.
    pub fn with_replies(replies: impl IntoIterator<Item = Reply>) -> Self {
        let t = Self::new();
        t.queue.lock().unwrap().extend(replies);
        t
    }

    pub fn push(&self, reply: Reply) {
        self.queue.lock().unwrap().push_back(reply);
    }

    /// Register replies for requests whose URL contains `pattern`.
    pub fn route(self, pattern: &str, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.routes
            .lock()
            .unwrap()
            .push((pattern.to_string(), replies.into_iter().collect()));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.seen.lock().unwrap().clone()
    }

    /// Value of query parameter `name` on every request seen, in order.
    pub fn param_values(&self, name: &str) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|r| r.params.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone()))
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.clone());

        {
            let mut routes = self.routes.lock().unwrap();
            if let Some((_, replies)) = routes.iter_mut().find(|(p, _)| request.url.contains(p.as_str())) {
                return if replies.len() > 1 {
                    replies.pop_front().unwrap()
                } else {
                    replies
                        .front()
                        .cloned()
                        .unwrap_or_else(|| Err(TransportError::Other("route exhausted".into())))
                };
            }
        }

        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Other(format!("no scripted reply for {}", request.url))))
    }
}

// ── Reply helpers ─────────────────────────────────────────────────────────────

pub fn ok_json(body: serde_json::Value) -> Reply {
    Ok(HttpResponse::new(200, body.to_string()).with_header("content-type", "application/json"))
}

pub fn ok_text(body: &str) -> Reply {
    Ok(HttpResponse::new(200, body))
}

pub fn status(code: u16) -> Reply {
    Ok(HttpResponse::new(code, ""))
}

pub fn status_with_retry_after(code: u16, secs: u64) -> Reply {
    Ok(HttpResponse::new(code, "").with_header("Retry-After", secs.to_string()))
}

pub fn timeout() -> Reply {
    Err(TransportError::Timeout(std::time::Duration::from_secs(30)))
}

// ── Record builders ───────────────────────────────────────────────────────────

/// Fixed instant used wherever tests need a reproducible "now".
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// A ChEMBL-like activity row.
pub fn activity(id: i64, molecule: &str, value: f64) -> Record {
    Record::new("chembl")
        .with("activity_id", id)
        .with("molecule_chembl_id", molecule)
        .with("standard_type", "IC50")
        .with("standard_value", value)
}

/// Activity rows whose ids repeat according to `ids`.
pub fn activities(ids: &[i64]) -> Vec<Record> {
    ids.iter()
        .map(|id| activity(*id, &format!("CHEMBL{}", 1000 + id), *id as f64 * 1.5))
        .collect()
}

/// Column values of `column` across `rows`.
pub fn column(rows: &[Record], column: &str) -> Vec<Value> {
    rows.iter().map(|r| r.value(column)).collect()
}
