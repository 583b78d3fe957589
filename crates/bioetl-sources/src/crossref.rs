//! Crossref works, one DOI per request.
//!
//! API: https://api.crossref.org/works/{doi}
//! Polite pool: set a User-Agent with a mailto in `http.user_agent`.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bioetl_common::{Record, Value};
use bioetl_http::{fetch_ordered, paginate, FallbackRecord, FallbackReason, Page, ResilientClient};
use bioetl_pipeline::{Extractor, RunContext, Transformer};
use tracing::{debug, instrument};

use crate::support::{bind_release, key_value, lower, raw_record, take_payload, text};

pub const SOURCE: &str = "crossref";
pub const KEY: &str = "doi";

const PAGE_ROWS: usize = 500;

pub const COLUMNS: [&str; 10] = [
    "doi",
    "title",
    "container_title",
    "publisher",
    "work_type",
    "published_date",
    "volume",
    "issue",
    "page",
    "author_count",
];

pub struct CrossrefExtractor {
    client: ResilientClient,
}

impl CrossrefExtractor {
    pub fn new(client: ResilientClient) -> Self {
        Self { client }
    }

    #[instrument(skip(self))]
    async fn fetch_work(&self, doi: String) -> Record {
        let path = format!("works/{}", doi.trim());
        let url = self.client.url_for(&path);
        let placeholder = |fb: &FallbackRecord| fb.record_for(SOURCE, [(KEY.to_string(), key_value(&doi))]);
        let resp = match self.client.get(&path, &[]).await.into_result() {
            Ok(resp) => resp,
            Err(fb) if fb.http_status == Some(404) && fb.reason == FallbackReason::HttpError => {
                return placeholder(&FallbackRecord::not_found(&url, 404));
            }
            Err(fb) => return placeholder(&fb),
        };
        match resp.json::<serde_json::Value>() {
            Ok(mut body) => {
                debug!(doi = %doi, "Crossref work fetched");
                raw_record(SOURCE, KEY, &doi, message(&mut body))
            }
            Err(e) => {
                placeholder(&FallbackRecord::parse_error(&url, resp.status, e.to_string()))
            }
        }
    }

    /// Deep paging with `cursor=*`; `next-cursor` continues until a page
    /// comes back empty.
    async fn fetch_page(&self, cursor: String, query: Option<&str>) -> anyhow::Result<Page<Record, String>> {
        let rows = PAGE_ROWS.to_string();
        let mut params = vec![("cursor", cursor.as_str()), ("rows", rows.as_str())];
        if let Some(q) = query {
            params.push(("query", q));
        }
        let resp = self
            .client
            .get("works", &params)
            .await
            .into_result()
            .map_err(|fb| anyhow!("Crossref listing failed: {} ({})", fb.reason, fb.message))?;
        let mut body: serde_json::Value = resp.json().context("decoding Crossref listing")?;
        let msg = message(&mut body);

        let items: Vec<Record> = msg["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|w| {
                        let doi = w["DOI"].as_str()?;
                        Some(raw_record(SOURCE, KEY, doi, w.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let next = msg["next-cursor"]
            .as_str()
            .filter(|_| !items.is_empty())
            .map(str::to_string);
        Ok(Page { items, next })
    }
}

/// Crossref wraps every payload in `{"status", "message-version", "message"}`.
fn message(body: &mut serde_json::Value) -> serde_json::Value {
    body.get_mut("message").map(serde_json::Value::take).unwrap_or_default()
}

#[async_trait]
impl Extractor for CrossrefExtractor {
    #[instrument(skip_all)]
    async fn source_release(&self, _ctx: &RunContext) -> anyhow::Result<String> {
        let resp = self
            .client
            .request_uncached(bioetl_http::Method::GET, "works", &[("rows", "0")])
            .await
            .into_result()
            .map_err(|fb| anyhow!("Crossref unavailable: {} ({})", fb.reason, fb.message))?;
        let body: serde_json::Value = resp.json().context("decoding Crossref response")?;
        body["message-version"]
            .as_str()
            .map(|v| format!("crossref-{v}"))
            .ok_or_else(|| anyhow!("Crossref response has no message-version"))
    }

    async fn extract(&self, ctx: &RunContext, identifiers: &[String]) -> anyhow::Result<Vec<Record>> {
        bind_release(&self.client, ctx)?;
        let dois = identifiers.to_vec();
        Ok(fetch_ordered(dois, self.client.workers(), |doi| self.fetch_work(doi)).await)
    }

    async fn extract_all(&self, ctx: &RunContext) -> anyhow::Result<Vec<Record>> {
        bind_release(&self.client, ctx)?;
        let query = ctx.config.pipeline.query.as_deref();
        paginate("*".to_string(), self.client.max_pages(), |cursor| self.fetch_page(cursor, query)).await
    }
}

/// Flattens a Crossref `message` into [`COLUMNS`].
pub struct CrossrefTransformer;

impl CrossrefTransformer {
    fn normalize(mut record: Record) -> Record {
        if let Some(doi) = record.remove(KEY) {
            record.set(KEY, lower(doi));
        }
        let Some(work) = take_payload(&mut record) else {
            return record;
        };
        record.set("title", text(&work, "/title/0"));
        record.set("container_title", text(&work, "/container-title/0"));
        record.set("publisher", text(&work, "/publisher"));
        record.set("work_type", text(&work, "/type"));
        record.set("published_date", published_date(&work));
        record.set("volume", text(&work, "/volume"));
        record.set("issue", text(&work, "/issue"));
        record.set("page", text(&work, "/page"));
        let authors = work["author"].as_array().map_or(0, Vec::len);
        record.set("author_count", authors as i64);
        record
    }
}

/// First of `published`, `published-print`, `issued` with a year; missing
/// month/day parts are padded with `01`.
fn published_date(work: &serde_json::Value) -> Value {
    ["published", "published-print", "issued"]
        .iter()
        .find_map(|field| {
            let parts = work[*field]["date-parts"][0].as_array()?;
            let year = parts.first()?.as_i64()?;
            let month = parts.get(1).and_then(|m| m.as_i64()).unwrap_or(1);
            let day = parts.get(2).and_then(|d| d.as_i64()).unwrap_or(1);
            Some(Value::Str(format!("{year:04}-{month:02}-{day:02}")))
        })
        .unwrap_or(Value::Null)
}

#[async_trait]
impl Transformer for CrossrefTransformer {
    async fn transform(&self, _ctx: &RunContext, rows: Vec<Record>) -> anyhow::Result<Vec<Record>> {
        Ok(rows.into_iter().map(Self::normalize).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{client, context_with_release};
    use bioetl_test_utils::{ok_json, status, ScriptedTransport};
    use serde_json::json;
    use std::sync::Arc;

    fn work(doi: &str) -> serde_json::Value {
        json!({
            "status": "ok",
            "message-version": "1.0.0",
            "message": {
                "DOI": doi,
                "title": ["A study of KRAS"],
                "container-title": ["Nature"],
                "publisher": "Springer",
                "type": "journal-article",
                "issued": {"date-parts": [[2021, 3]]},
                "author": [{"given": "A", "family": "B"}, {"family": "C"}],
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_from_message_version() {
        let t = Arc::new(ScriptedTransport::with_replies([ok_json(json!({"message-version": "1.0.0", "message": {}}))]));
        let ex = CrossrefExtractor::new(client(SOURCE, t, 25));
        assert_eq!(ex.source_release(&context_with_release(None)).await.unwrap(), "crossref-1.0.0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_doi_becomes_not_found_row() {
        let t = Arc::new(
            ScriptedTransport::new()
                .route("10.1000/one", [ok_json(work("10.1000/ONE"))])
                .route("10.1000/missing", [status(404)]),
        );
        let ex = CrossrefExtractor::new(client(SOURCE, t.clone(), 25));
        let ctx = context_with_release(Some("crossref-1.0.0"));
        let dois = vec!["10.1000/one".to_string(), "10.1000/missing".to_string()];

        let rows = ex.extract(&ctx, &dois).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].is_fallback());
        let meta = rows[1].fallback_metadata().unwrap();
        assert_eq!(meta.reason, "not_found");
        assert_eq!(meta.http_status, Some(404));
        // 404 is not retried.
        assert_eq!(t.calls(), 2);
    }

    #[tokio::test]
    async fn test_transform_normalizes_work() {
        let ctx = context_with_release(Some("crossref-1.0.0"));
        let raw = vec![raw_record(SOURCE, KEY, "10.1000/ONE", work("10.1000/ONE")["message"].clone())];
        let rows = CrossrefTransformer.transform(&ctx, raw).await.unwrap();
        let r = &rows[0];
        assert_eq!(r.value("doi"), Value::Str("10.1000/one".into()));
        assert_eq!(r.value("title"), Value::Str("A study of KRAS".into()));
        assert_eq!(r.value("published_date"), Value::Str("2021-03-01".into()));
        assert_eq!(r.value("author_count"), Value::Int(2));
        assert_eq!(r.value("volume"), Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listing_uses_cursor() {
        let t = Arc::new(ScriptedTransport::with_replies([
            ok_json(json!({"message": {"items": [{"DOI": "10.1/a"}], "next-cursor": "abc"}})),
            ok_json(json!({"message": {"items": [], "next-cursor": "def"}})),
        ]));
        let ex = CrossrefExtractor::new(client(SOURCE, t.clone(), 25));
        let rows = ex.extract_all(&context_with_release(Some("crossref-1.0.0"))).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(t.param_values("cursor"), ["*", "abc"]);
    }
}
