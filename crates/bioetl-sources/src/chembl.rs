//! ChEMBL activities.
//!
//! Endpoint: https://www.ebi.ac.uk/chembl/api/data
//!
//!   - release: `status.json` → `chembl_db_version`
//!   - by id:   `activity.json?activity_id__in=1,2,3` in batches
//!   - listing: `activity.json`, following `page_meta.next`

use std::collections::HashMap;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bioetl_common::{Record, Value};
use bioetl_http::{batches, fetch_ordered, paginate, FallbackRecord, Page, ResilientClient};
use bioetl_pipeline::{Extractor, RunContext, Transformer};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::support::{self, bind_release, fallback_rows, number, raw_record, take_payload, text, upper};

pub const SOURCE: &str = "chembl";
pub const KEY: &str = "activity_id";

const PAGE_SIZE: usize = 1000;

/// Columns produced by [`ChemblTransformer`], in dataset order.
pub const COLUMNS: [&str; 10] = [
    "activity_id",
    "molecule_chembl_id",
    "target_chembl_id",
    "assay_chembl_id",
    "document_chembl_id",
    "standard_type",
    "standard_relation",
    "standard_value",
    "standard_units",
    "pchembl_value",
];

#[derive(Debug, Deserialize)]
struct ActivityPage {
    #[serde(default)]
    activities: Vec<serde_json::Value>,
    page_meta: Option<PageMeta>,
}

#[derive(Debug, Deserialize)]
struct PageMeta {
    next: Option<String>,
}

pub struct ChemblExtractor {
    client: ResilientClient,
}

impl ChemblExtractor {
    pub fn new(client: ResilientClient) -> Self {
        Self { client }
    }

    /// One `activity_id__in` request. Ids absent from a successful response
    /// become `not_found` rows; a failed request turns the whole batch into
    /// fallback rows.
    #[instrument(skip(self, ids), fields(batch = ids.len()))]
    async fn fetch_batch(&self, ids: Vec<String>) -> Vec<Record> {
        let joined = ids.join(",");
        let limit = ids.len().to_string();
        let url = self.client.url_for("activity.json");
        let resp = match self
            .client
            .get("activity.json", &[("activity_id__in", joined.as_str()), ("limit", limit.as_str())])
            .await
            .into_result()
        {
            Ok(resp) => resp,
            Err(fallback) => return fallback_rows(&fallback, SOURCE, KEY, &ids),
        };

        let page: ActivityPage = match resp.json() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Undecodable ChEMBL activity page");
                let fb = FallbackRecord::parse_error(&url, resp.status, e.to_string());
                return fallback_rows(&fb, SOURCE, KEY, &ids);
            }
        };

        let mut by_id: HashMap<String, serde_json::Value> = page
            .activities
            .into_iter()
            .filter_map(|a| Some((activity_key(&a)?, a)))
            .collect();
        debug!(requested = ids.len(), returned = by_id.len(), "ChEMBL batch fetched");

        ids.iter()
            .map(|id| match by_id.remove(id.trim()) {
                Some(payload) => raw_record(SOURCE, KEY, id, payload),
                None => FallbackRecord::not_found(&url, resp.status)
                    .record_for(SOURCE, [(KEY.to_string(), support::key_value(id))]),
            })
            .collect()
    }

    async fn fetch_page(&self, offset: usize, filters: &[(String, String)]) -> anyhow::Result<Page<Record, usize>> {
        let limit = PAGE_SIZE.to_string();
        let offset_s = offset.to_string();
        let mut params: Vec<(&str, &str)> = vec![("limit", limit.as_str()), ("offset", offset_s.as_str())];
        params.extend(filters.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let resp = self
            .client
            .get("activity.json", &params)
            .await
            .into_result()
            .map_err(|fb| anyhow!("ChEMBL page at offset {offset} failed: {} ({})", fb.reason, fb.message))?;
        let page: ActivityPage = resp.json().context("decoding ChEMBL activity page")?;

        let items: Vec<Record> = page
            .activities
            .into_iter()
            .filter_map(|a| {
                let id = activity_key(&a)?;
                Some(raw_record(SOURCE, KEY, &id, a))
            })
            .collect();
        let next = match page.page_meta.and_then(|m| m.next) {
            Some(link) => Some(next_offset(&link).unwrap_or(offset + items.len())),
            None => None,
        };
        // An empty page with a next link would loop forever.
        let next = next.filter(|_| !items.is_empty());
        Ok(Page { items, next })
    }
}

fn activity_key(activity: &serde_json::Value) -> Option<String> {
    match activity.get(KEY)? {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) => Some(s.trim().to_string()),
        _ => None,
    }
}

/// `offset` query parameter of a `page_meta.next` link.
fn next_offset(link: &str) -> Option<usize> {
    let base = url::Url::parse("https://www.ebi.ac.uk/").ok()?;
    let url = base.join(link).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == "offset")
        .and_then(|(_, v)| v.parse().ok())
}

/// `pipeline.query` as ChEMBL filter parameters, e.g.
/// `target_chembl_id=CHEMBL203&standard_type=IC50`.
fn filters(ctx: &RunContext) -> Vec<(String, String)> {
    ctx.config
        .pipeline
        .query
        .as_deref()
        .map(|q| {
            url::form_urlencoded::parse(q.trim_start_matches('?').as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Extractor for ChemblExtractor {
    #[instrument(skip_all)]
    async fn source_release(&self, _ctx: &RunContext) -> anyhow::Result<String> {
        let resp = self
            .client
            .request_uncached(bioetl_http::Method::GET, "status.json", &[])
            .await
            .into_result()
            .map_err(|fb| anyhow!("ChEMBL status unavailable: {} ({})", fb.reason, fb.message))?;
        let status: serde_json::Value = resp.json().context("decoding ChEMBL status")?;
        status
            .get("chembl_db_version")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("ChEMBL status has no chembl_db_version"))
    }

    async fn extract(&self, ctx: &RunContext, identifiers: &[String]) -> anyhow::Result<Vec<Record>> {
        bind_release(&self.client, ctx)?;
        let chunks = batches(identifiers, self.client.batch_size());
        let rows = fetch_ordered(chunks, self.client.workers(), |ids| self.fetch_batch(ids)).await;
        Ok(rows.into_iter().flatten().collect())
    }

    async fn extract_all(&self, ctx: &RunContext) -> anyhow::Result<Vec<Record>> {
        bind_release(&self.client, ctx)?;
        let filters = filters(ctx);
        let filters = &filters;
        paginate(0usize, self.client.max_pages(), |offset| self.fetch_page(offset, filters)).await
    }
}

/// Flattens an activity payload into [`COLUMNS`].
pub struct ChemblTransformer;

impl ChemblTransformer {
    fn normalize(mut record: Record) -> Record {
        let Some(payload) = take_payload(&mut record) else {
            return record;
        };
        let id = |col: &str| upper(text(&payload, &format!("/{col}")));
        record.set("molecule_chembl_id", id("molecule_chembl_id"));
        record.set("target_chembl_id", id("target_chembl_id"));
        record.set("assay_chembl_id", id("assay_chembl_id"));
        record.set("document_chembl_id", id("document_chembl_id"));
        record.set("standard_type", text(&payload, "/standard_type"));
        record.set("standard_relation", strip_quotes(text(&payload, "/standard_relation")));
        record.set("standard_value", number(&payload, "/standard_value"));
        record.set("standard_units", text(&payload, "/standard_units"));
        record.set("pchembl_value", number(&payload, "/pchembl_value"));
        record
    }
}

/// ChEMBL quotes some relations, e.g. `'='`.
fn strip_quotes(value: Value) -> Value {
    match value {
        Value::Str(s) => Value::Str(s.trim_matches('\'').to_string()),
        other => other,
    }
}

#[async_trait]
impl Transformer for ChemblTransformer {
    async fn transform(&self, _ctx: &RunContext, rows: Vec<Record>) -> anyhow::Result<Vec<Record>> {
        Ok(rows.into_iter().map(Self::normalize).collect())
    }
}
