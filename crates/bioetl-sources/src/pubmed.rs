//! PubMed E-utilities.
//!
//! Endpoints (relative to `https://eutils.ncbi.nlm.nih.gov/entrez/eutils`):
//!   einfo:   `einfo.fcgi?db=pubmed` → `<DbBuild>` is the release
//!   esearch: `esearch.fcgi` → PMIDs for `pipeline.query`
//!   efetch:  `efetch.fcgi?id=1,2,3&retmode=xml` in batches

use std::collections::HashMap;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bioetl_common::Record;
use bioetl_http::{batches, fetch_ordered, FallbackRecord, Method, ResilientClient};
use bioetl_pipeline::{Extractor, RunContext, Transformer};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::support::{bind_release, fallback_rows, key_value, lower, raw_record, take_payload, text};

pub const SOURCE: &str = "pubmed";
pub const KEY: &str = "pmid";

pub const COLUMNS: [&str; 7] = ["pmid", "title", "journal", "pub_year", "doi", "abstract", "author_count"];

/// Fields lifted out of one `<PubmedArticle>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PubmedArticle {
    pub pmid: String,
    pub title: String,
    pub abstract_text: Option<String>,
    pub journal: Option<String>,
    pub pub_year: Option<i64>,
    pub doi: Option<String>,
    pub authors: Vec<String>,
}

pub struct PubmedExtractor {
    client: ResilientClient,
    api_key: Option<String>,
}

impl PubmedExtractor {
    pub fn new(client: ResilientClient) -> Self {
        Self { client, api_key: None }
    }

    /// NCBI key for the higher rate tier.
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    fn params<'a>(&'a self, extra: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
        let mut params = vec![("db", "pubmed")];
        params.extend_from_slice(extra);
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.as_str()));
        }
        params
    }

    #[instrument(skip(self, pmids), fields(batch = pmids.len()))]
    async fn efetch(&self, pmids: Vec<String>) -> Vec<Record> {
        let joined = pmids.join(",");
        let url = self.client.url_for("efetch.fcgi");
        let params = self.params(&[("id", joined.as_str()), ("retmode", "xml")]);
        let resp = match self.client.get("efetch.fcgi", &params).await.into_result() {
            Ok(resp) => resp,
            Err(fb) => return fallback_rows(&fb, SOURCE, KEY, &pmids),
        };

        let articles = match parse_articles(&resp.body) {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "Unparseable PubMed efetch XML");
                let fb = FallbackRecord::parse_error(&url, resp.status, e.to_string());
                return fallback_rows(&fb, SOURCE, KEY, &pmids);
            }
        };
        let mut by_pmid: HashMap<String, PubmedArticle> =
            articles.into_iter().map(|a| (a.pmid.clone(), a)).collect();
        debug!(requested = pmids.len(), returned = by_pmid.len(), "PubMed batch fetched");

        pmids
            .iter()
            .map(|pmid| match by_pmid.remove(pmid.trim()) {
                Some(article) => match serde_json::to_value(&article) {
                    Ok(payload) => raw_record(SOURCE, KEY, pmid, payload),
                    Err(e) => FallbackRecord::parse_error(&url, resp.status, e.to_string())
                        .record_for(SOURCE, [(KEY.to_string(), key_value(pmid))]),
                },
                None => FallbackRecord::not_found(&url, resp.status)
                    .record_for(SOURCE, [(KEY.to_string(), key_value(pmid))]),
            })
            .collect()
    }

    async fn esearch(&self, term: &str) -> anyhow::Result<Vec<String>> {
        let retmax = (self.client.batch_size() * self.client.max_pages().unwrap_or(100)).to_string();
        let params = self.params(&[("term", term), ("retmax", retmax.as_str()), ("retmode", "json")]);
        let resp = self
            .client
            .get("esearch.fcgi", &params)
            .await
            .into_result()
            .map_err(|fb| anyhow!("PubMed esearch failed: {} ({})", fb.reason, fb.message))?;
        let body: serde_json::Value = resp.json().context("decoding esearch response")?;
        let ids: Vec<String> = body["esearchresult"]["idlist"]
            .as_array()
            .map(|ids| ids.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        debug!(count = ids.len(), "PubMed esearch returned PMIDs");
        Ok(ids)
    }
}

#[async_trait]
impl Extractor for PubmedExtractor {
    #[instrument(skip_all)]
    async fn source_release(&self, _ctx: &RunContext) -> anyhow::Result<String> {
        let params = self.params(&[]);
        let resp = self
            .client
            .request_uncached(Method::GET, "einfo.fcgi", &params)
            .await
            .into_result()
            .map_err(|fb| anyhow!("PubMed einfo unavailable: {} ({})", fb.reason, fb.message))?;
        parse_db_build(&resp.body)?.ok_or_else(|| anyhow!("einfo response has no DbBuild"))
    }

    async fn extract(&self, ctx: &RunContext, identifiers: &[String]) -> anyhow::Result<Vec<Record>> {
        bind_release(&self.client, ctx)?;
        let chunks = batches(identifiers, self.client.batch_size());
        let rows = fetch_ordered(chunks, self.client.workers(), |ids| self.efetch(ids)).await;
        Ok(rows.into_iter().flatten().collect())
    }

    async fn extract_all(&self, ctx: &RunContext) -> anyhow::Result<Vec<Record>> {
        let term = ctx
            .config
            .pipeline
            .query
            .as_deref()
            .ok_or_else(|| anyhow!("PubMed needs identifiers or a pipeline.query search term"))?;
        bind_release(&self.client, ctx)?;
        let pmids = self.esearch(term).await?;
        self.extract(ctx, &pmids).await
    }
}

// ── XML ───────────────────────────────────────────────────────────────────────

fn text_of(event: &quick_xml::events::BytesText<'_>) -> anyhow::Result<String> {
    Ok(event.unescape()?.trim().to_string())
}

fn is_doi_id(start: &BytesStart<'_>) -> anyhow::Result<bool> {
    Ok(match start.try_get_attribute("IdType")? {
        Some(attr) => attr.unescape_value()?.eq_ignore_ascii_case("doi"),
        None => false,
    })
}

/// `<DbBuild>` from an einfo response.
pub fn parse_db_build(xml: &str) -> anyhow::Result<Option<String>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut inside = false;
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"DbBuild" => inside = true,
            Event::Text(t) if inside => return Ok(Some(text_of(&t)?)),
            Event::End(e) if e.name().as_ref() == b"DbBuild" => inside = false,
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Parse a `<PubmedArticleSet>` into articles.
///
/// Elements are matched by their path, so PMIDs cited under
/// `CommentsCorrections` never overwrite the article's own.
pub fn parse_articles(xml: &str) -> anyhow::Result<Vec<PubmedArticle>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut out = Vec::new();
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut current: Option<PubmedArticle> = None;
    let mut in_doi = false;
    let mut last = String::new();
    let mut fore = String::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"PubmedArticle" => current = Some(PubmedArticle::default()),
                    b"Author" => {
                        last.clear();
                        fore.clear();
                    }
                    b"ArticleId" => in_doi = is_doi_id(&e)?,
                    _ => {}
                }
                path.push(name);
            }
            Event::Text(t) => {
                let Some(article) = current.as_mut() else { continue };
                let value = text_of(&t)?;
                if value.is_empty() {
                    continue;
                }
                let within = |tag: &[u8]| path.iter().any(|p| p.as_slice() == tag);
                let parent = path.iter().rev().nth(1).map(Vec::as_slice);
                let parent_is = |tag: &[u8]| parent == Some(tag);
                match path.last().map(Vec::as_slice) {
                    Some(b"PMID") if parent_is(b"MedlineCitation") => article.pmid = value,
                    Some(b"Title") if parent_is(b"Journal") => article.journal = Some(value),
                    Some(b"Year") if parent_is(b"PubDate") => article.pub_year = value.parse().ok(),
                    Some(b"LastName") if within(b"Author") => last = value,
                    Some(b"ForeName") if within(b"Author") => fore = value,
                    Some(b"ArticleId") if in_doi && within(b"PubmedData") => {
                        article.doi.get_or_insert(value);
                    }
                    _ if within(b"ArticleTitle") => append(&mut article.title, &value),
                    _ if within(b"AbstractText") => {
                        append(article.abstract_text.get_or_insert_with(String::new), &value)
                    }
                    _ => {}
                }
            }
            Event::End(e) => {
                match e.name().as_ref() {
                    b"Author" => {
                        if let Some(article) = current.as_mut() {
                            let name = match (fore.is_empty(), last.is_empty()) {
                                (_, true) => fore.clone(),
                                (true, false) => last.clone(),
                                (false, false) => format!("{fore} {last}"),
                            };
                            if !name.is_empty() {
                                article.authors.push(name);
                            }
                        }
                    }
                    b"ArticleId" => in_doi = false,
                    b"PubmedArticle" => {
                        if let Some(article) = current.take() {
                            if article.pmid.is_empty() {
                                warn!("PubmedArticle without a PMID skipped");
                            } else {
                                out.push(article);
                            }
                        }
                    }
                    _ => {}
                }
                path.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

fn append(buf: &mut String, piece: &str) {
    if !buf.is_empty() {
        buf.push(' ');
    }
    buf.push_str(piece);
}

// ── Transform ─────────────────────────────────────────────────────────────────

/// Flattens a parsed article into [`COLUMNS`].
pub struct PubmedTransformer;

impl PubmedTransformer {
    fn normalize(mut record: Record) -> Record {
        let Some(article) = take_payload(&mut record) else {
            return record;
        };
        record.set("title", text(&article, "/title"));
        record.set("journal", text(&article, "/journal"));
        record.set("pub_year", article["pub_year"].as_i64());
        record.set("doi", lower(text(&article, "/doi")));
        record.set("abstract", text(&article, "/abstract_text"));
        let authors = article["authors"].as_array().map_or(0, Vec::len);
        record.set("author_count", authors as i64);
        record
    }
}

#[async_trait]
impl Transformer for PubmedTransformer {
    async fn transform(&self, _ctx: &RunContext, rows: Vec<Record>) -> anyhow::Result<Vec<Record>> {
        Ok(rows.into_iter().map(Self::normalize).collect())
    }
}
