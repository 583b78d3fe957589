//! bioetl-sources — Thin adapters that plug upstream APIs into the pipeline.
//!
//! Each adapter is an [`Extractor`] that returns raw payload rows (or
//! fallback rows for identifiers that could not be fetched) and a
//! [`Transformer`] that flattens them into the entity's columns.

pub mod chembl;
pub mod crossref;
pub mod pubmed;
pub mod support;

use std::fmt;
use std::str::FromStr;

use bioetl_http::ResilientClient;
use bioetl_pipeline::{Extractor, Orchestrator, Transformer};

pub use chembl::{ChemblExtractor, ChemblTransformer};
pub use crossref::{CrossrefExtractor, CrossrefTransformer};
pub use pubmed::{PubmedArticle, PubmedExtractor, PubmedTransformer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Chembl,
    Crossref,
    Pubmed,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [SourceKind::Chembl, SourceKind::Crossref, SourceKind::Pubmed];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Chembl   => chembl::SOURCE,
            SourceKind::Crossref => crossref::SOURCE,
            SourceKind::Pubmed   => pubmed::SOURCE,
        }
    }

    /// Column that identifies a row for this source.
    pub fn key_column(&self) -> &'static str {
        match self {
            SourceKind::Chembl   => chembl::KEY,
            SourceKind::Crossref => crossref::KEY,
            SourceKind::Pubmed   => pubmed::KEY,
        }
    }

    /// Business columns the transformer produces.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            SourceKind::Chembl   => &chembl::COLUMNS,
            SourceKind::Crossref => &crossref::COLUMNS,
            SourceKind::Pubmed   => &pubmed::COLUMNS,
        }
    }

    /// Extractor and transformer for this source over `client`.
    pub fn stages(&self, client: ResilientClient) -> (Box<dyn Extractor>, Box<dyn Transformer>) {
        match self {
            SourceKind::Chembl => (Box::new(ChemblExtractor::new(client)), Box::new(ChemblTransformer)),
            SourceKind::Crossref => (Box::new(CrossrefExtractor::new(client)), Box::new(CrossrefTransformer)),
            SourceKind::Pubmed => {
                let api_key = std::env::var("NCBI_API_KEY").ok().filter(|k| !k.is_empty());
                (
                    Box::new(PubmedExtractor::new(client).with_api_key(api_key)),
                    Box::new(PubmedTransformer),
                )
            }
        }
    }

    pub fn orchestrator(&self, client: ResilientClient) -> Orchestrator {
        let (extractor, transformer) = self.stages(client);
        Orchestrator::from_boxed(extractor, transformer)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("unknown source {s:?} (expected chembl, crossref or pubmed)"))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use bioetl_config::PipelineConfig;
    use bioetl_http::{CacheConfig, HttpClientConfig, ResilientClient};
    use bioetl_pipeline::RunContext;
    use bioetl_test_utils::{fixed_now, ScriptedTransport};

    /// Single worker, no rate limit, short backoff, no cache.
    pub fn client(source: &str, transport: Arc<ScriptedTransport>, batch_size: usize) -> ResilientClient {
        let mut http = HttpClientConfig::default().with_base_url("https://api.example.org");
        http.workers = 1;
        http.batch_size = batch_size;
        http.rate_limit.max_calls = 0;
        http.retry.backoff_initial_ms = 10;
        let cache = CacheConfig { enabled: false, ..CacheConfig::default() };
        ResilientClient::with_transport(source, &http, &cache, transport).unwrap()
    }

    pub fn context_with_release(release: Option<&str>) -> RunContext {
        let cfg = PipelineConfig::from_yaml_str(
            r#"
pipeline: {entity: test, source: test}
http: {base_url: "https://api.example.org"}
determinism: {business_key: [id], column_order: [id]}
schema: {name: test, fields: [{name: id, dtype: string}]}
"#,
        )
        .unwrap();
        let ctx = RunContext::new(cfg, "0.1.0", fixed_now()).unwrap();
        if let Some(r) = release {
            ctx.run.capture_release(r).unwrap();
        }
        ctx
    }
}
