//! Stage seams. A pipeline is one implementation of each, composed by the
//! [`Orchestrator`](crate::Orchestrator).

use std::collections::BTreeMap;

use async_trait::async_trait;
use bioetl_common::Record;
use bioetl_determinism::{ArtifactWriter, MetaInputs, WriteOutcome};
use bioetl_qc::{validate_schema, QcSummary, SchemaErrors, ValidatedRows};
use chrono::Utc;

use crate::context::RunContext;

/// Pulls raw rows from one upstream source.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Upstream release snapshot identifier, e.g. `ChEMBL_34`.
    async fn source_release(&self, ctx: &RunContext) -> anyhow::Result<String>;

    /// Rows for the given identifiers, in input order. Identifiers that
    /// could not be retrieved come back as fallback rows.
    async fn extract(&self, ctx: &RunContext, identifiers: &[String]) -> anyhow::Result<Vec<Record>>;

    /// Every row the source exposes for this entity.
    async fn extract_all(&self, ctx: &RunContext) -> anyhow::Result<Vec<Record>>;
}

/// Normalizes extracted rows into the entity's column set.
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, ctx: &RunContext, rows: Vec<Record>) -> anyhow::Result<Vec<Record>>;
}

/// Passes every row through unchanged.
pub struct IdentityTransformer;

#[async_trait]
impl Transformer for IdentityTransformer {
    async fn transform(&self, _ctx: &RunContext, rows: Vec<Record>) -> anyhow::Result<Vec<Record>> {
        Ok(rows)
    }
}

pub trait Validator: Send + Sync {
    fn validate(&self, ctx: &RunContext, rows: Vec<Record>) -> Result<ValidatedRows, SchemaErrors>;
}

/// Validates against the schema declared in the run config.
pub struct SchemaValidator;

impl Validator for SchemaValidator {
    fn validate(&self, ctx: &RunContext, rows: Vec<Record>) -> Result<ValidatedRows, SchemaErrors> {
        validate_schema(&ctx.config.schema, rows, ctx.config.determinism.float_precision)
    }
}

/// Input of the write stage.
pub struct WriteRequest<'a> {
    pub rows: ValidatedRows,
    pub qc: &'a QcSummary,
    pub stage_durations_ms: BTreeMap<String, u64>,
}

#[async_trait]
pub trait Writer: Send + Sync {
    async fn write(&self, ctx: &RunContext, request: WriteRequest<'_>) -> anyhow::Result<WriteOutcome>;
}

/// Deterministic CSV/YAML/JSON artifact set under `output.dir`.
pub struct ArtifactSink;

impl ArtifactSink {
    fn writer(ctx: &RunContext) -> ArtifactWriter {
        let cfg = &ctx.config;
        ArtifactWriter::new(cfg.output.dir.clone(), cfg.pipeline.entity.clone(), cfg.determinism.clone())
            .with_date_tag(cfg.output.date_tag.clone())
    }
}

#[async_trait]
impl Writer for ArtifactSink {
    async fn write(&self, ctx: &RunContext, request: WriteRequest<'_>) -> anyhow::Result<WriteOutcome> {
        let writer = Self::writer(ctx);
        let schema_valid = request.rows.schema_valid();
        let mut rows = request.rows.into_inner();
        writer.prepare(&mut rows);

        let meta = MetaInputs {
            schema_name: ctx.config.schema.name.clone(),
            schema_version: ctx.config.schema.version.clone(),
            source_release: ctx.source_release().map(str::to_string),
            schema_valid,
            qc_summary: request.qc.to_json(),
            config_hash: ctx.run.config_hash.clone(),
            code_version: ctx.run.code_version.clone(),
            run_id: ctx.run.run_id,
            started_at: ctx.run.started_at,
            generated_at: Utc::now(),
            stage_durations_ms: request.stage_durations_ms,
        };
        Ok(writer.write(&rows, &request.qc.report_table(), &meta)?)
    }
}
