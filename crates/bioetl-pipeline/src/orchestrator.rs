//! Drives one run through Extract → Transform → Validate → Write.

use std::collections::BTreeMap;
use std::time::Instant;

use bioetl_common::Record;
use bioetl_determinism::{Canonicalizer, DeterminismError, WriteOutcome};
use bioetl_qc::{compute_metrics, compare_golden, enforce_thresholds, QcSummary, ValidatedRows};
use tracing::{error, info, info_span, warn, Instrument};

use crate::context::RunContext;
use crate::error::{PipelineError, Result, EXIT_SUCCESS};
use crate::select::{apply_limit, apply_sample};
use crate::stage::{Stage, StageMachine};
use crate::traits::{ArtifactSink, Extractor, SchemaValidator, Transformer, Validator, WriteRequest, Writer};

/// Violations logged individually before the rest are summarized.
const MAX_LOGGED_VIOLATIONS: usize = 20;

/// Which rows Extract asks the source for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Ids(Vec<String>),
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: uuid::Uuid,
    pub source_release: Option<String>,
    pub rows_extracted: usize,
    pub rows_written: usize,
    pub fallback_rows: usize,
    pub schema_valid: bool,
    pub qc: QcSummary,
    pub artifacts: WriteOutcome,
    pub stage_durations_ms: BTreeMap<String, u64>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        EXIT_SUCCESS
    }
}

pub struct Orchestrator {
    extractor: Box<dyn Extractor>,
    transformer: Box<dyn Transformer>,
    validator: Box<dyn Validator>,
    writer: Box<dyn Writer>,
}

impl Orchestrator {
    /// Schema validation and the artifact writer are the defaults.
    pub fn new(extractor: impl Extractor + 'static, transformer: impl Transformer + 'static) -> Self {
        Self::from_boxed(Box::new(extractor), Box::new(transformer))
    }

    /// For callers that pick the source at runtime.
    pub fn from_boxed(extractor: Box<dyn Extractor>, transformer: Box<dyn Transformer>) -> Self {
        Self {
            extractor,
            transformer,
            validator: Box::new(SchemaValidator),
            writer: Box::new(ArtifactSink),
        }
    }

    pub fn with_validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Box::new(validator);
        self
    }

    pub fn with_writer(mut self, writer: impl Writer + 'static) -> Self {
        self.writer = Box::new(writer);
        self
    }

    /// Run every stage. A failure is logged exactly once, here, with the
    /// stage it happened in and the exit code it maps to.
    pub async fn run(&self, ctx: &RunContext, selection: &Selection) -> Result<RunReport> {
        let span = info_span!(
            "run",
            run_id = %ctx.run.run_id,
            entity = %ctx.entity(),
            source = %ctx.source(),
        );
        let mut machine = StageMachine::new();
        let result = self.drive(ctx, selection, &mut machine).instrument(span.clone()).await;

        if let Err(e) = &result {
            let stage = machine.fail();
            span.in_scope(|| {
                error!(
                    run_id = %ctx.run.run_id,
                    stage = %stage,
                    error_kind = e.kind(),
                    exit_code = e.exit_code(),
                    error = %e,
                    "Pipeline run failed"
                )
            });
        }
        result
    }

    async fn drive(&self, ctx: &RunContext, selection: &Selection, machine: &mut StageMachine) -> Result<RunReport> {
        let cfg = &ctx.config;
        let started = Instant::now();
        let mut durations = BTreeMap::new();
        info!(
            config_hash = %ctx.run.config_hash,
            code_version = %ctx.run.code_version,
            fail_mode = ?cfg.pipeline.fail_mode,
            "Pipeline run started"
        );

        // ── Extract ──────────────────────────────────────────────────────────
        machine.advance(Stage::Extract)?;
        let rows_in = match selection {
            Selection::All => 0,
            Selection::Ids(ids) => ids.len(),
        };
        let timer = StageTimer::begin(Stage::Extract, rows_in);
        let release = match &cfg.pipeline.source_release {
            Some(pinned) => pinned.clone(),
            None => self
                .extractor
                .source_release(ctx)
                .await
                .map_err(|e| PipelineError::stage(Stage::Extract, e))?,
        };
        let release = ctx.run.capture_release(release)?;
        info!(source_release = %release, "Source release captured");

        let rows = match selection {
            Selection::All => self.extractor.extract_all(ctx).await,
            Selection::Ids(ids) => self.extractor.extract(ctx, ids).await,
        }
        .map_err(|e| PipelineError::stage(Stage::Extract, e))?;
        let rows_extracted = rows.len();
        let rows = select_rows(ctx, rows);
        let fallback_rows = rows.iter().filter(|r| r.is_fallback()).count();
        if fallback_rows > 0 {
            warn!(fallback_rows, "Extract produced fallback rows");
        }
        timer.end(rows.len(), &mut durations);

        // ── Transform ────────────────────────────────────────────────────────
        machine.advance(Stage::Transform)?;
        let timer = StageTimer::begin(Stage::Transform, rows.len());
        let rows = self
            .transformer
            .transform(ctx, rows)
            .await
            .map_err(|e| PipelineError::stage(Stage::Transform, e))?;
        timer.end(rows.len(), &mut durations);

        // ── Validate ─────────────────────────────────────────────────────────
        machine.advance(Stage::Validate)?;
        let timer = StageTimer::begin(Stage::Validate, rows.len());
        // Schema and QC must judge the values the writer will emit.
        let mut rows = rows;
        Canonicalizer::new(&cfg.determinism).canonicalize_all(&mut rows);
        let validated = self.validate(ctx, rows)?;
        let qc = run_qc(ctx, &validated)?;
        timer.end(validated.len(), &mut durations);

        // ── Write ────────────────────────────────────────────────────────────
        machine.advance(Stage::Write)?;
        let timer = StageTimer::begin(Stage::Write, validated.len());
        let schema_valid = validated.schema_valid();
        let rows_written = validated.len();
        let request = WriteRequest {
            rows: validated,
            qc: &qc,
            stage_durations_ms: durations.clone(),
        };
        let artifacts = self.writer.write(ctx, request).await.map_err(write_error)?;
        if let Some(golden) = &cfg.output.golden_dir {
            compare_golden(&artifacts, golden, &cfg.output.masked_meta_fields)?;
        }
        timer.end(rows_written, &mut durations);

        machine.advance(Stage::Done)?;
        info!(
            rows_written,
            duration_ms = started.elapsed().as_millis() as u64,
            dataset = %artifacts.dataset_path.display(),
            "Pipeline run finished"
        );

        Ok(RunReport {
            run_id: ctx.run.run_id,
            source_release: ctx.source_release().map(str::to_string),
            rows_extracted,
            rows_written,
            fallback_rows,
            schema_valid,
            qc,
            artifacts,
            stage_durations_ms: durations,
        })
    }

    fn validate(&self, ctx: &RunContext, rows: Vec<Record>) -> Result<ValidatedRows> {
        match self.validator.validate(ctx, rows) {
            Ok(valid) => Ok(valid),
            Err(errors) => {
                for v in errors.violations.iter().take(MAX_LOGGED_VIOLATIONS) {
                    warn!(
                        row = ?v.row_index,
                        column = %v.column,
                        rule = %v.rule,
                        value = %v.value,
                        "Schema violation"
                    );
                }
                if ctx.config.is_fail_open() {
                    warn!(
                        schema = %errors.schema,
                        violations = errors.count(),
                        "Schema validation failed; continuing in fail-open mode"
                    );
                    Ok(errors.accept())
                } else {
                    Err(PipelineError::Schema(errors))
                }
            }
        }
    }
}

fn select_rows(ctx: &RunContext, rows: Vec<Record>) -> Vec<Record> {
    let p = &ctx.config.pipeline;
    let before = rows.len();
    let rows = match (p.limit, p.sample) {
        (Some(n), _) => apply_limit(rows, n),
        (None, Some(n)) => apply_sample(rows, n, p.sample_seed),
        (None, None) => return rows,
    };
    info!(before, after = rows.len(), limit = ?p.limit, sample = ?p.sample, "Row selection applied");
    rows
}

/// Metrics plus threshold enforcement. The business key defaults to the
/// determinism business key when the QC plan names none.
fn run_qc(ctx: &RunContext, rows: &ValidatedRows) -> Result<QcSummary> {
    let mut plan = ctx.config.qc.metrics.clone();
    if plan.business_key.is_empty() {
        plan.business_key = ctx.config.determinism.business_key.clone();
    }
    let metrics = compute_metrics(rows.as_slice(), &plan, &ctx.siblings, ctx.config.determinism.float_precision);
    let summary = enforce_thresholds(metrics, &ctx.config.qc.thresholds)?;
    info!(
        metrics = summary.metrics.len(),
        breaches = summary.breaches.len(),
        worst = ?summary.worst_severity(),
        "QC gate passed"
    );
    Ok(summary)
}

fn write_error(e: anyhow::Error) -> PipelineError {
    match e.downcast::<DeterminismError>() {
        Ok(d) => PipelineError::Write(d),
        Err(e) => PipelineError::stage(Stage::Write, e),
    }
}

struct StageTimer {
    stage: Stage,
    rows_in: usize,
    started: Instant,
}

impl StageTimer {
    fn begin(stage: Stage, rows_in: usize) -> Self {
        info!(stage = %stage, rows_in, "Stage started");
        Self { stage, rows_in, started: Instant::now() }
    }

    fn end(self, rows_out: usize, durations: &mut BTreeMap<String, u64>) {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        info!(
            stage = %self.stage,
            duration_ms,
            rows_in = self.rows_in,
            rows_out,
            "Stage finished"
        );
        durations.insert(self.stage.as_str().to_string(), duration_ms);
    }
}
