//! End-to-end runs over an in-memory source.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bioetl_common::Record;
use bioetl_config::PipelineConfig;
use bioetl_determinism::{render, CaseRule, IdentifierColumn};
use bioetl_pipeline::{
    Extractor, IdentityTransformer, Orchestrator, PipelineError, RunContext, Selection, Transformer, EXIT_FAILURE,
    EXIT_VALIDATION,
};
use bioetl_test_utils::{activities, activity, fixed_now};
use pretty_assertions::assert_eq;

const CONFIG: &str = r#"
pipeline:
  entity: activity
  source: chembl
http:
  base_url: https://example.org/api
determinism:
  business_key: [activity_id]
  column_order:
    - activity_id
    - molecule_chembl_id
    - standard_type
    - standard_value
    - source_system
    - fallback_reason
    - fallback_error_type
    - fallback_http_status
    - fallback_attempt
    - hash_row
    - hash_business_key
schema:
  name: activity
  version: "2.1.0"
  fields:
    - name: activity_id
      dtype: int
      nullable: false
    - name: molecule_chembl_id
      dtype: string
      pattern: "CHEMBL\\d+"
    - name: standard_type
      dtype: string
      allowed: [IC50, Ki]
    - name: standard_value
      dtype: float
      min: 0
qc:
  thresholds:
    - metric: duplicate_count
      max: 0
      severity: critical
    - metric: fallback_ratio
      max: 0.5
      severity: warning
output:
  dir: OUT_DIR
  date_tag: fixture
"#;

fn config(out: &Path, pipeline_extra: &str) -> PipelineConfig {
    let yaml = CONFIG
        .replace("OUT_DIR", &out.display().to_string())
        .replace("source: chembl", &format!("source: chembl\n{pipeline_extra}"));
    PipelineConfig::from_yaml_str(&yaml).unwrap()
}

fn context(cfg: PipelineConfig) -> RunContext {
    RunContext::new(cfg, "0.1.0", fixed_now()).unwrap()
}

struct StaticExtractor {
    release: Option<&'static str>,
    rows: Option<Vec<Record>>,
}

impl StaticExtractor {
    fn new(rows: Vec<Record>) -> Self {
        Self { release: Some("ChEMBL_34"), rows: Some(rows) }
    }
}

#[async_trait]
impl Extractor for StaticExtractor {
    async fn source_release(&self, _ctx: &RunContext) -> anyhow::Result<String> {
        self.release
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("status endpoint unavailable"))
    }

    async fn extract(&self, ctx: &RunContext, identifiers: &[String]) -> anyhow::Result<Vec<Record>> {
        let all = self.extract_all(ctx).await?;
        Ok(identifiers
            .iter()
            .flat_map(|id| all.iter().filter(move |r| render(&r.value("activity_id"), 6) == *id).cloned())
            .collect())
    }

    async fn extract_all(&self, _ctx: &RunContext) -> anyhow::Result<Vec<Record>> {
        self.rows.clone().ok_or_else(|| anyhow::anyhow!("connection reset"))
    }
}

struct CountingTransformer(Arc<AtomicUsize>);

#[async_trait]
impl Transformer for CountingTransformer {
    async fn transform(&self, _ctx: &RunContext, rows: Vec<Record>) -> anyhow::Result<Vec<Record>> {
        self.0.store(rows.len(), Ordering::SeqCst);
        Ok(rows)
    }
}

fn meta(path: &Path) -> serde_yaml::Value {
    serde_yaml::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_successful_run_writes_artifact_set() {
    let out = tempfile::tempdir().unwrap();
    let ctx = context(config(out.path(), ""));
    let orch = Orchestrator::new(StaticExtractor::new(activities(&[3, 1, 2])), IdentityTransformer);

    let report = orch.run(&ctx, &Selection::All).await.unwrap();
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.rows_written, 3);
    assert_eq!(report.source_release.as_deref(), Some("ChEMBL_34"));
    assert!(report.schema_valid);
    assert_eq!(
        report.stage_durations_ms.keys().cloned().collect::<Vec<_>>(),
        ["extract", "transform", "validate", "write"]
    );

    let a = &report.artifacts;
    for p in [&a.dataset_path, &a.quality_report_path, &a.meta_path, &a.manifest_path] {
        assert!(p.exists(), "{} missing", p.display());
    }
    assert_eq!(a.dataset_path, out.path().join("activity_fixture.csv"));

    let dataset = std::fs::read_to_string(&a.dataset_path).unwrap();
    let ids: Vec<&str> = dataset.lines().skip(1).map(|l| l.split(',').next().unwrap()).collect();
    assert_eq!(ids, ["1", "2", "3"]);

    let m = meta(&a.meta_path);
    assert_eq!(m["schema_version"], "2.1.0");
    assert_eq!(m["source_release"], "ChEMBL_34");
    assert_eq!(m["row_count"], 3);
    assert_eq!(m["schema_valid"], true);
    assert_eq!(m["qc"]["status"], "pass");
    assert_eq!(m["config_hash"].as_str(), Some(ctx.run.config_hash.as_str()));
}

#[tokio::test]
async fn test_critical_duplicate_aborts_before_write() {
    let out = tempfile::tempdir().unwrap();
    let ctx = context(config(out.path(), ""));
    let orch = Orchestrator::new(StaticExtractor::new(activities(&[1, 1, 2])), IdentityTransformer);

    let err = orch.run(&ctx, &Selection::All).await.unwrap_err();
    assert!(matches!(err, PipelineError::Threshold(_)));
    assert_eq!(err.exit_code(), EXIT_VALIDATION);
    assert_eq!(err.kind(), "QcThresholdViolation");
    assert!(!out.path().join("activity_fixture.csv").exists());
    assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_keys_equal_after_canonicalization_are_duplicates() {
    let out = tempfile::tempdir().unwrap();
    let mut cfg = config(out.path(), "");
    cfg.determinism.business_key = vec!["molecule_chembl_id".into()];
    cfg.determinism.identifier_columns = vec![IdentifierColumn {
        name: "molecule_chembl_id".into(),
        case: CaseRule::Upper,
    }];
    let rows = vec![activity(1, "CHEMBL25", 1.5), activity(2, " chembl25", 3.0)];
    let orch = Orchestrator::new(StaticExtractor::new(rows), IdentityTransformer);

    let err = orch.run(&context(cfg), &Selection::All).await.unwrap_err();
    match &err {
        PipelineError::Threshold(v) => {
            let dup = v.critical.iter().find(|b| b.metric == "duplicate_count").unwrap();
            assert_eq!(dup.value, 1.0);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_schema_sees_canonical_identifiers() {
    let out = tempfile::tempdir().unwrap();
    let mut cfg = config(out.path(), "");
    cfg.determinism.identifier_columns = vec![IdentifierColumn {
        name: "molecule_chembl_id".into(),
        case: CaseRule::Upper,
    }];
    // Lowercase ids only satisfy the `CHEMBL\d+` pattern once upper-cased.
    let rows = vec![activity(1, "chembl25", 1.5), activity(2, "chembl26", 3.0)];
    let orch = Orchestrator::new(StaticExtractor::new(rows), IdentityTransformer);

    let report = orch.run(&context(cfg), &Selection::All).await.unwrap();
    assert!(report.schema_valid);
    let dataset = std::fs::read_to_string(&report.artifacts.dataset_path).unwrap();
    assert!(dataset.contains(",CHEMBL25,"));
}

#[tokio::test]
async fn test_schema_violation_fails_closed_by_default() {
    let out = tempfile::tempdir().unwrap();
    let ctx = context(config(out.path(), ""));
    let mut rows = activities(&[1, 2]);
    rows[1].set("standard_type", "Potency");
    let orch = Orchestrator::new(StaticExtractor::new(rows), IdentityTransformer);

    let err = orch.run(&ctx, &Selection::All).await.unwrap_err();
    match &err {
        PipelineError::Schema(e) => {
            assert_eq!(e.count(), 1);
            assert_eq!(e.violations[0].column, "standard_type");
            assert_eq!(e.violations[0].row_index, Some(1));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.exit_code(), EXIT_VALIDATION);
    assert!(!out.path().join("activity_fixture.csv").exists());
}

#[tokio::test]
async fn test_fail_open_writes_and_marks_schema_invalid() {
    let out = tempfile::tempdir().unwrap();
    let ctx = context(config(out.path(), "  fail_mode: open"));
    let mut rows = activities(&[1, 2]);
    rows[1].set("standard_type", "Potency");
    let orch = Orchestrator::new(StaticExtractor::new(rows), IdentityTransformer);

    let report = orch.run(&ctx, &Selection::All).await.unwrap();
    assert!(!report.schema_valid);
    assert_eq!(report.rows_written, 2);
    assert_eq!(meta(&report.artifacts.meta_path)["schema_valid"], false);
}

#[tokio::test]
async fn test_fail_open_does_not_soften_critical_qc() {
    let out = tempfile::tempdir().unwrap();
    let ctx = context(config(out.path(), "  fail_mode: open"));
    let orch = Orchestrator::new(StaticExtractor::new(activities(&[4, 4])), IdentityTransformer);

    let err = orch.run(&ctx, &Selection::All).await.unwrap_err();
    assert!(matches!(err, PipelineError::Threshold(_)));
}

#[tokio::test]
async fn test_reruns_are_byte_identical() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();

    let first = Orchestrator::new(StaticExtractor::new(activities(&[5, 1, 9])), IdentityTransformer)
        .run(&context(config(a.path(), "")), &Selection::All)
        .await
        .unwrap();
    let second = Orchestrator::new(StaticExtractor::new(activities(&[9, 5, 1])), IdentityTransformer)
        .run(&context(config(b.path(), "")), &Selection::All)
        .await
        .unwrap();

    assert_ne!(first.run_id, second.run_id);
    let read = |p: &Path| std::fs::read(p).unwrap();
    assert_eq!(read(&first.artifacts.dataset_path), read(&second.artifacts.dataset_path));
    assert_eq!(read(&first.artifacts.quality_report_path), read(&second.artifacts.quality_report_path));
    assert_eq!(read(&first.artifacts.manifest_path), read(&second.artifacts.manifest_path));
}

#[tokio::test]
async fn test_limit_applies_before_transform() {
    let out = tempfile::tempdir().unwrap();
    let ctx = context(config(out.path(), "  limit: 2"));
    let seen = Arc::new(AtomicUsize::new(0));
    let orch = Orchestrator::new(
        StaticExtractor::new(activities(&[7, 3, 5, 1])),
        CountingTransformer(seen.clone()),
    );

    let report = orch.run(&ctx, &Selection::All).await.unwrap();
    assert_eq!(report.rows_extracted, 4);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    let dataset = std::fs::read_to_string(&report.artifacts.dataset_path).unwrap();
    let ids: Vec<&str> = dataset.lines().skip(1).map(|l| l.split(',').next().unwrap()).collect();
    // First two in extraction order, then sorted on write.
    assert_eq!(ids, ["3", "7"]);
}

#[tokio::test]
async fn test_extract_by_identifiers() {
    let out = tempfile::tempdir().unwrap();
    let ctx = context(config(out.path(), ""));
    let orch = Orchestrator::new(StaticExtractor::new(activities(&[1, 2, 3, 4])), IdentityTransformer);

    let report = orch
        .run(&ctx, &Selection::Ids(vec!["4".into(), "2".into()]))
        .await
        .unwrap();
    assert_eq!(report.rows_written, 2);
}

#[tokio::test]
async fn test_extract_failure_is_runtime_error() {
    let out = tempfile::tempdir().unwrap();
    let ctx = context(config(out.path(), ""));
    let orch = Orchestrator::new(StaticExtractor { release: Some("ChEMBL_34"), rows: None }, IdentityTransformer);

    let err = orch.run(&ctx, &Selection::All).await.unwrap_err();
    assert_eq!(err.exit_code(), EXIT_FAILURE);
    assert_eq!(err.kind(), "StageError");
    assert_eq!(err.to_string(), "extract stage failed: connection reset");
}

#[tokio::test]
async fn test_pinned_release_skips_source_lookup() {
    let out = tempfile::tempdir().unwrap();
    let ctx = context(config(out.path(), "  source_release: ChEMBL_33"));
    let orch = Orchestrator::new(
        StaticExtractor { release: None, rows: Some(activities(&[1])) },
        IdentityTransformer,
    );

    let report = orch.run(&ctx, &Selection::All).await.unwrap();
    assert_eq!(report.source_release.as_deref(), Some("ChEMBL_33"));
    assert_eq!(ctx.source_release(), Some("ChEMBL_33"));
}

#[tokio::test]
async fn test_golden_comparison() {
    let golden = tempfile::tempdir().unwrap();
    Orchestrator::new(StaticExtractor::new(activities(&[1, 2])), IdentityTransformer)
        .run(&context(config(golden.path(), "")), &Selection::All)
        .await
        .unwrap();

    let with_golden = |out: &Path| {
        let mut cfg = config(out, "");
        cfg.output.golden_dir = Some(golden.path().to_path_buf());
        cfg
    };

    let same = tempfile::tempdir().unwrap();
    Orchestrator::new(StaticExtractor::new(activities(&[2, 1])), IdentityTransformer)
        .run(&context(with_golden(same.path())), &Selection::All)
        .await
        .unwrap();

    let drifted = tempfile::tempdir().unwrap();
    let rows = vec![activity(1, "CHEMBL1001", 1.5), activity(2, "CHEMBL1002", 9.0)];
    let err = Orchestrator::new(StaticExtractor::new(rows), IdentityTransformer)
        .run(&context(with_golden(drifted.path())), &Selection::All)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Golden(_)));
    assert_eq!(err.exit_code(), EXIT_VALIDATION);
}
