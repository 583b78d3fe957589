//! bioetl — command-line entry point.
//!
//! `bioetl run` loads the layered config, builds the source's resilient
//! client and drives one pipeline run. `bioetl validate-config` loads and
//! checks the config without touching the network.
//!
//! Exit codes: 0 success, 1 runtime failure, 2 usage, config, schema, QC or
//! golden mismatch.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context};
use bioetl_config::{config_paths_from_env, load_layered, FailMode, PipelineConfig};
use bioetl_http::ResilientClient;
use bioetl_pipeline::{RunContext, Selection, EXIT_FAILURE, EXIT_SUCCESS, EXIT_VALIDATION};
use bioetl_sources::SourceKind;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bioetl", version, about = "Deterministic bibliographic and bioactivity ETL")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one pipeline: extract, transform, validate, write.
    Run(RunArgs),
    /// Load, merge and validate config layers, then print the config hash.
    ValidateConfig(ConfigArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(clap::Args, Debug)]
struct ConfigArgs {
    /// Config layers, later files win. Defaults to `BIOETL_CONFIG`.
    #[arg(long = "config", value_name = "PATH")]
    configs: Vec<PathBuf>,
}

impl ConfigArgs {
    fn load(&self) -> anyhow::Result<PipelineConfig> {
        let paths = if self.configs.is_empty() { config_paths_from_env() } else { self.configs.clone() };
        Ok(load_layered(&paths)?)
    }
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Source adapter. Must agree with `pipeline.source` when both are set.
    #[arg(long, value_name = "SOURCE")]
    source: Option<SourceKind>,

    /// Identifiers to fetch (comma separated or repeated).
    #[arg(long, value_delimiter = ',', conflicts_with = "ids_file")]
    ids: Vec<String>,

    /// File with one identifier per line; blank lines and `#` comments are skipped.
    #[arg(long, value_name = "PATH")]
    ids_file: Option<PathBuf>,

    /// Keep the first N extracted rows.
    #[arg(long, value_name = "N", conflicts_with = "sample")]
    limit: Option<usize>,

    /// Keep a deterministic sample of N rows.
    #[arg(long, value_name = "N")]
    sample: Option<usize>,

    /// Output directory for the artifact set.
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Compare written artifacts against this golden directory.
    #[arg(long, value_name = "DIR")]
    golden: Option<PathBuf>,

    /// Continue past schema violations (QC thresholds still apply).
    #[arg(long)]
    fail_open: bool,
}

// ── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let code = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::ValidateConfig(args) => validate_config(&args),
    };
    exit_code(code)
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bioetl=info,info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

// ── Commands ─────────────────────────────────────────────────────────────────

fn validate_config(args: &ConfigArgs) -> i32 {
    let checked = args.load().and_then(|cfg| {
        let hash = cfg.config_hash()?;
        Ok((cfg, hash))
    });
    match checked {
        Ok((cfg, hash)) => {
            info!(entity = %cfg.pipeline.entity, source = %cfg.pipeline.source, "Config is valid");
            println!("config_hash: {hash}");
            EXIT_SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "Config is invalid");
            EXIT_VALIDATION
        }
    }
}

async fn run(args: RunArgs) -> i32 {
    info!("bioetl {}", env!("CARGO_PKG_VERSION"));

    let prepared = prepare(&args);
    let (kind, ctx, selection) = match prepared {
        Ok(p) => p,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Run setup failed");
            return EXIT_VALIDATION;
        }
    };

    let client = match ResilientClient::new(kind.as_str(), &ctx.config.http, &ctx.config.cache) {
        Ok(c) => c,
        Err(e) => {
            error!(source = %kind, error = %e, "HTTP client setup failed");
            return EXIT_FAILURE;
        }
    };

    match kind.orchestrator(client).run(&ctx, &selection).await {
        Ok(report) => {
            println!("run_id: {}", report.run_id);
            println!("source_release: {}", report.source_release.as_deref().unwrap_or("-"));
            println!("rows_written: {}", report.rows_written);
            println!("fallback_rows: {}", report.fallback_rows);
            println!("schema_valid: {}", report.schema_valid);
            println!("dataset: {}", report.artifacts.dataset_path.display());
            report.exit_code()
        }
        // Already logged by the orchestrator.
        Err(e) => e.exit_code(),
    }
}

/// Everything that can fail before the network is touched. Failures here are
/// usage or config errors.
fn prepare(args: &RunArgs) -> anyhow::Result<(SourceKind, RunContext, Selection)> {
    let mut cfg = args.config.load()?;
    let kind = resolve_source(&cfg, args.source)?;
    apply_overrides(&mut cfg, args, kind);
    let selection = selection(args)?;
    let ctx = RunContext::new(cfg, env!("CARGO_PKG_VERSION"), chrono::Utc::now())?;
    Ok((kind, ctx, selection))
}

fn resolve_source(cfg: &PipelineConfig, flag: Option<SourceKind>) -> anyhow::Result<SourceKind> {
    let configured: SourceKind = cfg
        .pipeline
        .source
        .parse()
        .with_context(|| format!("pipeline.source {:?}", cfg.pipeline.source))?;
    match flag {
        Some(kind) if kind != configured => {
            bail!("--source {kind} does not match pipeline.source {configured}")
        }
        _ => Ok(configured),
    }
}

/// CLI flags win over the config layers.
fn apply_overrides(cfg: &mut PipelineConfig, args: &RunArgs, kind: SourceKind) {
    cfg.pipeline.source = kind.as_str().to_string();
    if let Some(n) = args.limit {
        cfg.pipeline.limit = Some(n);
        cfg.pipeline.sample = None;
    }
    if let Some(n) = args.sample {
        cfg.pipeline.sample = Some(n);
        cfg.pipeline.limit = None;
    }
    if let Some(dir) = &args.output {
        cfg.output.dir = dir.clone();
    }
    if let Some(dir) = &args.golden {
        cfg.output.golden_dir = Some(dir.clone());
    }
    if args.fail_open {
        cfg.pipeline.fail_mode = FailMode::Open;
    }
}

fn selection(args: &RunArgs) -> anyhow::Result<Selection> {
    let ids = match &args.ids_file {
        Some(path) => read_ids(path)?,
        None => args.ids.iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
    };
    if ids.is_empty() {
        if args.ids_file.is_some() {
            bail!("identifier file is empty");
        }
        return Ok(Selection::All);
    }
    Ok(Selection::Ids(ids))
}

fn read_ids(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}
