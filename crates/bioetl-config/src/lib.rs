//! bioetl-config — Typed configuration for one pipeline run.
//!
//! A run is described by one or more YAML files, deep-merged in order (later
//! files win). `BIOETL_CONFIG` supplies the default file list when none is
//! given on the command line.

pub mod error;
pub mod loader;
pub mod pipeline;

pub use error::{ConfigError, Result};
pub use loader::{config_paths_from_env, deep_merge, load_layered, CONFIG_ENV_VAR};
pub use pipeline::{FailMode, OutputConfig, PipelineConfig, PipelineSection};
