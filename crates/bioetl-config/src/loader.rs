//! Layered YAML loading.

use std::path::{Path, PathBuf};

use serde_yaml::Value;
use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::pipeline::PipelineConfig;

pub const CONFIG_ENV_VAR: &str = "BIOETL_CONFIG";

/// Paths listed in `BIOETL_CONFIG` (platform path-list separator).
pub fn config_paths_from_env() -> Vec<PathBuf> {
    std::env::var_os(CONFIG_ENV_VAR)
        .map(|v| std::env::split_paths(&v).filter(|p| !p.as_os_str().is_empty()).collect())
        .unwrap_or_default()
}

/// Merge `overlay` into `base`. Mappings merge key by key; anything else in
/// the overlay replaces the base value.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn read_layer(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    // An empty file parses as null; treat it as an empty layer.
    Ok(if value.is_null() { Value::Mapping(Default::default()) } else { value })
}

/// Load, merge and validate the given files.
pub fn load_layered(paths: &[PathBuf]) -> Result<PipelineConfig> {
    if paths.is_empty() {
        return Err(ConfigError::Missing(CONFIG_ENV_VAR));
    }
    let mut merged = Value::Mapping(Default::default());
    for path in paths {
        debug!(path = %path.display(), "Loading config layer");
        deep_merge(&mut merged, read_layer(path)?);
    }
    let config: PipelineConfig = serde_yaml::from_value(merged)?;
    config.validate()?;
    Ok(config)
}
