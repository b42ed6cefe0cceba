//! Configuration types for resync components.
//!
//! Sources are declared in a TOML file; runtime tuning knobs keep hardcoded
//! defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;
use crate::models::{MlsSource, Operation};
use crate::scheduler::normalize_cron;

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP client configuration for upstream API calls.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// Contents of `sources.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    /// Root of the batch store. `--data-dir` takes precedence.
    pub data_dir: Option<PathBuf>,
    /// Move applied batches to `done/` instead of deleting them.
    #[serde(default)]
    pub keep_done_batches: bool,
    #[serde(default)]
    pub sources: Vec<MlsSource>,
}

impl SourcesConfig {
    /// Structural checks that do not need the adapter registries.
    pub fn validate(&self) -> Result<(), AppError> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(AppError::Config("source with empty name".to_string()));
            }
            if !seen.insert(source.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate source name: {}",
                    source.name
                )));
            }
            validate_source(source)?;
        }
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&MlsSource> {
        self.sources.iter().find(|s| s.name == name)
    }
}

fn validate_source(source: &MlsSource) -> Result<(), AppError> {
    let fail = |msg: &str| Err(AppError::Config(format!("source {}: {}", source.name, msg)));

    if source.resources.is_empty() {
        return fail("no resources declared");
    }
    if source.top == 0 || source.top_for_purge == 0 {
        return fail("top and top_for_purge must be positive");
    }
    if source.metadata_endpoint.is_none() && source.metadata_path.is_none() {
        return fail("one of metadata_endpoint or metadata_path is required");
    }
    if !source.resource_endpoint.contains("{resource}") {
        return fail("resource_endpoint must contain {resource}");
    }

    for op in Operation::ALL {
        for expr in source.cron.cron_strings(op) {
            if let Err(AppError::Config(msg)) = normalize_cron(expr) {
                return fail(&format!("{}: {}", op, msg));
            }
        }
    }

    let mut names = HashSet::new();
    for destination in &source.destinations {
        if !names.insert(destination.name.as_str()) {
            return fail(&format!("duplicate destination name: {}", destination.name));
        }
    }
    Ok(())
}

/// Default location of the sources file: `<config dir>/resync/sources.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("resync").join("sources.toml"))
}

/// Default batch store root: `<data dir>/resync/batches`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("resync")
        .join("batches")
}

/// Reads and validates the sources file.
pub fn load_sources_config(path: &Path) -> Result<SourcesConfig, AppError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!("cannot read {}: {}", path.display(), e))
    })?;
    let config: SourcesConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}
