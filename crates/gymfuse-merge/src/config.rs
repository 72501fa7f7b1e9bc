use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use gymfuse_storage::BatchConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::matcher::DEFAULT_DUPLICATE_THRESHOLD;

pub const MAX_AUTHORITATIVE_RECORDS: usize = 30_000;
pub const MAX_CRAWLED_RECORDS: usize = 20_000;
pub const MAX_RESULT_RECORDS: usize = 50_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for the merge engine and its fetch phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub max_concurrent_requests: usize,
    /// Milliseconds.
    #[serde(rename = "delayBetweenBatches")]
    pub delay_between_batches_ms: u64,
    /// Crawled candidates below this extraction confidence are dropped before merging.
    pub min_search_confidence: f64,
    /// Merges at or above this confidence count as successful.
    pub quality_threshold: f64,
    pub duplicate_threshold: f64,
    pub cache_capacity: usize,
    pub max_authoritative: usize,
    pub max_crawled: usize,
    pub max_results: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_concurrent_requests: 3,
            delay_between_batches_ms: 1000,
            min_search_confidence: 0.3,
            quality_threshold: 0.5,
            duplicate_threshold: DEFAULT_DUPLICATE_THRESHOLD,
            cache_capacity: 1000,
            max_authoritative: MAX_AUTHORITATIVE_RECORDS,
            max_crawled: MAX_CRAWLED_RECORDS,
            max_results: MAX_RESULT_RECORDS,
        }
    }
}

fn parsed_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// `GYMFUSE_*` environment variables over the defaults. Unparseable values
    /// fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            batch_size: parsed_or(&lookup, "GYMFUSE_BATCH_SIZE", d.batch_size),
            max_concurrent_requests: parsed_or(
                &lookup,
                "GYMFUSE_MAX_CONCURRENT_REQUESTS",
                d.max_concurrent_requests,
            ),
            delay_between_batches_ms: parsed_or(
                &lookup,
                "GYMFUSE_DELAY_BETWEEN_BATCHES_MS",
                d.delay_between_batches_ms,
            ),
            min_search_confidence: parsed_or(
                &lookup,
                "GYMFUSE_MIN_SEARCH_CONFIDENCE",
                d.min_search_confidence,
            ),
            quality_threshold: parsed_or(&lookup, "GYMFUSE_QUALITY_THRESHOLD", d.quality_threshold),
            duplicate_threshold: parsed_or(&lookup, "GYMFUSE_DUPLICATE_THRESHOLD", d.duplicate_threshold),
            cache_capacity: parsed_or(&lookup, "GYMFUSE_CACHE_CAPACITY", d.cache_capacity),
            max_authoritative: d.max_authoritative,
            max_crawled: d.max_crawled,
            max_results: d.max_results,
        }
    }

    pub fn from_yaml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batchSize must be at least 1".into()));
        }
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "maxConcurrentRequests must be at least 1".into(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::Invalid("cacheCapacity must be at least 1".into()));
        }
        for (name, value) in [
            ("minSearchConfidence", self.min_search_confidence),
            ("qualityThreshold", self.quality_threshold),
            ("duplicateThreshold", self.duplicate_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size,
            max_concurrency: self.max_concurrent_requests,
            inter_batch_delay: Duration::from_millis(self.delay_between_batches_ms),
        }
    }
}

/// Filesystem layout for one sync run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub engine: EngineConfig,
    pub workspace_root: PathBuf,
    /// Persisted record collection, read at the start of a run and replaced at the end.
    pub records_path: PathBuf,
    pub fixtures_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub snapshots_dir: PathBuf,
}

impl PipelineConfig {
    pub fn for_workspace(root: impl Into<PathBuf>, engine: EngineConfig) -> Self {
        let root = root.into();
        Self {
            engine,
            records_path: root.join("data").join("gyms.json"),
            fixtures_dir: root.join("fixtures"),
            reports_dir: root.join("reports"),
            snapshots_dir: root.join("snapshots"),
            workspace_root: root,
        }
    }

    /// `GYMFUSE_WORKSPACE_ROOT` picks the layout; `GYMFUSE_CONFIG` names an
    /// optional YAML file that replaces the environment-derived engine settings.
    pub fn from_env() -> Result<Self, ConfigError> {
        let root = std::env::var("GYMFUSE_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let engine = match std::env::var("GYMFUSE_CONFIG") {
            Ok(path) if !path.trim().is_empty() => EngineConfig::from_yaml_file(path.trim())?,
            _ => EngineConfig::from_env(),
        };
        engine.validate()?;

        let mut config = Self::for_workspace(root, engine);
        if let Ok(path) = std::env::var("GYMFUSE_RECORDS_PATH") {
            config.records_path = PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("GYMFUSE_FIXTURES_DIR") {
            config.fixtures_dir = PathBuf::from(dir);
        }
        Ok(config)
    }
}
