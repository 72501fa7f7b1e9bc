//! Duplicate matching, cross-validation and merging of authoritative and
//! crawled gym records, plus the batch fusion pipeline that drives them.

mod cache;
mod config;
mod matcher;
mod merger;
mod pipeline;
mod similarity;
mod validate;

pub use cache::FifoCache;
pub use config::{
    ConfigError, EngineConfig, PipelineConfig, MAX_AUTHORITATIVE_RECORDS, MAX_CRAWLED_RECORDS,
    MAX_RESULT_RECORDS,
};
pub use matcher::{MatchWeights, Matchable, RecordMatcher, DEFAULT_DUPLICATE_THRESHOLD};
pub use merger::{
    completeness, MergeError, MergeLimits, MergeOutput, MergeStatistics, UnifiedMerger,
};
pub use pipeline::{
    fixture_sources, run_once_from_env, FusionPipeline, FusionRunSummary, SharedSource,
};
pub use similarity::SimilarityScorer;
pub use validate::{
    CrossValidator, MergedFieldSet, ValidationBonus, ValidationError, CONFIDENCE_CEILING,
    FALLBACK_CONFIDENCE, FALLBACK_SOURCE,
};

pub const CRATE_NAME: &str = "gymfuse-merge";
