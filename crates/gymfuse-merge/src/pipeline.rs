//! One fusion run: load persisted records, search candidates in paced batches,
//! merge, persist, report.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gymfuse_core::{parse_authoritative_list, AuthoritativeRecord, RawCandidateRecord};
use gymfuse_extract::{load_fixture_sources, CandidateSource, FieldExtractor, SourceError};
use gymfuse_storage::{
    read_json_value, write_file_atomic, write_json_atomic, BatchOrchestrator, BatchProgress,
    ConcurrencyLimiter, ItemOutcome, SnapshotStore,
};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::FifoCache;
use crate::config::PipelineConfig;
use crate::merger::{MergeOutput, MergeStatistics, UnifiedMerger};
use crate::similarity::SimilarityScorer;

pub type SharedSource = Arc<dyn CandidateSource>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub anchors: usize,
    pub searched: usize,
    pub cache_hits: usize,
    pub failed_searches: usize,
    pub candidates: usize,
    pub discarded_low_confidence: usize,
    pub merged_records: usize,
    pub conflicts: usize,
    pub statistics: MergeStatistics,
    pub records_path: String,
    pub snapshot_path: String,
    pub reports_dir: String,
}

/// Every source is asked; the item fails only when all of them do.
async fn search_all(
    sources: &[SharedSource],
    anchor: &AuthoritativeRecord,
) -> Result<Vec<RawCandidateRecord>, SourceError> {
    let mut found = Vec::new();
    let mut failures = Vec::new();
    for source in sources {
        match source.search(anchor).await {
            Ok(records) => found.extend(records),
            Err(err) => {
                warn!(source = source.source_tag(), anchor = %anchor.name, error = %err, "candidate search failed");
                failures.push(format!("{}: {}", source.source_tag(), err));
            }
        }
    }
    if !sources.is_empty() && failures.len() == sources.len() {
        return Err(SourceError::Message(failures.join("; ")));
    }
    Ok(found)
}

pub struct FusionPipeline {
    config: PipelineConfig,
    merger: UnifiedMerger,
    orchestrator: BatchOrchestrator,
    sources: Arc<Vec<SharedSource>>,
    cache: FifoCache<String, Vec<RawCandidateRecord>>,
    snapshots: SnapshotStore,
}

impl FusionPipeline {
    pub fn new(config: PipelineConfig, sources: Vec<SharedSource>) -> Result<Self> {
        config.engine.validate().context("validating engine config")?;
        let extractor = FieldExtractor::new().context("compiling extraction rules")?;
        let merger = UnifiedMerger::new(extractor, SimilarityScorer::default(), &config.engine);
        let limiter = ConcurrencyLimiter::new(config.engine.max_concurrent_requests);
        Ok(Self::with_components(config, merger, limiter, sources))
    }

    pub fn with_components(
        config: PipelineConfig,
        merger: UnifiedMerger,
        limiter: ConcurrencyLimiter,
        sources: Vec<SharedSource>,
    ) -> Self {
        let orchestrator = BatchOrchestrator::with_limiter(config.engine.batch_config(), limiter);
        let cache = FifoCache::new(config.engine.cache_capacity);
        let snapshots = SnapshotStore::new(config.snapshots_dir.clone());
        Self {
            config,
            merger,
            orchestrator,
            sources: Arc::new(sources),
            cache,
            snapshots,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &FifoCache<String, Vec<RawCandidateRecord>> {
        &self.cache
    }

    pub async fn run_once(&mut self) -> Result<FusionRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("fusion_run", %run_id);
        self.run(run_id).instrument(span).await
    }

    async fn run(&mut self, run_id: Uuid) -> Result<FusionRunSummary> {
        let started_at = Utc::now();
        let records_path = self.config.records_path.clone();
        let value = read_json_value(&records_path).await?;
        let parsed = parse_authoritative_list(&value)
            .with_context(|| format!("loading {}", records_path.display()))?;
        for skipped in &parsed.skipped {
            warn!(error = %skipped, "skipping persisted record");
        }
        let anchors = parsed.records;
        info!(anchors = anchors.len(), sources = self.sources.len(), "fusion run started");

        // Cache reads and writes happen here, outside the concurrent search phase.
        let mut candidates: Vec<RawCandidateRecord> = Vec::new();
        let mut to_fetch: Vec<AuthoritativeRecord> = Vec::new();
        let mut queued: HashSet<String> = HashSet::new();
        let mut cache_hits = 0usize;
        for anchor in &anchors {
            let key = anchor.entity_key();
            if let Some(hit) = self.cache.get(&key) {
                cache_hits += 1;
                candidates.extend(hit.iter().cloned());
            } else if queued.insert(key) {
                to_fetch.push(anchor.clone());
            }
        }

        let searched = to_fetch.len();
        let keys: Vec<String> = to_fetch.iter().map(|a| a.entity_key()).collect();
        let sources = Arc::clone(&self.sources);
        let report = self
            .orchestrator
            .process_with_progress(
                to_fetch,
                move |anchor: AuthoritativeRecord| {
                    let sources = Arc::clone(&sources);
                    async move { search_all(&sources, &anchor).await }
                },
                |progress: BatchProgress| {
                    info!(
                        completed = progress.completed_batches,
                        total = progress.total_batches,
                        percent = progress.percent(),
                        "search progress"
                    );
                },
            )
            .await;

        let failed_searches = report.failed;
        for item in report.items {
            if let ItemOutcome::Success(found) = item.outcome {
                if let Some(key) = keys.get(item.index) {
                    self.cache.insert(key.clone(), found.clone());
                }
                candidates.extend(found);
            }
        }

        let floor = self.config.engine.min_search_confidence;
        let before = candidates.len();
        candidates.retain(|c| c.extraction_confidence >= floor);
        let discarded_low_confidence = before - candidates.len();
        if discarded_low_confidence > 0 {
            info!(discarded = discarded_low_confidence, floor, "dropped low-confidence candidates");
        }

        let anchor_count = anchors.len();
        let candidate_count = candidates.len();
        let output = self.merger.merge(anchors, candidates);
        let finished_at = Utc::now();

        let snapshot = self
            .snapshots
            .store_records(finished_at, "merged", &output.merged)
            .await
            .context("storing merged snapshot")?;
        write_json_atomic(&records_path, &output.merged)
            .await
            .with_context(|| format!("writing {}", records_path.display()))?;

        let mut summary = FusionRunSummary {
            run_id,
            started_at,
            finished_at,
            anchors: anchor_count,
            searched,
            cache_hits,
            failed_searches,
            candidates: candidate_count,
            discarded_low_confidence,
            merged_records: output.merged.len(),
            conflicts: output.conflicts.len(),
            statistics: output.statistics.clone(),
            records_path: records_path.display().to_string(),
            snapshot_path: snapshot.absolute_path.display().to_string(),
            reports_dir: String::new(),
        };
        let reports_dir = self.write_reports(&summary, &output).await?;
        summary.reports_dir = reports_dir.display().to_string();

        info!(
            merged = summary.merged_records,
            conflicts = summary.conflicts,
            failed_searches,
            reports = %summary.reports_dir,
            "fusion run complete"
        );
        Ok(summary)
    }

    async fn write_reports(&self, summary: &FusionRunSummary, output: &MergeOutput) -> Result<PathBuf> {
        let reports_dir = self.config.reports_dir.join(summary.run_id.to_string());

        let brief = render_summary(summary, output);
        write_file_atomic(&reports_dir.join("summary.md"), brief.as_bytes())
            .await
            .context("writing summary.md")?;
        write_json_atomic(&reports_dir.join("conflicts.json"), &output.conflicts)
            .await
            .context("writing conflicts.json")?;
        write_json_atomic(&reports_dir.join("statistics.json"), summary)
            .await
            .context("writing statistics.json")?;

        Ok(reports_dir)
    }
}

fn bullet_counts(counts: &BTreeMap<String, usize>) -> String {
    if counts.is_empty() {
        return "- none".to_string();
    }
    counts
        .iter()
        .map(|(k, v)| format!("- {}: {}", k, v))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_summary(summary: &FusionRunSummary, output: &MergeOutput) -> String {
    let mut sources: BTreeMap<String, usize> = BTreeMap::new();
    for record in &output.merged {
        for tag in record.source.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            *sources.entry(tag.to_string()).or_default() += 1;
        }
    }
    let mut conflict_fields: BTreeMap<String, usize> = BTreeMap::new();
    for conflict in &output.conflicts {
        *conflict_fields.entry(conflict.field.clone()).or_default() += 1;
    }
    let stats = &summary.statistics;

    format!(
        "# Gym Fusion Run\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Anchors: {}\n- Searches: {} (cache hits: {}, failed: {})\n- Candidates merged: {} (below confidence floor: {})\n- Output records: {}\n- Successfully merged: {}\n- Fallback used: {}\n- New low-confidence entities: {}\n- Duplicates removed: {}\n- Quality score: {:.3}\n\n## Records by Source\n{}\n\n## Conflicts by Field\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.anchors,
        summary.searched,
        summary.cache_hits,
        summary.failed_searches,
        summary.candidates,
        summary.discarded_low_confidence,
        summary.merged_records,
        stats.successfully_merged,
        stats.fallback_used,
        stats.low_confidence_new,
        stats.duplicates_removed,
        stats.quality_score,
        bullet_counts(&sources),
        bullet_counts(&conflict_fields),
    )
}

/// Candidate sources for every fixture bundle in `dir`.
pub fn fixture_sources(dir: &Path) -> Result<Vec<SharedSource>> {
    Ok(load_fixture_sources(dir)?
        .into_iter()
        .map(|source| Arc::new(source) as SharedSource)
        .collect())
}

pub async fn run_once_from_env() -> Result<FusionRunSummary> {
    let config = PipelineConfig::from_env().context("loading pipeline config")?;
    let sources = fixture_sources(&config.fixtures_dir)?;
    let mut pipeline = FusionPipeline::new(config, sources)?;
    pipeline.run_once().await
}
