//! Top-level merge: dedup, match, cross-validate, aggregate.

use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Utc};
use gymfuse_core::{
    non_empty, parse_authoritative_list, parse_candidate_list, AuthoritativeRecord, Conflict,
    ConflictResolution, ExtractionResult, Field, InputError, MergedRecord, RawCandidateRecord,
    RuleEvidence, ServiceType, DEFAULT_CONFIDENCE,
};
use gymfuse_extract::{FieldExtractor, RuleTier};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

use crate::config::EngineConfig;
use crate::matcher::RecordMatcher;
use crate::similarity::SimilarityScorer;
use crate::validate::{observed, phone_key, price_key, text_key, CrossValidator, MergedFieldSet};

const STRUCTURED_RULE_ID: &str = "record.structured";

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("{entity}: `{field}` holds an unusable value")]
    InvalidValue { entity: String, field: &'static str },
    #[error("serializing merged output: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeStatistics {
    pub total_processed: usize,
    pub successfully_merged: usize,
    pub fallback_used: usize,
    pub duplicates_removed: usize,
    pub quality_score: f64,
    pub processing_time_ms: u64,
    /// Input records dropped for missing identity or malformed shape.
    pub skipped_invalid: usize,
    /// Records dropped by the size ceilings.
    pub truncated: usize,
    /// New entities from crawled-only clusters that merged cleanly but sit below the quality threshold.
    pub low_confidence_new: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutput {
    pub merged: Vec<MergedRecord>,
    pub statistics: MergeStatistics,
    pub conflicts: Vec<Conflict>,
}

impl MergeOutput {
    pub fn to_json(&self) -> Result<JsonValue, MergeError> {
        Ok(serde_json::to_value(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeLimits {
    pub max_authoritative: usize,
    pub max_crawled: usize,
    pub max_results: usize,
}

impl From<&EngineConfig> for MergeLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_authoritative: config.max_authoritative,
            max_crawled: config.max_crawled,
            max_results: config.max_results,
        }
    }
}

struct GroupMerge {
    record: MergedRecord,
    fields: MergedFieldSet,
    observations: Vec<ExtractionResult>,
}

/// Weighted completeness of one output record, in [0, 0.85].
pub fn completeness(record: &MergedRecord) -> f64 {
    let mut score = 0.0;
    if !record.name.trim().is_empty() {
        score += 0.2;
    }
    if !record.address.trim().is_empty() {
        score += 0.2;
    }
    if non_empty(record.phone.as_deref()).is_some() {
        score += 0.15;
    }
    if record.rating.is_some() {
        score += 0.1;
    }
    if record.review_count.is_some() {
        score += 0.1;
    }
    if record.confidence.is_finite() {
        score += record.confidence.clamp(0.0, 1.0) * 0.1;
    }
    score
}

fn has_identity(name: &str, address: &str) -> bool {
    !name.trim().is_empty() && !address.trim().is_empty()
}

fn dedup_by_key<T>(records: Vec<T>, key: impl Fn(&T) -> String) -> (Vec<T>, usize) {
    let mut seen = HashSet::new();
    let before = records.len();
    let kept: Vec<T> = records.into_iter().filter(|r| seen.insert(key(r))).collect();
    let removed = before - kept.len();
    (kept, removed)
}

fn cap<T>(records: &mut Vec<T>, limit: usize, what: &str, stats: &mut MergeStatistics) {
    if records.len() > limit {
        let dropped = records.len() - limit;
        warn!(what, limit, dropped, "input exceeds size ceiling; truncating");
        records.truncate(limit);
        stats.truncated += dropped;
    }
}

fn structured<T>(value: T, confidence: f64) -> Field<T> {
    Field::with_value_and_evidence(
        value,
        RuleEvidence {
            rule_id: STRUCTURED_RULE_ID.to_string(),
            confidence,
            snippet: String::new(),
        },
    )
}

fn first_text<'a>(
    anchor: Option<&'a str>,
    members: impl IntoIterator<Item = Option<&'a str>>,
) -> Option<String> {
    non_empty(anchor)
        .or_else(|| members.into_iter().find_map(non_empty))
        .map(str::to_string)
}

fn join_sources(existing: &str, members: &[&RawCandidateRecord]) -> String {
    let mut tags: Vec<&str> = existing
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    for member in members {
        let tag = member.source_tag.trim();
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags.join(",")
}

/// Unmatched authoritative records keep every field; only confidence is normalized.
fn pass_through(anchor: &AuthoritativeRecord) -> MergedRecord {
    let mut record = anchor.clone();
    record.confidence = if record.confidence.is_finite() {
        record.confidence.clamp(0.0, 1.0)
    } else {
        DEFAULT_CONFIDENCE
    };
    record
}

/// Minimal record for a group whose merge failed: anchor fields untouched,
/// confidence the best of the inputs.
fn fallback_record(
    anchor: &AuthoritativeRecord,
    members: &[&RawCandidateRecord],
    now: DateTime<Utc>,
) -> MergedRecord {
    let confidence = members
        .iter()
        .map(|m| m.extraction_confidence)
        .chain(std::iter::once(anchor.confidence))
        .filter(|c| c.is_finite())
        .fold(0.0_f64, f64::max)
        .clamp(0.0, 1.0);
    let mut record = anchor.clone();
    record.confidence = confidence;
    record.updated_at = Some(now);
    record
}

/// Identity-only anchor for a group of crawled records with no authoritative match.
fn seed_from_crawled(lead: &RawCandidateRecord, members: &[&RawCandidateRecord]) -> AuthoritativeRecord {
    let mut seed = AuthoritativeRecord::new(lead.name.trim(), lead.address.trim());
    seed.confidence = members
        .iter()
        .map(|m| m.extraction_confidence)
        .filter(|c| c.is_finite())
        .fold(0.0_f64, f64::max)
        .clamp(0.0, 1.0);
    seed
}

fn conflicts_for_field(
    entity_key: &str,
    field: &str,
    authoritative: Option<&str>,
    crawled: &[&str],
    merged: Option<&str>,
    key: fn(&str) -> String,
) -> Vec<Conflict> {
    let Some(authoritative) = non_empty(authoritative) else {
        return Vec::new();
    };
    let anchor_key = key(authoritative);
    let merged_key = non_empty(merged).map(key);
    let mut seen: Vec<String> = Vec::new();
    let mut out = Vec::new();
    for value in crawled.iter().copied().filter_map(|v| non_empty(Some(v))) {
        let crawled_key = key(value);
        if crawled_key.is_empty() || crawled_key == anchor_key || seen.contains(&crawled_key) {
            continue;
        }
        let resolution = if merged_key.as_deref() == Some(crawled_key.as_str()) {
            ConflictResolution::CorroboratedCrawl
        } else {
            ConflictResolution::KeptAuthoritative
        };
        seen.push(crawled_key);
        out.push(Conflict {
            entity_key: entity_key.to_string(),
            field: field.to_string(),
            authoritative_value: authoritative.to_string(),
            crawled_value: value.to_string(),
            resolution,
        });
    }
    out
}

fn rating_key(value: &str) -> String {
    value
        .trim()
        .parse::<f64>()
        .map(|v| format!("{v:.2}"))
        .unwrap_or_default()
}

/// Authoritative-vs-crawled disagreements for one merged group.
fn collect_conflicts(
    anchor: &AuthoritativeRecord,
    members: &[&RawCandidateRecord],
    observations: &[ExtractionResult],
    record: &MergedRecord,
) -> Vec<Conflict> {
    let entity = anchor.entity_key();
    let names: Vec<&str> = members.iter().map(|m| m.name.as_str()).collect();
    let addresses: Vec<&str> = members.iter().map(|m| m.address.as_str()).collect();
    let ratings: Vec<String> = observations
        .iter()
        .filter_map(|o| o.rating.value)
        .map(|r| r.to_string())
        .collect();
    let reviews: Vec<String> = observations
        .iter()
        .filter_map(|o| o.review_count.value)
        .map(|r| r.to_string())
        .collect();
    let anchor_rating = anchor.rating.map(|r| r.to_string());
    let merged_rating = record.rating.map(|r| r.to_string());
    let anchor_reviews = anchor.review_count.map(|r| r.to_string());
    let merged_reviews = record.review_count.map(|r| r.to_string());

    let text: fn(&str) -> String = text_key;
    let phone: fn(&str) -> String = phone_key;
    let price: fn(&str) -> String = price_key;
    let rating: fn(&str) -> String = rating_key;

    let checks: Vec<(&str, Option<&str>, Vec<&str>, Option<&str>, fn(&str) -> String)> = vec![
        ("name", Some(anchor.name.as_str()), names, Some(record.name.as_str()), text),
        ("address", Some(anchor.address.as_str()), addresses, Some(record.address.as_str()), text),
        (
            "phone",
            anchor.phone.as_deref(),
            observed(observations, |o| &o.phone),
            record.phone.as_deref(),
            phone,
        ),
        (
            "openHour",
            anchor.open_hour.as_deref(),
            observed(observations, |o| &o.open_hour),
            record.open_hour.as_deref(),
            text,
        ),
        (
            "closeHour",
            anchor.close_hour.as_deref(),
            observed(observations, |o| &o.close_hour),
            record.close_hour.as_deref(),
            text,
        ),
        (
            "discountInfo",
            anchor.discount_info.as_deref(),
            observed(observations, |o| &o.discount_info),
            record.discount_info.as_deref(),
            text,
        ),
        (
            "membershipPrice",
            anchor.membership_price.as_deref(),
            observed(observations, |o| &o.membership_price),
            record.membership_price.as_deref(),
            price,
        ),
        (
            "ptPrice",
            anchor.pt_price.as_deref(),
            observed(observations, |o| &o.pt_price),
            record.pt_price.as_deref(),
            price,
        ),
        (
            "gxPrice",
            anchor.gx_price.as_deref(),
            observed(observations, |o| &o.gx_price),
            record.gx_price.as_deref(),
            price,
        ),
        (
            "dayPassPrice",
            anchor.day_pass_price.as_deref(),
            observed(observations, |o| &o.day_pass_price),
            record.day_pass_price.as_deref(),
            price,
        ),
        (
            "minimumPrice",
            anchor.minimum_price.as_deref(),
            observed(observations, |o| &o.minimum_price),
            record.minimum_price.as_deref(),
            price,
        ),
        (
            "rating",
            anchor_rating.as_deref(),
            ratings.iter().map(String::as_str).collect(),
            merged_rating.as_deref(),
            rating,
        ),
        (
            "reviewCount",
            anchor_reviews.as_deref(),
            reviews.iter().map(String::as_str).collect(),
            merged_reviews.as_deref(),
            text,
        ),
    ];

    checks
        .into_iter()
        .flat_map(|(field, authoritative, crawled, merged, key)| {
            conflicts_for_field(&entity, field, authoritative, &crawled, merged, key)
        })
        .collect()
}

/// Fuses authoritative records with crawled candidates. Collaborators are
/// injected; the merger holds no global state and performs no I/O.
#[derive(Debug, Clone)]
pub struct UnifiedMerger {
    extractor: FieldExtractor,
    matcher: RecordMatcher,
    validator: CrossValidator,
    quality_threshold: f64,
    limits: MergeLimits,
}

impl Default for UnifiedMerger {
    fn default() -> Self {
        Self::new(
            FieldExtractor::default(),
            SimilarityScorer::default(),
            &EngineConfig::default(),
        )
    }
}

impl UnifiedMerger {
    pub fn new(extractor: FieldExtractor, scorer: SimilarityScorer, config: &EngineConfig) -> Self {
        Self {
            extractor,
            matcher: RecordMatcher::new(scorer, config.duplicate_threshold),
            validator: CrossValidator::default(),
            quality_threshold: config.quality_threshold,
            limits: MergeLimits::from(config),
        }
    }

    pub fn with_validator(mut self, validator: CrossValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn matcher(&self) -> &RecordMatcher {
        &self.matcher
    }

    pub fn extractor(&self) -> &FieldExtractor {
        &self.extractor
    }

    /// Parse both JSON containers, merge, and serialize the result. Only a
    /// non-array container or a serialization failure is an error.
    pub fn merge_json(&self, authoritative: &JsonValue, crawled: &JsonValue) -> Result<JsonValue, MergeError> {
        self.merge_values(authoritative, crawled)?.to_json()
    }

    pub fn merge_values(
        &self,
        authoritative: &JsonValue,
        crawled: &JsonValue,
    ) -> Result<MergeOutput, MergeError> {
        let authoritative = parse_authoritative_list(authoritative)?;
        let crawled = parse_candidate_list(crawled)?;
        for skipped in authoritative.skipped.iter().chain(&crawled.skipped) {
            warn!(error = %skipped, "skipping input record");
        }
        let skipped = authoritative.skipped.len() + crawled.skipped.len();
        let mut output = self.merge(authoritative.records, crawled.records);
        output.statistics.skipped_invalid += skipped;
        output.statistics.total_processed += skipped;
        Ok(output)
    }

    pub fn merge(
        &self,
        authoritative: Vec<AuthoritativeRecord>,
        crawled: Vec<RawCandidateRecord>,
    ) -> MergeOutput {
        let started = Instant::now();
        let span = info_span!("merge", authoritative = authoritative.len(), crawled = crawled.len());
        let _guard = span.enter();

        let mut stats = MergeStatistics {
            total_processed: authoritative.len() + crawled.len(),
            ..MergeStatistics::default()
        };

        let before = authoritative.len() + crawled.len();
        let authoritative: Vec<_> = authoritative
            .into_iter()
            .filter(|r| has_identity(&r.name, &r.address))
            .collect();
        let crawled: Vec<_> = crawled
            .into_iter()
            .filter(|r| has_identity(&r.name, &r.address))
            .collect();
        let missing_identity = before - authoritative.len() - crawled.len();
        if missing_identity > 0 {
            warn!(count = missing_identity, "skipping records without name or address");
            stats.skipped_invalid += missing_identity;
        }

        let (mut authoritative, removed_a) = dedup_by_key(authoritative, |r| r.entity_key());
        // Scoped per source: the same entity from two sources is a corroborating vote.
        let (mut crawled, removed_c) =
            dedup_by_key(crawled, |r| format!("{}|{}", r.source_tag.trim(), r.entity_key()));
        stats.duplicates_removed += removed_a + removed_c;

        cap(&mut authoritative, self.limits.max_authoritative, "authoritative", &mut stats);
        cap(&mut crawled, self.limits.max_crawled, "crawled", &mut stats);

        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); authoritative.len()];
        let mut unmatched: Vec<usize> = Vec::new();
        for (index, candidate) in crawled.iter().enumerate() {
            match self.matcher.match_candidate(candidate, index, &authoritative) {
                Some(hit) => {
                    debug!(
                        candidate = %candidate.name,
                        anchor = %authoritative[hit.authoritative].name,
                        score = hit.score,
                        "matched crawled record"
                    );
                    groups[hit.authoritative].push(hit.candidate);
                }
                None => unmatched.push(index),
            }
        }

        // Crawled records with no authoritative match are grouped among themselves.
        let mut clusters: Vec<Vec<usize>> = Vec::new();
        let mut leads: Vec<&RawCandidateRecord> = Vec::new();
        for index in unmatched {
            match self.matcher.match_candidate(&crawled[index], index, &leads) {
                Some(hit) => clusters[hit.authoritative].push(index),
                None => {
                    leads.push(&crawled[index]);
                    clusters.push(vec![index]);
                }
            }
        }

        let now = Utc::now();
        let mut merged = Vec::with_capacity(authoritative.len() + clusters.len());
        let mut conflicts = Vec::new();

        for (anchor, group) in authoritative.iter().zip(&groups) {
            if group.is_empty() {
                merged.push(pass_through(anchor));
                continue;
            }
            stats.duplicates_removed += group.len();
            let members: Vec<&RawCandidateRecord> = group.iter().map(|&i| &crawled[i]).collect();
            match self.merge_group(anchor, &members, now) {
                Ok(outcome) => {
                    conflicts.extend(collect_conflicts(
                        anchor,
                        &members,
                        &outcome.observations,
                        &outcome.record,
                    ));
                    self.count_merge(&outcome, false, &mut stats);
                    merged.push(outcome.record);
                }
                Err(err) => {
                    warn!(entity = %anchor.entity_key(), error = %err, "merge failed; using fallback record");
                    stats.fallback_used += 1;
                    merged.push(fallback_record(anchor, &members, now));
                }
            }
        }

        for (lead, cluster) in leads.iter().zip(&clusters) {
            stats.duplicates_removed += cluster.len().saturating_sub(1);
            let members: Vec<&RawCandidateRecord> = cluster.iter().map(|&i| &crawled[i]).collect();
            let seed = seed_from_crawled(lead, &members);
            match self.merge_group(&seed, &members, now) {
                Ok(outcome) => {
                    self.count_merge(&outcome, true, &mut stats);
                    merged.push(outcome.record);
                }
                Err(err) => {
                    warn!(entity = %seed.entity_key(), error = %err, "merge failed; using fallback record");
                    stats.fallback_used += 1;
                    let mut record = fallback_record(&seed, &members, now);
                    record.source = join_sources("", &members);
                    merged.push(record);
                }
            }
        }

        cap(&mut merged, self.limits.max_results, "merged", &mut stats);

        stats.quality_score = if merged.is_empty() {
            0.0
        } else {
            merged.iter().map(completeness).sum::<f64>() / merged.len() as f64
        };
        stats.processing_time_ms = started.elapsed().as_millis() as u64;
        info!(
            merged = merged.len(),
            conflicts = conflicts.len(),
            successful = stats.successfully_merged,
            fallback = stats.fallback_used,
            low_confidence_new = stats.low_confidence_new,
            duplicates = stats.duplicates_removed,
            quality = stats.quality_score,
            "merge complete"
        );

        MergeOutput {
            merged,
            statistics: stats,
            conflicts,
        }
    }

    /// `fallbackUsed` counts degraded merges only; a clean crawled-only entity
    /// that scores low is tallied as `lowConfidenceNew` instead.
    fn count_merge(&self, outcome: &GroupMerge, new_entity: bool, stats: &mut MergeStatistics) {
        let below = outcome.record.confidence < self.quality_threshold;
        if outcome.fields.fallback || (below && !new_entity) {
            stats.fallback_used += 1;
        } else if below {
            stats.low_confidence_new += 1;
        } else {
            stats.successfully_merged += 1;
        }
    }

    /// Extraction over a candidate's free text, with its structured fields taking precedence.
    pub fn observe(&self, candidate: &RawCandidateRecord) -> ExtractionResult {
        let mut result = self.extractor.extract(&candidate.combined_text());
        let exact = RuleTier::Exact.confidence();

        let text_overlays: [(&Option<String>, &mut Field<String>); 8] = [
            (&candidate.phone, &mut result.phone),
            (&candidate.membership_price, &mut result.membership_price),
            (&candidate.pt_price, &mut result.pt_price),
            (&candidate.gx_price, &mut result.gx_price),
            (&candidate.day_pass_price, &mut result.day_pass_price),
            (&candidate.discount_info, &mut result.discount_info),
            (&candidate.open_hour, &mut result.open_hour),
            (&candidate.close_hour, &mut result.close_hour),
        ];
        for (value, field) in text_overlays {
            if let Some(value) = non_empty(value.as_deref()) {
                *field = structured(value.to_string(), exact);
            }
        }
        if result.has_category_price() {
            result.minimum_price = Field::empty();
            result.generic_price = Field::empty();
        }
        if let Some(rating) = candidate.rating {
            result.rating = structured(rating, exact);
        }
        if let Some(count) = candidate.review_count {
            result.review_count = structured(count, exact);
        }
        if !candidate.facilities.is_empty() {
            let mut names = result.facilities.value.take().unwrap_or_default();
            for name in &candidate.facilities {
                if !name.trim().is_empty() && !names.contains(name) {
                    names.push(name.clone());
                }
            }
            result.facilities = structured(names, exact);
        }

        let given = candidate.extraction_confidence;
        result.confidence = if given.is_finite() {
            result.confidence.max(given.clamp(0.0, 1.0))
        } else {
            given
        };
        result
    }

    fn merge_group(
        &self,
        anchor: &AuthoritativeRecord,
        members: &[&RawCandidateRecord],
        now: DateTime<Utc>,
    ) -> Result<GroupMerge, MergeError> {
        if members.iter().any(|m| m.rating.map(|r| !r.is_finite()).unwrap_or(false)) {
            return Err(MergeError::InvalidValue {
                entity: anchor.entity_key(),
                field: "rating",
            });
        }

        let observations: Vec<ExtractionResult> = members.iter().map(|m| self.observe(m)).collect();
        let fields = self.validator.validate(&observations, anchor);

        let mut record = anchor.clone();
        record.phone = fields.phone.clone();
        record.open_hour = fields.open_hour.clone();
        record.close_hour = fields.close_hour.clone();
        record.discount_info = fields.discount_info.clone();
        record.facilities = fields.facilities.clone();
        record.membership_price = fields.membership_price.clone();
        record.pt_price = fields.pt_price.clone();
        record.gx_price = fields.gx_price.clone();
        record.day_pass_price = fields.day_pass_price.clone();
        record.minimum_price = fields.minimum_price.clone();
        record.price_details = fields.price_details.clone();
        record.final_price = Some(fields.final_price.clone());
        record.rating = fields.rating;
        record.review_count = fields.review_count;
        record.confidence = fields.confidence;

        record.instagram = first_text(
            anchor.instagram.as_deref(),
            members.iter().map(|m| m.instagram.as_deref()),
        );
        record.facebook = first_text(
            anchor.facebook.as_deref(),
            members.iter().map(|m| m.facebook.as_deref()),
        );
        record.website = first_text(
            anchor.website.as_deref(),
            members.iter().map(|m| m.website.as_deref()),
        );
        if record.service_type.is_none() {
            let text = members
                .iter()
                .flat_map(|m| std::iter::once(m.name.as_str()).chain(m.free_text.iter().map(String::as_str)))
                .collect::<Vec<_>>()
                .join(" ");
            record.service_type = Some(ServiceType::classify(&anchor.name, &text));
        }
        record.source = match &fields.source {
            Some(source) => source.clone(),
            None => join_sources(&anchor.source, members),
        };
        record.updated_at = Some(now);

        Ok(GroupMerge {
            record,
            fields,
            observations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::FALLBACK_SOURCE;
    use gymfuse_core::{ConflictResolution, GymRecord, PRICE_UNKNOWN};
    use serde_json::json;

    fn merger() -> UnifiedMerger {
        UnifiedMerger::default()
    }

    fn anchor(name: &str, address: &str, phone: &str) -> GymRecord {
        let mut r = GymRecord::new(name, address);
        r.phone = Some(phone.to_string());
        r
    }

    fn crawled(name: &str, address: &str, tag: &str) -> RawCandidateRecord {
        RawCandidateRecord::new(name, address, tag, 0.7)
    }

    #[test]
    fn observe_prefers_structured_fields_over_text() {
        let mut c = crawled("Alpha Gym", "12 Main St", "naver");
        c.free_text = vec!["헬스 최저 50,000원부터 이용 가능 평점 4.1".into()];
        c.membership_price = Some("80,000원".into());
        c.rating = Some(4.5);
        let obs = merger().observe(&c);
        assert_eq!(obs.membership_price.value.as_deref(), Some("80,000원"));
        assert!(obs.minimum_price.value.is_none());
        assert_eq!(obs.rating.value, Some(4.5));
        assert!(obs.confidence >= 0.7);
    }

    #[test]
    fn exact_duplicates_are_removed_and_counted() {
        let a = anchor("Alpha Gym", "12 Main St", "555-0001");
        let mut dup = a.clone();
        dup.phone = Some("555-9999".into());
        let out = merger().merge(vec![a, dup], vec![]);
        assert_eq!(out.merged.len(), 1);
        assert_eq!(out.merged[0].phone.as_deref(), Some("555-0001"));
        assert_eq!(out.statistics.duplicates_removed, 1);
        assert_eq!(out.statistics.total_processed, 2);
    }

    #[test]
    fn unmatched_crawled_records_become_new_entities() {
        let mut first = crawled("Zen Pilates", "99 River Rd", "naver");
        first.phone = Some("02-777-1234".into());
        first.free_text = vec!["필라테스 그룹 수업".into()];
        let mut second = crawled("Zen Pilates", "99 River Road", "google");
        second.phone = Some("02-777-1234".into());

        let out = merger().merge(
            vec![anchor("Alpha Gym", "12 Main St", "555-0001")],
            vec![first, second],
        );
        assert_eq!(out.merged.len(), 2);
        let zen = &out.merged[1];
        assert_eq!(zen.name, "Zen Pilates");
        assert_eq!(zen.source, "naver,google");
        assert_eq!(zen.phone.as_deref(), Some("02-777-1234"));
        assert_eq!(zen.service_type, Some(ServiceType::Pilates));
        assert_eq!(zen.final_price.as_deref(), Some(PRICE_UNKNOWN));
        assert_eq!(out.statistics.duplicates_removed, 1);
        assert!(out.conflicts.is_empty());
    }

    #[test]
    fn disagreeing_crawl_is_logged_as_conflict() {
        let a = anchor("Alpha Gym", "12 Main St", "555-0001");
        let mut c = crawled("Alpha Gym", "12 Main St", "naver");
        c.phone = Some("555-0001".into());
        c.open_hour = Some("06:00".into());
        let mut a2 = a.clone();
        a2.open_hour = Some("05:00".into());

        let out = merger().merge(vec![a2], vec![c]);
        assert_eq!(out.merged[0].open_hour.as_deref(), Some("05:00"));
        assert_eq!(out.conflicts.len(), 1);
        let conflict = &out.conflicts[0];
        assert_eq!(conflict.field, "openHour");
        assert_eq!(conflict.authoritative_value, "05:00");
        assert_eq!(conflict.crawled_value, "06:00");
        assert_eq!(conflict.resolution, ConflictResolution::KeptAuthoritative);
    }

    #[test]
    fn corroborated_crawl_overrides_anchor_and_says_so() {
        let mut a = anchor("Alpha Gym", "12 Main St", "555-0001");
        a.membership_price = Some("70,000원".into());
        let mut c1 = crawled("Alpha Gym", "12 Main St", "naver");
        c1.membership_price = Some("80,000원".into());
        let mut c2 = crawled("Alpha Gym", "12 Main Street", "google");
        c2.membership_price = Some("80,000원".into());

        let out = merger().merge(vec![a], vec![c1, c2]);
        assert_eq!(out.merged[0].membership_price.as_deref(), Some("80,000원"));
        let price_conflicts: Vec<_> = out
            .conflicts
            .iter()
            .filter(|c| c.field == "membershipPrice")
            .collect();
        assert_eq!(price_conflicts.len(), 1);
        assert_eq!(price_conflicts[0].resolution, ConflictResolution::CorroboratedCrawl);
    }

    #[test]
    fn bad_pair_degrades_to_fallback_without_aborting_run() {
        let good = anchor("Alpha Gym", "12 Main St", "555-0001");
        let bad = anchor("Beta Fitness", "34 Side St", "555-0002");
        let mut c_good = crawled("Alpha Gym", "12 Main St", "naver");
        c_good.membership_price = Some("80,000원".into());
        let mut c_bad = crawled("Beta Fitness", "34 Side St", "naver");
        c_bad.rating = Some(f64::NAN);
        c_bad.extraction_confidence = 0.8;

        let out = merger().merge(vec![good, bad], vec![c_good, c_bad]);
        assert_eq!(out.merged.len(), 2);
        assert_eq!(out.merged[0].membership_price.as_deref(), Some("80,000원"));
        let beta = &out.merged[1];
        assert_eq!(beta.phone.as_deref(), Some("555-0002"));
        assert_eq!(beta.confidence, 0.8);
        assert!(beta.rating.is_none());
        assert_eq!(out.statistics.fallback_used, 1);
        assert_eq!(out.statistics.successfully_merged, 1);
    }

    #[test]
    fn validator_fallback_is_marked_and_counted() {
        let mut a = anchor("Alpha Gym", "12 Main St", "555-0001");
        a.confidence = f64::NAN;
        let c = crawled("Alpha Gym", "12 Main St", "naver");
        let out = merger().merge(vec![a], vec![c]);
        assert_eq!(out.merged[0].source, FALLBACK_SOURCE);
        assert!(out.merged[0].confidence <= 0.1);
        assert_eq!(out.statistics.fallback_used, 1);
    }

    #[test]
    fn results_are_capped() {
        let config = EngineConfig {
            max_authoritative: 2,
            max_results: 1,
            ..EngineConfig::default()
        };
        let merger = UnifiedMerger::new(FieldExtractor::default(), SimilarityScorer::default(), &config);
        let records = vec![
            anchor("Alpha Gym", "12 Main St", "555-0001"),
            anchor("Beta Fitness", "34 Side St", "555-0002"),
            anchor("Gamma Box", "56 Hill Rd", "555-0003"),
        ];
        let out = merger.merge(records, vec![]);
        assert_eq!(out.merged.len(), 1);
        assert_eq!(out.statistics.truncated, 2);
    }

    #[test]
    fn same_source_crawled_duplicates_keep_the_first() {
        let mut first = crawled("Zen Pilates", "99 River Rd", "naver");
        first.phone = Some("02-777-1234".into());
        let mut repeat = crawled("Zen Pilates", "99 River Rd", "naver");
        repeat.phone = Some("02-777-9999".into());

        let out = merger().merge(vec![], vec![first, repeat]);
        assert_eq!(out.merged.len(), 1);
        assert_eq!(out.merged[0].phone.as_deref(), Some("02-777-1234"));
        assert_eq!(out.merged[0].source, "naver");
        assert_eq!(out.statistics.duplicates_removed, 1);
        assert_eq!(out.statistics.successfully_merged, 1);
    }

    #[test]
    fn same_key_from_two_sources_counts_as_two_votes() {
        let mut a = anchor("Alpha Gym", "12 Main St", "555-0001");
        a.membership_price = Some("70,000원".into());
        let mut naver = crawled("Alpha Gym", "12 Main St", "naver");
        naver.membership_price = Some("80,000원".into());
        let mut google = crawled("Alpha Gym", "12 Main St", "google");
        google.membership_price = Some("80,000원".into());

        let out = merger().merge(vec![a], vec![naver, google]);
        assert_eq!(out.merged.len(), 1);
        assert_eq!(out.merged[0].membership_price.as_deref(), Some("80,000원"));
        assert!(out.merged[0].source.contains("naver"));
        assert!(out.merged[0].source.contains("google"));
        assert_eq!(out.statistics.duplicates_removed, 2);
    }

    #[test]
    fn crawled_input_is_capped() {
        let config = EngineConfig {
            max_crawled: 1,
            ..EngineConfig::default()
        };
        let merger = UnifiedMerger::new(FieldExtractor::default(), SimilarityScorer::default(), &config);
        let out = merger.merge(
            vec![],
            vec![
                crawled("Zen Pilates", "99 River Rd", "naver"),
                crawled("Iron Temple", "7 Harbor Ave", "naver"),
            ],
        );
        assert_eq!(out.merged.len(), 1);
        assert_eq!(out.merged[0].name, "Zen Pilates");
        assert_eq!(out.statistics.truncated, 1);
    }

    #[test]
    fn low_confidence_new_entity_is_not_a_fallback() {
        let mut unknown = crawled("Zen Pilates", "99 River Rd", "naver");
        unknown.extraction_confidence = 0.0;

        let out = merger().merge(vec![], vec![unknown]);
        assert_eq!(out.merged.len(), 1);
        assert_eq!(out.statistics.fallback_used, 0);
        assert_eq!(out.statistics.successfully_merged, 0);
        assert_eq!(out.statistics.low_confidence_new, 1);
        assert_eq!(
            out.to_json().unwrap()["statistics"]["lowConfidenceNew"],
            json!(1)
        );
    }

    #[test]
    fn merge_json_rejects_non_array_and_skips_bad_elements() {
        let err = merger().merge_json(&json!({"name": "x"}), &json!([])).unwrap_err();
        assert!(matches!(err, MergeError::Input(InputError::NotAnArray { .. })));

        let value = merger()
            .merge_json(
                &json!([{"name": "Alpha Gym", "address": "12 Main St"}, {"name": "No Address"}]),
                &json!([{"name": "", "address": "12 Main St"}]),
            )
            .unwrap();
        assert_eq!(value["merged"].as_array().map(Vec::len), Some(1));
        assert_eq!(value["statistics"]["skippedInvalid"], json!(2));
        assert_eq!(value["statistics"]["totalProcessed"], json!(3));
    }

    #[test]
    fn completeness_weights() {
        let mut r = GymRecord::new("Alpha Gym", "12 Main St");
        r.confidence = 0.0;
        assert!((completeness(&r) - 0.4).abs() < 1e-9);
        r.phone = Some("555-0001".into());
        r.rating = Some(4.5);
        r.review_count = Some(10);
        r.confidence = 1.0;
        assert!((completeness(&r) - 0.85).abs() < 1e-9);
    }
}
