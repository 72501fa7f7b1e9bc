//! Candidate source contracts, fixture-backed sources and free-text field extraction.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gymfuse_core::{normalize_key_fragment, AuthoritativeRecord, RawCandidateRecord};
use scraper::Html;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

mod extractor;

pub use extractor::{
    format_won, ExtractError, FieldExtractor, PriceRule, PriceSlot, RuleTier, PRICE_RULES,
};

pub const CRATE_NAME: &str = "gymfuse-extract";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Interface boundary to a crawl/search collaborator. Implementations own the
/// fetch mechanics; the engine only sees the candidates they return.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    fn source_tag(&self) -> &str;

    async fn search(&self, anchor: &AuthoritativeRecord) -> Result<Vec<RawCandidateRecord>, SourceError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source_tag: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub candidates: Vec<FixtureCandidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureCandidate {
    /// Anchor name this candidate answers; falls back to name containment when absent.
    #[serde(default)]
    pub query: Option<String>,
    pub record: RawCandidateRecord,
    #[serde(default)]
    pub cached_page: Option<FixtureRawPage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureRawPage {
    pub content_type: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub inline_text: Option<String>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let mut bundle: FixtureBundle = read_json_file(path)?;
    hydrate_cached_pages(path, &mut bundle)?;
    Ok(bundle)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn hydrate_cached_pages(bundle_path: &Path, bundle: &mut FixtureBundle) -> Result<()> {
    let base = bundle_path.parent().unwrap_or_else(|| Path::new("."));
    for candidate in &mut bundle.candidates {
        let Some(page) = candidate.cached_page.as_mut() else {
            continue;
        };
        if page.inline_text.is_some() {
            continue;
        }
        let Some(rel_path) = &page.path else {
            continue;
        };
        let raw_path = base.join(rel_path);
        if !raw_path.exists() {
            continue;
        }
        let raw = fs::read_to_string(&raw_path)
            .with_context(|| format!("reading cached page {}", raw_path.display()))?;
        page.inline_text = Some(raw);
    }
    Ok(())
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Visible text of a cached page. Script and style bodies are dropped; input
/// that is not HTML comes back whitespace-collapsed.
pub fn page_text(raw: &str) -> String {
    let looks_like_html = raw.contains('<') && raw.contains('>');
    if !looks_like_html {
        return text_or_none(raw).unwrap_or_default();
    }
    let document = Html::parse_document(raw);
    let mut chunks = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| e.name()))
            .map(|name| matches!(name, "script" | "style" | "noscript" | "template"))
            .unwrap_or(false);
        if hidden {
            continue;
        }
        if let Some(chunk) = text_or_none(text) {
            chunks.push(chunk);
        }
    }
    chunks.join(" ")
}

fn candidate_with_page_text(candidate: &FixtureCandidate, default_tag: &str) -> RawCandidateRecord {
    let mut record = candidate.record.clone();
    if record.source_tag.trim().is_empty() {
        record.source_tag = default_tag.to_string();
    }
    if let Some(text) = candidate
        .cached_page
        .as_ref()
        .and_then(|p| p.inline_text.as_deref())
    {
        let visible = page_text(text);
        if !visible.is_empty() {
            record.free_text.push(visible);
        }
    }
    record
}

fn answers_query(candidate: &FixtureCandidate, anchor: &AuthoritativeRecord) -> bool {
    let anchor_name = normalize_key_fragment(&anchor.name);
    if anchor_name.is_empty() {
        return false;
    }
    match candidate.query.as_deref() {
        Some(query) => normalize_key_fragment(query) == anchor_name,
        None => {
            let name = normalize_key_fragment(&candidate.record.name);
            !name.is_empty() && (name.contains(&anchor_name) || anchor_name.contains(&name))
        }
    }
}

/// Serves search results from a captured fixture bundle instead of the network.
#[derive(Debug, Clone)]
pub struct FixtureCandidateSource {
    bundle: FixtureBundle,
}

impl FixtureCandidateSource {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self { bundle }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }

    pub fn bundle(&self) -> &FixtureBundle {
        &self.bundle
    }
}

#[async_trait]
impl CandidateSource for FixtureCandidateSource {
    fn source_tag(&self) -> &str {
        &self.bundle.source_tag
    }

    async fn search(&self, anchor: &AuthoritativeRecord) -> Result<Vec<RawCandidateRecord>, SourceError> {
        let hits: Vec<_> = self
            .bundle
            .candidates
            .iter()
            .filter(|c| answers_query(c, anchor))
            .map(|c| candidate_with_page_text(c, &self.bundle.source_tag))
            .collect();
        debug!(
            source = %self.bundle.source_tag,
            anchor = %anchor.name,
            hits = hits.len(),
            "fixture search"
        );
        Ok(hits)
    }
}

/// Every `*.json` bundle in `dir`, sorted by file name so source order is stable.
pub fn load_fixture_sources(dir: impl AsRef<Path>) -> Result<Vec<FixtureCandidateSource>> {
    let dir = dir.as_ref();
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
        .collect();
    paths.sort();
    paths.iter().map(FixtureCandidateSource::from_path).collect()
}
