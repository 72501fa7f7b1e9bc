//! Core domain model for gym record fusion.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "gymfuse-core";

/// Price text used when no source yields a usable price.
pub const PRICE_UNKNOWN: &str = "방문후 확인";

/// Confidence assumed for persisted records that never carried one.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Provenance attached to a value produced by an extraction rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleEvidence {
    pub rule_id: String,
    pub confidence: f64,
    pub snippet: String,
}

/// Extracted field wrapper with optional value + evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub evidence: Option<RuleEvidence>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            evidence: None,
        }
    }

    pub fn with_value_and_evidence(value: T, evidence: RuleEvidence) -> Self {
        Self {
            value: Some(value),
            evidence: Some(evidence),
        }
    }

    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }

    pub fn confidence(&self) -> f64 {
        self.evidence.as_ref().map(|e| e.confidence).unwrap_or(0.0)
    }
}

/// Structured fields pulled out of one piece of free text.
///
/// Category prices (`membership_price`, `pt_price`, `gx_price`,
/// `day_pass_price`) are only filled by categorized rules. `minimum_price`
/// and `generic_price` are only filled when no category price was found, so a
/// vaguer phrasing can never shadow a precise one. `discount_info` is written
/// independently of every price field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub membership_price: Field<String>,
    pub pt_price: Field<String>,
    pub gx_price: Field<String>,
    pub day_pass_price: Field<String>,
    pub discount_info: Field<String>,
    pub minimum_price: Field<String>,
    pub generic_price: Field<String>,
    pub price_details: Option<String>,
    pub phone: Field<String>,
    pub open_hour: Field<String>,
    pub close_hour: Field<String>,
    pub rating: Field<f64>,
    pub review_count: Field<u32>,
    pub facilities: Field<Vec<String>>,
    /// Confidence of the strongest price rule that fired, 0.0 when none did.
    pub confidence: f64,
    pub rule_id: Option<String>,
}

impl ExtractionResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn has_category_price(&self) -> bool {
        self.membership_price.is_present()
            || self.pt_price.is_present()
            || self.gx_price.is_present()
            || self.day_pass_price.is_present()
    }
}

/// Derived facility taxonomy, most specific first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Crossfit,
    Pilates,
    Yoga,
    Pt,
    Gx,
    Gym,
}

const SERVICE_KEYWORDS: &[(ServiceType, &[&str])] = &[
    (ServiceType::Crossfit, &["크로스핏", "crossfit", "cross fit"]),
    (ServiceType::Pilates, &["필라테스", "pilates"]),
    (ServiceType::Yoga, &["요가", "yoga"]),
    (ServiceType::Pt, &["pt샵", "pt 샵", "퍼스널", "personal training", "개인 pt"]),
    (ServiceType::Gx, &["gx", "스피닝", "줌바", "에어로빅", "그룹운동", "그룹 운동"]),
];

impl ServiceType {
    /// Classify from a name plus any descriptive text. Falls back to `Gym`.
    pub fn classify(name: &str, text: &str) -> Self {
        let haystack = format!("{} {}", name, text).to_lowercase();
        SERVICE_KEYWORDS
            .iter()
            .find(|(_, needles)| needles.iter().any(|n| haystack.contains(n)))
            .map(|(service, _)| *service)
            .unwrap_or(ServiceType::Gym)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Crossfit => "crossfit",
            ServiceType::Pilates => "pilates",
            ServiceType::Yoga => "yoga",
            ServiceType::Pt => "pt",
            ServiceType::Gx => "gx",
            ServiceType::Gym => "gym",
        }
    }
}

fn default_confidence() -> f64 {
    DEFAULT_CONFIDENCE
}

/// A gym record as persisted: the authoritative input shape and the merged
/// output shape are the same so a merged set can be fed back in as anchors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GymRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership_price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pt_price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gx_price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_pass_price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_hour: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_hour: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instagram: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facebook: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<ServiceType>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Registry-only attributes, carried through verbatim.
    #[serde(flatten)]
    pub attributes: BTreeMap<String, JsonValue>,
}

pub type AuthoritativeRecord = GymRecord;
pub type MergedRecord = GymRecord;

impl GymRecord {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            address: address.into(),
            phone: None,
            membership_price: None,
            pt_price: None,
            gx_price: None,
            day_pass_price: None,
            discount_info: None,
            minimum_price: None,
            price_details: None,
            final_price: None,
            open_hour: None,
            close_hour: None,
            rating: None,
            review_count: None,
            facilities: Vec::new(),
            instagram: None,
            facebook: None,
            website: None,
            service_type: None,
            confidence: DEFAULT_CONFIDENCE,
            source: String::new(),
            updated_at: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn entity_key(&self) -> String {
        entity_key(&self.name, &self.address)
    }
}

/// One record as produced by a crawl or search collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCandidateRecord {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub phone: Option<String>,
    /// Snippets, descriptions and cached page text, in source order.
    #[serde(default)]
    pub free_text: Vec<String>,
    #[serde(default)]
    pub source_tag: String,
    #[serde(default)]
    pub extraction_confidence: f64,
    #[serde(default)]
    pub membership_price: Option<String>,
    #[serde(default)]
    pub pt_price: Option<String>,
    #[serde(default)]
    pub gx_price: Option<String>,
    #[serde(default)]
    pub day_pass_price: Option<String>,
    #[serde(default)]
    pub discount_info: Option<String>,
    #[serde(default)]
    pub open_hour: Option<String>,
    #[serde(default)]
    pub close_hour: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub review_count: Option<u32>,
    #[serde(default)]
    pub facilities: Vec<String>,
    #[serde(default)]
    pub instagram: Option<String>,
    #[serde(default)]
    pub facebook: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
}

impl RawCandidateRecord {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        source_tag: impl Into<String>,
        extraction_confidence: f64,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            phone: None,
            free_text: Vec::new(),
            source_tag: source_tag.into(),
            extraction_confidence,
            membership_price: None,
            pt_price: None,
            gx_price: None,
            day_pass_price: None,
            discount_info: None,
            open_hour: None,
            close_hour: None,
            rating: None,
            review_count: None,
            facilities: Vec::new(),
            instagram: None,
            facebook: None,
            website: None,
        }
    }

    pub fn entity_key(&self) -> String {
        entity_key(&self.name, &self.address)
    }

    pub fn combined_text(&self) -> String {
        self.free_text.join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Raw,
    Authoritative,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Raw => f.write_str("crawled"),
            RecordKind::Authoritative => f.write_str("authoritative"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum InputError {
    #[error("{kind} input must be a JSON array")]
    NotAnArray { kind: RecordKind },
    #[error("{kind} record {index} is missing required field `{field}`")]
    MissingIdentity {
        kind: RecordKind,
        index: usize,
        field: &'static str,
    },
    #[error("{kind} record {index} is malformed: {message}")]
    Malformed {
        kind: RecordKind,
        index: usize,
        message: String,
    },
}

/// Boundary input, validated once before any matching or merging.
#[derive(Debug, Clone, PartialEq)]
pub enum InputRecord {
    Raw(RawCandidateRecord),
    Authoritative(AuthoritativeRecord),
}

impl InputRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            InputRecord::Raw(_) => RecordKind::Raw,
            InputRecord::Authoritative(_) => RecordKind::Authoritative,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            InputRecord::Raw(r) => &r.name,
            InputRecord::Authoritative(r) => &r.name,
        }
    }

    pub fn address(&self) -> &str {
        match self {
            InputRecord::Raw(r) => &r.address,
            InputRecord::Authoritative(r) => &r.address,
        }
    }

    /// Deserialize one element of an input list and check its identity fields.
    pub fn from_json(kind: RecordKind, index: usize, value: &JsonValue) -> Result<Self, InputError> {
        let malformed = |e: serde_json::Error| InputError::Malformed {
            kind,
            index,
            message: e.to_string(),
        };
        let record = match kind {
            RecordKind::Raw => {
                InputRecord::Raw(serde_json::from_value(value.clone()).map_err(malformed)?)
            }
            RecordKind::Authoritative => {
                InputRecord::Authoritative(serde_json::from_value(value.clone()).map_err(malformed)?)
            }
        };
        record.validate(index)
    }

    /// Reject records whose `name` or `address` is blank.
    pub fn validate(self, index: usize) -> Result<Self, InputError> {
        let kind = self.kind();
        if self.name().trim().is_empty() {
            return Err(InputError::MissingIdentity {
                kind,
                index,
                field: "name",
            });
        }
        if self.address().trim().is_empty() {
            return Err(InputError::MissingIdentity {
                kind,
                index,
                field: "address",
            });
        }
        Ok(self)
    }
}

/// Records that survived boundary validation plus the reasons others did not.
#[derive(Debug, Clone, Default)]
pub struct ParsedInput<T> {
    pub records: Vec<T>,
    pub skipped: Vec<InputError>,
}

fn parse_list(kind: RecordKind, value: &JsonValue) -> Result<ParsedInput<InputRecord>, InputError> {
    let items = value.as_array().ok_or(InputError::NotAnArray { kind })?;
    let mut parsed = ParsedInput {
        records: Vec::with_capacity(items.len()),
        skipped: Vec::new(),
    };
    for (index, item) in items.iter().enumerate() {
        match InputRecord::from_json(kind, index, item) {
            Ok(record) => parsed.records.push(record),
            Err(err) => parsed.skipped.push(err),
        }
    }
    Ok(parsed)
}

/// Parse a JSON array of authoritative records. Only a non-array container is an error;
/// individual bad elements are reported in `skipped`.
pub fn parse_authoritative_list(value: &JsonValue) -> Result<ParsedInput<AuthoritativeRecord>, InputError> {
    let parsed = parse_list(RecordKind::Authoritative, value)?;
    Ok(ParsedInput {
        records: parsed
            .records
            .into_iter()
            .filter_map(|r| match r {
                InputRecord::Authoritative(a) => Some(a),
                InputRecord::Raw(_) => None,
            })
            .collect(),
        skipped: parsed.skipped,
    })
}

/// Parse a JSON array of crawled candidate records.
pub fn parse_candidate_list(value: &JsonValue) -> Result<ParsedInput<RawCandidateRecord>, InputError> {
    let parsed = parse_list(RecordKind::Raw, value)?;
    Ok(ParsedInput {
        records: parsed
            .records
            .into_iter()
            .filter_map(|r| match r {
                InputRecord::Raw(c) => Some(c),
                InputRecord::Authoritative(_) => None,
            })
            .collect(),
        skipped: parsed.skipped,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    KeptAuthoritative,
    CorroboratedCrawl,
}

/// Authoritative-vs-crawled disagreement observed during a merge. Diagnostic only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub entity_key: String,
    pub field: String,
    pub authoritative_value: String,
    pub crawled_value: String,
    pub resolution: ConflictResolution,
}

/// Best pool entry for one candidate, by index into the pools handed to the matcher.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchResult {
    pub authoritative: usize,
    pub candidate: usize,
    pub score: f64,
}

/// Lowercase, keep letters and digits (any script), collapse everything else to single spaces.
pub fn normalize_key_fragment(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Dedup/cache key for an entity: normalized `"name-address"`.
pub fn entity_key(name: &str, address: &str) -> String {
    format!(
        "{}-{}",
        normalize_key_fragment(name),
        normalize_key_fragment(address)
    )
}

pub fn digits_only(input: &str) -> String {
    input.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Trimmed, non-empty view of an optional string.
pub fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_key_ignores_case_punctuation_and_spacing() {
        assert_eq!(
            entity_key("Alpha  Gym!", "12 Main St."),
            entity_key("alpha gym", "12 main st")
        );
        assert_eq!(entity_key("강남 헬스", "서울시 강남구"), "강남 헬스-서울시 강남구");
    }

    #[test]
    fn service_type_prefers_most_specific_keyword() {
        assert_eq!(ServiceType::classify("강남 크로스핏 & 요가", ""), ServiceType::Crossfit);
        assert_eq!(ServiceType::classify("바른 필라테스", ""), ServiceType::Pilates);
        assert_eq!(ServiceType::classify("Body Fit", "GX 스피닝 운영"), ServiceType::Gx);
        assert_eq!(ServiceType::classify("Iron Gym", ""), ServiceType::Gym);
    }

    #[test]
    fn non_array_container_is_rejected() {
        let err = parse_authoritative_list(&json!({"name": "x"})).unwrap_err();
        assert_eq!(
            err,
            InputError::NotAnArray {
                kind: RecordKind::Authoritative
            }
        );
    }

    #[test]
    fn records_without_identity_are_skipped_not_fatal() {
        let parsed = parse_candidate_list(&json!([
            {"name": "Alpha Gym", "address": "12 Main St", "sourceTag": "naver"},
            {"name": "", "address": "12 Main St", "sourceTag": "naver"},
            {"name": "Beta Gym", "sourceTag": "google"},
            {"name": "Gamma Gym", "address": "   ", "sourceTag": "google"}
        ]))
        .unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.skipped.len(), 3);
        assert!(matches!(
            parsed.skipped[0],
            InputError::MissingIdentity { field: "name", index: 1, .. }
        ));
        assert!(matches!(parsed.skipped[1], InputError::Malformed { index: 2, .. }));
        assert!(matches!(
            parsed.skipped[2],
            InputError::MissingIdentity { field: "address", index: 3, .. }
        ));
    }

    #[test]
    fn parsed_input_clones_with_its_skip_reasons() {
        let parsed = parse_authoritative_list(&json!([
            {"name": "Alpha Gym", "address": "12 Main St"},
            {"name": "", "address": "12 Main St"}
        ]))
        .unwrap();
        let kept = parsed.clone();
        drop(parsed);
        assert_eq!(kept.records.len(), 1);
        assert_eq!(
            kept.skipped,
            vec![InputError::MissingIdentity {
                kind: RecordKind::Authoritative,
                index: 1,
                field: "name",
            }]
        );
    }

    #[test]
    fn registry_only_attributes_round_trip_verbatim() {
        let value = json!({
            "name": "Alpha Gym",
            "address": "12 Main St",
            "licenseNo": "2019-3220000-00123",
            "businessStatus": {"code": "01", "label": "영업"}
        });
        let parsed = parse_authoritative_list(&json!([value.clone()])).unwrap();
        let record = &parsed.records[0];
        assert_eq!(record.confidence, DEFAULT_CONFIDENCE);
        assert_eq!(record.attributes["licenseNo"], json!("2019-3220000-00123"));
        let back = serde_json::to_value(record).unwrap();
        assert_eq!(back["businessStatus"], value["businessStatus"]);
        assert_eq!(back["name"], json!("Alpha Gym"));
    }
}
