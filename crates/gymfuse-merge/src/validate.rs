//! Majority-vote cross-validation of redundant extractions for one entity.

use gymfuse_core::{
    digits_only, non_empty, normalize_key_fragment, ExtractionResult, Field, GymRecord, PRICE_UNKNOWN,
};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Validated confidence never exceeds this through bonuses alone.
pub const CONFIDENCE_CEILING: f64 = 0.9;
pub const FALLBACK_CONFIDENCE: f64 = 0.1;
pub const FALLBACK_SOURCE: &str = "fallback_error_recovery";

const CORROBORATION_VOTES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationBonus {
    pub phone: f64,
    pub hours: f64,
    pub price: f64,
    pub facilities: f64,
}

impl Default for ValidationBonus {
    fn default() -> Self {
        Self {
            phone: 0.3,
            hours: 0.2,
            price: 0.3,
            facilities: 0.2,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("anchor confidence {0} is not finite")]
    NonFiniteAnchor(f64),
    #[error("observation {index} confidence {value} is not finite")]
    NonFiniteObservation { index: usize, value: f64 },
}

/// Consensus field values for one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedFieldSet {
    pub phone: Option<String>,
    pub open_hour: Option<String>,
    pub close_hour: Option<String>,
    pub discount_info: Option<String>,
    pub facilities: Vec<String>,
    pub membership_price: Option<String>,
    pub pt_price: Option<String>,
    pub gx_price: Option<String>,
    pub day_pass_price: Option<String>,
    pub minimum_price: Option<String>,
    pub price_details: Option<String>,
    /// Exact price, else minimum phrase, else generic text, else [`PRICE_UNKNOWN`].
    pub final_price: String,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub confidence: f64,
    /// Fields whose value was agreed on by at least two sources.
    pub corroborated: Vec<&'static str>,
    /// Set only on the error-recovery path.
    pub source: Option<String>,
    pub fallback: bool,
}

impl MergedFieldSet {
    pub fn is_corroborated(&self, field: &str) -> bool {
        self.corroborated.iter().any(|f| *f == field)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Vote {
    key: String,
    value: String,
    count: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
struct Resolved {
    value: Option<String>,
    corroborated: bool,
}

fn tally<'a>(
    anchor: Option<&'a str>,
    observed: impl IntoIterator<Item = &'a str>,
    key: fn(&str) -> String,
) -> Vec<Vote> {
    let mut votes: Vec<Vote> = Vec::new();
    for value in non_empty(anchor).into_iter().chain(
        observed
            .into_iter()
            .filter_map(|v| non_empty(Some(v))),
    ) {
        let k = key(value);
        if k.is_empty() {
            continue;
        }
        match votes.iter_mut().find(|v| v.key == k) {
            Some(vote) => vote.count += 1,
            None => votes.push(Vote {
                key: k,
                value: value.to_string(),
                count: 1,
            }),
        }
    }
    votes
}

/// Highest count wins; ties keep the first value seen (the anchor's, when it voted).
fn leader(votes: &[Vote]) -> Option<&Vote> {
    votes
        .iter()
        .fold(None, |best: Option<&Vote>, vote| match best {
            Some(b) if b.count >= vote.count => Some(b),
            _ => Some(vote),
        })
}

/// The anchor's value counts as one vote. A value needs two votes to replace
/// the anchor's; an empty anchor takes an uncontested single observation.
fn resolve_scalar<'a>(
    anchor: Option<&'a str>,
    observed: impl IntoIterator<Item = &'a str>,
    key: fn(&str) -> String,
) -> Resolved {
    let votes = tally(anchor, observed, key);
    let Some(top) = leader(&votes) else {
        return Resolved::default();
    };
    if top.count >= CORROBORATION_VOTES {
        return Resolved {
            value: Some(top.value.clone()),
            corroborated: true,
        };
    }
    if let Some(anchor) = non_empty(anchor) {
        return Resolved {
            value: Some(anchor.to_string()),
            corroborated: false,
        };
    }
    Resolved {
        value: (votes.len() == 1).then(|| top.value.clone()),
        corroborated: false,
    }
}

pub(crate) fn text_key(value: &str) -> String {
    normalize_key_fragment(value)
}

pub(crate) fn phone_key(value: &str) -> String {
    digits_only(value)
}

pub(crate) fn price_key(value: &str) -> String {
    let digits = digits_only(value);
    if digits.is_empty() {
        normalize_key_fragment(value)
    } else {
        digits
    }
}

pub(crate) fn observed<'a, F>(results: &'a [ExtractionResult], field: F) -> Vec<&'a str>
where
    F: Fn(&'a ExtractionResult) -> &'a Field<String>,
{
    results
        .iter()
        .filter_map(|r| field(r).value.as_deref())
        .collect()
}

/// Anchor facilities are kept; anything else must be named by two sources.
fn resolve_facilities(anchor: &[String], results: &[ExtractionResult]) -> (Vec<String>, bool) {
    let mut votes: Vec<Vote> = Vec::new();
    let add = |name: &str, votes: &mut Vec<Vote>| {
        let key = normalize_key_fragment(name);
        if key.is_empty() {
            return;
        }
        match votes.iter_mut().find(|v| v.key == key) {
            Some(v) => v.count += 1,
            None => votes.push(Vote {
                key,
                value: name.trim().to_string(),
                count: 1,
            }),
        }
    };

    let mut anchor_keys: Vec<String> = Vec::new();
    for name in anchor {
        let key = normalize_key_fragment(name);
        if !key.is_empty() && !anchor_keys.contains(&key) {
            anchor_keys.push(key);
            add(name, &mut votes);
        }
    }
    for result in results {
        let Some(names) = result.facilities.value.as_ref() else {
            continue;
        };
        let mut seen: Vec<String> = Vec::new();
        for name in names {
            let key = normalize_key_fragment(name);
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            add(name, &mut votes);
        }
    }

    let corroborated = votes.iter().any(|v| v.count >= CORROBORATION_VOTES);
    let kept = votes
        .into_iter()
        .filter(|v| anchor_keys.contains(&v.key) || v.count >= CORROBORATION_VOTES)
        .map(|v| v.value)
        .collect();
    (kept, corroborated)
}

fn first_present<T: Copy>(anchor: Option<T>, observed: impl IntoIterator<Item = Option<T>>) -> Option<T> {
    anchor.or_else(|| observed.into_iter().flatten().next())
}

fn finite_rating(value: f64) -> Option<f64> {
    (value.is_finite() && (0.0..=5.0).contains(&value)).then_some(value)
}

#[derive(Debug, Clone, Default)]
pub struct CrossValidator {
    bonus: ValidationBonus,
}

impl CrossValidator {
    pub fn new(bonus: ValidationBonus) -> Self {
        Self { bonus }
    }

    /// Consensus over `results` against `anchor`. Never fails: internal
    /// errors produce [`CrossValidator::fallback`].
    pub fn validate(&self, results: &[ExtractionResult], anchor: &GymRecord) -> MergedFieldSet {
        match self.try_validate(results, anchor) {
            Ok(fields) => fields,
            Err(err) => {
                warn!(entity = %anchor.entity_key(), error = %err, "cross-validation failed; using fallback");
                Self::fallback(anchor)
            }
        }
    }

    pub fn try_validate(
        &self,
        results: &[ExtractionResult],
        anchor: &GymRecord,
    ) -> Result<MergedFieldSet, ValidationError> {
        if !anchor.confidence.is_finite() {
            return Err(ValidationError::NonFiniteAnchor(anchor.confidence));
        }
        if let Some((index, r)) = results.iter().enumerate().find(|(_, r)| !r.confidence.is_finite()) {
            return Err(ValidationError::NonFiniteObservation {
                index,
                value: r.confidence,
            });
        }

        let mut corroborated: Vec<&'static str> = Vec::new();
        let mut scalar = |name: &'static str,
                          anchor: Option<&str>,
                          values: Vec<&str>,
                          key: fn(&str) -> String| {
            let resolved = resolve_scalar(anchor, values, key);
            if resolved.corroborated {
                corroborated.push(name);
            }
            resolved.value
        };

        let phone = scalar("phone", anchor.phone.as_deref(), observed(results, |r| &r.phone), phone_key);
        let open_hour = scalar(
            "openHour",
            anchor.open_hour.as_deref(),
            observed(results, |r| &r.open_hour),
            text_key,
        );
        let close_hour = scalar(
            "closeHour",
            anchor.close_hour.as_deref(),
            observed(results, |r| &r.close_hour),
            text_key,
        );
        let discount_info = scalar(
            "discountInfo",
            anchor.discount_info.as_deref(),
            observed(results, |r| &r.discount_info),
            text_key,
        );
        let membership_price = scalar(
            "membershipPrice",
            anchor.membership_price.as_deref(),
            observed(results, |r| &r.membership_price),
            price_key,
        );
        let pt_price = scalar(
            "ptPrice",
            anchor.pt_price.as_deref(),
            observed(results, |r| &r.pt_price),
            price_key,
        );
        let gx_price = scalar(
            "gxPrice",
            anchor.gx_price.as_deref(),
            observed(results, |r| &r.gx_price),
            price_key,
        );
        let day_pass_price = scalar(
            "dayPassPrice",
            anchor.day_pass_price.as_deref(),
            observed(results, |r| &r.day_pass_price),
            price_key,
        );
        let minimum_price = scalar(
            "minimumPrice",
            anchor.minimum_price.as_deref(),
            observed(results, |r| &r.minimum_price),
            price_key,
        );
        let generic_price = resolve_scalar(None, observed(results, |r| &r.generic_price), price_key).value;

        let (facilities, facilities_corroborated) = resolve_facilities(&anchor.facilities, results);
        if facilities_corroborated {
            corroborated.push("facilities");
        }

        let exact_slots: [(&'static str, Option<&String>); 4] = [
            ("membershipPrice", membership_price.as_ref()),
            ("ptPrice", pt_price.as_ref()),
            ("gxPrice", gx_price.as_ref()),
            ("dayPassPrice", day_pass_price.as_ref()),
        ];
        let corroborated_exact = exact_slots
            .iter()
            .find(|(name, value)| value.is_some() && corroborated.contains(name))
            .and_then(|(_, value)| value.cloned());
        let any_exact = exact_slots.iter().find_map(|(_, value)| value.cloned());
        let price_corroborated = corroborated_exact.is_some();

        let final_price = corroborated_exact
            .or(any_exact)
            .or_else(|| minimum_price.clone())
            .or(generic_price)
            .or_else(|| {
                non_empty(anchor.final_price.as_deref())
                    .filter(|p| *p != PRICE_UNKNOWN)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| PRICE_UNKNOWN.to_string());

        let price_details = non_empty(anchor.price_details.as_deref())
            .map(str::to_string)
            .or_else(|| results.iter().find_map(|r| r.price_details.clone()));

        let rating = first_present(
            anchor.rating.and_then(finite_rating),
            results.iter().map(|r| r.rating.value.and_then(finite_rating)),
        );
        let review_count = first_present(anchor.review_count, results.iter().map(|r| r.review_count.value));

        let mut bonus = 0.0;
        if corroborated.contains(&"phone") {
            bonus += self.bonus.phone;
        }
        if corroborated.contains(&"openHour") || corroborated.contains(&"closeHour") {
            bonus += self.bonus.hours;
        }
        if price_corroborated {
            bonus += self.bonus.price;
        }
        if facilities_corroborated {
            bonus += self.bonus.facilities;
        }
        let base = anchor.confidence.clamp(0.0, 1.0);
        let confidence = base.max((base + bonus).min(CONFIDENCE_CEILING));

        Ok(MergedFieldSet {
            phone,
            open_hour,
            close_hour,
            discount_info,
            facilities,
            membership_price,
            pt_price,
            gx_price,
            day_pass_price,
            minimum_price,
            price_details,
            final_price,
            rating,
            review_count,
            confidence,
            corroborated,
            source: None,
            fallback: false,
        })
    }

    /// Anchor scalars that survive coercion, with confidence forced low.
    pub fn fallback(anchor: &GymRecord) -> MergedFieldSet {
        let keep = |v: &Option<String>| non_empty(v.as_deref()).map(str::to_string);
        let confidence = if anchor.confidence.is_finite() {
            anchor.confidence.clamp(0.0, FALLBACK_CONFIDENCE)
        } else {
            0.0
        };
        MergedFieldSet {
            phone: keep(&anchor.phone),
            open_hour: keep(&anchor.open_hour),
            close_hour: keep(&anchor.close_hour),
            discount_info: keep(&anchor.discount_info),
            facilities: anchor
                .facilities
                .iter()
                .filter(|f| !f.trim().is_empty())
                .cloned()
                .collect(),
            membership_price: keep(&anchor.membership_price),
            pt_price: keep(&anchor.pt_price),
            gx_price: keep(&anchor.gx_price),
            day_pass_price: keep(&anchor.day_pass_price),
            minimum_price: keep(&anchor.minimum_price),
            price_details: keep(&anchor.price_details),
            final_price: keep(&anchor.final_price).unwrap_or_else(|| PRICE_UNKNOWN.to_string()),
            rating: anchor.rating.and_then(finite_rating),
            review_count: anchor.review_count,
            confidence,
            corroborated: Vec::new(),
            source: Some(FALLBACK_SOURCE.to_string()),
            fallback: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gymfuse_core::RuleEvidence;

    fn field<T>(value: T) -> Field<T> {
        Field::with_value_and_evidence(
            value,
            RuleEvidence {
                rule_id: "test".into(),
                confidence: 0.9,
                snippet: String::new(),
            },
        )
    }

    fn anchor() -> GymRecord {
        let mut a = GymRecord::new("Alpha Gym", "12 Main St");
        a.phone = Some("555-0001".into());
        a
    }

    #[test]
    fn agreeing_crawl_corroborates_anchor_phone() {
        let mut obs = ExtractionResult::empty();
        obs.phone = field("5550001".to_string());
        obs.membership_price = field("80,000원".to_string());
        obs.rating = field(4.5);

        let out = CrossValidator::default().validate(&[obs], &anchor());
        assert_eq!(out.phone.as_deref(), Some("555-0001"));
        assert_eq!(out.membership_price.as_deref(), Some("80,000원"));
        assert_eq!(out.final_price, "80,000원");
        assert_eq!(out.rating, Some(4.5));
        assert!(out.is_corroborated("phone"));
        assert!(!out.is_corroborated("membershipPrice"));
        assert!((out.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn single_disagreeing_source_never_overrides_anchor() {
        let mut obs = ExtractionResult::empty();
        obs.phone = field("555-9999".to_string());
        let out = CrossValidator::default().validate(&[obs], &anchor());
        assert_eq!(out.phone.as_deref(), Some("555-0001"));
        assert_eq!(out.confidence, 0.5);
    }

    #[test]
    fn two_agreeing_sources_override_anchor() {
        let obs: Vec<_> = (0..2)
            .map(|_| {
                let mut r = ExtractionResult::empty();
                r.phone = field("02-555-9999".to_string());
                r
            })
            .collect();
        let out = CrossValidator::default().validate(&obs, &anchor());
        assert_eq!(out.phone.as_deref(), Some("02-555-9999"));
        assert!(out.is_corroborated("phone"));
    }

    #[test]
    fn split_crawled_hours_are_not_promoted() {
        let mut a = ExtractionResult::empty();
        a.open_hour = field("06:00".to_string());
        let mut b = ExtractionResult::empty();
        b.open_hour = field("07:00".to_string());
        let out = CrossValidator::default().validate(&[a, b], &anchor());
        assert_eq!(out.open_hour, None);
    }

    #[test]
    fn uncontested_single_observation_fills_empty_anchor_field() {
        let mut a = ExtractionResult::empty();
        a.open_hour = field("06:00".to_string());
        a.close_hour = field("23:00".to_string());
        let out = CrossValidator::default().validate(&[a], &anchor());
        assert_eq!(out.open_hour.as_deref(), Some("06:00"));
        assert_eq!(out.close_hour.as_deref(), Some("23:00"));
        assert!(!out.is_corroborated("openHour"));
    }

    #[test]
    fn facilities_need_two_votes() {
        let mut a = ExtractionResult::empty();
        a.facilities = field(vec!["샤워실".to_string(), "사우나".to_string()]);
        let mut b = ExtractionResult::empty();
        b.facilities = field(vec!["샤워실".to_string(), "주차".to_string(), "샤워실".to_string()]);
        let mut anchor = anchor();
        anchor.facilities = vec!["락커".to_string()];

        let out = CrossValidator::default().validate(&[a, b], &anchor);
        assert_eq!(out.facilities, vec!["락커".to_string(), "샤워실".to_string()]);
        assert!(out.is_corroborated("facilities"));
    }

    #[test]
    fn exact_price_beats_minimum_phrase() {
        let mut exact = ExtractionResult::empty();
        exact.membership_price = field("70,000원".to_string());
        let mut minimum = ExtractionResult::empty();
        minimum.minimum_price = field("50,000원부터".to_string());

        let out = CrossValidator::default().validate(&[minimum, exact], &anchor());
        assert_eq!(out.final_price, "70,000원");
        assert_eq!(out.minimum_price.as_deref(), Some("50,000원부터"));
    }

    #[test]
    fn price_tiers_fall_through_to_sentinel() {
        let v = CrossValidator::default();
        let mut generic = ExtractionResult::empty();
        generic.generic_price = field("30,000원 ~ 90,000원".to_string());
        assert_eq!(v.validate(&[generic], &anchor()).final_price, "30,000원 ~ 90,000원");
        assert_eq!(v.validate(&[], &anchor()).final_price, PRICE_UNKNOWN);
    }

    #[test]
    fn corroborated_price_adds_bonus() {
        let obs: Vec<_> = ["80,000원", "80000원"]
            .iter()
            .map(|p| {
                let mut r = ExtractionResult::empty();
                r.membership_price = field(p.to_string());
                r
            })
            .collect();
        let mut a = GymRecord::new("Alpha Gym", "12 Main St");
        a.confidence = 0.4;
        let out = CrossValidator::default().validate(&obs, &a);
        assert_eq!(out.final_price, "80,000원");
        assert!((out.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn confidence_never_drops_below_anchor() {
        let mut a = anchor();
        a.confidence = 0.95;
        let mut obs = ExtractionResult::empty();
        obs.phone = field("555-0001".to_string());
        let out = CrossValidator::default().validate(&[obs], &a);
        assert_eq!(out.confidence, 0.95);
    }

    #[test]
    fn bonuses_cap_at_ceiling() {
        let obs: Vec<_> = (0..2)
            .map(|_| {
                let mut r = ExtractionResult::empty();
                r.phone = field("555-0001".to_string());
                r.open_hour = field("06:00".to_string());
                r.membership_price = field("80,000원".to_string());
                r.facilities = field(vec!["주차".to_string()]);
                r
            })
            .collect();
        let out = CrossValidator::default().validate(&obs, &anchor());
        assert_eq!(out.confidence, CONFIDENCE_CEILING);
    }

    #[test]
    fn non_finite_confidence_takes_fallback_path() {
        let mut a = anchor();
        a.membership_price = Some("90,000원".into());
        a.confidence = f64::NAN;
        let out = CrossValidator::default().validate(&[ExtractionResult::empty()], &a);
        assert!(out.fallback);
        assert_eq!(out.source.as_deref(), Some(FALLBACK_SOURCE));
        assert_eq!(out.confidence, 0.0);
        assert_eq!(out.phone.as_deref(), Some("555-0001"));
        assert_eq!(out.membership_price.as_deref(), Some("90,000원"));

        let mut bad = ExtractionResult::empty();
        bad.confidence = f64::INFINITY;
        let out = CrossValidator::default().validate(&[bad], &anchor());
        assert!(out.fallback);
        assert!(out.confidence <= FALLBACK_CONFIDENCE);
    }
}
