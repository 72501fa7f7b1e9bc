use gymfuse_core::{non_empty, GymRecord, MatchResult, RawCandidateRecord};

use crate::similarity::SimilarityScorer;

/// Identity fields the matcher compares.
pub trait Matchable {
    fn match_name(&self) -> &str;
    fn match_address(&self) -> &str;
    fn match_phone(&self) -> Option<&str>;
}

impl Matchable for GymRecord {
    fn match_name(&self) -> &str {
        &self.name
    }

    fn match_address(&self) -> &str {
        &self.address
    }

    fn match_phone(&self) -> Option<&str> {
        self.phone.as_deref()
    }
}

impl Matchable for RawCandidateRecord {
    fn match_name(&self) -> &str {
        &self.name
    }

    fn match_address(&self) -> &str {
        &self.address
    }

    fn match_phone(&self) -> Option<&str> {
        self.phone.as_deref()
    }
}

impl<T: Matchable + ?Sized> Matchable for &T {
    fn match_name(&self) -> &str {
        (**self).match_name()
    }

    fn match_address(&self) -> &str {
        (**self).match_address()
    }

    fn match_phone(&self) -> Option<&str> {
        (**self).match_phone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchWeights {
    pub name: f64,
    pub address: f64,
    pub phone: f64,
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            name: 0.4,
            address: 0.3,
            phone: 0.3,
        }
    }
}

pub const DEFAULT_DUPLICATE_THRESHOLD: f64 = 0.8;

/// Weighted name/address/phone matcher. Linear in the pool size; callers
/// with very large pools should bucket by region or name prefix first.
#[derive(Debug, Clone)]
pub struct RecordMatcher {
    scorer: SimilarityScorer,
    weights: MatchWeights,
    threshold: f64,
}

impl Default for RecordMatcher {
    fn default() -> Self {
        Self::new(SimilarityScorer::default(), DEFAULT_DUPLICATE_THRESHOLD)
    }
}

impl RecordMatcher {
    pub fn new(scorer: SimilarityScorer, threshold: f64) -> Self {
        Self {
            scorer,
            weights: MatchWeights::default(),
            threshold,
        }
    }

    pub fn with_weights(mut self, weights: MatchWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Weighted similarity over the components present on both sides, with
    /// the weights renormalized to those components. 0.0 when none overlap.
    pub fn score<A: Matchable, B: Matchable>(&self, a: &A, b: &B) -> f64 {
        let mut weighted = 0.0;
        let mut total_weight = 0.0;

        let pairs = [
            (
                non_empty(Some(a.match_name())),
                non_empty(Some(b.match_name())),
                self.weights.name,
                false,
            ),
            (
                non_empty(Some(a.match_address())),
                non_empty(Some(b.match_address())),
                self.weights.address,
                false,
            ),
            (
                non_empty(a.match_phone()),
                non_empty(b.match_phone()),
                self.weights.phone,
                true,
            ),
        ];
        for (left, right, weight, is_phone) in pairs {
            let (Some(left), Some(right)) = (left, right) else {
                continue;
            };
            let similarity = if is_phone {
                self.scorer.phone_similarity(left, right)
            } else {
                self.scorer.string_similarity(left, right)
            };
            weighted += similarity * weight;
            total_weight += weight;
        }

        if total_weight <= 0.0 {
            0.0
        } else {
            weighted / total_weight
        }
    }

    /// Best-scoring pool entry for `candidate`, if it clears the duplicate
    /// threshold. Ties keep the earliest pool entry.
    pub fn match_candidate<A: Matchable, B: Matchable>(
        &self,
        candidate: &A,
        candidate_index: usize,
        pool: &[B],
    ) -> Option<MatchResult> {
        let mut best: Option<MatchResult> = None;
        for (index, entry) in pool.iter().enumerate() {
            let score = self.score(candidate, entry);
            if best.map(|b| score > b.score).unwrap_or(true) {
                best = Some(MatchResult {
                    authoritative: index,
                    candidate: candidate_index,
                    score,
                });
            }
        }
        best.filter(|b| self.is_duplicate(b.score))
    }

    pub fn is_duplicate(&self, score: f64) -> bool {
        score > self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor(name: &str, address: &str, phone: Option<&str>) -> GymRecord {
        let mut r = GymRecord::new(name, address);
        r.phone = phone.map(str::to_string);
        r
    }

    fn crawled(name: &str, address: &str, phone: Option<&str>) -> RawCandidateRecord {
        let mut r = RawCandidateRecord::new(name, address, "naver", 0.7);
        r.phone = phone.map(str::to_string);
        r
    }

    #[test]
    fn identical_records_score_one_and_match() {
        let m = RecordMatcher::default();
        let a = anchor("Alpha Gym", "12 Main St", Some("555-0001"));
        let c = crawled("Alpha Gym", "12 Main St", Some("555-0001"));
        assert_eq!(m.score(&c, &a), 1.0);
        let hit = m.match_candidate(&c, 4, &[a]).expect("match");
        assert_eq!(hit.authoritative, 0);
        assert_eq!(hit.candidate, 4);
        assert_eq!(hit.score, 1.0);
    }

    #[test]
    fn disjoint_records_score_zero_and_never_match() {
        let m = RecordMatcher::default();
        let a = anchor("Alpha", "서울시", Some("555-0001"));
        let c = crawled("Zenit", "부산항", Some("777-8888"));
        assert_eq!(m.score(&c, &a), 0.0);
        assert!(m.match_candidate(&c, 0, &[a]).is_none());
    }

    #[test]
    fn missing_phone_renormalizes_weights() {
        let m = RecordMatcher::default();
        let a = anchor("Alpha Gym", "12 Main St", Some("555-0001"));
        let c = crawled("Alpha Gym", "12 Main St", None);
        assert_eq!(m.score(&c, &a), 1.0);
    }

    #[test]
    fn similar_name_alone_is_not_a_duplicate() {
        let m = RecordMatcher::default();
        let a = anchor("Alpha Gym", "12 Main St", None);
        let c = crawled("Alpha Gym 강남점", "98 Side Rd", None);
        assert!(m.score(&c, &a) < 0.8);
        assert!(m.match_candidate(&c, 0, &[a]).is_none());
    }

    #[test]
    fn threshold_is_strict() {
        let m = RecordMatcher::default();
        assert!(!m.is_duplicate(0.8));
        assert!(m.is_duplicate(0.81));
    }

    #[test]
    fn best_pool_entry_wins() {
        let m = RecordMatcher::default();
        let pool = vec![
            anchor("Beta Fitness", "34 Side St", None),
            anchor("Alpha Gym", "12 Main St", Some("555-0001")),
        ];
        let c = crawled("Alpha Gym", "12 Main St", Some("02-555-0001"));
        let hit = m.match_candidate(&c, 0, &pool).expect("match");
        assert_eq!(hit.authoritative, 1);
        assert!(hit.score > 0.9);
    }
}
