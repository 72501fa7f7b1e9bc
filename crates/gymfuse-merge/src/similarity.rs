use gymfuse_core::digits_only;
use strsim::levenshtein;

/// Pure similarity functions shared by matching and dedup. Every function is
/// total: empty or odd input scores 0.0 rather than failing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimilarityScorer;

fn normalize(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl SimilarityScorer {
    pub fn new() -> Self {
        Self
    }

    /// 1.0 on exact match after case/whitespace normalization, 0.8 when one
    /// side contains the other, otherwise the Levenshtein ratio.
    pub fn string_similarity(&self, a: &str, b: &str) -> f64 {
        let a = normalize(a);
        let b = normalize(b);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        if a == b {
            return 1.0;
        }
        if a.contains(&b) || b.contains(&a) {
            return 0.8;
        }
        let max_len = a.chars().count().max(b.chars().count());
        let distance = levenshtein(&a, &b);
        (1.0 - distance as f64 / max_len as f64).clamp(0.0, 1.0)
    }

    /// Compares digits only: 1.0 on equality, 0.9 on containment, else 0.0.
    pub fn phone_similarity(&self, a: &str, b: &str) -> f64 {
        let a = digits_only(a);
        let b = digits_only(b);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        if a == b {
            1.0
        } else if a.contains(&b) || b.contains(&a) {
            0.9
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_after_normalization_scores_one() {
        let s = SimilarityScorer::new();
        assert_eq!(s.string_similarity("Alpha  Gym", " alpha gym "), 1.0);
    }

    #[test]
    fn containment_scores_point_eight() {
        let s = SimilarityScorer::new();
        assert_eq!(s.string_similarity("Alpha Gym", "Alpha Gym 강남점"), 0.8);
        assert_eq!(s.string_similarity("강남점 Alpha Gym", "alpha gym"), 0.8);
    }

    #[test]
    fn edit_distance_ratio_otherwise() {
        let s = SimilarityScorer::new();
        let score = s.string_similarity("kitten", "sitting");
        assert!((score - (1.0 - 3.0 / 7.0)).abs() < 1e-9);
        assert_eq!(s.string_similarity("abc", "xyz"), 0.0);
    }

    #[test]
    fn empty_sides_score_zero() {
        let s = SimilarityScorer::new();
        assert_eq!(s.string_similarity("", "Alpha"), 0.0);
        assert_eq!(s.string_similarity("   ", "   "), 0.0);
        assert_eq!(s.phone_similarity("", "555-0001"), 0.0);
    }

    #[test]
    fn phone_similarity_uses_digits() {
        let s = SimilarityScorer::new();
        assert_eq!(s.phone_similarity("02-555-0001", "(02) 5550001"), 1.0);
        assert_eq!(s.phone_similarity("02-555-0001", "555-0001"), 0.9);
        assert_eq!(s.phone_similarity("02-555-0001", "031-777-8888"), 0.0);
    }
}
