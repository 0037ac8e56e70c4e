// 📏 Similarity Engine - Edit-distance scoring for business names
// Used by the merge engine to find near-duplicate merchants
// ("Super-Pharm" vs "SuperPharm" vs "SUPER PHARM LTD")

use serde::{Deserialize, Serialize};

// ============================================================================
// EDIT DISTANCE
// ============================================================================

/// Classic dynamic-programming edit distance.
///
/// Insertions, deletions and substitutions all cost 1. Comparison is
/// char-based, not byte-based, so non-ASCII business names are measured in
/// characters. Case folding is the caller's job - `similarity` below does it.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let len_a = a_chars.len();
    let len_b = b_chars.len();

    if len_a == 0 {
        return len_b;
    }
    if len_b == 0 {
        return len_a;
    }

    let mut matrix = vec![vec![0usize; len_b + 1]; len_a + 1];

    // Initialize first row and column
    for (i, row) in matrix.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=len_b {
        matrix[0][j] = j;
    }

    for i in 1..=len_a {
        for j in 1..=len_b {
            let cost = if a_chars[i - 1] == b_chars[j - 1] { 0 } else { 1 };

            matrix[i][j] = std::cmp::min(
                std::cmp::min(
                    matrix[i - 1][j] + 1, // deletion
                    matrix[i][j - 1] + 1, // insertion
                ),
                matrix[i - 1][j - 1] + cost, // substitution
            );
        }
    }

    matrix[len_a][len_b]
}

// ============================================================================
// SIMILARITY SCORE
// ============================================================================

/// Normalized similarity in [0, 1].
///
/// `1 - edit_distance(lower(a), lower(b)) / max(chars)`. Identical strings
/// score 1.0; if exactly one side is empty the score is 0.0. Symmetric by
/// construction.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a_lower = a.to_lowercase();
    let b_lower = b.to_lowercase();

    let len_a = a_lower.chars().count();
    let len_b = b_lower.chars().count();

    if len_a == 0 && len_b == 0 {
        return 1.0;
    }
    if len_a == 0 || len_b == 0 {
        return 0.0;
    }

    let distance = edit_distance(&a_lower, &b_lower);
    let max_len = std::cmp::max(len_a, len_b);

    1.0 - (distance as f64 / max_len as f64)
}

// ============================================================================
// CANDIDATE SEARCH
// ============================================================================

/// A candidate scored against the target string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarMatch {
    pub candidate: String,
    pub score: f64,
}

/// Score every candidate against `target`, keep those at or above
/// `threshold`, sorted descending by score. Ties keep input order
/// (stable sort).
pub fn find_similar(target: &str, candidates: &[String], threshold: f64) -> Vec<SimilarMatch> {
    let mut matches: Vec<SimilarMatch> = candidates
        .iter()
        .map(|candidate| SimilarMatch {
            candidate: candidate.clone(),
            score: similarity(target, candidate),
        })
        .filter(|m| m.score >= threshold)
        .collect();

    matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    matches
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_distance_basics() {
        assert_eq!(edit_distance("", ""), 0);
        assert_eq!(edit_distance("abc", ""), 3);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("starbucks", "starbuck"), 1);
    }

    #[test]
    fn test_edit_distance_char_based() {
        // Hebrew business names must be measured in chars, not bytes
        assert_eq!(edit_distance("שופרסל", "שופרסל"), 0);
        assert_eq!(edit_distance("שופרסל", "שופרסלל"), 1);
    }

    #[test]
    fn test_similarity_identity_and_symmetry() {
        assert_eq!(similarity("Super-Pharm", "Super-Pharm"), 1.0);
        assert_eq!(similarity("", ""), 1.0);

        let ab = similarity("Super-Pharm", "SuperPharm");
        let ba = similarity("SuperPharm", "Super-Pharm");
        assert_eq!(ab, ba, "similarity must be symmetric");
    }

    #[test]
    fn test_similarity_empty_side() {
        assert_eq!(similarity("anything", ""), 0.0);
        assert_eq!(similarity("", "anything"), 0.0);
    }

    #[test]
    fn test_similarity_case_insensitive() {
        assert_eq!(similarity("NETFLIX", "netflix"), 1.0);
    }

    #[test]
    fn test_near_duplicate_business_names() {
        // The merge engine's canonical example pair
        let score = similarity("Super-Pharm", "SuperPharm");
        assert!(score >= 0.85, "expected >= 0.85, got {score}");

        let unrelated = similarity("Super-Pharm", "McDonald's");
        assert!(unrelated < 0.85, "expected < 0.85, got {unrelated}");
    }

    #[test]
    fn test_find_similar_filters_and_sorts() {
        let candidates = vec![
            "McDonald's".to_string(),
            "SuperPharm".to_string(),
            "Super-Pharm Ltd".to_string(),
        ];

        let matches = find_similar("Super-Pharm", &candidates, 0.7);

        assert_eq!(matches.len(), 2);
        assert!(matches[0].score >= matches[1].score, "must be sorted descending");
        assert!(matches.iter().all(|m| m.candidate != "McDonald's"));
    }

    #[test]
    fn test_find_similar_empty_candidates() {
        let matches = find_similar("anything", &[], 0.85);
        assert!(matches.is_empty());
    }
}
