//! Pluggable similarity strategies for merge scoring.

/// Scores two vectors. Higher means more similar.
pub trait Similarity: Send + Sync {
    fn score(&self, a: &[f32], b: &[f32]) -> f32;

    fn name(&self) -> &str;
}

/// Cosine similarity. Mismatched or zero vectors score 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cosine;

impl Similarity for Cosine {
    fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        cosine_similarity(a, b, magnitude(a))
    }

    fn name(&self) -> &str {
        "cosine"
    }
}

pub fn magnitude(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Compute cosine similarity between two vectors.
/// Assumes query_magnitude is pre-computed for efficiency.
pub fn cosine_similarity(query: &[f32], stored: &[f32], query_magnitude: f32) -> f32 {
    if query.len() != stored.len() || query_magnitude == 0.0 {
        return 0.0;
    }

    let mut dot_product = 0.0f32;
    let mut stored_magnitude_sq = 0.0f32;

    for (q, s) in query.iter().zip(stored.iter()) {
        dot_product += q * s;
        stored_magnitude_sq += s * s;
    }

    let stored_magnitude = stored_magnitude_sq.sqrt();
    if stored_magnitude == 0.0 {
        return 0.0;
    }

    dot_product / (query_magnitude * stored_magnitude)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine() {
        let cosine = Cosine;
        assert!((cosine.score(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine.score(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine.score(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(Cosine.score(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(Cosine.score(&[1.0, 0.0], &[0.0, 0.0]), 0.0);
        assert_eq!(Cosine.score(&[1.0], &[1.0, 0.0]), 0.0);
    }
}
