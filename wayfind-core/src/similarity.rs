//! Cosine similarity over embedding vectors.
//!
//! The ANN index handles candidate recall; this exact scorer ranks the
//! candidates it returns. A zero-magnitude operand scores 0.0 — similarity
//! against an unembedded or degenerate entity is "no signal", not an error.

/// Cosine similarity of two vectors, in [-1, 1].
///
/// Symmetric, and 1.0 for any non-zero vector against itself. Mismatched
/// lengths are scored over the shorter prefix; the store never produces them
/// because embeddings are written whole or not at all.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0_f64;
    let mut mag_a = 0.0_f64;
    let mut mag_b = 0.0_f64;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        mag_a += (*x as f64) * (*x as f64);
        mag_b += (*y as f64) * (*y as f64);
    }

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    let sim = dot / (mag_a.sqrt() * mag_b.sqrt());
    // float error can push |sim| a hair past 1
    sim.clamp(-1.0, 1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_score_one() {
        let v = vec![0.3_f32, -1.2, 4.5, 0.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn opposite_vectors_score_minus_one() {
        let a = vec![1.0_f32, 2.0, 3.0];
        let b: Vec<f32> = a.iter().map(|x| -x).collect();
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_score_zero() {
        let a = [1.0_f32, 0.0];
        let b = [0.0_f32, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn zero_magnitude_scores_zero() {
        let zero = [0.0_f32; 8];
        let v = [1.0_f32; 8];
        assert_eq!(cosine_similarity(&zero, &v), 0.0);
        assert_eq!(cosine_similarity(&v, &zero), 0.0);
        assert_eq!(cosine_similarity(&zero, &zero), 0.0);
    }

    #[test]
    fn symmetric_and_bounded() {
        let a = [0.9_f32, -0.4, 2.2, 7.1, -3.3];
        let b = [1.1_f32, 0.2, -5.0, 0.7, 2.4];
        let ab = cosine_similarity(&a, &b);
        let ba = cosine_similarity(&b, &a);
        assert_eq!(ab, ba);
        assert!((-1.0..=1.0).contains(&ab));
    }

    #[test]
    fn scale_invariant() {
        let a = [0.5_f32, 1.5, -2.0];
        let scaled: Vec<f32> = a.iter().map(|x| x * 40.0).collect();
        assert!((cosine_similarity(&a, &scaled) - 1.0).abs() < 1e-6);
    }
}
