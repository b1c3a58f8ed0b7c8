//! Distance helpers for dense vectors.
//!
//! The index hard-codes cosine similarity and expects **L2-normalized**
//! inputs everywhere past the ingestion boundary, so the normalized variants
//! reduce to dot products. [`l2_normalize`] is applied once, at encode time.

use crate::simd;

/// Cosine distance $1 - \langle a,b\rangle$ for **L2-normalized** vectors.
///
/// Faster than computing norms, but returns nonsense if inputs are not
/// normalized. Mismatched dimensions return `f32::INFINITY` so the pair is
/// never selected as a nearest neighbor.
#[inline]
#[must_use]
pub fn cosine_distance_normalized(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    1.0 - simd::dot(a, b)
}

/// Cosine similarity including norm computation (ingestion-boundary use only).
#[inline]
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    simd::cosine(a, b)
}

/// L2-normalize a vector in place.
///
/// Zero vectors are left untouched rather than producing NaNs; they quantize
/// to the zero residual and score zero against every query.
pub fn l2_normalize(v: &mut [f32]) {
    let n = simd::norm(v);
    if n > 1e-9 {
        for x in v.iter_mut() {
            *x /= n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_norm() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((simd::norm(&v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_leaves_zero_vector() {
        let mut v = vec![0.0, 0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn mismatched_dims_are_infinitely_far() {
        assert_eq!(cosine_distance_normalized(&[1.0], &[1.0, 0.0]), f32::INFINITY);
    }
}
