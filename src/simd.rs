//! Portable vector primitives.
//!
//! All hot paths in `lateral` operate on L2-normalized vectors, so `dot`
//! doubles as cosine similarity. `cosine` computes norms and is only used at
//! ingestion boundaries where inputs may not be normalized yet.

const NORM_EPSILON: f32 = 1e-9;

/// Dot product of two equal-length vectors.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// L2 norm of a vector.
#[inline]
#[must_use]
pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Cosine similarity between two vectors, computing norms.
#[inline]
#[must_use]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let d = dot(a, b);
    let na = norm(a);
    let nb = norm(b);
    if na > NORM_EPSILON && nb > NORM_EPSILON {
        d / (na * nb)
    } else {
        0.0
    }
}
