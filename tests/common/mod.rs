//! Shared test embedders with fully deterministic output.

use lateral::{EmbedRole, Embedder, Result, TokenEmbeddings};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// One pseudo-random unit vector per whitespace token, derived from a hash of
/// the token text. Identical texts always embed identically.
pub struct HashEmbedder {
    pub dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn token_vector(&self, token: &str) -> Vec<f32> {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        let mut state = hasher.finish() | 1;

        // splitmix64 stream, mapped into [-1, 1].
        let mut v: Vec<f32> = (0..self.dim)
            .map(|_| {
                state = state.wrapping_add(0x9e3779b97f4a7c15);
                let mut z = state;
                z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
                z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
                z ^= z >> 31;
                (z as f64 / u64::MAX as f64) as f32 * 2.0 - 1.0
            })
            .collect();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in &mut v {
            *x /= norm;
        }
        v
    }
}

impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn embed(&self, texts: &[String], _role: EmbedRole) -> Result<Vec<TokenEmbeddings>> {
        Ok(texts
            .iter()
            .map(|text| {
                let vectors = text
                    .split_whitespace()
                    .map(|tok| self.token_vector(tok))
                    .collect::<Vec<_>>();
                // Empty texts still get one vector so every document scores.
                let vectors = if vectors.is_empty() {
                    vec![self.token_vector("")]
                } else {
                    vectors
                };
                TokenEmbeddings { vectors }
            })
            .collect())
    }
}

/// A small corpus of distinct sentences.
pub fn sentences(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| {
            format!(
                "document number{i} talks about topic{} and subject{} in passage {i}",
                i % 7,
                i % 3
            )
        })
        .collect()
}
