//! Maxsim search over a compressed index.
//!
//! Query tokens are embedded, candidate documents are pulled from the
//! inverted file, each candidate is decompressed, and documents are ranked by
//! maxsim: for every query vector the maximum dot product against any of the
//! document's vectors, summed over query vectors. Scoring is deterministic
//! given a fixed index and fixed query embeddings; the only approximation is
//! candidate generation.

use crate::embed::{EmbedRole, Embedder};
use crate::error::{LateError, Result};
use crate::index::Index;
use rayon::prelude::*;
use std::sync::Arc;

/// Candidate-generation knobs.
#[derive(Debug, Clone, Copy)]
pub struct SearchParams {
    /// Centroids probed per query vector.
    pub nprobe: usize,
    /// Cap on candidate documents per query.
    pub max_candidates: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            nprobe: 4,
            max_candidates: 8192,
        }
    }
}

/// One ranked hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub doc_id: u32,
    pub score: f32,
    /// Provenance text, when the document carried one.
    pub text: Option<String>,
}

/// Maxsim score of a query against one document's token vectors.
///
/// Both sides are expected L2-normalized, so dot product is cosine.
pub fn maxsim(query_vectors: &[Vec<f32>], doc_vectors: &[Vec<f32>]) -> f32 {
    if doc_vectors.is_empty() {
        return 0.0;
    }
    query_vectors
        .iter()
        .map(|q| {
            doc_vectors
                .iter()
                .map(|d| crate::simd::dot(q, d))
                .fold(f32::NEG_INFINITY, f32::max)
        })
        .sum()
}

/// Read-only searcher over an immutable index snapshot.
///
/// Holds an `Arc` so searches keep working against their snapshot while a
/// builder swaps in a replacement.
pub struct Searcher<'a> {
    index: Arc<Index>,
    embedder: &'a dyn Embedder,
}

impl<'a> Searcher<'a> {
    pub fn new(index: Arc<Index>, embedder: &'a dyn Embedder) -> Result<Self> {
        if embedder.dimension() != index.dimension() {
            return Err(LateError::DimensionMismatch {
                expected: index.dimension(),
                got: embedder.dimension(),
            });
        }
        Ok(Self { index, embedder })
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Rank the top `k` documents for one query.
    pub fn search(&self, query: &str, k: usize, params: SearchParams) -> Result<Vec<SearchResult>> {
        let embeddings = self
            .embedder
            .embed(&[query.to_string()], EmbedRole::Query)?;
        let query_vectors = self.normalized_query(embeddings.into_iter().next())?;
        self.search_embedded(&query_vectors, k, params)
    }

    /// Rank each query of a batch independently.
    ///
    /// Results are index-aligned with the input; one malformed query yields a
    /// per-item error without failing its neighbors.
    pub fn search_batch(
        &self,
        queries: &[String],
        k: usize,
        params: SearchParams,
    ) -> Vec<Result<Vec<SearchResult>>> {
        queries
            .iter()
            .map(|q| self.search(q, k, params))
            .collect()
    }

    /// Rank against pre-computed, normalized query vectors.
    pub fn search_embedded(
        &self,
        query_vectors: &[Vec<f32>],
        k: usize,
        params: SearchParams,
    ) -> Result<Vec<SearchResult>> {
        if query_vectors.is_empty() {
            return Err(LateError::InvalidParameter(
                "query produced no token embeddings".to_string(),
            ));
        }
        for v in query_vectors {
            if v.len() != self.index.dimension() {
                return Err(LateError::DimensionMismatch {
                    expected: self.index.dimension(),
                    got: v.len(),
                });
            }
        }

        let candidates =
            self.index
                .ivf
                .candidates(query_vectors, params.nprobe, params.max_candidates);

        let mut scored: Vec<SearchResult> = candidates
            .par_iter()
            .map(|&doc_id| self.score_candidate(doc_id, query_vectors))
            .collect::<Result<_>>()?;

        // Total order: score descending, then doc id ascending.
        scored.sort_unstable_by(|a, b| b.score.total_cmp(&a.score).then(a.doc_id.cmp(&b.doc_id)));
        scored.truncate(k);
        Ok(scored)
    }

    fn score_candidate(&self, doc_id: u32, query_vectors: &[Vec<f32>]) -> Result<SearchResult> {
        let stored = self
            .index
            .store
            .get(doc_id)?
            .ok_or(LateError::DocumentNotFound(doc_id))?;

        let mut doc_vectors = Vec::with_capacity(stored.vectors.len());
        for cv in &stored.vectors {
            let centroid = self.index.ivf.centroid(cv.centroid_id);
            doc_vectors.push(self.index.codec.decode(cv, centroid)?);
        }

        Ok(SearchResult {
            doc_id,
            score: maxsim(query_vectors, &doc_vectors),
            text: stored.text,
        })
    }

    fn normalized_query(
        &self,
        embeddings: Option<crate::embed::TokenEmbeddings>,
    ) -> Result<Vec<Vec<f32>>> {
        let mut vectors = embeddings
            .map(|e| e.vectors)
            .ok_or_else(|| LateError::EncodingUnavailable("embedder returned no output".into()))?;
        for v in &mut vectors {
            crate::distance::l2_normalize(v);
        }
        Ok(vectors)
    }
}
