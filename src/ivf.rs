//! Inverted-file clustering index.
//!
//! Partitions token embeddings into centroid-keyed buckets. Each centroid
//! owns a posting list of `(doc id, token index)` back-references; the
//! vectors themselves live in the document store. Candidate generation probes
//! the `nprobe` nearest centroids per query vector and unions the owning
//! documents, capped to bound worst-case latency.

use crate::distance;
use crate::error::{LateError, Result};
use crate::kmeans::KMeans;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashSet;

/// Back-reference from a centroid to one token vector of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub doc_id: u32,
    pub token_idx: u32,
}

/// Centroid table plus posting lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfIndex {
    dimension: usize,
    num_centroids: usize,
    /// Flat centroid storage, `num_centroids * dimension`.
    centroids: Vec<f32>,
    /// One posting list per centroid.
    postings: Vec<Vec<Posting>>,
}

/// Centroid count for a corpus: the power of two at or below `16 * sqrt(n)`.
///
/// Yields 1024 centroids near 10K embeddings and 2048 near 18K. Small
/// corpora degrade further at training time when the
/// sample cannot support this many clusters.
pub fn suggested_centroid_count(total_embeddings: usize) -> usize {
    let target = (16.0 * (total_embeddings as f64).sqrt()).max(1.0);
    1usize << (target.log2().floor() as u32)
}

impl IvfIndex {
    /// Cluster `num_vectors` embeddings into `num_centroids` buckets.
    ///
    /// Returns the index (with empty posting lists) and the per-vector
    /// assignment, input-ordered. Degrades the centroid count if the sample
    /// is too small (see [`KMeans::train_degrading`]).
    pub fn build(
        vectors: &[f32],
        num_vectors: usize,
        dimension: usize,
        num_centroids: usize,
        seed: u64,
    ) -> Result<(Self, Vec<usize>)> {
        let km = KMeans::train_degrading(dimension, num_centroids, vectors, num_vectors, seed)?;
        let assignments = km.assign_clusters(vectors, num_vectors);

        let num_centroids = km.k();
        let mut centroids = Vec::with_capacity(num_centroids * dimension);
        for c in km.centroids() {
            centroids.extend_from_slice(c);
        }

        Ok((
            Self {
                dimension,
                num_centroids,
                centroids,
                postings: vec![Vec::new(); num_centroids],
            },
            assignments,
        ))
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn num_centroids(&self) -> usize {
        self.num_centroids
    }

    /// Total postings across all centroids.
    pub fn num_postings(&self) -> usize {
        self.postings.iter().map(Vec::len).sum()
    }

    /// Centroid vector by id.
    pub fn centroid(&self, id: u32) -> &[f32] {
        let start = id as usize * self.dimension;
        &self.centroids[start..start + self.dimension]
    }

    /// Record that `doc_id`'s token `token_idx` is assigned to `centroid_id`.
    pub fn add_posting(&mut self, centroid_id: u32, doc_id: u32, token_idx: u32) {
        self.postings[centroid_id as usize].push(Posting { doc_id, token_idx });
    }

    /// Drop every posting that references `doc_id`.
    pub fn remove_document(&mut self, doc_id: u32) {
        for list in &mut self.postings {
            list.retain(|p| p.doc_id != doc_id);
        }
    }

    /// Nearest centroid for a vector. Equal distances break toward the lower
    /// centroid id.
    pub fn assign(&self, vector: &[f32]) -> Result<u32> {
        if vector.len() != self.dimension {
            return Err(LateError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        let mut best = 0u32;
        let mut best_dist = f32::INFINITY;
        for id in 0..self.num_centroids {
            let dist = distance::cosine_distance_normalized(vector, self.centroid(id as u32));
            if dist < best_dist {
                best_dist = dist;
                best = id as u32;
            }
        }
        Ok(best)
    }

    /// The `nprobe` nearest centroids for one query vector, nearest first.
    /// Equal distances order by centroid id ascending.
    pub fn nearest_centroids(&self, vector: &[f32], nprobe: usize) -> SmallVec<[u32; 16]> {
        let mut ranked: Vec<(f32, u32)> = (0..self.num_centroids as u32)
            .map(|id| {
                (
                    distance::cosine_distance_normalized(vector, self.centroid(id)),
                    id,
                )
            })
            .collect();
        ranked.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        ranked.into_iter().take(nprobe).map(|(_, id)| id).collect()
    }

    /// Candidate documents for a multi-vector query.
    ///
    /// Probes the `nprobe` nearest centroids of every query vector in input
    /// order and unions the owning documents, stopping once `max_candidates`
    /// distinct documents have been collected. The probe order is fully
    /// deterministic, so the returned set is reproducible.
    pub fn candidates(
        &self,
        query_vectors: &[Vec<f32>],
        nprobe: usize,
        max_candidates: usize,
    ) -> Vec<u32> {
        let mut seen: HashSet<u32> = HashSet::new();
        let mut out = Vec::new();

        'outer: for qv in query_vectors {
            for centroid_id in self.nearest_centroids(qv, nprobe) {
                let list = &self.postings[centroid_id as usize];
                if list.is_empty() {
                    continue;
                }
                for posting in list {
                    if seen.insert(posting.doc_id) {
                        out.push(posting.doc_id);
                        if out.len() >= max_candidates {
                            break 'outer;
                        }
                    }
                }
            }
        }

        out
    }
}
