//! Hard-negative mining.
//!
//! Builds a cheap single-vector index over the corpus (mean-pooled token
//! embeddings) and, for each labeled query, retrieves the nearest passages
//! that are *not* marked positive. A shortfall — fewer eligible passages than
//! requested — is reported with a flag, never as an error.
//!
//! Mining is deterministic. The optional non-mining fallback samples
//! uniformly instead and takes an explicit seed for reproducibility.

use crate::distance::l2_normalize;
use crate::embed::{embed_batched, EmbedRole, Embedder};
use crate::error::{LateError, Result};
use crate::ivf::suggested_centroid_count;
use crate::kmeans::KMeans;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use tracing::warn;

/// A query with its known-relevant passages.
#[derive(Debug, Clone)]
pub struct LabeledQuery {
    pub query: String,
    /// Corpus indices of known positives.
    pub positive_ids: Vec<u32>,
    /// Positive texts; passages equal to any of these are also excluded.
    pub positive_texts: Vec<String>,
}

/// Mined negatives for one query, input-ordered with the query batch.
#[derive(Debug, Clone)]
pub struct MinedNegatives {
    /// Corpus indices, best (hardest) negative first.
    pub negatives: Vec<u32>,
    /// Set when fewer eligible passages existed than were requested.
    pub shortfall: bool,
}

/// Miner configuration.
#[derive(Debug, Clone)]
pub struct MinerConfig {
    /// Upper bound on negatives returned per query.
    pub num_negatives: usize,
    /// When false, sample uniformly instead of mining nearest passages.
    pub mine_hard_negatives: bool,
    /// Seed for the uniform-sampling fallback.
    pub seed: u64,
    /// Centroids probed per query in the coarse index.
    pub nprobe: usize,
    /// Embedder batch size.
    pub batch_size: usize,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            num_negatives: 10,
            mine_hard_negatives: true,
            seed: 42,
            nprobe: 8,
            batch_size: 32,
        }
    }
}

/// Single-vector approximate index over mean-pooled passage embeddings.
struct CoarseIndex {
    dimension: usize,
    /// Pooled passage vectors, flat SoA.
    pooled: Vec<f32>,
    num_passages: usize,
    centroids: KMeans,
    /// Passage ids per centroid.
    buckets: Vec<Vec<u32>>,
}

impl CoarseIndex {
    fn build(pooled: Vec<f32>, num_passages: usize, dimension: usize, seed: u64) -> Result<Self> {
        let k = suggested_centroid_count(num_passages).min(num_passages.max(1));
        let centroids = KMeans::train_degrading(dimension, k, &pooled, num_passages, seed)?;

        let mut buckets = vec![Vec::new(); centroids.k()];
        for i in 0..num_passages {
            let v = &pooled[i * dimension..(i + 1) * dimension];
            buckets[centroids.assign_one(v)].push(i as u32);
        }

        Ok(Self {
            dimension,
            pooled,
            num_passages,
            centroids,
            buckets,
        })
    }

    fn passage(&self, id: u32) -> &[f32] {
        let start = id as usize * self.dimension;
        &self.pooled[start..start + self.dimension]
    }

    /// Top `k` passages by pooled cosine, probing `nprobe` centroid buckets.
    /// Ties break by passage id ascending.
    fn nearest(&self, query: &[f32], k: usize, nprobe: usize) -> Vec<u32> {
        // No bucket walk can yield more than the whole corpus.
        let want = k.min(self.num_passages);

        let mut ranked: Vec<(f32, usize)> = self
            .centroids
            .centroids()
            .iter()
            .enumerate()
            .map(|(id, c)| (crate::simd::dot(query, c), id))
            .collect();
        ranked.sort_unstable_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut candidates: Vec<u32> = Vec::new();
        for &(_, centroid_id) in ranked.iter().take(nprobe) {
            candidates.extend_from_slice(&self.buckets[centroid_id]);
        }
        // Probe wider if the buckets were too sparse to fill the request.
        if candidates.len() < want {
            for &(_, centroid_id) in ranked.iter().skip(nprobe) {
                candidates.extend_from_slice(&self.buckets[centroid_id]);
                if candidates.len() >= want {
                    break;
                }
            }
        }

        let mut scored: Vec<(f32, u32)> = candidates
            .into_iter()
            .map(|id| (crate::simd::dot(query, self.passage(id)), id))
            .collect();
        scored.sort_unstable_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.into_iter().take(want).map(|(_, id)| id).collect()
    }
}

/// Mines semantically-close-but-irrelevant passages for labeled queries.
pub struct HardNegativeMiner<'a> {
    embedder: &'a dyn Embedder,
    config: MinerConfig,
}

impl<'a> HardNegativeMiner<'a> {
    pub fn new(embedder: &'a dyn Embedder, config: MinerConfig) -> Self {
        Self { embedder, config }
    }

    /// Mine negatives for each query against the full corpus.
    ///
    /// Output is index-aligned with `queries`.
    pub fn mine(
        &self,
        queries: &[LabeledQuery],
        corpus: &[String],
    ) -> Result<Vec<MinedNegatives>> {
        if corpus.is_empty() {
            return Err(LateError::InvalidParameter("empty corpus".to_string()));
        }
        for q in queries {
            if let Some(&id) = q.positive_ids.iter().find(|&&id| id as usize >= corpus.len()) {
                return Err(LateError::InvalidParameter(format!(
                    "positive id {id} out of range for corpus of {}",
                    corpus.len()
                )));
            }
        }

        if !self.config.mine_hard_negatives {
            return Ok(self.sample_uniform(queries, corpus));
        }

        let (pooled, dim) = self.pool_corpus(corpus)?;
        let coarse = CoarseIndex::build(pooled, corpus.len(), dim, self.config.seed)?;

        let query_texts: Vec<String> = queries.iter().map(|q| q.query.clone()).collect();
        let query_embeddings = embed_batched(
            self.embedder,
            &query_texts,
            EmbedRole::Query,
            self.config.batch_size,
            &|| false,
        )?;

        let slack = self.config.num_negatives.max(10);
        let fetch = self.config.num_negatives + slack;

        let mut out = Vec::with_capacity(queries.len());
        for (query, emb) in queries.iter().zip(query_embeddings) {
            let pooled_query = mean_pool(&emb.vectors, dim)?;
            let ranked = coarse.nearest(&pooled_query, fetch.min(corpus.len()), self.config.nprobe);
            out.push(self.filter_positives(query, ranked, corpus));
        }
        Ok(out)
    }

    fn filter_positives(
        &self,
        query: &LabeledQuery,
        ranked: Vec<u32>,
        corpus: &[String],
    ) -> MinedNegatives {
        let positive_ids: HashSet<u32> = query.positive_ids.iter().copied().collect();
        let positive_texts: HashSet<&str> =
            query.positive_texts.iter().map(String::as_str).collect();

        let negatives: Vec<u32> = ranked
            .into_iter()
            .filter(|id| {
                !positive_ids.contains(id) && !positive_texts.contains(corpus[*id as usize].as_str())
            })
            .take(self.config.num_negatives)
            .collect();

        let shortfall = negatives.len() < self.config.num_negatives;
        if shortfall {
            warn!(
                query = %query.query,
                requested = self.config.num_negatives,
                got = negatives.len(),
                "negative shortfall"
            );
        }
        MinedNegatives {
            negatives,
            shortfall,
        }
    }

    /// Seeded uniform sampling over eligible passages (non-mining fallback).
    fn sample_uniform(&self, queries: &[LabeledQuery], corpus: &[String]) -> Vec<MinedNegatives> {
        queries
            .iter()
            .enumerate()
            .map(|(qi, query)| {
                let positive_ids: HashSet<u32> = query.positive_ids.iter().copied().collect();
                let positive_texts: HashSet<&str> =
                    query.positive_texts.iter().map(String::as_str).collect();

                let mut eligible: Vec<u32> = (0..corpus.len() as u32)
                    .filter(|id| {
                        !positive_ids.contains(id)
                            && !positive_texts.contains(corpus[*id as usize].as_str())
                    })
                    .collect();

                let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(qi as u64));
                eligible.shuffle(&mut rng);
                eligible.truncate(self.config.num_negatives);

                let shortfall = eligible.len() < self.config.num_negatives;
                MinedNegatives {
                    negatives: eligible,
                    shortfall,
                }
            })
            .collect()
    }

    /// Mean-pool each passage's token embeddings into one normalized vector.
    fn pool_corpus(&self, corpus: &[String]) -> Result<(Vec<f32>, usize)> {
        let dim = self.embedder.dimension();
        let embeddings = embed_batched(
            self.embedder,
            corpus,
            EmbedRole::Document,
            self.config.batch_size,
            &|| false,
        )?;

        let mut pooled = Vec::with_capacity(corpus.len() * dim);
        for emb in &embeddings {
            pooled.extend(mean_pool(&emb.vectors, dim)?);
        }
        Ok((pooled, dim))
    }
}

fn mean_pool(vectors: &[Vec<f32>], dim: usize) -> Result<Vec<f32>> {
    if vectors.is_empty() {
        return Err(LateError::EncodingUnavailable(
            "passage produced no token embeddings".to_string(),
        ));
    }
    let mut pooled = vec![0.0f32; dim];
    for v in vectors {
        if v.len() != dim {
            return Err(LateError::DimensionMismatch {
                expected: dim,
                got: v.len(),
            });
        }
        for (p, x) in pooled.iter_mut().zip(v) {
            *p += x;
        }
    }
    for p in &mut pooled {
        *p /= vectors.len() as f32;
    }
    l2_normalize(&mut pooled);
    Ok(pooled)
}
