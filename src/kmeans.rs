//! k-means clustering over flat (SoA) vector storage.
//!
//! Used for the IVF centroid table and for the hard-negative miner's coarse
//! partitioning. Inputs are expected to be L2-normalized; distances are
//! dot-product cosine.

use crate::distance;
use crate::error::{LateError, Result};
use tracing::warn;

/// Minimum training samples per requested cluster before training degrades.
pub const MIN_SAMPLES_PER_CLUSTER: usize = 2;

/// k-means clustering with k-means++ initialization.
#[derive(Debug)]
pub struct KMeans {
    /// Centroids (k x dimension)
    centroids: Vec<Vec<f32>>,
    dimension: usize,
    k: usize,
    seed: u64,
    max_iterations: usize,
}

impl KMeans {
    /// Create new k-means with k clusters and a deterministic seed.
    ///
    /// Repeated `fit(...)` calls on the same inputs produce identical results.
    pub fn new(dimension: usize, k: usize, seed: u64) -> Result<Self> {
        if dimension == 0 || k == 0 {
            return Err(LateError::InvalidParameter(
                "dimension and k must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            centroids: Vec::new(),
            dimension,
            k,
            seed,
            max_iterations: 25,
        })
    }

    /// Train, degrading the cluster count once if the sample is too small.
    ///
    /// If `num_vectors < k * MIN_SAMPLES_PER_CLUSTER`, retries with the
    /// largest cluster count the sample supports and emits a diagnostic.
    /// Surfaces [`LateError::InsufficientTrainingData`] only if even a single
    /// cluster cannot be trained.
    pub fn train_degrading(
        dimension: usize,
        k: usize,
        vectors: &[f32],
        num_vectors: usize,
        seed: u64,
    ) -> Result<Self> {
        let k = if num_vectors < k * MIN_SAMPLES_PER_CLUSTER {
            let degraded = (num_vectors / MIN_SAMPLES_PER_CLUSTER).max(1);
            if num_vectors == 0 {
                return Err(LateError::InsufficientTrainingData { got: 0, wanted: k });
            }
            warn!(
                requested = k,
                degraded,
                samples = num_vectors,
                "training sample too small for requested cluster count, degrading"
            );
            degraded
        } else {
            k
        };

        let mut km = Self::new(dimension, k, seed)?;
        km.fit(vectors, num_vectors)?;
        Ok(km)
    }

    /// Train k-means on `num_vectors` vectors stored contiguously.
    pub fn fit(&mut self, vectors: &[f32], num_vectors: usize) -> Result<()> {
        if vectors.len() < num_vectors * self.dimension {
            return Err(LateError::InvalidParameter(
                "vector buffer shorter than num_vectors * dimension".to_string(),
            ));
        }
        if num_vectors < self.k {
            return Err(LateError::InsufficientTrainingData {
                got: num_vectors,
                wanted: self.k,
            });
        }

        self.centroids = self.kmeans_plus_plus(vectors, num_vectors);

        for _iteration in 0..self.max_iterations {
            let assignments = self.assign_clusters(vectors, num_vectors);
            let new_centroids = self.update_centroids(vectors, num_vectors, &assignments);

            let mut converged = true;
            for (old, new) in self.centroids.iter().zip(new_centroids.iter()) {
                if distance::cosine_distance_normalized(old, new) > 1e-6 {
                    converged = false;
                    break;
                }
            }

            self.centroids = new_centroids;
            if converged {
                break;
            }
        }

        // Centroids are means of unit vectors; renormalize so assignment
        // stays a pure dot product downstream.
        for c in &mut self.centroids {
            distance::l2_normalize(c);
        }

        Ok(())
    }

    /// k-means++ initialization, seeded.
    fn kmeans_plus_plus(&self, vectors: &[f32], num_vectors: usize) -> Vec<Vec<f32>> {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut centroids = Vec::with_capacity(self.k);

        let first_idx = rng.random_range(0..num_vectors);
        centroids.push(self.get_vector(vectors, first_idx).to_vec());

        // Subsequent centroids: weighted by distance to nearest existing centroid.
        while centroids.len() < self.k {
            let mut distances = Vec::with_capacity(num_vectors);
            let mut total_distance = 0.0f64;

            for i in 0..num_vectors {
                let vec = self.get_vector(vectors, i);
                let min_dist = centroids
                    .iter()
                    .map(|c| distance::cosine_distance_normalized(vec, c).max(0.0))
                    .fold(f32::INFINITY, f32::min);
                distances.push(min_dist);
                total_distance += min_dist as f64;
            }

            if total_distance <= 0.0 {
                // All points coincide with existing centroids; duplicate one.
                centroids.push(centroids[0].clone());
                continue;
            }

            let threshold = rng.random::<f64>() * total_distance;
            let mut cumulative = 0.0f64;
            let mut chosen = num_vectors - 1;
            for (i, &dist) in distances.iter().enumerate() {
                cumulative += dist as f64;
                if cumulative >= threshold {
                    chosen = i;
                    break;
                }
            }
            centroids.push(self.get_vector(vectors, chosen).to_vec());
        }

        centroids
    }

    /// Assign vectors to nearest centroids. Equal distances break toward the
    /// lower centroid id.
    pub fn assign_clusters(&self, vectors: &[f32], num_vectors: usize) -> Vec<usize> {
        (0..num_vectors)
            .map(|i| self.assign_one(self.get_vector(vectors, i)))
            .collect()
    }

    /// Nearest centroid for a single vector.
    pub fn assign_one(&self, vector: &[f32]) -> usize {
        let mut best_cluster = 0;
        let mut best_dist = f32::INFINITY;
        for (cluster_idx, centroid) in self.centroids.iter().enumerate() {
            let dist = distance::cosine_distance_normalized(vector, centroid);
            if dist < best_dist {
                best_dist = dist;
                best_cluster = cluster_idx;
            }
        }
        best_cluster
    }

    fn update_centroids(
        &self,
        vectors: &[f32],
        num_vectors: usize,
        assignments: &[usize],
    ) -> Vec<Vec<f32>> {
        let mut cluster_sums = vec![vec![0.0f32; self.dimension]; self.centroids.len()];
        let mut cluster_counts = vec![0usize; self.centroids.len()];

        for (i, &cluster) in assignments.iter().enumerate().take(num_vectors) {
            cluster_counts[cluster] += 1;
            let vec = self.get_vector(vectors, i);
            for (j, &val) in vec.iter().enumerate() {
                cluster_sums[cluster][j] += val;
            }
        }

        cluster_sums
            .into_iter()
            .zip(cluster_counts.iter())
            .zip(self.centroids.iter())
            .map(|((sums, &count), old)| {
                if count > 0 {
                    sums.iter().map(|&s| s / count as f32).collect()
                } else {
                    // Empty cluster: keep the old centroid.
                    old.clone()
                }
            })
            .collect()
    }

    fn get_vector<'a>(&self, vectors: &'a [f32], idx: usize) -> &'a [f32] {
        let start = idx * self.dimension;
        &vectors[start..start + self.dimension]
    }

    /// Trained centroids (k x dimension). Normalized after `fit`.
    pub fn centroids(&self) -> &[Vec<f32>] {
        &self.centroids
    }

    /// Actual cluster count (may be below the requested k after degrade).
    pub fn k(&self) -> usize {
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn l2_normalize_in_place(vecs: &mut [f32], num_vectors: usize, dimension: usize) {
        for i in 0..num_vectors {
            let v = &mut vecs[i * dimension..(i + 1) * dimension];
            let norm = v.iter().map(|&x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for x in v {
                    *x /= norm;
                }
            } else if !v.is_empty() {
                v[0] = 1.0;
            }
        }
    }

    #[test]
    fn degrade_shrinks_cluster_count() {
        // 6 samples cannot support 16 clusters at 2 samples each.
        let dimension = 4;
        let mut vectors = vec![0.0f32; 6 * dimension];
        for (i, chunk) in vectors.chunks_mut(dimension).enumerate() {
            chunk[i % dimension] = 1.0;
        }
        let km = KMeans::train_degrading(dimension, 16, &vectors, 6, 7).unwrap();
        assert_eq!(km.k(), 3);
        assert_eq!(km.centroids().len(), 3);
    }

    #[test]
    fn empty_sample_is_an_error() {
        let err = KMeans::train_degrading(4, 8, &[], 0, 7).unwrap_err();
        assert!(matches!(
            err,
            crate::error::LateError::InsufficientTrainingData { got: 0, .. }
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn fit_is_deterministic_given_seed(
            seed in any::<u64>(),
            dimension in 1usize..12,
            num_vectors in 4usize..48,
            k in 1usize..8,
            raw in proptest::collection::vec(-1.0f32..1.0f32, 4usize..(48 * 12)),
        ) {
            prop_assume!(k <= num_vectors);
            let needed = num_vectors * dimension;
            prop_assume!(raw.len() >= needed);

            let mut vectors = raw[..needed].to_vec();
            l2_normalize_in_place(&mut vectors, num_vectors, dimension);

            let mut km1 = KMeans::new(dimension, k, seed).unwrap();
            let mut km2 = KMeans::new(dimension, k, seed).unwrap();
            km1.fit(&vectors, num_vectors).unwrap();
            km2.fit(&vectors, num_vectors).unwrap();

            let a1 = km1.assign_clusters(&vectors, num_vectors);
            let a2 = km2.assign_clusters(&vectors, num_vectors);
            prop_assert_eq!(a1, a2);
        }
    }
}
