//! Residual bucket quantization.
//!
//! Vectors are stored as (nearest centroid id + quantized residual). The
//! residual quantizer learns, from a bounded training sample:
//!
//! - a global **average residual** per dimension, subtracted before bucketing
//!   to center the distribution;
//! - per-dimension **bucket weights** (the reconstruction value of each
//!   bucket), taken as percentile means of the observed residuals;
//! - global **bucket cutoffs**, the midpoints between consecutive average
//!   bucket weights, used for binary-search quantization.
//!
//! At `bits` precision there are `2^bits` buckets; codes are bit-packed, so a
//! 128-dim vector at 4 bits costs 64 bytes of residual plus a centroid id.

use crate::error::{LateError, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Minimum training samples per bucket before training degrades.
pub const MIN_SAMPLES_PER_BUCKET: usize = 2;

/// A quantized vector: nearest centroid plus packed residual codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedVector {
    /// Id of the nearest centroid at encode time.
    pub centroid_id: u32,
    /// Residual bucket codes, bit-packed at the codec's bit-width.
    pub codes: Vec<u8>,
}

/// Trained residual quantizer parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResidualCodec {
    dimension: usize,
    bits: u8,
    /// Bucket boundaries including sentinels: `[-inf, c1, ..., c(B-1), inf]`.
    bucket_cutoffs: Vec<f32>,
    /// Reconstruction values, `[bucket][dimension]` flattened.
    bucket_weights: Vec<f32>,
    /// Mean residual per dimension, subtracted before bucketing.
    avg_residual: Vec<f32>,
}

impl ResidualCodec {
    /// Train a codec from residual samples stored contiguously (SoA).
    ///
    /// `residuals` holds `num_samples * dimension` floats of
    /// `vector - nearest_centroid` differences. If the sample cannot support
    /// `2^bits` buckets at [`MIN_SAMPLES_PER_BUCKET`] samples each, the bit
    /// width degrades to the largest one it can, with a diagnostic. Only a
    /// sample too small even for 1-bit buckets is an error.
    pub fn train(
        residuals: &[f32],
        num_samples: usize,
        dimension: usize,
        bits: u8,
    ) -> Result<Self> {
        if !(1..=8).contains(&bits) {
            return Err(LateError::InvalidParameter(format!(
                "bits must be in 1..=8, got {bits}"
            )));
        }
        if dimension == 0 {
            return Err(LateError::InvalidParameter(
                "dimension must be greater than 0".to_string(),
            ));
        }
        if residuals.len() < num_samples * dimension {
            return Err(LateError::InvalidParameter(
                "residual buffer shorter than num_samples * dimension".to_string(),
            ));
        }

        let requested = bits;
        let mut bits = bits;
        while bits > 1 && num_samples < (1usize << bits) * MIN_SAMPLES_PER_BUCKET {
            bits -= 1;
        }
        let num_buckets = 1usize << bits;
        if num_samples < num_buckets * MIN_SAMPLES_PER_BUCKET {
            return Err(LateError::InsufficientTrainingData {
                got: num_samples,
                wanted: num_buckets * MIN_SAMPLES_PER_BUCKET,
            });
        }
        if bits < requested {
            warn!(
                requested,
                degraded = bits,
                samples = num_samples,
                "training sample too small for requested bit width, degrading"
            );
        }

        // Center the residual distribution.
        let mut avg_residual = vec![0.0f32; dimension];
        for sample in residuals.chunks_exact(dimension).take(num_samples) {
            for (d, &v) in sample.iter().enumerate() {
                avg_residual[d] += v;
            }
        }
        for v in &mut avg_residual {
            *v /= num_samples as f32;
        }

        // Per-dimension percentile means become bucket weights.
        let mut bucket_weights = vec![0.0f32; num_buckets * dimension];
        let mut column = Vec::with_capacity(num_samples);
        for d in 0..dimension {
            column.clear();
            for s in 0..num_samples {
                column.push(residuals[s * dimension + d] - avg_residual[d]);
            }
            column.sort_by(f32::total_cmp);

            for bucket in 0..num_buckets {
                let start = bucket * num_samples / num_buckets;
                let end = ((bucket + 1) * num_samples / num_buckets).max(start + 1);
                let end = end.min(num_samples);
                let slice = &column[start.min(num_samples - 1)..end];
                let mean = if slice.is_empty() {
                    0.0
                } else {
                    slice.iter().sum::<f32>() / slice.len() as f32
                };
                bucket_weights[bucket * dimension + d] = mean;
            }
        }

        // Cutoffs: midpoints between consecutive dimension-averaged weights.
        let mut avg_bucket: Vec<f32> = (0..num_buckets)
            .map(|b| {
                bucket_weights[b * dimension..(b + 1) * dimension]
                    .iter()
                    .sum::<f32>()
                    / dimension as f32
            })
            .collect();
        avg_bucket.sort_by(f32::total_cmp);

        let mut bucket_cutoffs = Vec::with_capacity(num_buckets + 1);
        bucket_cutoffs.push(f32::NEG_INFINITY);
        for i in 0..num_buckets - 1 {
            bucket_cutoffs.push((avg_bucket[i] + avg_bucket[i + 1]) / 2.0);
        }
        bucket_cutoffs.push(f32::INFINITY);

        Ok(Self {
            dimension,
            bits,
            bucket_cutoffs,
            bucket_weights,
            avg_residual,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Bytes of packed residual per vector.
    pub fn bytes_per_vector(&self) -> usize {
        (self.dimension * self.bits as usize).div_ceil(8)
    }

    /// Quantize one centered residual component to its bucket index.
    fn bucket_of(&self, value: f32) -> u8 {
        let num_buckets = 1usize << self.bits;
        let mut left = 0usize;
        let mut right = num_buckets;
        while left < right {
            let mid = (left + right) / 2;
            if value < self.bucket_cutoffs[mid + 1] {
                right = mid;
            } else {
                left = mid + 1;
            }
        }
        left.min(num_buckets - 1) as u8
    }

    /// Encode a normalized vector against its nearest centroid.
    pub fn encode(
        &self,
        vector: &[f32],
        centroid_id: u32,
        centroid: &[f32],
    ) -> Result<CompressedVector> {
        if vector.len() != self.dimension {
            return Err(LateError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }

        let mut writer = BitWriter::new(self.bytes_per_vector());
        for d in 0..self.dimension {
            let residual = vector[d] - centroid[d] - self.avg_residual[d];
            writer.push(self.bucket_of(residual), self.bits);
        }

        Ok(CompressedVector {
            centroid_id,
            codes: writer.into_bytes(),
        })
    }

    /// Reconstruct an approximate vector: centroid + avg residual + bucket weight.
    pub fn decode(&self, compressed: &CompressedVector, centroid: &[f32]) -> Result<Vec<f32>> {
        if centroid.len() != self.dimension {
            return Err(LateError::DimensionMismatch {
                expected: self.dimension,
                got: centroid.len(),
            });
        }
        if compressed.codes.len() != self.bytes_per_vector() {
            return Err(LateError::IndexCorrupt(format!(
                "compressed vector has {} code bytes, codec expects {}",
                compressed.codes.len(),
                self.bytes_per_vector()
            )));
        }

        let mut reader = BitReader::new(&compressed.codes);
        let mut out = Vec::with_capacity(self.dimension);
        for d in 0..self.dimension {
            let bucket = reader.pull(self.bits) as usize;
            out.push(
                centroid[d] + self.avg_residual[d] + self.bucket_weights[bucket * self.dimension + d],
            );
        }
        Ok(out)
    }
}

/// LSB-first bit packer for sub-byte codes.
struct BitWriter {
    bytes: Vec<u8>,
    bit_pos: usize,
}

impl BitWriter {
    fn new(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            bit_pos: 0,
        }
    }

    fn push(&mut self, code: u8, bits: u8) {
        for i in 0..bits {
            if self.bit_pos % 8 == 0 {
                self.bytes.push(0);
            }
            let bit = (code >> i) & 1;
            let byte = self.bytes.len() - 1;
            self.bytes[byte] |= bit << (self.bit_pos % 8);
            self.bit_pos += 1;
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

struct BitReader<'a> {
    bytes: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, bit_pos: 0 }
    }

    fn pull(&mut self, bits: u8) -> u8 {
        let mut code = 0u8;
        for i in 0..bits {
            let byte = self.bit_pos / 8;
            let bit = (self.bytes[byte] >> (self.bit_pos % 8)) & 1;
            code |= bit << i;
            self.bit_pos += 1;
        }
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::cosine_similarity;

    fn synthetic_residuals(num: usize, dim: usize) -> Vec<f32> {
        // Deterministic spread of small residuals in [-0.1, 0.1].
        (0..num * dim)
            .map(|i| ((i as f32 * 0.7371).sin()) * 0.1)
            .collect()
    }

    #[test]
    fn bit_packing_round_trips_every_width() {
        for bits in 1u8..=8 {
            let max = ((1u16 << bits) - 1) as u8;
            let codes: Vec<u8> = (0..37).map(|i| (i * 5 % (max as usize + 1)) as u8).collect();
            let mut w = BitWriter::new(64);
            for &c in &codes {
                w.push(c, bits);
            }
            let bytes = w.into_bytes();
            let mut r = BitReader::new(&bytes);
            for &c in &codes {
                assert_eq!(r.pull(bits), c, "bits={bits}");
            }
        }
    }

    #[test]
    fn codec_rejects_bad_bit_widths() {
        let residuals = synthetic_residuals(16, 4);
        assert!(ResidualCodec::train(&residuals, 16, 4, 0).is_err());
        assert!(ResidualCodec::train(&residuals, 16, 4, 9).is_err());
    }

    #[test]
    fn undersampled_training_degrades_bit_width() {
        // 10 samples support 4 buckets at most, not the 256 requested.
        let residuals = synthetic_residuals(10, 4);
        let codec = ResidualCodec::train(&residuals, 10, 4, 8).unwrap();
        assert_eq!(codec.bits(), 2);
        assert_eq!(codec.bytes_per_vector(), 1);
    }

    #[test]
    fn too_small_sample_is_an_error() {
        let residuals = synthetic_residuals(2, 4);
        assert!(matches!(
            ResidualCodec::train(&residuals, 2, 4, 1),
            Err(LateError::InsufficientTrainingData { got: 2, .. })
        ));
    }

    #[test]
    fn encode_decode_stays_close_at_4_bits() {
        let dim = 16;
        let num = 256;
        let residuals = synthetic_residuals(num, dim);
        let codec = ResidualCodec::train(&residuals, num, dim, 4).unwrap();

        let mut centroid = vec![0.0f32; dim];
        centroid[0] = 1.0;

        let mut total_sim = 0.0;
        let trials = 64;
        for t in 0..trials {
            let mut v = centroid.clone();
            for (d, x) in v.iter_mut().enumerate() {
                *x += residuals[(t * dim + d) % residuals.len()];
            }
            crate::distance::l2_normalize(&mut v);

            let c = codec.encode(&v, 0, &centroid).unwrap();
            let back = codec.decode(&c, &centroid).unwrap();
            total_sim += cosine_similarity(&v, &back);
        }
        let avg = total_sim / trials as f32;
        assert!(avg >= 0.95, "average cosine {avg} below 0.95 at 4 bits");
    }

    #[test]
    fn decode_detects_truncated_codes() {
        let residuals = synthetic_residuals(32, 8);
        let codec = ResidualCodec::train(&residuals, 32, 8, 2).unwrap();
        let bad = CompressedVector {
            centroid_id: 0,
            codes: vec![0u8; 1],
        };
        let centroid = vec![0.0f32; 8];
        assert!(matches!(
            codec.decode(&bad, &centroid),
            Err(LateError::IndexCorrupt(_))
        ));
    }
}
