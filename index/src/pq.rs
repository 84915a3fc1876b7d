//! Product quantization: compress vectors into per-subspace centroid
//! codes and answer asymmetric distance queries through lookup tables.

use crate::{DimensionMismatchSnafu, Result};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use snafu::ensure;

/// Quantizer shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PqConfig {
    /// Full vector dimensionality; must divide evenly by
    /// `num_subquantizers`.
    pub dimensions: usize,
    /// Number of subspaces the vector splits into.
    pub num_subquantizers: usize,
    /// Centroids per subspace (≤ 256 so codes fit a byte).
    pub num_centroids: usize,
    /// K-means iterations during training.
    pub training_iterations: usize,
}

impl PqConfig {
    /// A quantizer with 8 subspaces of 256 centroids.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            num_subquantizers: 8,
            num_centroids: 256,
            training_iterations: 10,
        }
    }

    fn sub_dims(&self) -> usize {
        self.dimensions / self.num_subquantizers
    }
}

/// A trained product quantizer; the codebooks serialize for reuse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductQuantizer {
    config: PqConfig,
    // codebooks[subquantizer][centroid] = centroid sub-vector
    codebooks: Vec<Vec<Vec<f32>>>,
}

fn l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn kmeans(samples: &[&[f32]], k: usize, iterations: usize) -> Vec<Vec<f32>> {
    let mut rng = rand::thread_rng();
    let mut centroids: Vec<Vec<f32>> = samples
        .choose_multiple(&mut rng, k.min(samples.len()))
        .map(|s| s.to_vec())
        .collect();
    // degenerate sample sets keep whatever centroids exist
    if centroids.is_empty() {
        return vec![];
    }

    for _ in 0..iterations {
        let mut sums: Vec<Vec<f32>> = vec![vec![0.0; samples[0].len()]; centroids.len()];
        let mut counts = vec![0usize; centroids.len()];
        for sample in samples {
            let nearest = nearest_centroid(&centroids, sample);
            counts[nearest] += 1;
            for (accumulator, v) in sums[nearest].iter_mut().zip(sample.iter()) {
                *accumulator += v;
            }
        }
        for (i, centroid) in centroids.iter_mut().enumerate() {
            if counts[i] > 0 {
                for (c, s) in centroid.iter_mut().zip(&sums[i]) {
                    *c = s / counts[i] as f32;
                }
            }
        }
    }
    centroids
}

fn nearest_centroid(centroids: &[Vec<f32>], sample: &[f32]) -> usize {
    centroids
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| l2(a, sample).total_cmp(&l2(b, sample)))
        .map(|(i, _)| i)
        .expect("at least one centroid")
}

impl ProductQuantizer {
    /// Train codebooks on a sample of vectors.
    pub fn train(config: PqConfig, samples: &[Vec<f32>]) -> Result<Self> {
        assert!(
            config.dimensions % config.num_subquantizers == 0,
            "dimensions must divide evenly into subquantizers"
        );
        assert!(config.num_centroids <= 256, "codes must fit a byte");
        for sample in samples {
            ensure!(
                sample.len() == config.dimensions,
                DimensionMismatchSnafu {
                    got: sample.len(),
                    expected: config.dimensions,
                }
            );
        }

        let sub_dims = config.sub_dims();
        let mut codebooks = Vec::with_capacity(config.num_subquantizers);
        for sub in 0..config.num_subquantizers {
            let offset = sub * sub_dims;
            let sub_samples: Vec<&[f32]> = samples
                .iter()
                .map(|s| &s[offset..offset + sub_dims])
                .collect();
            codebooks.push(kmeans(
                &sub_samples,
                config.num_centroids,
                config.training_iterations,
            ));
        }
        Ok(Self { config, codebooks })
    }

    /// The trained shape.
    pub fn config(&self) -> &PqConfig {
        &self.config
    }

    /// Compress a vector into one code byte per subspace.
    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        ensure!(
            vector.len() == self.config.dimensions,
            DimensionMismatchSnafu {
                got: vector.len(),
                expected: self.config.dimensions,
            }
        );
        let sub_dims = self.config.sub_dims();
        Ok(self
            .codebooks
            .iter()
            .enumerate()
            .map(|(sub, codebook)| {
                let offset = sub * sub_dims;
                nearest_centroid(codebook, &vector[offset..offset + sub_dims]) as u8
            })
            .collect())
    }

    /// Per-subspace distances from `query` to every centroid, for
    /// asymmetric distance computation.
    pub fn distance_table(&self, query: &[f32]) -> Result<Vec<Vec<f32>>> {
        ensure!(
            query.len() == self.config.dimensions,
            DimensionMismatchSnafu {
                got: query.len(),
                expected: self.config.dimensions,
            }
        );
        let sub_dims = self.config.sub_dims();
        Ok(self
            .codebooks
            .iter()
            .enumerate()
            .map(|(sub, codebook)| {
                let offset = sub * sub_dims;
                let q = &query[offset..offset + sub_dims];
                codebook.iter().map(|c| l2(c, q)).collect()
            })
            .collect())
    }

    /// Approximate distance of an encoded vector using a
    /// [`distance_table`](Self::distance_table).
    pub fn adc_distance(table: &[Vec<f32>], codes: &[u8]) -> f32 {
        table
            .iter()
            .zip(codes)
            .map(|(sub_table, code)| sub_table[*code as usize])
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clustered_samples() -> Vec<Vec<f32>> {
        // two clear clusters per subspace
        let mut samples = vec![];
        for i in 0..32 {
            let hot = if i % 2 == 0 { 10.0 } else { -10.0 };
            samples.push(vec![
                hot + (i as f32) * 0.01,
                0.0,
                -hot,
                (i as f32) * 0.01,
            ]);
        }
        samples
    }

    fn quantizer() -> ProductQuantizer {
        let config = PqConfig {
            dimensions: 4,
            num_subquantizers: 2,
            num_centroids: 4,
            training_iterations: 10,
        };
        ProductQuantizer::train(config, &clustered_samples()).unwrap()
    }

    #[test]
    fn encode_produces_one_code_per_subspace() {
        let pq = quantizer();
        let codes = pq.encode(&[10.0, 0.0, -10.0, 0.0]).unwrap();
        assert_eq!(codes.len(), 2);
    }

    #[test]
    fn adc_distance_ranks_like_true_distance() {
        let pq = quantizer();
        let near = vec![10.0, 0.0, -10.0, 0.0];
        let far = vec![-10.0, 0.0, 10.0, 0.0];

        let query = vec![9.5, 0.1, -9.5, 0.0];
        let table = pq.distance_table(&query).unwrap();

        let near_distance =
            ProductQuantizer::adc_distance(&table, &pq.encode(&near).unwrap());
        let far_distance = ProductQuantizer::adc_distance(&table, &pq.encode(&far).unwrap());
        assert!(near_distance < far_distance);
    }

    #[test]
    fn codebook_serializes() {
        let pq = quantizer();
        let json = serde_json::to_string(&pq).unwrap();
        let back: ProductQuantizer = serde_json::from_str(&json).unwrap();
        assert_eq!(back.config(), pq.config());

        // the deserialized quantizer encodes identically
        let v = vec![10.0, 0.0, -10.0, 0.0];
        assert_eq!(back.encode(&v).unwrap(), pq.encode(&v).unwrap());
    }

    #[test]
    fn dimension_checks() {
        let pq = quantizer();
        assert!(pq.encode(&[1.0]).is_err());
        assert!(pq.distance_table(&[1.0, 2.0]).is_err());
    }
}
