//! Samples, batches and the dataloader that feeds the training loop.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A single labelled example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub features: Vec<f64>,
    pub target: f64,
}

impl Sample {
    pub fn new(features: Vec<f64>, target: f64) -> Self {
        Self { features, target }
    }
}

/// A group of samples handed to one model step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub features: Vec<Vec<f64>>,
    pub targets: Vec<f64>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    fn push(&mut self, sample: &Sample) {
        self.features.push(sample.features.clone());
        self.targets.push(sample.target);
    }
}

/// Splits a dataset into batches, optionally shuffling each pass.
#[derive(Debug, Clone)]
pub struct DataLoader {
    samples: Arc<[Sample]>,
    batch_size: usize,
    shuffle: bool,
}

impl DataLoader {
    /// Create a loader. A `batch_size` of zero is treated as one.
    pub fn new(samples: impl Into<Arc<[Sample]>>, batch_size: usize) -> Self {
        Self {
            samples: samples.into(),
            batch_size: batch_size.max(1),
            shuffle: false,
        }
    }

    pub fn shuffled(mut self) -> Self {
        self.shuffle = true;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }

    /// Materialise one pass over the data.
    pub fn batches(&self, rng: &mut StdRng) -> Vec<Batch> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if self.shuffle {
            order.shuffle(rng);
        }
        order
            .chunks(self.batch_size)
            .map(|chunk| {
                let mut batch = Batch::default();
                for &idx in chunk {
                    batch.push(&self.samples[idx]);
                }
                batch
            })
            .collect()
    }
}

/// Number of batches to run given a fraction of the full set.
///
/// A percent of zero disables the phase. Any positive percent runs at least one batch.
pub fn limit_batches(total: usize, percent: f64) -> usize {
    if total == 0 || percent <= 0.0 {
        return 0;
    }
    ((total as f64 * percent).floor() as usize).clamp(1, total)
}

/// Deterministic RNG when a seed is given, entropy-seeded otherwise.
pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}
