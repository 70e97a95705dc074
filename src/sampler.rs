//! Top-k and quantile-stratified sampling of activating examples
//!
//! ## Banding policy
//!
//! After the top `n_train` examples are taken for training, the remaining
//! ranked pool is cut into `n_quantiles` bands of equal *count* (by rank,
//! not by activation value). When the pool does not divide evenly, the
//! first `pool % n_quantiles` bands hold one extra example. Band 0 holds
//! the strongest remaining activations.
//!
//! ## Shortfall policy
//!
//! Sampling never oversamples. A pool smaller than `n_quantiles * n_test`
//! is a [`SamplingError::InsufficientPool`]; the feature is skipped.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SamplingError};
use crate::feature::{ActivationExample, FeatureRecord};

/// Split sizes and seed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Highest-activating examples used for explanation
    pub n_train: usize,
    /// Examples drawn from each quantile band
    pub n_test: usize,
    pub n_quantiles: usize,
    pub seed: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            n_train: 10,
            n_test: 5,
            n_quantiles: 4,
            seed: 22,
        }
    }
}

impl SamplingConfig {
    /// Scoring an existing explanation needs no training split
    pub fn test_only(self) -> Self {
        Self { n_train: 0, ..self }
    }

    /// Defaults for score runs: no training split, two examples per band
    pub fn scoring() -> Self {
        Self {
            n_test: 2,
            ..Self::default().test_only()
        }
    }

    /// Replace the fields a caller set explicitly, keep the rest
    pub fn overridden(
        self,
        n_train: Option<usize>,
        n_test: Option<usize>,
        n_quantiles: Option<usize>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            n_train: n_train.unwrap_or(self.n_train),
            n_test: n_test.unwrap_or(self.n_test),
            n_quantiles: n_quantiles.unwrap_or(self.n_quantiles),
            seed: seed.unwrap_or(self.seed),
        }
    }

    /// Run the sampler on a record with these settings
    pub fn sample<'a>(&self, record: &'a FeatureRecord) -> Result<SampleSplit<'a>> {
        sample_top_and_quantiles(record, self.n_train, self.n_test, self.n_quantiles, self.seed)
    }
}

/// A test example tagged with the band it was drawn from
#[derive(Debug, Clone, Copy)]
pub struct Sampled<'a> {
    pub example: &'a ActivationExample,
    /// Band index, 0 = strongest
    pub quantile: usize,
}

/// Train/test partition borrowing from a [`FeatureRecord`]
#[derive(Debug, Clone)]
pub struct SampleSplit<'a> {
    pub train: Vec<&'a ActivationExample>,
    /// One group per quantile band, strongest band first
    pub test: Vec<Vec<&'a ActivationExample>>,
    pub seed: u64,
}

impl<'a> SampleSplit<'a> {
    /// All test examples, band by band
    pub fn test_flat(&self) -> Vec<Sampled<'a>> {
        self.test
            .iter()
            .enumerate()
            .flat_map(|(quantile, group)| {
                group.iter().map(move |&example| Sampled { example, quantile })
            })
            .collect()
    }

    pub fn n_test(&self) -> usize {
        self.test.iter().map(Vec::len).sum()
    }
}

/// Take the top `n_train` activating examples for training and sample
/// `n_test` examples from each of `n_quantiles` rank bands of the rest.
///
/// Identical record and seed always give the identical split.
pub fn sample_top_and_quantiles(
    record: &FeatureRecord,
    n_train: usize,
    n_test: usize,
    n_quantiles: usize,
    seed: u64,
) -> Result<SampleSplit<'_>> {
    if n_quantiles == 0 {
        return Err(SamplingError::NoQuantiles.into());
    }

    let mut ranked: Vec<&ActivationExample> = record.activating().iter().collect();
    ranked.sort_by(|a, b| {
        b.max_activation()
            .partial_cmp(&a.max_activation())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let needed = n_train + n_quantiles * n_test;
    if ranked.len() < needed {
        return Err(SamplingError::InsufficientPool {
            needed,
            available: ranked.len(),
        }
        .into());
    }

    let pool = ranked.split_off(n_train);
    let train = ranked;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut test = Vec::with_capacity(n_quantiles);
    for band in quantile_bands(&pool, n_quantiles) {
        let mut picks = rand::seq::index::sample(&mut rng, band.len(), n_test).into_vec();
        picks.sort_unstable();
        test.push(picks.into_iter().map(|i| band[i]).collect());
    }

    Ok(SampleSplit { train, test, seed })
}

/// Equal-count bands by rank; leading bands absorb the remainder
fn quantile_bands<T>(pool: &[T], n_quantiles: usize) -> Vec<&[T]> {
    let base = pool.len() / n_quantiles;
    let extra = pool.len() % n_quantiles;
    let mut bands = Vec::with_capacity(n_quantiles);
    let mut start = 0;
    for i in 0..n_quantiles {
        let size = base + usize::from(i < extra);
        bands.push(&pool[start..start + size]);
        start += size;
    }
    bands
}
