//! Explanation scorers
//!
//! Every scorer takes held-out examples plus an explanation and returns a
//! [`ScorePayload`]. The payload shape differs per scorer, so it is a
//! tagged union; [`ScorePayload::headline`] gives one comparable number.
//!
//! | Scorer     | Model calls           | Measures                                  |
//! |------------|-----------------------|-------------------------------------------|
//! | Embedding  | none (local embedder) | similarity of examples to the explanation |
//! | Fuzz       | one per batch         | does it pick out *which* tokens fire      |
//! | Detection  | one per batch         | does it find activating contexts          |
//! | Simulation | one per example       | token-level activation prediction         |

mod classifier;
mod embedding;
mod metrics;
mod simulation;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::{GenerationOptions, ModelClient};
use crate::embedding::Embedder;
use crate::error::Result;
use crate::explainer::Explanation;
use crate::feature::{Feature, FeatureRecord};
use crate::retry::RetryPolicy;
use crate::sampler::Sampled;

pub use classifier::{ClassifierOutcome, DetectionScorer, FuzzScorer};
pub use embedding::{EmbeddedExample, EmbeddingScorer};
pub use metrics::ClassificationMetrics;
pub use simulation::{pearson, SimulatedExample, SimulationScorer};

// ---------------------------------------------------------------------------
// Scorer kinds and options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    Embedding,
    Fuzz,
    Detection,
    Simulation,
}

impl ScorerKind {
    pub const ALL: [ScorerKind; 4] = [
        ScorerKind::Embedding,
        ScorerKind::Fuzz,
        ScorerKind::Detection,
        ScorerKind::Simulation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScorerKind::Embedding => "embedding",
            ScorerKind::Fuzz => "fuzz",
            ScorerKind::Detection => "detection",
            ScorerKind::Simulation => "simulation",
        }
    }
}

impl std::fmt::Display for ScorerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScorerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ScorerKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown scorer '{s}' (expected embedding, fuzz, detection or simulation)"))
    }
}

/// Knobs shared by the LLM-backed scorers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerOptions {
    /// Examples per classification prompt
    pub batch_size: usize,
    /// Tokens at or above this fraction of an example's max count as firing
    pub highlight_fraction: f32,
    /// Share of fuzz examples shown with wrong highlights
    pub incorrect_fraction: f64,
    /// Seeds shuffling and fuzzing
    pub seed: u64,
    pub generation: GenerationOptions,
}

impl Default for ScorerOptions {
    fn default() -> Self {
        Self {
            batch_size: 5,
            highlight_fraction: 0.5,
            incorrect_fraction: 0.5,
            seed: 22,
            generation: GenerationOptions {
                temperature: 0.0,
                max_tokens: 500,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// Everything a scorer looks at for one feature
#[derive(Debug, Clone)]
pub struct ScorerInput<'a> {
    pub record: &'a FeatureRecord,
    /// Held-out activating examples, tagged with their quantile band
    pub test: Vec<Sampled<'a>>,
    pub explanation: &'a Explanation,
}

/// Scorer-specific result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScorePayload {
    Embedding {
        examples: Vec<EmbeddedExample>,
        mean_activating: f64,
        mean_random: Option<f64>,
        /// Chance an activating example outranks a random one
        auroc: Option<f64>,
    },
    Fuzz {
        outcomes: Vec<ClassifierOutcome>,
        metrics: ClassificationMetrics,
    },
    Detection {
        outcomes: Vec<ClassifierOutcome>,
        metrics: ClassificationMetrics,
    },
    Simulation {
        examples: Vec<SimulatedExample>,
        /// Correlation over every simulated token
        ev_correlation: Option<f64>,
    },
}

impl ScorePayload {
    pub fn kind(&self) -> ScorerKind {
        match self {
            ScorePayload::Embedding { .. } => ScorerKind::Embedding,
            ScorePayload::Fuzz { .. } => ScorerKind::Fuzz,
            ScorePayload::Detection { .. } => ScorerKind::Detection,
            ScorePayload::Simulation { .. } => ScorerKind::Simulation,
        }
    }

    /// One number per scorer so results can be compared across features
    pub fn headline(&self) -> Option<f64> {
        match self {
            ScorePayload::Embedding {
                auroc,
                mean_activating,
                ..
            } => auroc.or(Some(*mean_activating)),
            ScorePayload::Fuzz { metrics, .. } | ScorePayload::Detection { metrics, .. } => {
                Some(metrics.accuracy)
            }
            ScorePayload::Simulation { ev_correlation, .. } => *ev_correlation,
        }
    }

    /// Number of examples scored
    pub fn n_examples(&self) -> usize {
        match self {
            ScorePayload::Embedding { examples, .. } => examples.len(),
            ScorePayload::Fuzz { outcomes, .. } | ScorePayload::Detection { outcomes, .. } => {
                outcomes.len()
            }
            ScorePayload::Simulation { examples, .. } => examples.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreMetadata {
    /// Model (or embedder) that produced the score
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub n_examples: usize,
}

/// Persisted result for one (feature, scorer) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreResult {
    pub feature: Feature,
    pub scorer: ScorerKind,
    pub explanation: String,
    pub score: Option<f64>,
    pub payload: ScorePayload,
    pub metadata: ScoreMetadata,
}

impl ScoreResult {
    /// Result for `feature`, the record that was scored. The explanation
    /// only contributes its text.
    pub fn new(
        feature: Feature,
        explanation: &Explanation,
        payload: ScorePayload,
        model: impl Into<String>,
    ) -> Self {
        Self {
            feature,
            scorer: payload.kind(),
            explanation: explanation.text.clone(),
            score: payload.headline(),
            metadata: ScoreMetadata {
                model: model.into(),
                created_at: Utc::now(),
                n_examples: payload.n_examples(),
            },
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Scorer
// ---------------------------------------------------------------------------

/// One of the four scoring protocols
pub enum Scorer {
    Embedding(EmbeddingScorer),
    Fuzz(FuzzScorer),
    Detection(DetectionScorer),
    Simulation(SimulationScorer),
}

impl Scorer {
    /// Build a scorer of the given kind. The embedder is only used by
    /// [`ScorerKind::Embedding`].
    pub fn build(
        kind: ScorerKind,
        options: ScorerOptions,
        retry: RetryPolicy,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        match kind {
            ScorerKind::Embedding => Scorer::Embedding(EmbeddingScorer::new(embedder)),
            ScorerKind::Fuzz => Scorer::Fuzz(FuzzScorer::new(options, retry)),
            ScorerKind::Detection => Scorer::Detection(DetectionScorer::new(options, retry)),
            ScorerKind::Simulation => Scorer::Simulation(SimulationScorer::new(options, retry)),
        }
    }

    pub fn kind(&self) -> ScorerKind {
        match self {
            Scorer::Embedding(_) => ScorerKind::Embedding,
            Scorer::Fuzz(_) => ScorerKind::Fuzz,
            Scorer::Detection(_) => ScorerKind::Detection,
            Scorer::Simulation(_) => ScorerKind::Simulation,
        }
    }

    /// Model name to record for results of this scorer
    pub fn model_name<'a, C: ModelClient>(&'a self, client: &'a C) -> &'a str {
        match self {
            Scorer::Embedding(s) => s.embedder_name(),
            _ => client.model_id(),
        }
    }

    pub async fn score<C: ModelClient>(
        &self,
        client: &C,
        input: &ScorerInput<'_>,
    ) -> Result<ScorePayload> {
        match self {
            Scorer::Embedding(s) => s.score(input),
            Scorer::Fuzz(s) => s.score(client, input).await,
            Scorer::Detection(s) => s.score(client, input).await,
            Scorer::Simulation(s) => s.score(client, input).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip_through_str() {
        for kind in ScorerKind::ALL {
            assert_eq!(kind.as_str().parse::<ScorerKind>().unwrap(), kind);
        }
        assert_eq!("FUZZ".parse::<ScorerKind>().unwrap(), ScorerKind::Fuzz);
        assert!("recall".parse::<ScorerKind>().is_err());
    }

    #[test]
    fn test_payload_is_tagged() {
        let payload = ScorePayload::Simulation {
            examples: vec![],
            ev_correlation: Some(0.5),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "simulation");
        assert_eq!(payload.headline(), Some(0.5));
    }

    #[test]
    fn test_score_result_keyed_by_scored_feature() {
        let explanation = Explanation::new(Feature::new(3, 1), "dogs");
        let payload = ScorePayload::Embedding {
            examples: vec![],
            mean_activating: 0.25,
            mean_random: None,
            auroc: None,
        };
        let result = ScoreResult::new(Feature::new(3, 9), &explanation, payload, "hashing");
        assert_eq!(result.feature, Feature::new(3, 9));
        assert_eq!(result.scorer, ScorerKind::Embedding);
        assert_eq!(result.score, Some(0.25));
        assert_eq!(result.metadata.model, "hashing");
    }
}
