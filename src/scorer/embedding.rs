//! Embedding scoring
//!
//! No model calls: the explanation and every example are embedded with a
//! local [`Embedder`] and ranked by cosine similarity. A good explanation
//! sits closer to activating contexts than to random ones.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ScorePayload, ScorerInput};
use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedExample {
    pub text: String,
    pub quantile: Option<usize>,
    pub activating: bool,
    /// Cosine similarity to the explanation
    pub similarity: f64,
}

pub struct EmbeddingScorer {
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingScorer {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    pub fn embedder_name(&self) -> &str {
        self.embedder.name()
    }

    pub fn score(&self, input: &ScorerInput<'_>) -> Result<ScorePayload> {
        let mut examples: Vec<EmbeddedExample> = input
            .test
            .iter()
            .map(|s| EmbeddedExample {
                text: s.example.text(),
                quantile: Some(s.quantile),
                activating: s.example.is_activating(),
                similarity: 0.0,
            })
            .chain(input.record.random().iter().map(|e| EmbeddedExample {
                text: e.text(),
                quantile: None,
                activating: false,
                similarity: 0.0,
            }))
            .collect();

        let mut texts = Vec::with_capacity(examples.len() + 1);
        texts.push(input.explanation.text.clone());
        texts.extend(examples.iter().map(|e| e.text.clone()));

        let vectors = self.embedder.embed(&texts)?;
        let Some((query, rest)) = vectors.split_first() else {
            return Err(Error::Embedding("embedder returned no vectors".into()));
        };
        if rest.len() != examples.len() {
            return Err(Error::Embedding(format!(
                "expected {} embeddings, got {}",
                examples.len(),
                rest.len()
            )));
        }
        for (example, vector) in examples.iter_mut().zip(rest) {
            example.similarity = f64::from(cosine_similarity(query, vector));
        }

        let positives: Vec<f64> = examples
            .iter()
            .filter(|e| e.activating)
            .map(|e| e.similarity)
            .collect();
        let negatives: Vec<f64> = examples
            .iter()
            .filter(|e| !e.activating)
            .map(|e| e.similarity)
            .collect();

        let mean_activating = mean(&positives).unwrap_or(0.0);
        let mean_random = mean(&negatives);
        let auroc = auroc(&positives, &negatives);
        debug!(
            feature = %input.explanation.feature,
            mean_activating,
            ?auroc,
            "embedding scoring finished"
        );

        Ok(ScorePayload::Embedding {
            examples,
            mean_activating,
            mean_random,
            auroc,
        })
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Probability a positive outranks a negative; ties count half
fn auroc(positives: &[f64], negatives: &[f64]) -> Option<f64> {
    if positives.is_empty() || negatives.is_empty() {
        return None;
    }
    let mut wins = 0.0;
    for &p in positives {
        for &n in negatives {
            if p > n {
                wins += 1.0;
            } else if p == n {
                wins += 0.5;
            }
        }
    }
    Some(wins / (positives.len() * negatives.len()) as f64)
}
