//! Confusion-matrix metrics for the classification scorers

use serde::{Deserialize, Serialize};

use super::classifier::ClassifierOutcome;

/// Classification results over one feature's examples
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    /// Fraction of examples the model judged correctly
    pub accuracy: f64,
    /// Number of correct predictions
    pub correct: usize,
    /// Total number of judged examples
    pub total: usize,
    pub true_positives: usize,
    pub true_negatives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

impl ClassificationMetrics {
    /// Tally predictions against ground truth
    pub fn from_outcomes(outcomes: &[ClassifierOutcome]) -> Self {
        let mut tp = 0;
        let mut tn = 0;
        let mut fp = 0;
        let mut r#fn = 0;

        for outcome in outcomes {
            match (outcome.prediction, outcome.ground_truth) {
                (true, true) => tp += 1,
                (false, false) => tn += 1,
                (true, false) => fp += 1,
                (false, true) => r#fn += 1,
            }
        }

        let correct = tp + tn;
        let total = outcomes.len();
        let accuracy = if total == 0 {
            0.0
        } else {
            correct as f64 / total as f64
        };

        Self {
            accuracy,
            correct,
            total,
            true_positives: tp,
            true_negatives: tn,
            false_positives: fp,
            false_negatives: r#fn,
        }
    }

    /// Compute precision (activating = positive class)
    pub fn precision(&self) -> f64 {
        let denom = self.true_positives + self.false_positives;
        if denom == 0 {
            0.0
        } else {
            self.true_positives as f64 / denom as f64
        }
    }

    /// Compute recall (activating = positive class)
    pub fn recall(&self) -> f64 {
        let denom = self.true_positives + self.false_negatives;
        if denom == 0 {
            0.0
        } else {
            self.true_positives as f64 / denom as f64
        }
    }

    /// Compute F1 score
    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}
