//! Feature identity, activation examples and per-feature records
//!
//! A [`FeatureRecord`] is built once from an activation dump and is
//! read-only afterwards. Samplers and scorers borrow its examples.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dump::{ActivationDump, Detokenizer, RawTrace};
use crate::error::{DataError, Result};

/// Opening marker for a highlighted token span
pub const HIGHLIGHT_OPEN: &str = "<<";
/// Closing marker for a highlighted token span
pub const HIGHLIGHT_CLOSE: &str = ">>";

// ---------------------------------------------------------------------------
// Feature identity
// ---------------------------------------------------------------------------

/// Identifies a single feature by its layer and index within that layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Feature {
    pub layer_index: usize,
    pub feature_index: usize,
}

impl Feature {
    pub fn new(layer_index: usize, feature_index: usize) -> Self {
        Self {
            layer_index,
            feature_index,
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "layer{}_feature{}", self.layer_index, self.feature_index)
    }
}

// ---------------------------------------------------------------------------
// Activation examples
// ---------------------------------------------------------------------------

/// Where an example came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExampleKind {
    /// Drawn from contexts where the feature fired
    Activating,
    /// Non-activating context used as a negative
    Random,
}

/// One input context with per-token activations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationExample {
    tokens: Vec<String>,
    activations: Vec<f32>,
    max_activation: f32,
    kind: ExampleKind,
}

impl ActivationExample {
    /// Build an example; tokens and activations must be the same length.
    pub fn new(tokens: Vec<String>, activations: Vec<f32>, kind: ExampleKind) -> Result<Self> {
        if tokens.len() != activations.len() {
            return Err(DataError::LengthMismatch {
                tokens: tokens.len(),
                activations: activations.len(),
            }
            .into());
        }
        let max_activation = activations.iter().copied().fold(0.0_f32, f32::max);
        Ok(Self {
            tokens,
            activations,
            max_activation,
            kind,
        })
    }

    /// Shorthand for an activating example
    pub fn activating(tokens: Vec<String>, activations: Vec<f32>) -> Result<Self> {
        Self::new(tokens, activations, ExampleKind::Activating)
    }

    /// A non-activating context: every activation is zero
    pub fn random(tokens: Vec<String>) -> Self {
        let activations = vec![0.0; tokens.len()];
        Self {
            tokens,
            activations,
            max_activation: 0.0,
            kind: ExampleKind::Random,
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn activations(&self) -> &[f32] {
        &self.activations
    }

    /// Largest activation in the context (0 for an empty context)
    pub fn max_activation(&self) -> f32 {
        self.max_activation
    }

    pub fn kind(&self) -> ExampleKind {
        self.kind
    }

    pub fn is_activating(&self) -> bool {
        self.kind == ExampleKind::Activating
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Plain text of the context
    pub fn text(&self) -> String {
        self.tokens.concat()
    }

    /// Mask of tokens whose activation is at least `fraction` of the max.
    ///
    /// Nothing is marked when the example never activates.
    pub fn activation_mask(&self, fraction: f32) -> Vec<bool> {
        if self.max_activation <= 0.0 {
            return vec![false; self.tokens.len()];
        }
        let threshold = self.max_activation * fraction;
        self.activations
            .iter()
            .map(|&a| a > 0.0 && a >= threshold)
            .collect()
    }

    /// Text with high-activation tokens wrapped in `<<` `>>`
    pub fn highlighted(&self, fraction: f32) -> String {
        self.render_marked(&self.activation_mask(fraction))
    }

    /// Text with the tokens selected by `mask` wrapped in `<<` `>>`.
    ///
    /// Consecutive marked tokens share one span.
    pub fn render_marked(&self, mask: &[bool]) -> String {
        let mut out = String::new();
        let mut open = false;
        for (i, token) in self.tokens.iter().enumerate() {
            let marked = mask.get(i).copied().unwrap_or(false);
            if marked && !open {
                out.push_str(HIGHLIGHT_OPEN);
                open = true;
            } else if !marked && open {
                out.push_str(HIGHLIGHT_CLOSE);
                open = false;
            }
            out.push_str(token);
        }
        if open {
            out.push_str(HIGHLIGHT_CLOSE);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Selection policy
// ---------------------------------------------------------------------------

/// Which features to build records for, and how many examples to accept
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionPolicy {
    pub layer_index: usize,
    /// Feature indices to build (empty = every feature in the dump)
    pub selected_features: BTreeSet<usize>,
    /// Non-activating contexts to inject as negatives
    pub n_random: usize,
    pub min_examples: usize,
    pub max_examples: usize,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            layer_index: 0,
            selected_features: BTreeSet::new(),
            n_random: 10,
            min_examples: 120,
            max_examples: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// FeatureRecord
// ---------------------------------------------------------------------------

/// Activation evidence for a single feature.
///
/// Activating examples are held sorted by max activation (descending);
/// random negatives follow them in [`FeatureRecord::examples`].
#[derive(Debug, Clone)]
pub struct FeatureRecord {
    feature: Feature,
    activating: Vec<ActivationExample>,
    random: Vec<ActivationExample>,
    min_examples: usize,
    max_examples: usize,
}

impl FeatureRecord {
    /// Build a record from already-decoded examples.
    ///
    /// When more than `max_examples` are supplied the lowest-activating
    /// examples are dropped. Fewer than `min_examples` in total is an
    /// `InsufficientExamples` error.
    pub fn new(
        feature: Feature,
        mut activating: Vec<ActivationExample>,
        mut random: Vec<ActivationExample>,
        min_examples: usize,
        max_examples: usize,
    ) -> Result<Self> {
        random.truncate(max_examples);
        sort_by_max_activation(&mut activating);
        activating.truncate(max_examples - random.len());

        let available = activating.len() + random.len();
        if available < min_examples {
            return Err(DataError::InsufficientExamples {
                feature,
                available,
                required: min_examples,
            }
            .into());
        }

        Ok(Self {
            feature,
            activating,
            random,
            min_examples,
            max_examples,
        })
    }

    /// Build one record per selected feature from a raw activation dump.
    ///
    /// Features are returned in ascending index order. Each entry fails on
    /// its own, so callers can skip features without losing the rest.
    pub fn from_dump(
        dump: &ActivationDump,
        policy: &SelectionPolicy,
        detokenizer: Option<&dyn Detokenizer>,
    ) -> Vec<Result<FeatureRecord>> {
        let by_index: HashMap<usize, _> = dump
            .features
            .iter()
            .map(|f| (f.feature_index, f))
            .collect();

        let selected: BTreeSet<usize> = if policy.selected_features.is_empty() {
            by_index.keys().copied().collect()
        } else {
            policy.selected_features.clone()
        };

        selected
            .into_iter()
            .map(|index| {
                let feature = Feature::new(policy.layer_index, index);
                let Some(raw) = by_index.get(&index) else {
                    return Err(DataError::InsufficientExamples {
                        feature,
                        available: 0,
                        required: policy.min_examples,
                    }
                    .into());
                };

                let activating = raw
                    .activations
                    .iter()
                    .map(|trace| decode_activating(trace, detokenizer))
                    .collect::<Result<Vec<_>>>()?;
                let random = raw
                    .random
                    .iter()
                    .take(policy.n_random)
                    .map(|trace| decode_tokens(trace, detokenizer).map(ActivationExample::random))
                    .collect::<Result<Vec<_>>>()?;

                debug!(
                    %feature,
                    activating = activating.len(),
                    random = random.len(),
                    "building feature record"
                );
                FeatureRecord::new(
                    feature,
                    activating,
                    random,
                    policy.min_examples,
                    policy.max_examples,
                )
            })
            .collect()
    }

    pub fn feature(&self) -> Feature {
        self.feature
    }

    /// Activating examples, highest max activation first
    pub fn activating(&self) -> &[ActivationExample] {
        &self.activating
    }

    /// Non-activating negatives
    pub fn random(&self) -> &[ActivationExample] {
        &self.random
    }

    /// All examples: activating (sorted) then random
    pub fn examples(&self) -> impl Iterator<Item = &ActivationExample> {
        self.activating.iter().chain(self.random.iter())
    }

    /// Total example count
    pub fn len(&self) -> usize {
        self.activating.len() + self.random.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest activation seen for this feature
    pub fn max_activation(&self) -> f32 {
        self.activating
            .first()
            .map_or(0.0, ActivationExample::max_activation)
    }

    /// The bounds this record was accepted under
    pub fn bounds(&self) -> (usize, usize) {
        (self.min_examples, self.max_examples)
    }
}

/// Stable descending sort on max activation
pub(crate) fn sort_by_max_activation(examples: &mut [ActivationExample]) {
    examples.sort_by(|a, b| {
        b.max_activation
            .partial_cmp(&a.max_activation)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn decode_tokens(trace: &RawTrace, detokenizer: Option<&dyn Detokenizer>) -> Result<Vec<String>> {
    trace.tokens.decode(detokenizer)
}

fn decode_activating(
    trace: &RawTrace,
    detokenizer: Option<&dyn Detokenizer>,
) -> Result<ActivationExample> {
    let tokens = decode_tokens(trace, detokenizer)?;
    ActivationExample::activating(tokens, trace.values.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn example(max: f32) -> ActivationExample {
        ActivationExample::activating(
            vec!["a".into(), " b".into(), " c".into()],
            vec![0.0, max, max / 2.0],
        )
        .unwrap()
    }

    fn examples(n: usize) -> Vec<ActivationExample> {
        (0..n).map(|i| example(i as f32 + 1.0)).collect()
    }

    #[test]
    fn test_feature_display() {
        assert_eq!(Feature::new(6, 42).to_string(), "layer6_feature42");
    }

    #[test]
    fn test_example_max_activation() {
        let ex = example(3.0);
        assert_eq!(ex.max_activation(), 3.0);

        let empty = ActivationExample::activating(vec![], vec![]).unwrap();
        assert_eq!(empty.max_activation(), 0.0);
    }

    #[test]
    fn test_example_length_mismatch() {
        let err = ActivationExample::activating(vec!["a".into()], vec![1.0, 2.0]).unwrap_err();
        assert!(matches!(
            err,
            Error::Data(DataError::LengthMismatch {
                tokens: 1,
                activations: 2
            })
        ));
    }

    #[test]
    fn test_highlight_groups_consecutive_tokens() {
        let ex = ActivationExample::activating(
            vec!["The".into(), " big".into(), " dog".into(), " ran".into()],
            vec![0.0, 0.8, 1.0, 0.1],
        )
        .unwrap();
        assert_eq!(ex.highlighted(0.5), "The<< big dog>> ran");
        assert_eq!(ex.text(), "The big dog ran");
    }

    #[test]
    fn test_highlight_trailing_span_is_closed() {
        let ex = ActivationExample::activating(vec!["a".into(), "b".into()], vec![0.0, 1.0]).unwrap();
        assert_eq!(ex.highlighted(0.5), "a<<b>>");
    }

    #[test]
    fn test_random_example_never_highlighted() {
        let ex = ActivationExample::random(vec!["x".into(), "y".into()]);
        assert_eq!(ex.highlighted(0.0), "xy");
        assert!(!ex.is_activating());
    }

    #[test]
    fn test_record_within_bounds() {
        let record = FeatureRecord::new(Feature::new(0, 1), examples(5), vec![], 5, 10).unwrap();
        assert_eq!(record.len(), 5);
        // Sorted descending
        assert_eq!(record.activating()[0].max_activation(), 5.0);
        assert_eq!(record.max_activation(), 5.0);
    }

    #[test]
    fn test_record_below_minimum_rejected() {
        let err = FeatureRecord::new(Feature::new(0, 1), examples(4), vec![], 5, 10).unwrap_err();
        assert!(matches!(
            err,
            Error::Data(DataError::InsufficientExamples {
                available: 4,
                required: 5,
                ..
            })
        ));
    }

    #[test]
    fn test_random_examples_count_toward_minimum() {
        let random = vec![ActivationExample::random(vec!["z".into()])];
        let record = FeatureRecord::new(Feature::new(0, 1), examples(4), random, 5, 10).unwrap();
        assert_eq!(record.len(), 5);
        assert_eq!(record.random().len(), 1);
    }

    #[test]
    fn test_record_truncates_to_highest() {
        let random = vec![ActivationExample::random(vec!["z".into()])];
        let record = FeatureRecord::new(Feature::new(0, 1), examples(20), random, 1, 10).unwrap();
        assert_eq!(record.len(), 10);
        assert_eq!(record.activating().len(), 9);
        // The nine strongest survive: 20..=12
        assert_eq!(record.activating()[8].max_activation(), 12.0);
    }
}
