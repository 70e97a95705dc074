//! Simulation scoring
//!
//! The model reads the explanation and predicts, token by token, how
//! strongly the feature fires (0-10). Predictions are compared to the true
//! activations, normalized to the same 0-10 scale by the feature's max.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::classifier::extract_json_list;
use super::{ScorePayload, ScorerInput, ScorerOptions};
use crate::client::{ChatMessage, CompletionRequest, ModelClient};
use crate::error::{ClientError, Error, Result};
use crate::feature::ActivationExample;
use crate::retry::RetryPolicy;

/// Top of the prediction scale
pub const MAX_SIMULATED: f32 = 10.0;

const SYSTEM_PROMPT: &str = "You simulate a single feature of a language model. Given an \
explanation of what the feature detects and a sequence of tokens, predict how strongly the \
feature fires on each token, as an integer from 0 (not at all) to 10 (as strongly as it ever \
does). Most tokens should be 0.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedExample {
    pub text: String,
    pub quantile: Option<usize>,
    pub activating: bool,
    pub predicted: Vec<f32>,
    /// True activations scaled to 0-10
    pub actual: Vec<f32>,
    /// `None` when either side is constant
    pub correlation: Option<f64>,
}

/// Token-level prediction of activations from the explanation
#[derive(Debug, Clone)]
pub struct SimulationScorer {
    options: ScorerOptions,
    retry: RetryPolicy,
}

impl SimulationScorer {
    pub fn new(options: ScorerOptions, retry: RetryPolicy) -> Self {
        Self { options, retry }
    }

    pub async fn score<C: ModelClient>(
        &self,
        client: &C,
        input: &ScorerInput<'_>,
    ) -> Result<ScorePayload> {
        let max_activation = input.record.max_activation();
        let targets = input
            .test
            .iter()
            .map(|s| (s.example, Some(s.quantile)))
            .chain(input.record.random().iter().map(|e| (e, None)));

        let mut examples = Vec::new();
        for (example, quantile) in targets {
            let predicted = self.simulate(client, &input.explanation.text, example).await?;
            let actual = scale_activations(example.activations(), max_activation);
            let correlation = pearson(&predicted, &actual);
            examples.push(SimulatedExample {
                text: example.text(),
                quantile,
                activating: example.is_activating(),
                predicted,
                actual,
                correlation,
            });
        }

        let all_predicted: Vec<f32> = examples.iter().flat_map(|e| e.predicted.clone()).collect();
        let all_actual: Vec<f32> = examples.iter().flat_map(|e| e.actual.clone()).collect();
        let ev_correlation = pearson(&all_predicted, &all_actual);
        debug!(
            feature = %input.explanation.feature,
            n = examples.len(),
            ?ev_correlation,
            "simulation finished"
        );

        Ok(ScorePayload::Simulation {
            examples,
            ev_correlation,
        })
    }

    /// Ask for one prediction per token of `example`
    async fn simulate<C: ModelClient>(
        &self,
        client: &C,
        explanation: &str,
        example: &ActivationExample,
    ) -> Result<Vec<f32>> {
        if example.is_empty() {
            return Ok(Vec::new());
        }
        let tokens = serde_json::to_string(example.tokens())?;
        let n = example.len();
        let prompt = format!(
            "Explanation: {explanation}\n\nTokens (JSON): {tokens}\n\n\
             Answer with a JSON list of {n} integers, one per token in order."
        );
        let request = CompletionRequest::new(
            vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)],
            self.options.generation,
        );
        let request = &request;
        self.retry
            .run("simulate", move || async move {
                let completion = client.complete(request).await?;
                parse_predictions(&completion.text, n)
            })
            .await
    }
}

fn parse_predictions(reply: &str, n: usize) -> Result<Vec<f32>> {
    let values = extract_json_list(reply)?;
    if values.len() != n {
        return Err(Error::from(ClientError::MalformedResponse(format!(
            "expected {n} predictions, got {}",
            values.len()
        ))));
    }
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|x| (x as f32).clamp(0.0, MAX_SIMULATED))
                .ok_or_else(|| {
                    Error::from(ClientError::MalformedResponse(format!("bad prediction {v}")))
                })
        })
        .collect()
}

fn scale_activations(activations: &[f32], max_activation: f32) -> Vec<f32> {
    if max_activation <= 0.0 {
        return vec![0.0; activations.len()];
    }
    activations
        .iter()
        .map(|&a| (a / max_activation * MAX_SIMULATED).clamp(0.0, MAX_SIMULATED))
        .collect()
}

/// Pearson correlation; `None` for fewer than two points or zero variance
pub fn pearson(x: &[f32], y: &[f32]) -> Option<f64> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let mean_x = x[..n].iter().map(|&v| f64::from(v)).sum::<f64>() / n as f64;
    let mean_y = y[..n].iter().map(|&v| f64::from(v)).sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (&a, &b) in x[..n].iter().zip(&y[..n]) {
        let dx = f64::from(a) - mean_x;
        let dy = f64::from(b) - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x < 1e-12 || var_y < 1e-12 {
        return None;
    }
    Some(cov / (var_x.sqrt() * var_y.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explainer::Explanation;
    use crate::feature::{Feature, FeatureRecord};
    use crate::sampler::SamplingConfig;
    use crate::testing::ScriptedClient;

    #[test]
    fn test_pearson() {
        assert!((pearson(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]).unwrap() - 1.0).abs() < 1e-9);
        assert!((pearson(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]).unwrap() + 1.0).abs() < 1e-9);
        assert!(pearson(&[1.0, 1.0], &[1.0, 2.0]).is_none());
        assert!(pearson(&[1.0], &[1.0]).is_none());
    }

    #[test]
    fn test_parse_predictions_clamps() {
        assert_eq!(parse_predictions("[0, 12, -3, 5]", 4).unwrap(), vec![0.0, 10.0, 0.0, 5.0]);
        assert!(parse_predictions("[1, 2]", 3).unwrap_err().is_transient());
    }

    #[test]
    fn test_scale_activations() {
        assert_eq!(scale_activations(&[0.0, 1.0, 2.0], 2.0), vec![0.0, 5.0, 10.0]);
        assert_eq!(scale_activations(&[1.0], 0.0), vec![0.0]);
    }

    #[tokio::test]
    async fn test_simulation_with_oracle() {
        let activating = (0..4)
            .map(|i| {
                ActivationExample::activating(
                    vec!["a ".into(), "dog ".into(), "ran".into()],
                    vec![0.0, 1.0 + i as f32, 0.0],
                )
                .unwrap()
            })
            .collect();
        let random = vec![ActivationExample::random(vec!["no ".into(), "cats".into()])];
        let record = FeatureRecord::new(Feature::new(1, 1), activating, random, 1, 10).unwrap();
        let split = SamplingConfig {
            n_train: 0,
            n_test: 1,
            n_quantiles: 2,
            seed: 4,
        }
        .sample(&record)
        .unwrap();
        let explanation = Explanation::new(record.feature(), "the word dog");
        let input = ScorerInput {
            record: &record,
            test: split.test_flat(),
            explanation: &explanation,
        };

        let client = ScriptedClient::new(|request| {
            let line = request
                .prompt()
                .lines()
                .find_map(|l| l.strip_prefix("Tokens (JSON): "))
                .unwrap_or("[]");
            let tokens: Vec<String> = serde_json::from_str(line).unwrap();
            let predictions: Vec<u8> = tokens
                .iter()
                .map(|t| if t.contains("dog") { 10 } else { 0 })
                .collect();
            Ok(format!("{predictions:?}"))
        });

        let payload = SimulationScorer::new(ScorerOptions::default(), RetryPolicy::default())
            .score(&client, &input)
            .await
            .unwrap();
        let ScorePayload::Simulation {
            examples,
            ev_correlation,
        } = payload
        else {
            panic!("expected simulation payload");
        };

        assert_eq!(examples.len(), 3);
        assert_eq!(client.calls(), 3);
        assert!(examples[0].correlation.unwrap() > 0.99);
        assert!(examples[1].correlation.unwrap() > 0.99);
        // Random context never fires: constant actuals
        assert!(examples[2].correlation.is_none());
        assert!(!examples[2].activating);
        // Pooled tokens mix two activation strengths against one prediction
        assert!(ev_correlation.unwrap() > 0.8);
    }
}
