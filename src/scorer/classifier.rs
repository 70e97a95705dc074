//! Fuzz and detection scoring
//!
//! Both scorers show the model the explanation plus a batch of numbered
//! examples and ask for one 0/1 judgement per example:
//!
//! - Fuzz: examples carry highlighted tokens, some highlighted wrongly.
//!   The model says whether the highlighting matches the explanation.
//! - Detection: examples are unmarked and mixed with random contexts. The
//!   model says which ones the feature would fire on.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::metrics::ClassificationMetrics;
use super::{ScorePayload, ScorerInput, ScorerOptions};
use crate::client::{ChatMessage, CompletionRequest, ModelClient};
use crate::error::{ClientError, Error, Result};
use crate::feature::{ActivationExample, Feature};
use crate::retry::RetryPolicy;

const FUZZ_SYSTEM_PROMPT: &str = "You are checking an explanation of a language-model feature. \
Each example below has some tokens wrapped in << and >>, claimed to be the tokens the feature \
fires on. For every example decide whether the marked tokens are exactly the ones the \
explanation describes. Answer 1 if the marking is correct and 0 if it is not.";

const DETECTION_SYSTEM_PROMPT: &str = "You are checking an explanation of a language-model \
feature. Some of the examples below contain text the feature fires on and some do not. Using \
only the explanation, decide for every example whether the feature would fire anywhere in it. \
Answer 1 if it would and 0 if it would not.";

/// Judgement on one shown example
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierOutcome {
    /// Plain text of the example
    pub text: String,
    /// Quantile band for held-out activating examples, `None` for random ones
    pub quantile: Option<usize>,
    pub ground_truth: bool,
    pub prediction: bool,
    /// Whether tokens were marked in the prompt
    pub highlighted: bool,
}

/// An example as it will appear in a prompt
#[derive(Debug, Clone)]
struct Item {
    shown: String,
    text: String,
    quantile: Option<usize>,
    ground_truth: bool,
    highlighted: bool,
}

// ---------------------------------------------------------------------------
// Fuzz
// ---------------------------------------------------------------------------

/// Tests whether the explanation identifies *which* tokens fire
#[derive(Debug, Clone)]
pub struct FuzzScorer {
    options: ScorerOptions,
    retry: RetryPolicy,
}

impl FuzzScorer {
    pub fn new(options: ScorerOptions, retry: RetryPolicy) -> Self {
        Self { options, retry }
    }

    pub async fn score<C: ModelClient>(
        &self,
        client: &C,
        input: &ScorerInput<'_>,
    ) -> Result<ScorePayload> {
        let feature = input.explanation.feature;
        let mut rng = StdRng::seed_from_u64(feature_seed(self.options.seed, feature));
        let p_incorrect = self.options.incorrect_fraction.clamp(0.0, 1.0);

        let mut items = Vec::with_capacity(input.test.len() + input.record.random().len());
        for sampled in &input.test {
            let example = sampled.example;
            let correct = example.activation_mask(self.options.highlight_fraction);
            let (mask, ground_truth) = if rng.gen_bool(p_incorrect) {
                match misplaced_mask(&correct, &mut rng) {
                    Some(wrong) => (wrong, false),
                    None => (correct, true),
                }
            } else {
                (correct, true)
            };
            items.push(Item {
                shown: example.render_marked(&mask),
                text: example.text(),
                quantile: Some(sampled.quantile),
                ground_truth,
                highlighted: true,
            });
        }
        for example in input.record.random() {
            items.push(Item {
                shown: example.render_marked(&random_mask(example, &mut rng)),
                text: example.text(),
                quantile: None,
                ground_truth: false,
                highlighted: true,
            });
        }

        let outcomes = classify(
            client,
            &self.retry,
            &self.options,
            FUZZ_SYSTEM_PROMPT,
            "1 if the marked tokens are correct, 0 otherwise",
            input,
            items,
        )
        .await?;
        let metrics = ClassificationMetrics::from_outcomes(&outcomes);
        Ok(ScorePayload::Fuzz { outcomes, metrics })
    }
}

/// Same number of marked tokens, none of them in the right place.
///
/// `None` when every token is already marked.
fn misplaced_mask(correct: &[bool], rng: &mut StdRng) -> Option<Vec<bool>> {
    let k = correct.iter().filter(|&&m| m).count().max(1);
    let candidates: Vec<usize> = (0..correct.len()).filter(|&i| !correct[i]).collect();
    if candidates.is_empty() {
        return None;
    }
    let mut mask = vec![false; correct.len()];
    for &i in candidates.choose_multiple(rng, k.min(candidates.len())) {
        mask[i] = true;
    }
    Some(mask)
}

/// Mark one to three random tokens
fn random_mask(example: &ActivationExample, rng: &mut StdRng) -> Vec<bool> {
    let mut mask = vec![false; example.len()];
    if example.is_empty() {
        return mask;
    }
    let k = rng.gen_range(1..=example.len().min(3));
    for i in rand::seq::index::sample(rng, example.len(), k) {
        mask[i] = true;
    }
    mask
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Tests whether the explanation lets a judge find activating contexts
#[derive(Debug, Clone)]
pub struct DetectionScorer {
    options: ScorerOptions,
    retry: RetryPolicy,
}

impl DetectionScorer {
    pub fn new(options: ScorerOptions, retry: RetryPolicy) -> Self {
        Self { options, retry }
    }

    pub async fn score<C: ModelClient>(
        &self,
        client: &C,
        input: &ScorerInput<'_>,
    ) -> Result<ScorePayload> {
        let activating = input.test.iter().map(|sampled| Item {
            shown: sampled.example.text(),
            text: sampled.example.text(),
            quantile: Some(sampled.quantile),
            ground_truth: true,
            highlighted: false,
        });
        let decoys = input.record.random().iter().map(|example| Item {
            shown: example.text(),
            text: example.text(),
            quantile: None,
            ground_truth: false,
            highlighted: false,
        });
        let items: Vec<Item> = activating.chain(decoys).collect();

        let outcomes = classify(
            client,
            &self.retry,
            &self.options,
            DETECTION_SYSTEM_PROMPT,
            "1 if the feature would fire, 0 otherwise",
            input,
            items,
        )
        .await?;
        let metrics = ClassificationMetrics::from_outcomes(&outcomes);
        Ok(ScorePayload::Detection { outcomes, metrics })
    }
}

// ---------------------------------------------------------------------------
// Shared batching
// ---------------------------------------------------------------------------

/// Per-feature seed so features get different shuffles under one config
fn feature_seed(seed: u64, feature: Feature) -> u64 {
    seed ^ (((feature.layer_index as u64) << 32) | feature.feature_index as u64)
}

fn batch_prompt(explanation: &str, batch: &[Item], answer: &str) -> String {
    let mut prompt = format!("Explanation: {explanation}\n\n");
    for (i, item) in batch.iter().enumerate() {
        prompt.push_str(&format!("Example {}: {}\n", i + 1, item.shown));
    }
    prompt.push_str(&format!(
        "\nAnswer with a JSON list of {} integers, one per example in order: {answer}.",
        batch.len()
    ));
    prompt
}

/// Shuffle, batch and judge every item; outcomes come back in shuffled order.
async fn classify<C: ModelClient>(
    client: &C,
    retry: &RetryPolicy,
    options: &ScorerOptions,
    system_prompt: &str,
    answer: &str,
    input: &ScorerInput<'_>,
    mut items: Vec<Item>,
) -> Result<Vec<ClassifierOutcome>> {
    let feature = input.explanation.feature;
    let mut rng = StdRng::seed_from_u64(feature_seed(options.seed, feature).wrapping_add(1));
    items.shuffle(&mut rng);

    let mut outcomes = Vec::with_capacity(items.len());
    for batch in items.chunks(options.batch_size.max(1)) {
        let request = CompletionRequest::new(
            vec![
                ChatMessage::system(system_prompt),
                ChatMessage::user(batch_prompt(&input.explanation.text, batch, answer)),
            ],
            options.generation,
        );
        let request = &request;
        let n = batch.len();
        let labels = retry
            .run("classify", move || async move {
                let completion = client.complete(request).await?;
                parse_labels(&completion.text, n)
            })
            .await?;
        debug!(%feature, n, "batch classified");

        outcomes.extend(batch.iter().zip(labels).map(|(item, prediction)| ClassifierOutcome {
            text: item.text.clone(),
            quantile: item.quantile,
            ground_truth: item.ground_truth,
            prediction,
            highlighted: item.highlighted,
        }));
    }
    Ok(outcomes)
}

/// Parse a JSON list of `n` 0/1 labels from anywhere in the reply
pub(crate) fn parse_labels(reply: &str, n: usize) -> Result<Vec<bool>> {
    let values = extract_json_list(reply)?;
    if values.len() != n {
        return Err(malformed(format!("expected {n} labels, got {}", values.len())));
    }
    values
        .iter()
        .map(|v| match v {
            serde_json::Value::Bool(b) => Ok(*b),
            serde_json::Value::Number(num) => num
                .as_f64()
                .map(|x| x >= 0.5)
                .ok_or_else(|| malformed(format!("bad label {num}"))),
            other => Err(malformed(format!("bad label {other}"))),
        })
        .collect()
}

/// The first `[` ... last `]` span of a reply, parsed as JSON
pub(crate) fn extract_json_list(reply: &str) -> Result<Vec<serde_json::Value>> {
    let start = reply.find('[');
    let end = reply.rfind(']');
    match (start, end) {
        (Some(s), Some(e)) if s < e => serde_json::from_str(&reply[s..=e])
            .map_err(|err| malformed(format!("invalid JSON list: {err}"))),
        _ => Err(malformed("no JSON list in reply".to_string())),
    }
}

fn malformed(message: String) -> Error {
    ClientError::MalformedResponse(message).into()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::explainer::Explanation;
    use crate::feature::FeatureRecord;
    use crate::sampler::SamplingConfig;
    use crate::testing::ScriptedClient;

    fn words(text: &str) -> Vec<String> {
        text.split_inclusive(' ').map(str::to_string).collect()
    }

    fn dog_record() -> FeatureRecord {
        let activating = (0..6)
            .map(|i| {
                let tokens = words("my dog ran home");
                ActivationExample::activating(tokens, vec![0.0, 1.0 + i as f32, 0.0, 0.0]).unwrap()
            })
            .collect();
        let random = vec![
            ActivationExample::random(words("the cat sat down")),
            ActivationExample::random(words("stocks fell today")),
        ];
        FeatureRecord::new(Feature::new(0, 5), activating, random, 1, 100).unwrap()
    }

    fn options(batch_size: usize) -> ScorerOptions {
        ScorerOptions {
            batch_size,
            ..ScorerOptions::default()
        }
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2,
            max_attempts: 2,
        }
    }

    /// Says 1 for every example line that mentions a dog
    fn dog_oracle() -> ScriptedClient {
        ScriptedClient::new(|request| {
            let labels: Vec<u8> = request
                .prompt()
                .lines()
                .filter(|l| l.starts_with("Example "))
                .map(|l| u8::from(l.contains("dog")))
                .collect();
            Ok(format!("Sure: {labels:?}"))
        })
    }

    #[test]
    fn test_parse_labels() {
        assert_eq!(parse_labels("[1, 0, 1]", 3).unwrap(), vec![true, false, true]);
        assert_eq!(
            parse_labels("answer: [true, false] done", 2).unwrap(),
            vec![true, false]
        );
        assert!(parse_labels("[1, 0]", 3).unwrap_err().is_transient());
        assert!(parse_labels("no list here", 1).is_err());
        assert!(parse_labels("[\"yes\"]", 1).is_err());
    }

    #[test]
    fn test_misplaced_mask_avoids_correct_tokens() {
        let mut rng = StdRng::seed_from_u64(3);
        let correct = vec![false, true, true, false, false];
        let wrong = misplaced_mask(&correct, &mut rng).unwrap();
        assert_eq!(wrong.iter().filter(|&&m| m).count(), 2);
        assert!(!wrong[1] && !wrong[2]);

        assert!(misplaced_mask(&[true, true], &mut rng).is_none());
    }

    #[tokio::test]
    async fn test_detection_with_oracle() {
        let record = dog_record();
        let split = SamplingConfig {
            n_train: 0,
            n_test: 2,
            n_quantiles: 2,
            seed: 1,
        }
        .sample(&record)
        .unwrap();
        let explanation = Explanation::new(record.feature(), "the word dog");
        let input = ScorerInput {
            record: &record,
            test: split.test_flat(),
            explanation: &explanation,
        };

        let client = dog_oracle();
        let payload = DetectionScorer::new(options(3), retry())
            .score(&client, &input)
            .await
            .unwrap();

        let ScorePayload::Detection { outcomes, metrics } = payload else {
            panic!("expected detection payload");
        };
        // 4 held-out + 2 decoys in batches of 3
        assert_eq!(outcomes.len(), 6);
        assert_eq!(client.calls(), 2);
        assert_eq!(metrics.accuracy, 1.0);
        assert_eq!(outcomes.iter().filter(|o| o.quantile.is_none()).count(), 2);
        assert!(outcomes.iter().all(|o| !o.highlighted));
    }

    #[tokio::test]
    async fn test_fuzz_marks_and_labels() {
        let record = dog_record();
        let split = SamplingConfig {
            n_train: 2,
            n_test: 2,
            n_quantiles: 2,
            seed: 9,
        }
        .sample(&record)
        .unwrap();
        let explanation = Explanation::new(record.feature(), "the word dog");
        let input = ScorerInput {
            record: &record,
            test: split.test_flat(),
            explanation: &explanation,
        };

        // Correct iff the dog token is the marked one
        let client = ScriptedClient::new(|request| {
            let labels: Vec<u8> = request
                .prompt()
                .lines()
                .filter(|l| l.starts_with("Example "))
                .map(|l| u8::from(l.contains("<<dog >>")))
                .collect();
            Ok(format!("{labels:?}"))
        });
        let payload = FuzzScorer::new(options(10), retry())
            .score(&client, &input)
            .await
            .unwrap();

        let ScorePayload::Fuzz { outcomes, metrics } = payload else {
            panic!("expected fuzz payload");
        };
        assert_eq!(outcomes.len(), 6);
        assert_eq!(client.calls(), 1);
        assert!(outcomes.iter().all(|o| o.highlighted));
        assert_eq!(metrics.accuracy, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_propagates() {
        let record = dog_record();
        let config = SamplingConfig {
            n_test: 1,
            n_quantiles: 1,
            ..SamplingConfig::default().test_only()
        };
        let split = config.sample(&record).unwrap();
        let explanation = Explanation::new(record.feature(), "dogs");
        let input = ScorerInput {
            record: &record,
            test: split.test_flat(),
            explanation: &explanation,
        };
        let client = ScriptedClient::always_permanent();
        let err = DetectionScorer::new(options(5), retry())
            .score(&client, &input)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Client(ClientError::Permanent(_))));
    }
}
