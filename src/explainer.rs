//! Explanation generation from top-activating examples
//!
//! Each training example is rendered with its strongest tokens wrapped in
//! `<<` `>>` and the model is asked for the pattern they share.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::client::{ChatMessage, CompletionRequest, GenerationOptions, ModelClient};
use crate::error::{ClientError, Error, GenerationError, Result};
use crate::feature::{ActivationExample, Feature};
use crate::retry::RetryPolicy;

/// Marker the model must put before its final answer
pub const EXPLANATION_MARKER: &str = "[EXPLANATION]:";

const SYSTEM_PROMPT: &str = "You are studying a single feature inside a language model. \
You will see text excerpts where the feature fires. Tokens where it fires strongly are \
wrapped in << and >>. Work out what the marked tokens and their context have in common. \
Describe what the feature detects in one short sentence; do not summarize the individual \
excerpts. You may reason briefly first, but end your reply with a single line of the form\n\
[EXPLANATION]: <your explanation>";

/// A natural-language hypothesis about what a feature detects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Explanation {
    pub feature: Feature,
    pub text: String,
}

impl Explanation {
    pub fn new(feature: Feature, text: impl Into<String>) -> Self {
        Self {
            feature,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplainerOptions {
    /// Tokens at or above this fraction of an example's max are highlighted
    pub highlight_fraction: f32,
    pub generation: GenerationOptions,
}

impl Default for ExplainerOptions {
    fn default() -> Self {
        Self {
            highlight_fraction: 0.5,
            generation: GenerationOptions {
                temperature: 0.0,
                max_tokens: 500,
            },
        }
    }
}

/// Turns training examples into an [`Explanation`]
#[derive(Debug, Clone, Default)]
pub struct ExplanationGenerator {
    options: ExplainerOptions,
    retry: RetryPolicy,
}

impl ExplanationGenerator {
    pub fn new(options: ExplainerOptions, retry: RetryPolicy) -> Self {
        Self { options, retry }
    }

    pub fn options(&self) -> &ExplainerOptions {
        &self.options
    }

    /// Build the chat prompt for a set of training examples
    pub fn build_prompt(&self, train: &[&ActivationExample]) -> Vec<ChatMessage> {
        let mut body = String::new();
        for (i, example) in train.iter().enumerate() {
            body.push_str(&format!(
                "Example {}: {}\n",
                i + 1,
                example.highlighted(self.options.highlight_fraction)
            ));
        }
        vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(body)]
    }

    /// Ask the model for an explanation of `feature`.
    ///
    /// Transient failures and unparseable replies are retried under the
    /// configured policy; whatever is left afterwards becomes a
    /// [`GenerationError::Model`].
    pub async fn explain<C: ModelClient>(
        &self,
        client: &C,
        feature: Feature,
        train: &[&ActivationExample],
    ) -> Result<Explanation> {
        if train.is_empty() {
            return Err(GenerationError::EmptyTrainSet.into());
        }

        let request = CompletionRequest::new(self.build_prompt(train), self.options.generation);
        debug!(%feature, n_examples = train.len(), "requesting explanation");

        let request = &request;
        let result = self
            .retry
            .run("explain", move || async move {
                let completion = client.complete(request).await?;
                parse_explanation(&completion.text).ok_or_else(|| {
                    Error::from(ClientError::MalformedResponse(
                        "reply contains no explanation".into(),
                    ))
                })
            })
            .await;

        match result {
            Ok(text) => {
                info!(%feature, explanation = %text, "explanation generated");
                Ok(Explanation::new(feature, text))
            }
            Err(Error::Client(source)) => Err(GenerationError::Model { feature, source }.into()),
            Err(other) => Err(other),
        }
    }
}

/// Pull the explanation out of a model reply.
///
/// Uses the text after the last `[EXPLANATION]:` marker, falling back to
/// the last non-empty line when the marker is missing.
pub fn parse_explanation(reply: &str) -> Option<String> {
    let candidate = match reply.rfind(EXPLANATION_MARKER) {
        Some(pos) => reply[pos + EXPLANATION_MARKER.len()..]
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())?,
        None => reply.lines().map(str::trim).rfind(|l| !l.is_empty())?,
    };
    let cleaned = candidate
        .strip_prefix('"')
        .and_then(|c| c.strip_suffix('"'))
        .unwrap_or(candidate)
        .trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::ScriptedClient;

    fn examples() -> Vec<ActivationExample> {
        vec![
            ActivationExample::activating(
                vec!["I".into(), " saw".into(), " a".into(), " dog".into()],
                vec![0.0, 0.0, 0.1, 2.0],
            )
            .unwrap(),
            ActivationExample::activating(
                vec!["the".into(), " dog".into(), " barked".into()],
                vec![0.0, 1.5, 0.2],
            )
            .unwrap(),
        ]
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            multiplier: 2,
            max_attempts: 3,
        }
    }

    #[test]
    fn test_parse_with_marker() {
        let reply = "The tokens are all dogs.\n[EXPLANATION]: the word \"dog\"";
        assert_eq!(parse_explanation(reply).unwrap(), "the word \"dog\"");
        assert_eq!(parse_explanation("[EXPLANATION]: \"dogs\"").unwrap(), "dogs");
        let reply = "reasoning\n[EXPLANATION]:   mentions of dogs  \n";
        assert_eq!(parse_explanation(reply).unwrap(), "mentions of dogs");
    }

    #[test]
    fn test_parse_uses_last_marker() {
        let reply = "[EXPLANATION]: first\nmore thought\n[EXPLANATION]: second";
        assert_eq!(parse_explanation(reply).unwrap(), "second");
    }

    #[test]
    fn test_parse_fallback_last_line() {
        assert_eq!(parse_explanation("a\n\nanimal nouns\n\n").unwrap(), "animal nouns");
        assert!(parse_explanation("  \n ").is_none());
        assert!(parse_explanation("[EXPLANATION]:   ").is_none());
    }

    #[test]
    fn test_prompt_highlights_tokens() {
        let examples = examples();
        let train: Vec<&ActivationExample> = examples.iter().collect();
        let messages = ExplanationGenerator::default().build_prompt(&train);
        assert_eq!(messages.len(), 2);
        assert!(messages[1].content.contains("Example 1: I saw a<< dog>>"));
        assert!(messages[1].content.contains("Example 2: the<< dog>> barked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explain_retries_malformed_reply() {
        let client = ScriptedClient::sequence(vec![
            Ok("".to_string()),
            Ok("[EXPLANATION]: the word dog".to_string()),
        ]);
        let examples = examples();
        let train: Vec<&ActivationExample> = examples.iter().collect();
        let generator = ExplanationGenerator::new(ExplainerOptions::default(), quick_retry());

        let explanation = generator
            .explain(&client, Feature::new(1, 2), &train)
            .await
            .unwrap();
        assert_eq!(explanation.text, "the word dog");
        assert_eq!(explanation.feature, Feature::new(1, 2));
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explain_permanent_failure() {
        let client = ScriptedClient::always_permanent();
        let examples = examples();
        let train: Vec<&ActivationExample> = examples.iter().collect();
        let generator = ExplanationGenerator::new(ExplainerOptions::default(), quick_retry());

        let err = generator
            .explain(&client, Feature::new(1, 2), &train)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Generation(GenerationError::Model { .. })));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_explain_empty_train_set() {
        let client = ScriptedClient::always_permanent();
        let err = ExplanationGenerator::default()
            .explain(&client, Feature::new(0, 0), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Generation(GenerationError::EmptyTrainSet)));
        assert_eq!(client.calls(), 0);
    }
}
