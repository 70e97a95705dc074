//! Activation dump loading
//!
//! Dumps are JSON files produced by an activation-capture run: one entry per
//! feature, each holding the traces where it fired plus optional
//! non-activating contexts. Tokens may be decoded strings or raw ids.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::error::DataError;

/// Token sequence as stored in a dump
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTokens {
    Text(Vec<String>),
    Ids(Vec<u32>),
}

impl RawTokens {
    /// Decoded token strings; ids need a detokenizer.
    pub fn decode(
        &self,
        detokenizer: Option<&dyn Detokenizer>,
    ) -> crate::Result<Vec<String>> {
        match self {
            RawTokens::Text(tokens) => Ok(tokens.clone()),
            RawTokens::Ids(ids) => match detokenizer {
                Some(detok) => detok.decode_tokens(ids),
                None => Err(DataError::Decode(
                    "dump holds token ids but no tokenizer was provided".into(),
                )
                .into()),
            },
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RawTokens::Text(t) => t.len(),
            RawTokens::Ids(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One context: tokens plus per-token activations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTrace {
    pub tokens: RawTokens,
    /// Per-token activations (absent for random contexts)
    #[serde(default, alias = "activations")]
    pub values: Vec<f32>,
}

/// All traces recorded for one feature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFeature {
    pub feature_index: usize,
    #[serde(default)]
    pub activations: Vec<RawTrace>,
    /// Contexts where the feature stayed silent
    #[serde(default)]
    pub random: Vec<RawTrace>,
}

/// A whole activation dump
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivationDump {
    /// Layer the dump was captured at, when recorded
    #[serde(default)]
    pub layer_index: Option<usize>,
    pub features: Vec<RawFeature>,
}

impl ActivationDump {
    /// Load a dump from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read activation dump {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse activation dump {}", path.display()))
    }

    /// Parse a dump from a JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        let dump: ActivationDump = serde_json::from_str(content)?;
        Ok(dump)
    }

    /// Number of features in the dump
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Detokenization
// ---------------------------------------------------------------------------

/// Turns token ids back into per-token strings.
pub trait Detokenizer: Send + Sync {
    /// Decode each id to its own string, preserving length
    fn decode_tokens(&self, ids: &[u32]) -> crate::Result<Vec<String>>;
}

impl Detokenizer for Tokenizer {
    fn decode_tokens(&self, ids: &[u32]) -> crate::Result<Vec<String>> {
        ids.iter()
            .map(|&id| {
                self.decode(&[id], false)
                    .map_err(|e| crate::Error::from(DataError::Decode(e.to_string())))
            })
            .collect()
    }
}

/// Load a HuggingFace tokenizer by model id (downloads `tokenizer.json`)
pub fn load_tokenizer(model_id: &str) -> Result<Tokenizer> {
    use hf_hub::{api::sync::Api, Repo, RepoType};

    let api = Api::new().context("Failed to create HuggingFace API")?;
    let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
    let path = repo
        .get("tokenizer.json")
        .with_context(|| format!("Failed to download tokenizer for {model_id}"))?;
    Tokenizer::from_file(&path).map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{Feature, FeatureRecord, SelectionPolicy};

    struct Spelled;

    impl Detokenizer for Spelled {
        fn decode_tokens(&self, ids: &[u32]) -> crate::Result<Vec<String>> {
            Ok(ids.iter().map(|id| format!("<{id}>")).collect())
        }
    }

    const DUMP: &str = r#"{
        "layer_index": 2,
        "features": [
            {
                "feature_index": 3,
                "activations": [
                    {"tokens": ["a", "b"], "values": [0.0, 2.0]},
                    {"tokens": ["c", "d"], "values": [1.0, 0.5]},
                    {"tokens": ["e", "f"], "values": [0.1, 0.0]}
                ],
                "random": [{"tokens": ["x", "y"]}, {"tokens": ["z"]}]
            },
            {
                "feature_index": 7,
                "activations": [{"tokens": [11, 12], "activations": [0.3, 0.0]}]
            }
        ]
    }"#;

    fn policy(selected: &[usize], min: usize) -> SelectionPolicy {
        SelectionPolicy {
            layer_index: 2,
            selected_features: selected.iter().copied().collect(),
            n_random: 1,
            min_examples: min,
            max_examples: 100,
        }
    }

    #[test]
    fn test_dump_parsing() {
        let dump = ActivationDump::from_json(DUMP).unwrap();
        assert_eq!(dump.layer_index, Some(2));
        assert_eq!(dump.len(), 2);
        assert!(matches!(dump.features[1].activations[0].tokens, RawTokens::Ids(_)));
        assert_eq!(dump.features[1].activations[0].values, vec![0.3, 0.0]);
    }

    #[test]
    fn test_records_from_dump() {
        let dump = ActivationDump::from_json(DUMP).unwrap();
        let records = FeatureRecord::from_dump(&dump, &policy(&[3], 4), None);
        assert_eq!(records.len(), 1);
        let record = records.into_iter().next().unwrap().unwrap();
        assert_eq!(record.feature(), Feature::new(2, 3));
        assert_eq!(record.activating().len(), 3);
        // n_random caps the injected negatives
        assert_eq!(record.random().len(), 1);
        assert_eq!(record.activating()[0].max_activation(), 2.0);
    }

    #[test]
    fn test_insufficient_feature_is_isolated() {
        let dump = ActivationDump::from_json(DUMP).unwrap();
        let records = FeatureRecord::from_dump(&dump, &policy(&[3, 7, 99], 2), Some(&Spelled));
        assert_eq!(records.len(), 3);
        assert!(records[0].is_ok());
        // feature 7 has one activating example and no randoms
        assert!(records[1].as_ref().unwrap_err().is_insufficient_data());
        // feature 99 is absent from the dump
        assert!(records[2].as_ref().unwrap_err().is_insufficient_data());
    }

    #[test]
    fn test_token_ids_decoded() {
        let dump = ActivationDump::from_json(DUMP).unwrap();
        let records = FeatureRecord::from_dump(&dump, &policy(&[7], 1), Some(&Spelled));
        let record = records.into_iter().next().unwrap().unwrap();
        assert_eq!(record.activating()[0].tokens(), &["<11>", "<12>"]);
    }

    #[test]
    fn test_token_ids_without_detokenizer() {
        let dump = ActivationDump::from_json(DUMP).unwrap();
        let records = FeatureRecord::from_dump(&dump, &policy(&[7], 1), None);
        assert!(records[0].is_err());
    }

    #[test]
    fn test_empty_selection_takes_all_features() {
        let dump = ActivationDump::from_json(DUMP).unwrap();
        let records = FeatureRecord::from_dump(&dump, &policy(&[], 1), Some(&Spelled));
        assert_eq!(records.len(), 2);
    }
}
