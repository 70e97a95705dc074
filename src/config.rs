//! Pipeline configuration
//!
//! A single JSON file holds every knob; missing keys take their defaults.
//! The CLI layers its flags on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::batch::BatchOptions;
use crate::client::ClientConfig;
use crate::dump::{ActivationDump, Detokenizer};
use crate::explainer::ExplainerOptions;
use crate::feature::{FeatureRecord, SelectionPolicy};
use crate::retry::RetryPolicy;
use crate::sampler::SamplingConfig;
use crate::scorer::{ScorerKind, ScorerOptions};

/// Placeholder in dump paths replaced by each configured layer
pub const LAYER_PLACEHOLDER: &str = "{layer}";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Activation dump files; a path containing `{layer}` is expanded once
    /// per entry in `layers`
    pub dumps: Vec<String>,
    /// Layers to process (empty = whatever the dumps hold)
    pub layers: Vec<usize>,
    pub output_dir: PathBuf,
    /// Tokenizer used to decode dumps that store token ids
    pub tokenizer: Option<String>,
    pub selection: SelectionPolicy,
    /// Drop records with fewer examples than this before any work is done
    pub min_record_examples: usize,
    /// Sampling for `explain` runs
    pub sampling: SamplingConfig,
    /// Sampling for `score` runs
    pub score_sampling: SamplingConfig,
    pub client: ClientConfig,
    pub explainer: ExplainerOptions,
    pub scorers: Vec<ScorerKind>,
    pub scorer: ScorerOptions,
    /// BERT checkpoint for the embedding scorer (unset = hashing embedder)
    pub embedding_model: Option<String>,
    /// Maximum model calls in flight
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Abort the batch after this many seconds
    pub deadline_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dumps: vec![],
            layers: vec![],
            output_dir: PathBuf::from("results"),
            tokenizer: None,
            selection: SelectionPolicy::default(),
            min_record_examples: 0,
            sampling: SamplingConfig::default(),
            score_sampling: SamplingConfig::scoring(),
            client: ClientConfig::default(),
            explainer: ExplainerOptions::default(),
            scorers: vec![ScorerKind::Detection, ScorerKind::Fuzz],
            scorer: ScorerOptions::default(),
            embedding_model: None,
            concurrency: 4,
            retry: RetryPolicy::default(),
            deadline_secs: None,
        }
    }
}

/// Records ready for work plus what was dropped on the way
#[derive(Debug, Default)]
pub struct RecordSet {
    pub records: Vec<FeatureRecord>,
    /// One message per feature that could not be built
    pub dropped: Vec<String>,
}

impl PipelineConfig {
    /// Load a config file; keys not present keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            concurrency: self.concurrency,
            deadline: self.deadline_secs.map(Duration::from_secs),
        }
    }

    /// Dump files to read, with the layer each one was expanded for
    pub fn dump_paths(&self) -> Vec<(PathBuf, Option<usize>)> {
        let mut paths = Vec::new();
        for template in &self.dumps {
            if template.contains(LAYER_PLACEHOLDER) {
                for &layer in &self.layers {
                    let path = template.replace(LAYER_PLACEHOLDER, &layer.to_string());
                    paths.push((PathBuf::from(path), Some(layer)));
                }
            } else {
                paths.push((PathBuf::from(template), None));
            }
        }
        paths
    }

    /// Read every dump and build the selected feature records.
    ///
    /// Unreadable dumps are fatal. Features with too few examples are
    /// logged and dropped.
    pub fn collect_records(&self, detokenizer: Option<&dyn Detokenizer>) -> Result<RecordSet> {
        let mut set = RecordSet::default();
        for (path, expanded_layer) in self.dump_paths() {
            let dump = ActivationDump::load(&path)?;
            let layer = expanded_layer
                .or(dump.layer_index)
                .unwrap_or(self.selection.layer_index);
            if expanded_layer.is_none() && !self.layers.is_empty() && !self.layers.contains(&layer)
            {
                info!(path = %path.display(), layer, "layer not selected, skipping dump");
                continue;
            }

            let policy = SelectionPolicy {
                layer_index: layer,
                ..self.selection.clone()
            };
            info!(path = %path.display(), layer, features = dump.len(), "loaded activation dump");

            for built in FeatureRecord::from_dump(&dump, &policy, detokenizer) {
                match built {
                    Ok(record) if record.len() < self.min_record_examples => {
                        warn!(
                            feature = %record.feature(),
                            examples = record.len(),
                            required = self.min_record_examples,
                            "record below minimum size, dropping"
                        );
                        set.dropped.push(format!(
                            "{}: {} examples, at least {} required",
                            record.feature(),
                            record.len(),
                            self.min_record_examples
                        ));
                    }
                    Ok(record) => set.records.push(record),
                    Err(err) => {
                        warn!(layer, error = %err, "could not build feature record");
                        set.dropped.push(err.to_string());
                    }
                }
            }
        }
        Ok(set)
    }
}
