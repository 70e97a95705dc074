// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in scoring
#![allow(clippy::cast_possible_truncation)] // u128 millis→u64, usize→u32 in tensors
#![allow(clippy::many_single_char_names)] // x, y, p, r standard in math
#![allow(clippy::similar_names)] // related variables like `tp`/`fp`
#![allow(clippy::module_name_repetitions)] // ScorerKind in scorer/ is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::unused_self)] // &self for API consistency
#![allow(clippy::struct_field_names)] // field postfix patterns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! autointerp-rs: automated interpretability for sparse-autoencoder features
//!
//! Generates natural-language explanations of what a feature detects from
//! its top-activating contexts, then scores each explanation against
//! held-out examples.
//!
//! ## Architecture
//!
//! - `dump`: Activation dump loading and detokenization
//! - `feature`: Features, activation examples and per-feature records
//! - `sampler`: Top-k train split and quantile-stratified test split
//! - `client`: OpenAI-compatible chat clients (remote and local) and a concurrency cap
//! - `retry`: Bounded exponential backoff for transient model failures
//! - `explainer`: Explanation prompt, request and reply parsing
//! - `embedding`: Local text embedders (feature hashing, BERT via candle)
//! - `scorer`: Embedding, fuzz, detection and simulation scoring
//! - `batch`: Bounded-concurrency unit execution with cancellation
//! - `store`: Atomic on-disk explanation and score artifacts
//! - `config`: Pipeline configuration file

pub mod batch;
pub mod client;
pub mod config;
pub mod dump;
pub mod embedding;
pub mod error;
pub mod explainer;
pub mod feature;
pub mod retry;
pub mod sampler;
pub mod scorer;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{
    score_units, BatchExecutor, BatchOptions, BatchReport, BatchSummary, Unit, UnitFailure,
    UnitKind, UnitSuccess, UnitTask,
};
pub use client::{
    BackendKind, ChatMessage, ClientConfig, Completion, CompletionRequest, GenerationOptions,
    LimitedClient, LocalClient, ModelBackend, ModelClient, RemoteClient, Role,
};
pub use config::{PipelineConfig, RecordSet};
pub use dump::{load_tokenizer, ActivationDump, Detokenizer};
pub use embedding::{cosine_similarity, BertEmbedder, Embedder, HashingEmbedder};
pub use error::{
    ClientError, DataError, Error, GenerationError, PersistenceError, Result, SamplingError,
};
pub use explainer::{parse_explanation, ExplainerOptions, Explanation, ExplanationGenerator};
pub use feature::{ActivationExample, ExampleKind, Feature, FeatureRecord, SelectionPolicy};
pub use retry::RetryPolicy;
pub use sampler::{sample_top_and_quantiles, SampleSplit, Sampled, SamplingConfig};
pub use scorer::{
    ClassificationMetrics, ScorePayload, ScoreResult, Scorer, ScorerInput, ScorerKind,
    ScorerOptions,
};
pub use store::ResultStore;
