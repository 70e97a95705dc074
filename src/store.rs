//! On-disk layout for explanations and scores
//!
//! ```text
//! <root>/
//!   explanations/layer{L}_feature{F}.txt
//!   scores/{scorer}/layer{L}_feature{F}.json
//!   report.json
//! ```
//!
//! Every write goes to a temporary file in the target directory and is then
//! renamed over the destination, so a cancelled run never leaves a
//! half-written artifact. Existing artifacts are overwritten.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::debug;

use crate::error::{PersistenceError, Result};
use crate::explainer::Explanation;
use crate::feature::Feature;
use crate::scorer::{ScoreResult, ScorerKind};

const EXPLANATIONS_DIR: &str = "explanations";
const SCORES_DIR: &str = "scores";
const REPORT_FILE: &str = "report.json";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Explanation and score artifacts under one output directory
#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [root.join(EXPLANATIONS_DIR), root.join(SCORES_DIR)] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| persistence("create", &dir, source))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn explanation_path(&self, feature: Feature) -> PathBuf {
        self.root
            .join(EXPLANATIONS_DIR)
            .join(format!("{feature}.txt"))
    }

    pub fn score_path(&self, feature: Feature, scorer: ScorerKind) -> PathBuf {
        self.root
            .join(SCORES_DIR)
            .join(scorer.as_str())
            .join(format!("{feature}.json"))
    }

    pub fn report_path(&self) -> PathBuf {
        self.root.join(REPORT_FILE)
    }

    pub async fn save_explanation(&self, explanation: &Explanation) -> Result<PathBuf> {
        let path = self.explanation_path(explanation.feature);
        write_atomic(&path, explanation.text.as_bytes()).await?;
        debug!(feature = %explanation.feature, path = %path.display(), "saved explanation");
        Ok(path)
    }

    pub async fn load_explanation(&self, feature: Feature) -> Result<Explanation> {
        let path = self.explanation_path(feature);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| persistence("read", &path, source))?;
        Ok(Explanation::new(feature, text.trim()))
    }

    pub async fn save_score(&self, result: &ScoreResult) -> Result<PathBuf> {
        let path = self.score_path(result.feature, result.scorer);
        let json = serde_json::to_vec_pretty(result)?;
        write_atomic(&path, &json).await?;
        debug!(
            feature = %result.feature,
            scorer = %result.scorer,
            path = %path.display(),
            "saved score"
        );
        Ok(path)
    }

    pub async fn load_score(&self, feature: Feature, scorer: ScorerKind) -> Result<ScoreResult> {
        let path = self.score_path(feature, scorer);
        let content = tokio::fs::read(&path)
            .await
            .map_err(|source| persistence("read", &path, source))?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Write a run summary to `report.json`
    pub async fn save_report<T: Serialize>(&self, report: &T) -> Result<PathBuf> {
        let path = self.report_path();
        let json = serde_json::to_vec_pretty(report)?;
        write_atomic(&path, &json).await?;
        Ok(path)
    }
}

fn persistence(op: &'static str, path: &Path, source: std::io::Error) -> PersistenceError {
    PersistenceError {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Write to a sibling temp file, then rename over `path`
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| persistence("create", dir, source))?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(
        ".{name}.{}.{}.tmp",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    if let Err(source) = tokio::fs::write(&tmp, contents).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(persistence("write", &tmp, source).into());
    }
    if let Err(source) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(persistence("rename", path, source).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::scorer::ScorePayload;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_layout() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path()).await.unwrap();
        let feature = Feature::new(2, 17);

        assert!(store
            .explanation_path(feature)
            .ends_with("explanations/layer2_feature17.txt"));
        assert!(store
            .score_path(feature, ScorerKind::Fuzz)
            .ends_with("scores/fuzz/layer2_feature17.json"));
        assert!(dir.path().join("explanations").is_dir());
    }

    #[tokio::test]
    async fn test_explanation_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path()).await.unwrap();
        let feature = Feature::new(0, 1);

        store
            .save_explanation(&Explanation::new(feature, "first"))
            .await
            .unwrap();
        store
            .save_explanation(&Explanation::new(feature, "the word dog"))
            .await
            .unwrap();

        let loaded = store.load_explanation(feature).await.unwrap();
        assert_eq!(loaded.text, "the word dog");

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("explanations"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_score_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path()).await.unwrap();
        let explanation = Explanation::new(Feature::new(1, 3), "dogs");
        let payload = ScorePayload::Simulation {
            examples: vec![],
            ev_correlation: Some(0.75),
        };
        let result = ScoreResult::new(explanation.feature, &explanation, payload, "scripted");

        let path = store.save_score(&result).await.unwrap();
        assert!(path.exists());

        let loaded = store
            .load_score(Feature::new(1, 3), ScorerKind::Simulation)
            .await
            .unwrap();
        assert_eq!(loaded.score, Some(0.75));
        assert_eq!(loaded.explanation, "dogs");
    }

    #[tokio::test]
    async fn test_missing_explanation_is_persistence_error() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path()).await.unwrap();
        let err = store.load_explanation(Feature::new(9, 9)).await.unwrap_err();
        assert!(matches!(err, Error::Persistence(ref e) if e.op == "read"));
        assert!(err.to_string().contains("layer9_feature9.txt"));
    }
}
