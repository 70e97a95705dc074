//! Bounded-concurrency execution of explain and score units
//!
//! Every unit (one feature, one task) runs in its own task inside a
//! [`JoinSet`]. Model calls go through a shared [`LimitedClient`], so at
//! most `concurrency` requests are in flight no matter how many units are
//! outstanding. A unit's error is caught at the unit boundary and recorded
//! against its feature; it never aborts the rest of the batch.
//!
//! A deadline or an external shutdown future aborts every outstanding
//! unit. Artifacts are only written once a unit has fully succeeded, so
//! aborted units leave nothing behind.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::client::{LimitedClient, ModelClient};
use crate::error::Result;
use crate::explainer::{Explanation, ExplanationGenerator};
use crate::feature::{Feature, FeatureRecord};
use crate::sampler::SamplingConfig;
use crate::scorer::{ScoreResult, Scorer, ScorerInput, ScorerKind};
use crate::store::ResultStore;

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

/// What to do with one feature
pub enum UnitTask {
    Explain {
        sampling: SamplingConfig,
    },
    Score {
        explanation: Explanation,
        scorer: Arc<Scorer>,
        sampling: SamplingConfig,
    },
}

/// One feature plus the task to run on it
pub struct Unit {
    pub record: Arc<FeatureRecord>,
    pub task: UnitTask,
}

impl Unit {
    pub fn explain(record: Arc<FeatureRecord>, sampling: SamplingConfig) -> Self {
        Self {
            record,
            task: UnitTask::Explain { sampling },
        }
    }

    pub fn score(
        record: Arc<FeatureRecord>,
        explanation: Explanation,
        scorer: Arc<Scorer>,
        sampling: SamplingConfig,
    ) -> Self {
        Self {
            record,
            task: UnitTask::Score {
                explanation,
                scorer,
                sampling,
            },
        }
    }

    pub fn feature(&self) -> Feature {
        self.record.feature()
    }

    pub fn kind(&self) -> UnitKind {
        match &self.task {
            UnitTask::Explain { .. } => UnitKind::Explain,
            UnitTask::Score { scorer, .. } => UnitKind::Score {
                scorer: scorer.kind(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum UnitKind {
    Explain,
    Score { scorer: ScorerKind },
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitKind::Explain => f.write_str("explain"),
            UnitKind::Score { scorer } => write!(f, "score/{scorer}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSuccess {
    pub feature: Feature,
    pub kind: UnitKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub feature: Feature,
    pub kind: UnitKind,
    pub error: String,
}

/// Per-unit outcomes, in completion order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub succeeded: Vec<UnitSuccess>,
    /// Units whose data could not support the task
    pub skipped: Vec<UnitFailure>,
    pub failed: Vec<UnitFailure>,
    /// Units aborted by the deadline or a shutdown request
    pub cancelled: usize,
    /// Unit tasks that panicked
    pub panicked: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl std::fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} succeeded, {} skipped, {} failed, {} cancelled",
            self.succeeded, self.skipped, self.failed, self.cancelled
        )
    }
}

impl BatchReport {
    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            succeeded: self.succeeded.len(),
            skipped: self.skipped.len(),
            failed: self.failed.len() + self.panicked,
            cancelled: self.cancelled,
        }
    }

    /// Merge another batch's outcomes into this one
    pub fn extend(&mut self, other: BatchReport) {
        self.succeeded.extend(other.succeeded);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
        self.cancelled += other.cancelled;
        self.panicked += other.panicked;
    }

    fn record(&mut self, outcome: UnitOutcome) {
        let UnitOutcome {
            feature,
            kind,
            result,
        } = outcome;
        match result {
            Ok(path) => {
                info!(%feature, %kind, path = %path.display(), "unit succeeded");
                self.succeeded.push(UnitSuccess {
                    feature,
                    kind,
                    path,
                });
            }
            Err(err) if err.is_insufficient_data() => {
                warn!(%feature, %kind, error = %err, "unit skipped");
                self.skipped.push(UnitFailure {
                    feature,
                    kind,
                    error: err.to_string(),
                });
            }
            Err(err) => {
                error!(%feature, %kind, error = %err, "unit failed");
                self.failed.push(UnitFailure {
                    feature,
                    kind,
                    error: err.to_string(),
                });
            }
        }
    }

    fn record_join(&mut self, joined: std::result::Result<UnitOutcome, tokio::task::JoinError>) {
        match joined {
            Ok(outcome) => self.record(outcome),
            Err(err) if err.is_cancelled() => self.cancelled += 1,
            Err(err) => {
                error!(error = %err, "unit task panicked");
                self.panicked += 1;
            }
        }
    }
}

/// One score unit per (record with a stored explanation, scorer).
///
/// Records with no stored explanation come back as skipped entries, one
/// per scorer, so they show up in the run report.
pub async fn score_units(
    store: &ResultStore,
    records: Vec<FeatureRecord>,
    scorers: &[Arc<Scorer>],
    sampling: SamplingConfig,
) -> (Vec<Unit>, Vec<UnitFailure>) {
    let mut units = Vec::new();
    let mut missing = Vec::new();
    for record in records {
        let feature = record.feature();
        let explanation = match store.load_explanation(feature).await {
            Ok(explanation) => explanation,
            Err(err) => {
                warn!(%feature, error = %err, "no stored explanation, skipping");
                missing.extend(scorers.iter().map(|scorer| UnitFailure {
                    feature,
                    kind: UnitKind::Score {
                        scorer: scorer.kind(),
                    },
                    error: err.to_string(),
                }));
                continue;
            }
        };
        let record = Arc::new(record);
        for scorer in scorers {
            units.push(Unit::score(
                Arc::clone(&record),
                explanation.clone(),
                Arc::clone(scorer),
                sampling,
            ));
        }
    }
    (units, missing)
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Maximum model calls in flight
    pub concurrency: usize,
    /// Abort outstanding units after this long
    pub deadline: Option<Duration>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            deadline: None,
        }
    }
}

struct UnitOutcome {
    feature: Feature,
    kind: UnitKind,
    result: Result<PathBuf>,
}

/// Runs units against one client and one store
pub struct BatchExecutor<C> {
    client: LimitedClient<C>,
    store: ResultStore,
    generator: Arc<ExplanationGenerator>,
    options: BatchOptions,
}

impl<C: ModelClient + 'static> BatchExecutor<C> {
    pub fn new(client: Arc<C>, store: ResultStore, options: BatchOptions) -> Self {
        Self {
            client: LimitedClient::new(client, options.concurrency),
            store,
            generator: Arc::new(ExplanationGenerator::default()),
            options,
        }
    }

    /// Use a configured generator for explain units
    pub fn with_generator(mut self, generator: ExplanationGenerator) -> Self {
        self.generator = Arc::new(generator);
        self
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Run every unit to completion (or until the deadline)
    pub async fn run(&self, units: Vec<Unit>) -> BatchReport {
        self.run_until(units, std::future::pending()).await
    }

    /// Run units until they finish, the deadline passes, or `shutdown`
    /// resolves, whichever comes first.
    pub async fn run_until<F>(&self, units: Vec<Unit>, shutdown: F) -> BatchReport
    where
        F: Future<Output = ()>,
    {
        let total = units.len();
        info!(
            units = total,
            concurrency = self.options.concurrency,
            deadline_secs = self.options.deadline.map(|d| d.as_secs_f64()),
            "starting batch"
        );

        let mut set = JoinSet::new();
        for unit in units {
            set.spawn(run_unit(
                self.client.clone(),
                self.store.clone(),
                Arc::clone(&self.generator),
                unit,
            ));
        }

        let deadline = self.options.deadline;
        let expired = async move {
            match deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(shutdown);
        tokio::pin!(expired);

        let mut report = BatchReport::default();
        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(joined) => report.record_join(joined),
                    None => break,
                },
                () = &mut shutdown => {
                    warn!(outstanding = set.len(), "shutdown requested, aborting outstanding units");
                    break;
                }
                () = &mut expired => {
                    warn!(outstanding = set.len(), "batch deadline reached, aborting outstanding units");
                    break;
                }
            }
        }

        // Units that finished before the abort landed keep their results
        set.abort_all();
        while let Some(joined) = set.join_next().await {
            report.record_join(joined);
        }

        info!(units = total, summary = %report.summary(), "batch finished");
        report
    }
}

async fn run_unit<C: ModelClient>(
    client: LimitedClient<C>,
    store: ResultStore,
    generator: Arc<ExplanationGenerator>,
    unit: Unit,
) -> UnitOutcome {
    let feature = unit.feature();
    let kind = unit.kind();
    let result = execute(&client, &store, &generator, &unit).await;
    UnitOutcome {
        feature,
        kind,
        result,
    }
}

/// Sample, run the task, persist
async fn execute<C: ModelClient>(
    client: &LimitedClient<C>,
    store: &ResultStore,
    generator: &ExplanationGenerator,
    unit: &Unit,
) -> Result<PathBuf> {
    let record = unit.record.as_ref();
    match &unit.task {
        UnitTask::Explain { sampling } => {
            let split = sampling.sample(record)?;
            let explanation = generator
                .explain(client, record.feature(), &split.train)
                .await?;
            store.save_explanation(&explanation).await
        }
        UnitTask::Score {
            explanation,
            scorer,
            sampling,
        } => {
            let split = sampling.sample(record)?;
            let input = ScorerInput {
                record,
                test: split.test_flat(),
                explanation,
            };
            let payload = scorer.score(client, &input).await?;
            let result = ScoreResult::new(
                record.feature(),
                explanation,
                payload,
                scorer.model_name(client),
            );
            store.save_score(&result).await
        }
    }
}
