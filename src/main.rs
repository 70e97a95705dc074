//! autointerp-rs CLI: explain and score sparse-autoencoder features

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use autointerp_rs::{
    load_tokenizer, score_units, BackendKind, BatchExecutor, BertEmbedder, Detokenizer, Embedder,
    ExplanationGenerator, HashingEmbedder, ModelBackend, PipelineConfig, ResultStore, Scorer,
    ScorerKind, Unit,
};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Environment variable read when the config carries no API key
const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

#[derive(Parser)]
#[command(name = "autointerp-rs")]
#[command(about = "Explain and score sparse-autoencoder features with language models")]
#[command(version)]
struct Cli {
    /// Pipeline config file (JSON); flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Activation dump; `{layer}` is expanded per --layers entry
    #[arg(short, long)]
    dump: Vec<String>,

    /// Layers to process, comma separated
    #[arg(short, long, value_delimiter = ',')]
    layers: Vec<usize>,

    /// Output directory for explanations, scores and the run report
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Model served by the backend
    #[arg(short, long)]
    model: Option<String>,

    /// Use a self-hosted OpenAI-compatible server instead of the hosted provider
    #[arg(long)]
    local: bool,

    /// Override the backend base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Maximum model calls in flight
    #[arg(long)]
    concurrency: Option<usize>,

    /// Abort the run after this many seconds
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// Drop features with fewer examples than this
    #[arg(long)]
    min_record_examples: Option<usize>,

    /// HuggingFace tokenizer for dumps that store token ids
    #[arg(long)]
    tokenizer: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate an explanation per feature from its top activations
    Explain {
        #[arg(long)]
        n_train: Option<usize>,
        #[arg(long)]
        n_test: Option<usize>,
        #[arg(long)]
        n_quantiles: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Score stored explanations against held-out examples
    Score {
        /// Scorers to run, comma separated (embedding, fuzz, detection, simulation)
        #[arg(short, long, value_delimiter = ',')]
        scorers: Vec<ScorerKind>,
        /// Defaults to 0 unless the config sets `score_sampling`
        #[arg(long)]
        n_train: Option<usize>,
        /// Defaults to 2
        #[arg(long)]
        n_test: Option<usize>,
        /// Defaults to 4
        #[arg(long)]
        n_quantiles: Option<usize>,
        /// Defaults to 22
        #[arg(long)]
        seed: Option<u64>,
        /// BERT checkpoint for the embedding scorer (default: hashing embedder)
        #[arg(long)]
        embedding_model: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    apply_overrides(&mut config, &cli);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?;
    runtime.block_on(run(cli.command, config))
}

fn apply_overrides(config: &mut PipelineConfig, cli: &Cli) {
    if !cli.dump.is_empty() {
        config.dumps.clone_from(&cli.dump);
    }
    if !cli.layers.is_empty() {
        config.layers.clone_from(&cli.layers);
    }
    if let Some(output) = &cli.output {
        config.output_dir.clone_from(output);
    }
    if let Some(model) = &cli.model {
        config.client.model.clone_from(model);
    }
    if cli.local {
        config.client.backend = BackendKind::Local;
    }
    if let Some(url) = &cli.base_url {
        config.client.base_url = Some(url.clone());
    }
    if let Some(n) = cli.concurrency {
        config.concurrency = n;
    }
    if let Some(secs) = cli.deadline_secs {
        config.deadline_secs = Some(secs);
    }
    if let Some(n) = cli.min_record_examples {
        config.min_record_examples = n;
    }
    if let Some(tokenizer) = &cli.tokenizer {
        config.tokenizer = Some(tokenizer.clone());
    }
    if config.client.api_key.is_none() {
        config.client.api_key = std::env::var(API_KEY_ENV).ok();
    }

    match &cli.command {
        Command::Explain {
            n_train,
            n_test,
            n_quantiles,
            seed,
        } => {
            config.sampling = config
                .sampling
                .overridden(*n_train, *n_test, *n_quantiles, *seed);
        }
        Command::Score {
            scorers,
            n_train,
            n_test,
            n_quantiles,
            seed,
            embedding_model,
        } => {
            config.score_sampling = config
                .score_sampling
                .overridden(*n_train, *n_test, *n_quantiles, *seed);
            if !scorers.is_empty() {
                config.scorers.clone_from(scorers);
            }
            if embedding_model.is_some() {
                config.embedding_model.clone_from(embedding_model);
            }
        }
    }
}

async fn run(command: Command, config: PipelineConfig) -> Result<()> {
    println!("=== autointerp-rs ===");
    println!("Model:  {} ({:?})", config.client.model, config.client.backend);
    println!("Output: {}", config.output_dir.display());

    // Setup failures abort before any unit runs
    let tokenizer = match &config.tokenizer {
        Some(id) => Some(load_tokenizer(id)?),
        None => None,
    };
    let detokenizer = tokenizer.as_ref().map(|t| t as &dyn Detokenizer);
    let set = config.collect_records(detokenizer)?;
    info!(
        records = set.records.len(),
        dropped = set.dropped.len(),
        "feature records ready"
    );

    let store = ResultStore::open(&config.output_dir).await?;
    let client = Arc::new(ModelBackend::from_config(&config.client)?);
    let executor = BatchExecutor::new(client, store.clone(), config.batch_options())
        .with_generator(ExplanationGenerator::new(config.explainer, config.retry.clone()));

    let (units, missing) = match command {
        Command::Explain { .. } => {
            let units = set
                .records
                .into_iter()
                .map(|record| Unit::explain(Arc::new(record), config.sampling))
                .collect();
            (units, Vec::new())
        }
        Command::Score { .. } => {
            let scorers = build_scorers(&config)?;
            score_units(&store, set.records, &scorers, config.score_sampling).await
        }
    };

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let mut report = executor.run_until(units, shutdown).await;
    report.skipped.extend(missing);
    let report_path = store.save_report(&report).await?;

    let summary = report.summary();
    println!("\n=== Results ===");
    println!("Succeeded: {}", summary.succeeded);
    println!("Skipped:   {}", summary.skipped + set.dropped.len());
    println!("Failed:    {}", summary.failed);
    println!("Cancelled: {}", summary.cancelled);
    for failure in &report.failed {
        println!("  {} ({}): {}", failure.feature, failure.kind, failure.error);
    }
    info!("Report saved to {}", report_path.display());

    Ok(())
}

/// One scorer per configured kind, sharing a single embedder
fn build_scorers(config: &PipelineConfig) -> Result<Vec<Arc<Scorer>>> {
    let embedder: Arc<dyn Embedder> = match &config.embedding_model {
        Some(id) if config.scorers.contains(&ScorerKind::Embedding) => {
            Arc::new(BertEmbedder::from_pretrained(id)?)
        }
        _ => Arc::new(HashingEmbedder::default()),
    };
    Ok(config
        .scorers
        .iter()
        .map(|&kind| {
            Arc::new(Scorer::build(
                kind,
                config.scorer,
                config.retry.clone(),
                Arc::clone(&embedder),
            ))
        })
        .collect())
}
