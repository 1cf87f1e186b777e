// ============================================================================
// main.rs – experiment driver
// ============================================================================
// Note:     Loads the labeled texts, builds the indexed corpus and runs one of
//           scan (default), train, kfold or report. Logging goes through
//           tracing (RUST_LOG overrides the default `info` level), the final
//           reports are printed to stdout.
// ============================================================================

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use w2v_cnn::config::{ExperimentConfig, ModelType};
use w2v_cnn::dataset_loader::{load_labeled_csv, split_train_val, DataSplit, LabeledTexts};
use w2v_cnn::kfold::cross_validate;
use w2v_cnn::model::CnnParams;
use w2v_cnn::reporting::{format_best, Metric, Reporting};
use w2v_cnn::search::{ParamGrid, Scan, RESULTS_FILE};
use w2v_cnn::train::{stop_flag, train_model, TrainContext};
use w2v_cnn::vocabulary::IndexedCorpus;
use w2v_cnn::word2vec::EmbeddingCache;

#[derive(Parser)]
#[command(name = "w2v-cnn", about = "Word2Vec + CNN text classifier with grid search")]
struct Cli {
    /// TOML experiment configuration; defaults apply when missing.
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Overrides `data.train_path`.
    #[arg(long, global = true)]
    data: Option<PathBuf>,

    /// Overrides `model.model_type` (CNN-rand, CNN-non-static, CNN-static).
    #[arg(long, global = true)]
    model_type: Option<ModelType>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Hyperparameter grid scan over the `[search]` grid.
    Scan {
        /// Number of best parameter sets to print.
        #[arg(long, default_value = "1")]
        top: usize,
    },

    /// Single training run with the `[model]` / `[training]` parameters.
    Train {
        /// Write the trained model here (bincode).
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Write the per epoch history here (JSON).
        #[arg(long)]
        history: Option<PathBuf>,
    },

    /// K fold cross validation over the full dataset.
    Kfold {
        #[arg(long, default_value = "10")]
        folds: usize,
    },

    /// Best parameters from a finished scan's results.csv.
    Report {
        /// Defaults to <output_dir>/<experiment_name>/results.csv.
        #[arg(long)]
        results: Option<PathBuf>,

        #[arg(long, default_value = "val_accuracy")]
        metric: Metric,

        #[arg(long, default_value = "5")]
        top: usize,
    },
}

/// ---------------------------------------------------------------------------
/// Prepared data shared by the subcommands
/// ---------------------------------------------------------------------------
struct Prepared {
    data: LabeledTexts,
    corpus: IndexedCorpus,
}

fn prepare_data(cfg: &ExperimentConfig) -> Result<Prepared> {
    info!("Load data...");
    let data = load_labeled_csv(
        &cfg.data.train_path,
        &cfg.data.x_col,
        &cfg.data.y_cols,
        cfg.data.label_threshold,
    )
    .with_context(|| format!("cannot load training data from {}", cfg.data.train_path))?;

    let corpus = IndexedCorpus::from_texts(
        &data.texts,
        cfg.preprocessing.sequence_length,
        cfg.preprocessing.max_words,
    )?;
    if corpus.width != cfg.preprocessing.sequence_length {
        info!(
            configured = cfg.preprocessing.sequence_length,
            actual = corpus.width,
            "Adjusting sequence length for actual size"
        );
    }
    info!(vocabulary = corpus.vocabulary.len(), "Vocabulary Size: {}", corpus.vocabulary.len());
    Ok(Prepared { data, corpus })
}

fn make_cache(cfg: &ExperimentConfig) -> Arc<EmbeddingCache> {
    Arc::new(match &cfg.word2vec.cache_dir {
        Some(dir) => EmbeddingCache::with_dir(dir),
        None => EmbeddingCache::in_memory(),
    })
}

fn make_context(cfg: &ExperimentConfig, prepared: &Prepared, split: DataSplit) -> TrainContext {
    TrainContext {
        model_type: cfg.model.model_type,
        vocabulary: prepared.corpus.vocabulary.clone(),
        split,
        word2vec: cfg.word2vec.clone(),
        training: cfg.training.clone(),
        cache: make_cache(cfg),
        seed: cfg.data.seed,
        stop: Some(stop_flag()),
    }
}

fn split_context(cfg: &ExperimentConfig, prepared: &Prepared) -> Result<TrainContext> {
    let split = split_train_val(
        prepared.corpus.sequences.clone(),
        prepared.data.labels.clone(),
        cfg.data.train_percent,
        cfg.data.seed,
    )?;
    let i_width = prepared.corpus.width;
    info!(shape = ?(split.x_train.len(), i_width), "x_train shape");
    info!(shape = ?(split.x_val.len(), i_width), "x_val shape");
    Ok(make_context(cfg, prepared, split))
}

/// ---------------------------------------------------------------------------
/// Subcommands
/// ---------------------------------------------------------------------------
fn run_scan(cfg: &ExperimentConfig, i_top: usize) -> Result<()> {
    let prepared = prepare_data(cfg)?;
    let ctx = split_context(cfg, &prepared)?;

    let grid = ParamGrid::from_config(&cfg.search, prepared.corpus.width);
    let scan = Scan::from_config(grid, &cfg.search, cfg.data.seed).stop_flag(stop_flag());
    let results = scan.run(|params| train_model(&ctx, params).map(|(history, _)| history))?;

    if let Some(path) = &results.results_path {
        info!(path = %path.display(), "scan results written");
    }
    let report = Reporting::new(&results);
    let best = report.best_params(Metric::ValAccuracy, i_top);
    println!(
        "Best parameters ({} of {} rounds, {} failed):",
        report.rounds(),
        results.planned,
        results.failed
    );
    print!("{}", format_best(&best, Metric::ValAccuracy));
    Ok(())
}

fn run_train(cfg: &ExperimentConfig, checkpoint: Option<PathBuf>, history_path: Option<PathBuf>) -> Result<()> {
    let prepared = prepare_data(cfg)?;
    let ctx = split_context(cfg, &prepared)?;
    let params = CnnParams::from_config(&cfg.model, &cfg.word2vec, &cfg.training, prepared.corpus.width);

    let (history, mut model) = train_model(&ctx, &params)?;
    println!("{}", model.summary());
    let (d_loss, d_acc) = model.evaluate(&ctx.split.x_val, &ctx.split.y_val)?;
    println!("Test loss: {:.4}", d_loss);
    println!("Test accuracy: {:.4}", d_acc);

    if let Some(path) = checkpoint {
        model
            .save_checkpoint(&path)
            .with_context(|| format!("cannot write checkpoint {}", path.display()))?;
    }
    if let Some(path) = history_path {
        history
            .save_json(&path)
            .with_context(|| format!("cannot write history {}", path.display()))?;
    }
    Ok(())
}

fn run_kfold(cfg: &ExperimentConfig, i_folds: usize) -> Result<()> {
    let prepared = prepare_data(cfg)?;
    let empty = DataSplit {
        x_train: Vec::new(),
        y_train: Vec::new(),
        x_val: Vec::new(),
        y_val: Vec::new(),
    };
    let ctx = make_context(cfg, &prepared, empty);
    let params = CnnParams::from_config(&cfg.model, &cfg.word2vec, &cfg.training, prepared.corpus.width);

    let cv = cross_validate(&ctx, &prepared.corpus.sequences, &prepared.data.labels, &params, i_folds)?;
    for fold in &cv.folds {
        println!(
            "Fold {:>2}: loss {:.4}  accuracy {:.4}  ({} epochs)",
            fold.fold + 1,
            fold.loss,
            fold.accuracy,
            fold.epochs
        );
    }
    println!("Average {}-fold validation loss: {:.4}", cv.folds.len(), cv.mean_loss());
    println!("Average {}-fold validation accuracy: {:.4}", cv.folds.len(), cv.mean_accuracy());
    Ok(())
}

fn run_report(cfg: &ExperimentConfig, results: Option<PathBuf>, metric: Metric, i_top: usize) -> Result<()> {
    let path = results.unwrap_or_else(|| {
        PathBuf::from(&cfg.search.output_dir)
            .join(&cfg.search.experiment_name)
            .join(RESULTS_FILE)
    });
    let report = Reporting::from_csv(&path)
        .with_context(|| format!("cannot read scan results {}", path.display()))?;
    println!(
        "{} rounds, {} high {:?}, low {:?}",
        report.rounds(),
        metric,
        report.high(metric),
        report.low(metric)
    );
    print!("{}", format_best(&report.best_params(metric, i_top), metric));
    Ok(())
}

/// ---------------------------------------------------------------------------
/// main
/// ---------------------------------------------------------------------------
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = ExperimentConfig::load_or_default(&cli.config)
        .with_context(|| format!("invalid config {}", cli.config.display()))?;
    if let Some(path) = cli.data {
        cfg.data.train_path = path.to_string_lossy().into_owned();
    }
    if let Some(model_type) = cli.model_type {
        cfg.model.model_type = model_type;
    }
    info!(model_type = %cfg.model.model_type, "configuration loaded");

    match cli.command.unwrap_or(Command::Scan { top: 1 }) {
        Command::Scan { top } => run_scan(&cfg, top),
        Command::Train { checkpoint, history } => run_train(&cfg, checkpoint, history),
        Command::Kfold { folds } => run_kfold(&cfg, folds),
        Command::Report { results, metric, top } => run_report(&cfg, results, metric, top),
    }
}
