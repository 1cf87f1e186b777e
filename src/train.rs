// train.rs
// ============================================================================
// Note:     Training orchestration: epoch loop with per sample backprop and
//           batch accumulation, early stopping on validation accuracy, the
//           per epoch history and the model function used by every search
//           round (embeddings -> build -> fit).
// ============================================================================

#![forbid(unsafe_code)]

use ndarray::Array2;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{EarlyStoppingConfig, ModelType, TrainingConfig, Word2VecConfig};
use crate::dataset_loader::DataSplit;
use crate::error::{CnnError, Result};
use crate::math::{accuracy, binary_cross_entropy, mean};
use crate::model::{CnnParams, TextCnn};
use crate::vocabulary::{Vocabulary, PAD_ID};
use crate::word2vec::{EmbeddingCache, Word2VecParams};

// ---------------- Stop flag (Ctrl+C) ----------------

static STOP_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// Process wide flag set by Ctrl+C. The handler is installed on first use.
pub fn stop_flag() -> Arc<AtomicBool> {
    Arc::clone(STOP_FLAG.get_or_init(|| {
        let flag = Arc::new(AtomicBool::new(false));
        let flag_ctrlc = Arc::clone(&flag);
        if let Err(e) = ctrlc::set_handler(move || {
            flag_ctrlc.store(true, AtomicOrdering::SeqCst);
        }) {
            warn!(error = %e, "could not install Ctrl+C handler");
        }
        flag
    }))
}

fn is_stopped(stop: &Option<Arc<AtomicBool>>) -> bool {
    stop.as_ref().map(|f| f.load(AtomicOrdering::Relaxed)).unwrap_or(false)
}

// ---------------- Early stopping ----------------

/// Monitors `val_accuracy` in max mode: an epoch improves when it beats the
/// best value so far by more than `min_delta`.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    pub min_delta: f32,
    pub patience: usize,
    best: Option<f32>,
    wait: usize,
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    pub fn new(min_delta: f32, patience: usize) -> Self {
        Self {
            min_delta: min_delta.abs(),
            patience,
            best: None,
            wait: 0,
            stopped_epoch: None,
        }
    }

    /// `None` when disabled in the config.
    pub fn from_config(cfg: &EarlyStoppingConfig) -> Option<Self> {
        cfg.enabled.then(|| Self::new(cfg.min_delta, cfg.patience))
    }

    pub fn best(&self) -> Option<f32> {
        self.best
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    /// Feeds one epoch's `val_accuracy`, returns true when training should stop.
    pub fn update(&mut self, i_epoch: usize, d_val_accuracy: f32) -> bool {
        let b_improved = match self.best {
            None => true,
            Some(d_best) => d_val_accuracy - self.min_delta > d_best,
        };
        if b_improved {
            self.best = Some(d_val_accuracy);
            self.wait = 0;
            return false;
        }
        self.wait += 1;
        if self.wait >= self.patience {
            self.stopped_epoch = Some(i_epoch);
            return true;
        }
        false
    }
}

// ---------------- History ----------------

/// Per epoch metrics, the data behind the loss / accuracy curves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub loss: Vec<f32>,
    pub accuracy: Vec<f32>,
    pub val_loss: Vec<f32>,
    pub val_accuracy: Vec<f32>,
}

/// Metrics of a single epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub loss: f32,
    pub accuracy: f32,
    pub val_loss: f32,
    pub val_accuracy: f32,
}

impl History {
    pub fn epochs(&self) -> usize {
        self.loss.len()
    }

    pub fn push(&mut self, m: EpochMetrics) {
        self.loss.push(m.loss);
        self.accuracy.push(m.accuracy);
        self.val_loss.push(m.val_loss);
        self.val_accuracy.push(m.val_accuracy);
    }

    pub fn last(&self) -> Option<EpochMetrics> {
        let i = self.epochs().checked_sub(1)?;
        Some(EpochMetrics {
            loss: self.loss[i],
            accuracy: self.accuracy[i],
            val_loss: self.val_loss[i],
            val_accuracy: self.val_accuracy[i],
        })
    }

    pub fn best_val_accuracy(&self) -> Option<f32> {
        self.val_accuracy.iter().copied().reduce(f32::max)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let w = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(w, self)?;
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let r = std::io::BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(r)?)
    }
}

// ---------------- fit ----------------

#[derive(Debug, Clone)]
pub struct FitOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub early_stopping: Option<EarlyStopping>,
    pub seed: u64,
    pub stop: Option<Arc<AtomicBool>>,
}

impl FitOptions {
    pub fn from_config(cfg: &TrainingConfig, i_batch_size: usize, seed: u64) -> Self {
        Self {
            epochs: cfg.num_epochs,
            batch_size: i_batch_size,
            learning_rate: cfg.learning_rate,
            early_stopping: EarlyStopping::from_config(&cfg.early_stopping),
            seed,
            stop: None,
        }
    }
}

/// Trains `model` and validates after every epoch.
///
/// Samples are visited in a fresh seeded order each epoch; the optimizers
/// average `batch_size` per sample gradients per update and the trailing
/// partial batch is flushed at the end of the epoch.
pub fn fit(
    model: &mut TextCnn,
    x_train: &[Vec<usize>],
    y_train: &[f32],
    x_val: &[Vec<usize>],
    y_val: &[f32],
    opts: &FitOptions,
) -> Result<History> {
    if x_train.len() != y_train.len() || x_val.len() != y_val.len() {
        return Err(CnnError::Data("feature / label row counts differ".into()));
    }
    if x_train.is_empty() || x_val.is_empty() {
        return Err(CnnError::Data("train and validation sets must not be empty".into()));
    }
    if opts.batch_size == 0 {
        return Err(CnnError::InvalidParams("batch_size must be positive".into()));
    }
    model.check_inputs(x_train)?;
    model.check_inputs(x_val)?;

    model.set_batch_accumulation(opts.batch_size);
    let mut early_stopping = opts.early_stopping.clone();
    let mut rng = ChaCha8Rng::seed_from_u64(opts.seed);
    let mut v_order: Vec<usize> = (0..x_train.len()).collect();
    let mut history = History::default();

    for i_epoch in 0..opts.epochs {
        if is_stopped(&opts.stop) {
            warn!(epoch = i_epoch, "training interrupted (Ctrl+C)");
            break;
        }
        let t_epoch_start = Instant::now();
        v_order.shuffle(&mut rng);

        model.set_train_mode(true);
        let mut v_losses: Vec<f32> = Vec::with_capacity(v_order.len());
        let mut v_probs: Vec<f32> = Vec::with_capacity(v_order.len());
        let mut v_targets: Vec<f32> = Vec::with_capacity(v_order.len());
        for &i in &v_order {
            let d_prob = model.train_step(&x_train[i], y_train[i], opts.learning_rate);
            v_losses.push(binary_cross_entropy(d_prob, y_train[i]));
            v_probs.push(d_prob);
            v_targets.push(y_train[i]);
        }
        model.flush(opts.learning_rate);

        let (d_val_loss, d_val_acc) = model.evaluate(x_val, y_val)?;
        let metrics = EpochMetrics {
            loss: mean(&v_losses),
            accuracy: accuracy(&v_probs, &v_targets),
            val_loss: d_val_loss,
            val_accuracy: d_val_acc,
        };
        history.push(metrics);

        info!(
            epoch = i_epoch + 1,
            loss = %format!("{:.4}", metrics.loss),
            accuracy = %format!("{:.4}", metrics.accuracy),
            val_loss = %format!("{:.4}", metrics.val_loss),
            val_accuracy = %format!("{:.4}", metrics.val_accuracy),
            secs = %format!("{:.2}", t_epoch_start.elapsed().as_secs_f32()),
            "epoch finished"
        );

        if let Some(es) = early_stopping.as_mut() {
            if es.update(i_epoch, d_val_acc) {
                info!(epoch = i_epoch + 1, best = ?es.best(), "early stopping");
                break;
            }
        }
    }
    model.set_train_mode(false);
    Ok(history)
}

// ---------------- Model function ----------------

/// Everything a round needs besides its parameters.
pub struct TrainContext {
    pub model_type: ModelType,
    pub vocabulary: Vocabulary,
    pub split: DataSplit,
    pub word2vec: Word2VecConfig,
    pub training: TrainingConfig,
    pub cache: Arc<EmbeddingCache>,
    pub seed: u64,
    pub stop: Option<Arc<AtomicBool>>,
}

impl TrainContext {
    pub fn word2vec_params(&self, params: &CnnParams) -> Word2VecParams {
        Word2VecParams {
            num_features: params.embedding_dim,
            min_word_count: self.word2vec.min_word_count,
            context: params.context,
            negative: self.word2vec.negative,
            sample: self.word2vec.sample,
            epochs: self.word2vec.epochs,
            learning_rate: self.word2vec.learning_rate,
            seed: self.seed,
        }
    }

    /// Padded width of the loaded data.
    pub fn data_width(&self) -> usize {
        self.split.x_train.first().map(|r| r.len()).unwrap_or(0)
    }

    /// Same context on different data (one k-fold split).
    pub fn with_split(&self, split: DataSplit) -> Self {
        Self {
            model_type: self.model_type,
            vocabulary: self.vocabulary.clone(),
            split,
            word2vec: self.word2vec.clone(),
            training: self.training.clone(),
            cache: Arc::clone(&self.cache),
            seed: self.seed,
            stop: self.stop.clone(),
        }
    }
}

/// Truncates or pads every row to `i_width`.
pub fn fit_width(x: &[Vec<usize>], i_width: usize) -> Vec<Vec<usize>> {
    x.iter()
        .map(|row| {
            let mut v: Vec<usize> = row.iter().copied().take(i_width).collect();
            v.resize(i_width, PAD_ID);
            v
        })
        .collect()
}

/// Builds and trains one model for `params`: Word2Vec embeddings (cached)
/// for the non-random model types, then fit on the context's split.
pub fn train_model(ctx: &TrainContext, params: &CnnParams) -> Result<(History, TextCnn)> {
    params.validate()?;
    info!(model_type = %ctx.model_type, "Model type is {}", ctx.model_type);

    let (x_train, x_val) = if ctx.data_width() == params.sequence_length {
        (ctx.split.x_train.clone(), ctx.split.x_val.clone())
    } else {
        debug!(from = ctx.data_width(), to = params.sequence_length, "re-padding sequences");
        (
            fit_width(&ctx.split.x_train, params.sequence_length),
            fit_width(&ctx.split.x_val, params.sequence_length),
        )
    };

    let embedding_weights: Option<Arc<Array2<f32>>> = if ctx.model_type.uses_word2vec() {
        let v_sentences: Vec<Vec<usize>> = x_train.iter().chain(x_val.iter()).cloned().collect();
        let w2v = ctx.word2vec_params(params);
        Some(ctx.cache.get_or_train(&v_sentences, &ctx.vocabulary, &w2v)?)
    } else {
        None
    };

    let mut model = TextCnn::build(
        ctx.model_type,
        ctx.vocabulary.len(),
        params,
        embedding_weights.as_deref(),
        ctx.seed,
    )?;
    debug!("\n{}", model.summary());

    let mut opts = FitOptions::from_config(&ctx.training, params.batch_size, ctx.seed);
    opts.stop = ctx.stop.clone();
    let history = fit(&mut model, &x_train, &ctx.split.y_train, &x_val, &ctx.split.y_val, &opts)?;
    Ok((history, model))
}
