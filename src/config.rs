// config.rs
// ============================================================================
// Note:     Central hyperparameters (one place for all constants) plus the
//           TOML backed experiment configuration. Every section falls back
//           to the constants below, so an empty file is a valid config.
// ============================================================================

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{CnnError, Result};

// ---------------- Model hyperparameters ----------------

pub const EMBEDDING_DIM: usize = 50;
pub const FILTER_SIZES: [usize; 2] = [3, 8];
pub const NUM_FILTERS: usize = 8;
pub const DROPOUT_PROB: (f32, f32) = (0.7, 0.9);
pub const HIDDEN_DIMS: usize = 70;

// ---------------- Training ----------------

pub const BATCH_SIZE: usize = 64;
pub const NUM_EPOCHS: usize = 50;
pub const LEARNING_RATE: f32 = 1e-3;

// ---------------- Preprocessing ----------------

pub const SEQUENCE_LENGTH: usize = 400;
pub const MAX_WORDS: usize = 5000;
pub const TRAIN_PERCENT: f64 = 0.9;
pub const SEED: u64 = 0;

// ---------------- Word2Vec ----------------

pub const MIN_WORD_COUNT: usize = 1;
pub const CONTEXT: usize = 10;

// ---------------- Data source ----------------

pub const TRAIN_DATA_PATH: &str = "Data/mturk_train.csv";
pub const TRAIN_DATA_X_COL: &str = "inputtext";
pub const TRAIN_DATA_Y_COLS: [&str; 5] = ["rating1", "rating2", "rating3", "rating4", "rating5"];

/// Kim (2014), section 3: how the embedding layer is initialised and whether
/// it keeps learning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ModelType {
    /// Random embeddings, trained with the network.
    Rand,
    /// Word2Vec initialised embeddings, fine tuned with the network.
    NonStatic,
    /// Word2Vec embeddings kept frozen.
    Static,
}

impl ModelType {
    pub fn uses_word2vec(&self) -> bool {
        matches!(self, ModelType::NonStatic | ModelType::Static)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Rand => "CNN-rand",
            ModelType::NonStatic => "CNN-non-static",
            ModelType::Static => "CNN-static",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = CnnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CNN-rand" => Ok(ModelType::Rand),
            "CNN-non-static" => Ok(ModelType::NonStatic),
            "CNN-static" => Ok(ModelType::Static),
            other => Err(CnnError::InvalidParams(format!("Unknown model type: {other}"))),
        }
    }
}

impl TryFrom<String> for ModelType {
    type Error = CnnError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ModelType> for String {
    fn from(m: ModelType) -> Self {
        m.as_str().to_string()
    }
}

// ---------------- Experiment configuration ----------------

/// Top level configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub data: DataConfig,
    pub preprocessing: PreprocessConfig,
    pub word2vec: Word2VecConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub search: SearchConfig,
}

/// Where the labeled texts come from and how they are split.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub train_path: String,
    pub x_col: String,
    pub y_cols: Vec<String>,
    /// Mean rating at or above this value is the positive class.
    pub label_threshold: f64,
    /// Share of rows used for training, the rest validates.
    pub train_percent: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub sequence_length: usize,
    pub max_words: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Word2VecConfig {
    pub min_word_count: usize,
    pub context: usize,
    pub negative: usize,
    /// Downsampling threshold for frequent words (0 disables).
    pub sample: f64,
    pub epochs: usize,
    pub learning_rate: f32,
    /// Optional directory for trained vectors, reused across runs.
    pub cache_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model_type: ModelType,
    pub embedding_dim: usize,
    pub filter_sizes: Vec<usize>,
    pub num_filters: usize,
    pub emb_drop: f32,
    pub hidden_drop: f32,
    pub hidden_dims: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub num_epochs: usize,
    pub learning_rate: f32,
    pub early_stopping: EarlyStoppingConfig,
}

/// Stop when `val_accuracy` has not improved by `min_delta` for `patience`
/// epochs. Off by default: every round trains the full `num_epochs`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStoppingConfig {
    pub enabled: bool,
    pub min_delta: f32,
    pub patience: usize,
}

/// Grid and scan settings. Every list is one axis of the grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub experiment_name: String,
    pub output_dir: String,
    pub round_limit: Option<usize>,
    pub fraction_limit: Option<f64>,
    /// Visit the grid in random order instead of declaration order.
    pub shuffle: bool,
    pub concurrency: usize,
    pub embedding_dim: Vec<usize>,
    pub context: Vec<usize>,
    /// Empty means "the actual padded width of the data".
    pub sequence_length: Vec<usize>,
    pub filter_sizes: Vec<Vec<usize>>,
    pub num_filters: Vec<usize>,
    pub emb_drop: Vec<f32>,
    pub hidden_drop: Vec<f32>,
    pub hidden_dims: Vec<usize>,
    pub batch_size: Vec<usize>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_path: TRAIN_DATA_PATH.to_string(),
            x_col: TRAIN_DATA_X_COL.to_string(),
            y_cols: TRAIN_DATA_Y_COLS.iter().map(|s| s.to_string()).collect(),
            label_threshold: 3.0,
            train_percent: TRAIN_PERCENT,
            seed: SEED,
        }
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            sequence_length: SEQUENCE_LENGTH,
            max_words: MAX_WORDS,
        }
    }
}

impl Default for Word2VecConfig {
    fn default() -> Self {
        Self {
            min_word_count: MIN_WORD_COUNT,
            context: CONTEXT,
            negative: 5,
            sample: 1e-3,
            epochs: 5,
            learning_rate: 0.025,
            cache_dir: None,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_type: ModelType::NonStatic,
            embedding_dim: EMBEDDING_DIM,
            filter_sizes: FILTER_SIZES.to_vec(),
            num_filters: NUM_FILTERS,
            emb_drop: DROPOUT_PROB.0,
            hidden_drop: DROPOUT_PROB.1,
            hidden_dims: HIDDEN_DIMS,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: BATCH_SIZE,
            num_epochs: NUM_EPOCHS,
            learning_rate: LEARNING_RATE,
            early_stopping: EarlyStoppingConfig::default(),
        }
    }
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_delta: 0.01,
            patience: 4,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            experiment_name: "w2v_cnn_optimize".to_string(),
            output_dir: "output".to_string(),
            round_limit: None,
            fraction_limit: None,
            shuffle: false,
            concurrency: 1,
            embedding_dim: vec![20, 50, 100],
            context: vec![5, 10, 15],
            sequence_length: Vec::new(),
            filter_sizes: vec![vec![3, 8], vec![2, 3, 8]],
            num_filters: vec![8, 10, 30, 100],
            emb_drop: vec![0.5, 0.7, 0.9],
            hidden_drop: vec![0.7, 0.9, 0.95],
            hidden_dims: vec![70, 140],
            batch_size: vec![64, 128],
        }
    }
}

impl ExperimentConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ExperimentConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Like [`ExperimentConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_type_parses_all_variants() {
        assert_eq!("CNN-rand".parse::<ModelType>().unwrap(), ModelType::Rand);
        assert_eq!("CNN-non-static".parse::<ModelType>().unwrap(), ModelType::NonStatic);
        assert_eq!("CNN-static".parse::<ModelType>().unwrap(), ModelType::Static);
        assert!(matches!(
            "CNN-dynamic".parse::<ModelType>(),
            Err(CnnError::InvalidParams(_))
        ));
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg: ExperimentConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.model.model_type, ModelType::NonStatic);
        assert_eq!(cfg.preprocessing.sequence_length, SEQUENCE_LENGTH);
        assert_eq!(cfg.search.num_filters, vec![8, 10, 30, 100]);
        assert_eq!(cfg.training.early_stopping, EarlyStoppingConfig::default());
        assert!(!cfg.training.early_stopping.enabled);
        assert_eq!(cfg.training.early_stopping.patience, 4);
    }

    #[test]
    fn partial_sections_override_single_fields() {
        let cfg: ExperimentConfig = toml::from_str(
            r#"
            [model]
            model_type = "CNN-static"

            [training.early_stopping]
            enabled = true

            [search]
            batch_size = [32]
            round_limit = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.model.model_type, ModelType::Static);
        assert_eq!(cfg.model.hidden_dims, HIDDEN_DIMS);
        assert_eq!(cfg.search.batch_size, vec![32]);
        assert_eq!(cfg.search.round_limit, Some(3));
        assert!(cfg.training.early_stopping.enabled);
        assert_eq!(cfg.training.early_stopping.patience, 4);
        assert_eq!(cfg.search.embedding_dim, vec![20, 50, 100]);
    }

    #[test]
    fn unknown_model_type_is_rejected() {
        let res: std::result::Result<ExperimentConfig, _> =
            toml::from_str("[model]\nmodel_type = \"CNN-multichannel\"\n");
        assert!(res.is_err());
    }
}
