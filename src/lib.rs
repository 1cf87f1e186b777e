// =============================================
// lib.rs
// =============================================
pub mod config;
pub mod error;
pub mod math;

pub mod dataset_loader;
pub mod vocabulary;
pub mod word2vec;

pub mod layers;
pub mod model;
pub mod train;

pub mod kfold;
pub mod reporting;
pub mod search;

// Re-export key structs for easier access
pub use config::{ExperimentConfig, ModelType};
pub use error::{CnnError, Result};
pub use model::{CnnParams, TextCnn};
pub use reporting::{Metric, Reporting};
pub use search::{ParamGrid, Scan, ScanResults};
pub use train::{train_model, History, TrainContext};
