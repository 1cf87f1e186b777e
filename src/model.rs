// model.rs
// ============================================================================
// Note:     Text CNN: Embedding -> Dropout -> parallel Conv1D/MaxPool blocks
//           -> Dropout -> Dense(ReLU) -> Dense(1) + sigmoid. One network per
//           parameter set, checkpointed layer by layer with bincode.
// ============================================================================

#![forbid(unsafe_code)]

use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

use crate::config::{ModelConfig, ModelType, TrainingConfig, Word2VecConfig};
use crate::error::{CnnError, Result};
use crate::layers::{Activation, Dense, Dropout, Embedding, Layer, ParallelConv, POOL_SIZE};
use crate::math::{accuracy, binary_cross_entropy, sigmoid, uniform_init};

/// Limit of the uniform initialiser for randomly initialised embeddings.
const RAND_EMBEDDING_LIMIT: f32 = 0.05;

// ---------------- Parameters ----------------

/// One point of the search grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CnnParams {
    pub embedding_dim: usize,
    /// Word2Vec context window; unused by `CNN-rand`.
    pub context: usize,
    pub sequence_length: usize,
    pub filter_sizes: Vec<usize>,
    pub num_filters: usize,
    pub emb_drop: f32,
    pub hidden_drop: f32,
    pub hidden_dims: usize,
    pub batch_size: usize,
}

impl CnnParams {
    pub fn from_config(
        model: &ModelConfig,
        word2vec: &Word2VecConfig,
        training: &TrainingConfig,
        i_sequence_length: usize,
    ) -> Self {
        Self {
            embedding_dim: model.embedding_dim,
            context: word2vec.context,
            sequence_length: i_sequence_length,
            filter_sizes: model.filter_sizes.clone(),
            num_filters: model.num_filters,
            emb_drop: model.emb_drop,
            hidden_drop: model.hidden_drop,
            hidden_dims: model.hidden_dims,
            batch_size: training.batch_size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("embedding_dim", self.embedding_dim),
            ("sequence_length", self.sequence_length),
            ("num_filters", self.num_filters),
            ("hidden_dims", self.hidden_dims),
            ("batch_size", self.batch_size),
        ];
        for (s_name, i_val) in positive {
            if i_val == 0 {
                return Err(CnnError::InvalidParams(format!("{s_name} must be positive")));
            }
        }
        if self.filter_sizes.is_empty() {
            return Err(CnnError::InvalidParams("filter_sizes must not be empty".into()));
        }
        for &k in &self.filter_sizes {
            // valid conv length (seq - k + 1) must survive pooling
            if k == 0 || self.sequence_length + 1 < k + POOL_SIZE {
                return Err(CnnError::InvalidParams(format!(
                    "filter size {} does not fit sequence length {}",
                    k, self.sequence_length
                )));
            }
        }
        for (s_name, f_rate) in [("emb_drop", self.emb_drop), ("hidden_drop", self.hidden_drop)] {
            if !(0.0..1.0).contains(&f_rate) {
                return Err(CnnError::InvalidParams(format!(
                    "{s_name} must be in [0, 1), got {f_rate}"
                )));
            }
        }
        Ok(())
    }

    /// Compact one-line form for logs and result tables.
    pub fn filter_sizes_label(&self) -> String {
        let v: Vec<String> = self.filter_sizes.iter().map(|k| k.to_string()).collect();
        format!("({})", v.join(","))
    }
}

// ---------------- Network ----------------

#[derive(Serialize, Deserialize)]
struct CheckpointHeader {
    model_type: ModelType,
    vocab_size: usize,
    params: CnnParams,
}

pub struct TextCnn {
    pub model_type: ModelType,
    pub params: CnnParams,
    pub network: Vec<Box<dyn Layer>>,
}

impl TextCnn {
    /// Builds the network. Word2Vec model types need `embedding_weights` of
    /// shape `[vocab_size, embedding_dim]`; `CNN-rand` ignores them.
    pub fn build(
        model_type: ModelType,
        i_vocab_size: usize,
        params: &CnnParams,
        embedding_weights: Option<&Array2<f32>>,
        seed: u64,
    ) -> Result<Self> {
        params.validate()?;
        if i_vocab_size == 0 {
            return Err(CnnError::InvalidParams("vocabulary is empty".into()));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let i_dim = params.embedding_dim;

        let embedding = match (model_type, embedding_weights) {
            (ModelType::Rand, _) => Embedding::new(
                uniform_init((i_vocab_size, i_dim), RAND_EMBEDDING_LIMIT, &mut rng),
                true,
            ),
            (_, Some(w)) => {
                if w.dim() != (i_vocab_size, i_dim) {
                    return Err(CnnError::InvalidParams(format!(
                        "embedding weights have shape {:?}, expected ({}, {})",
                        w.dim(),
                        i_vocab_size,
                        i_dim
                    )));
                }
                info!(shape = ?w.dim(), "Initializing embedding layer with word2vec weights");
                Embedding::new(w.clone(), model_type == ModelType::NonStatic)
            }
            (_, None) => {
                return Err(CnnError::InvalidParams(format!(
                    "{} requires word2vec embedding weights",
                    model_type
                )))
            }
        };

        let conv = ParallelConv::new(&params.filter_sizes, params.num_filters, i_dim, &mut rng);
        let (_, i_flat) = conv.output_shape((params.sequence_length, i_dim));

        let network: Vec<Box<dyn Layer>> = vec![
            Box::new(embedding),
            Box::new(Dropout::new(params.emb_drop, seed.wrapping_add(1))),
            Box::new(conv),
            Box::new(Dropout::new(params.hidden_drop, seed.wrapping_add(2))),
            Box::new(Dense::new(i_flat, params.hidden_dims, Activation::Relu, &mut rng)),
            Box::new(Dense::new(params.hidden_dims, 1, Activation::Linear, &mut rng)),
        ];

        Ok(Self {
            model_type,
            params: params.clone(),
            network,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.embedding().map(|e| e.vocab_size()).unwrap_or(0)
    }

    pub fn embedding(&self) -> Option<&Embedding> {
        self.network.first().and_then(|l| l.as_any().downcast_ref::<Embedding>())
    }

    pub fn total_parameters(&self) -> usize {
        self.network.iter().map(|l| l.parameter_count()).sum()
    }

    /// Parameters updated by training (a frozen embedding is excluded).
    pub fn trainable_parameters(&self) -> usize {
        let i_frozen = match self.embedding() {
            Some(e) if !e.trainable => e.parameter_count(),
            _ => 0,
        };
        self.total_parameters() - i_frozen
    }

    /// Layer table with output shapes and parameter counts.
    pub fn summary(&self) -> String {
        let mut s_out = format!("Model: {}\n", self.model_type);
        s_out.push_str(&format!("{:<16}{:<16}{:>12}\n", "Layer (type)", "Output Shape", "Param #"));
        s_out.push_str(&"=".repeat(44));
        s_out.push('\n');

        let mut shape = (1, self.params.sequence_length);
        s_out.push_str(&format!("{:<16}{:<16}{:>12}\n", "Input", format!("{:?}", shape), 0));
        for layer in &self.network {
            shape = layer.output_shape(shape);
            s_out.push_str(&format!(
                "{:<16}{:<16}{:>12}\n",
                layer.layer_type(),
                format!("{:?}", shape),
                layer.parameter_count()
            ));
        }
        s_out.push_str(&"=".repeat(44));
        s_out.push('\n');
        s_out.push_str(&format!("Total params: {}\n", self.total_parameters()));
        s_out.push_str(&format!("Trainable params: {}\n", self.trainable_parameters()));
        s_out
    }

    // ---------------- Training hooks ----------------

    pub fn set_train_mode(&mut self, b_train: bool) {
        for layer in &mut self.network {
            layer.set_train_mode(b_train);
        }
    }

    pub fn set_batch_accumulation(&mut self, i_batch_size: usize) {
        let i_steps = i_batch_size.max(1);
        for layer in &mut self.network {
            layer.set_accumulate_steps(i_steps);
        }
    }

    pub fn flush(&mut self, d_lr: f32) {
        for layer in &mut self.network {
            layer.flush(d_lr);
        }
    }

    /// Checks width and id range of every row before it reaches the layers.
    pub fn check_inputs(&self, x: &[Vec<usize>]) -> Result<()> {
        let i_vocab = self.vocab_size();
        for (i_row, v_ids) in x.iter().enumerate() {
            if v_ids.len() != self.params.sequence_length {
                return Err(CnnError::Data(format!(
                    "row {} has length {}, model expects {}",
                    i_row,
                    v_ids.len(),
                    self.params.sequence_length
                )));
            }
            if let Some(&i_bad) = v_ids.iter().find(|&&i| i >= i_vocab) {
                return Err(CnnError::Data(format!(
                    "row {} holds id {} outside vocabulary of {}",
                    i_row, i_bad, i_vocab
                )));
            }
        }
        Ok(())
    }

    fn forward_logit(&mut self, v_ids: &[usize]) -> f32 {
        let mut a_forward =
            Array2::from_shape_fn((1, v_ids.len()), |(_, j)| v_ids[j] as f32);
        for layer in &mut self.network {
            a_forward = layer.forward(&a_forward);
        }
        a_forward[(0, 0)]
    }

    /// One forward/backward pass on a single sample. Returns the predicted
    /// probability; weights move once the batch accumulation is full.
    pub fn train_step(&mut self, v_ids: &[usize], d_target: f32, d_lr: f32) -> f32 {
        let d_prob = sigmoid(self.forward_logit(v_ids));
        // d BCE / d logit for a sigmoid output
        let mut a_grads = Array2::from_elem((1, 1), d_prob - d_target);
        for layer in self.network.iter_mut().rev() {
            a_grads = layer.backward(&a_grads, d_lr);
        }
        d_prob
    }

    /// Positive class probabilities in evaluation mode.
    pub fn predict_proba(&mut self, x: &[Vec<usize>]) -> Result<Vec<f32>> {
        self.check_inputs(x)?;
        self.set_train_mode(false);
        let v_probs = x.iter().map(|v_ids| sigmoid(self.forward_logit(v_ids))).collect();
        Ok(v_probs)
    }

    /// Mean binary cross entropy and accuracy.
    pub fn evaluate(&mut self, x: &[Vec<usize>], y: &[f32]) -> Result<(f32, f32)> {
        if x.len() != y.len() {
            return Err(CnnError::Data(format!("x has {} rows but y has {}", x.len(), y.len())));
        }
        if x.is_empty() {
            return Err(CnnError::Data("cannot evaluate on an empty set".into()));
        }
        let v_probs = self.predict_proba(x)?;
        let d_loss = v_probs
            .iter()
            .zip(y.iter())
            .map(|(&p, &t)| binary_cross_entropy(p, t))
            .sum::<f32>()
            / x.len() as f32;
        Ok((d_loss, accuracy(&v_probs, y)))
    }

    // ---------------- Checkpoints ----------------

    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let f = File::create(path)?;
        let mut w = BufWriter::with_capacity(8 * 1024 * 1024, f);
        let cfg = bincode::config::standard();

        let header = CheckpointHeader {
            model_type: self.model_type,
            vocab_size: self.vocab_size(),
            params: self.params.clone(),
        };
        bincode::serde::encode_into_std_write(&header, &mut w, cfg)?;

        for layer in &self.network {
            let any = layer.as_any();
            if let Some(l) = any.downcast_ref::<Embedding>() {
                bincode::serde::encode_into_std_write(l, &mut w, cfg)?;
            } else if let Some(l) = any.downcast_ref::<Dropout>() {
                bincode::serde::encode_into_std_write(l, &mut w, cfg)?;
            } else if let Some(l) = any.downcast_ref::<ParallelConv>() {
                bincode::serde::encode_into_std_write(l, &mut w, cfg)?;
            } else if let Some(l) = any.downcast_ref::<Dense>() {
                bincode::serde::encode_into_std_write(l, &mut w, cfg)?;
            } else {
                return Err(CnnError::Checkpoint(format!(
                    "unknown layer type {}",
                    layer.layer_type()
                )));
            }
        }
        w.flush()?;
        info!(path = %path.display(), "checkpoint saved");
        Ok(())
    }

    pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let f = File::open(path)?;
        let mut r = BufReader::with_capacity(8 * 1024 * 1024, f);
        let cfg = bincode::config::standard();

        let header: CheckpointHeader = bincode::serde::decode_from_std_read(&mut r, cfg)?;
        let placeholder = Array2::zeros((header.vocab_size, header.params.embedding_dim));
        let mut model = Self::build(
            header.model_type,
            header.vocab_size,
            &header.params,
            Some(&placeholder),
            0,
        )?;

        for layer in &mut model.network {
            let v_expected = layer.param_shapes();
            let any = layer.as_any_mut();
            if let Some(l) = any.downcast_mut::<Embedding>() {
                *l = bincode::serde::decode_from_std_read(&mut r, cfg)?;
            } else if let Some(l) = any.downcast_mut::<Dropout>() {
                *l = bincode::serde::decode_from_std_read(&mut r, cfg)?;
            } else if let Some(l) = any.downcast_mut::<ParallelConv>() {
                *l = bincode::serde::decode_from_std_read(&mut r, cfg)?;
            } else if let Some(l) = any.downcast_mut::<Dense>() {
                *l = bincode::serde::decode_from_std_read(&mut r, cfg)?;
            } else {
                return Err(CnnError::Checkpoint("unknown layer type while loading".into()));
            }
            if layer.param_shapes() != v_expected {
                return Err(CnnError::Checkpoint(format!(
                    "{} layer shapes {:?} do not match the header, expected {:?}",
                    layer.layer_type(),
                    layer.param_shapes(),
                    v_expected
                )));
            }
        }
        info!(path = %path.display(), model_type = %model.model_type, "checkpoint loaded");
        Ok(model)
    }
}

/// Kernel sizes of the first `ParallelConv` block, mostly for diagnostics.
pub fn conv_kernels(model: &TextCnn) -> Vec<usize> {
    model
        .network
        .iter()
        .find_map(|l| l.as_any().downcast_ref::<ParallelConv>())
        .map(|pc| pc.kernel_sizes())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> CnnParams {
        CnnParams {
            embedding_dim: 4,
            context: 2,
            sequence_length: 10,
            filter_sizes: vec![3, 8],
            num_filters: 2,
            emb_drop: 0.5,
            hidden_drop: 0.5,
            hidden_dims: 3,
            batch_size: 2,
        }
    }

    #[test]
    fn validation_rejects_oversized_kernel() {
        let mut p = params();
        assert!(p.validate().is_ok());
        p.filter_sizes = vec![10];
        assert!(matches!(p.validate(), Err(CnnError::InvalidParams(_))));
    }

    #[test]
    fn validation_rejects_bad_dropout_and_empty_filters() {
        let mut p = params();
        p.emb_drop = 1.0;
        assert!(p.validate().is_err());
        let mut p = params();
        p.filter_sizes.clear();
        assert!(p.validate().is_err());
        let mut p = params();
        p.batch_size = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn word2vec_types_require_weights_of_right_shape() {
        let p = params();
        assert!(TextCnn::build(ModelType::NonStatic, 6, &p, None, 0).is_err());
        let w = Array2::zeros((6, 5));
        assert!(TextCnn::build(ModelType::Static, 6, &p, Some(&w), 0).is_err());
        let w = Array2::zeros((6, 4));
        assert!(TextCnn::build(ModelType::Static, 6, &p, Some(&w), 0).is_ok());
    }

    #[test]
    fn summary_reports_shapes_and_counts() {
        let model = TextCnn::build(ModelType::Rand, 6, &params(), None, 0).unwrap();
        // conv 3: (10-3+1)/2 = 4 -> 8, conv 8: (10-8+1)/2 = 1 -> 2, flat = 10
        let i_expected = 6 * 4 + (3 * 4 * 2 + 2) + (8 * 4 * 2 + 2) + (10 * 3 + 3) + (3 + 1);
        assert_eq!(model.total_parameters(), i_expected);
        let s = model.summary();
        assert!(s.contains("ParallelConv"));
        assert!(s.contains("(1, 10)"));
        assert!(s.contains(&format!("Total params: {}", i_expected)));
        assert_eq!(conv_kernels(&model), vec![3, 8]);
    }

    #[test]
    fn static_model_keeps_embedding_frozen() {
        let p = params();
        let w = Array2::from_elem((6, 4), 0.1f32);
        let mut model = TextCnn::build(ModelType::Static, 6, &p, Some(&w), 0).unwrap();
        assert_eq!(model.trainable_parameters(), model.total_parameters() - 24);
        model.set_batch_accumulation(1);
        model.set_train_mode(true);
        for _ in 0..3 {
            model.train_step(&[2, 3, 4, 5, 0, 0, 0, 0, 0, 0], 1.0, 0.01);
        }
        assert_eq!(model.embedding().unwrap().weights, w);
    }

    #[test]
    fn training_reduces_loss_on_separable_toy_data() {
        let mut p = params();
        p.emb_drop = 0.0;
        p.hidden_drop = 0.0;
        p.batch_size = 1;
        p.num_filters = 8;
        p.hidden_dims = 8;
        let mut model = TextCnn::build(ModelType::Rand, 6, &p, None, 3).unwrap();
        let x = vec![vec![2; 10], vec![3; 10]];
        let y = vec![1.0, 0.0];
        let (d_before, _) = model.evaluate(&x, &y).unwrap();
        model.set_batch_accumulation(1);
        for _ in 0..150 {
            model.set_train_mode(true);
            for (v, &t) in x.iter().zip(y.iter()) {
                model.train_step(v, t, 0.01);
            }
        }
        let (d_after, d_acc) = model.evaluate(&x, &y).unwrap();
        assert!(d_after < d_before, "{d_after} !< {d_before}");
        assert_eq!(d_acc, 1.0);
    }

    #[test]
    fn rejects_rows_of_wrong_width_or_unknown_ids() {
        let mut model = TextCnn::build(ModelType::Rand, 6, &params(), None, 0).unwrap();
        assert!(model.predict_proba(&[vec![0; 9]]).is_err());
        assert!(model.predict_proba(&[vec![6; 10]]).is_err());
        assert_eq!(model.predict_proba(&[vec![1; 10]]).unwrap().len(), 1);
    }

    #[test]
    fn checkpoint_round_trip_preserves_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let mut model = TextCnn::build(ModelType::Rand, 6, &params(), None, 11).unwrap();
        let x = vec![vec![2, 3, 4, 5, 1, 0, 0, 0, 0, 0]];
        let before = model.predict_proba(&x).unwrap();
        model.save_checkpoint(&path).unwrap();

        let mut loaded = TextCnn::load_checkpoint(&path).unwrap();
        assert_eq!(loaded.params, model.params);
        assert_eq!(loaded.model_type, ModelType::Rand);
        let after = loaded.predict_proba(&x).unwrap();
        assert!((before[0] - after[0]).abs() < 1e-6);
    }

    #[test]
    fn checkpoint_with_mismatched_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let model = TextCnn::build(ModelType::Rand, 6, &params(), None, 3).unwrap();
        model.save_checkpoint(&path).unwrap();

        // header claims a larger vocabulary than the stored embedding
        let cfg = bincode::config::standard();
        let header = |i_vocab| CheckpointHeader {
            model_type: ModelType::Rand,
            vocab_size: i_vocab,
            params: params(),
        };
        let i_header_len = bincode::serde::encode_to_vec(header(6), cfg).unwrap().len();
        let bytes = std::fs::read(&path).unwrap();
        let mut corrupt = bincode::serde::encode_to_vec(header(9), cfg).unwrap();
        corrupt.extend_from_slice(&bytes[i_header_len..]);
        let bad = dir.path().join("bad.bin");
        std::fs::write(&bad, corrupt).unwrap();

        assert!(matches!(TextCnn::load_checkpoint(&bad), Err(CnnError::Checkpoint(_))));
    }
}
