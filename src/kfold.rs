// kfold.rs
// ============================================================================
// Note:     K fold cross validation: contiguous, unshuffled folds over the
//           full dataset, one freshly trained model per fold.
// ============================================================================

#![forbid(unsafe_code)]

use std::sync::atomic::Ordering as AtomicOrdering;
use tracing::{info, warn};

use crate::dataset_loader::DataSplit;
use crate::error::{CnnError, Result};
use crate::math::mean;
use crate::model::CnnParams;
use crate::train::{train_model, TrainContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KFold {
    pub n_splits: usize,
}

impl KFold {
    pub fn new(n_splits: usize) -> Result<Self> {
        if n_splits < 2 {
            return Err(CnnError::InvalidParams(format!(
                "n_splits must be at least 2, got {n_splits}"
            )));
        }
        Ok(Self { n_splits })
    }

    /// `(train, test)` index pairs. The first `n % k` folds hold one extra
    /// test sample.
    pub fn split(&self, n: usize) -> Result<Vec<(Vec<usize>, Vec<usize>)>> {
        if n < self.n_splits {
            return Err(CnnError::Data(format!(
                "cannot split {} samples into {} folds",
                n, self.n_splits
            )));
        }
        let i_base = n / self.n_splits;
        let i_extra = n % self.n_splits;

        let mut v_folds = Vec::with_capacity(self.n_splits);
        let mut i_start = 0;
        for i_fold in 0..self.n_splits {
            let i_size = i_base + usize::from(i_fold < i_extra);
            let i_stop = i_start + i_size;
            let v_test: Vec<usize> = (i_start..i_stop).collect();
            let v_train: Vec<usize> = (0..i_start).chain(i_stop..n).collect();
            v_folds.push((v_train, v_test));
            i_start = i_stop;
        }
        Ok(v_folds)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FoldScore {
    pub fold: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub epochs: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrossValidation {
    pub folds: Vec<FoldScore>,
}

impl CrossValidation {
    pub fn mean_loss(&self) -> f32 {
        mean(&self.folds.iter().map(|f| f.loss).collect::<Vec<_>>())
    }

    pub fn mean_accuracy(&self) -> f32 {
        mean(&self.folds.iter().map(|f| f.accuracy).collect::<Vec<_>>())
    }
}

fn take(x: &[Vec<usize>], y: &[f32], v_idx: &[usize]) -> (Vec<Vec<usize>>, Vec<f32>) {
    (
        v_idx.iter().map(|&i| x[i].clone()).collect(),
        v_idx.iter().map(|&i| y[i]).collect(),
    )
}

/// Trains one model per fold with `params` and scores it on the held out
/// fold. `ctx` supplies vocabulary, model type and training settings; its
/// own split is ignored.
pub fn cross_validate(
    ctx: &TrainContext,
    x: &[Vec<usize>],
    y: &[f32],
    params: &CnnParams,
    n_splits: usize,
) -> Result<CrossValidation> {
    if x.len() != y.len() {
        return Err(CnnError::Data(format!("x has {} rows but y has {}", x.len(), y.len())));
    }
    let kfold = KFold::new(n_splits)?;
    let mut folds = Vec::with_capacity(n_splits);

    for (i_fold, (v_train, v_test)) in kfold.split(x.len())?.into_iter().enumerate() {
        if ctx.stop.as_ref().is_some_and(|f| f.load(AtomicOrdering::Relaxed)) {
            warn!(completed = folds.len(), "cross validation interrupted (Ctrl+C)");
            break;
        }
        info!(fold = i_fold + 1, of = n_splits, "Training on kfold {}...", i_fold + 1);

        let (x_train, y_train) = take(x, y, &v_train);
        let (x_val, y_val) = take(x, y, &v_test);
        let fold_ctx = ctx.with_split(DataSplit { x_train, y_train, x_val, y_val });

        let (history, mut model) = train_model(&fold_ctx, params)?;
        let x_eval = crate::train::fit_width(&fold_ctx.split.x_val, params.sequence_length);
        let (d_loss, d_acc) = model.evaluate(&x_eval, &fold_ctx.split.y_val)?;
        info!(fold = i_fold + 1, loss = %format!("{:.4}", d_loss), accuracy = %format!("{:.4}", d_acc), "fold scored");

        folds.push(FoldScore {
            fold: i_fold,
            loss: d_loss,
            accuracy: d_acc,
            epochs: history.epochs(),
        });
    }

    if folds.is_empty() {
        return Err(CnnError::Cancelled { completed: 0 });
    }
    let cv = CrossValidation { folds };
    info!(
        folds = cv.folds.len(),
        mean_loss = %format!("{:.4}", cv.mean_loss()),
        mean_accuracy = %format!("{:.4}", cv.mean_accuracy()),
        "cross validation finished"
    );
    Ok(cv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelType, TrainingConfig, Word2VecConfig};
    use crate::vocabulary::IndexedCorpus;
    use crate::word2vec::EmbeddingCache;
    use std::sync::Arc;

    #[test]
    fn folds_are_contiguous_and_cover_everything() {
        let folds = KFold::new(3).unwrap().split(10).unwrap();
        assert_eq!(folds.len(), 3);
        assert_eq!(folds[0].1, vec![0, 1, 2, 3]);
        assert_eq!(folds[1].1, vec![4, 5, 6]);
        assert_eq!(folds[2].1, vec![7, 8, 9]);
        assert_eq!(folds[1].0, vec![0, 1, 2, 3, 7, 8, 9]);

        let mut all: Vec<usize> = folds.iter().flat_map(|(_, t)| t.clone()).collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn invalid_fold_counts_are_rejected() {
        assert!(KFold::new(1).is_err());
        assert!(KFold::new(5).unwrap().split(4).is_err());
    }

    #[test]
    fn cross_validation_scores_every_fold() {
        let texts: Vec<String> = (0..20)
            .map(|i| if i % 2 == 0 { "good great fine nice film here" } else { "bad awful poor dull film here" })
            .map(String::from)
            .collect();
        let labels: Vec<f32> = (0..20).map(|i| if i % 2 == 0 { 1.0 } else { 0.0 }).collect();
        let corpus = IndexedCorpus::from_texts(&texts, 400, 50).unwrap();
        let i_width = corpus.width;

        let ctx = TrainContext {
            model_type: ModelType::Rand,
            vocabulary: corpus.vocabulary.clone(),
            split: DataSplit { x_train: Vec::new(), y_train: Vec::new(), x_val: Vec::new(), y_val: Vec::new() },
            word2vec: Word2VecConfig::default(),
            training: TrainingConfig { num_epochs: 2, batch_size: 4, ..TrainingConfig::default() },
            cache: Arc::new(EmbeddingCache::in_memory()),
            seed: 0,
            stop: None,
        };
        let params = CnnParams {
            embedding_dim: 6,
            context: 3,
            sequence_length: i_width,
            filter_sizes: vec![2, 3],
            num_filters: 3,
            emb_drop: 0.2,
            hidden_drop: 0.2,
            hidden_dims: 5,
            batch_size: 4,
        };
        let cv = cross_validate(&ctx, &corpus.sequences, &labels, &params, 4).unwrap();
        assert_eq!(cv.folds.len(), 4);
        assert!(cv.folds.iter().all(|f| f.epochs >= 1 && (0.0..=1.0).contains(&f.accuracy)));
        assert!(cv.mean_loss().is_finite());
    }
}
