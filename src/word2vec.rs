// word2vec.rs
// ============================================================================
// Note:     CBOW Word2Vec with negative sampling on index sentences. Produces
//           one vector per vocabulary entry, used to initialise (or freeze)
//           the CNN embedding layer. Trained matrices are cached per
//           (features, min count, context) in memory and optionally on disk.
// History:
//  - Frequent word subsampling and reduced windows follow the reference C
//    implementation; words below min count get U(-0.25, 0.25) vectors.
// ============================================================================

#![forbid(unsafe_code)]

use ndarray::{Array1, Array2};
use rand::distributions::WeightedIndex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::Distribution;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CnnError, Result};
use crate::math::{sigmoid, uniform_init};
use crate::vocabulary::{Vocabulary, PAD_ID, UNK_ID};

#[derive(Debug, Clone, PartialEq)]
pub struct Word2VecParams {
    pub num_features: usize,
    pub min_word_count: usize,
    /// Maximum distance between target and context word.
    pub context: usize,
    pub negative: usize,
    pub sample: f64,
    pub epochs: usize,
    pub learning_rate: f32,
    pub seed: u64,
}

impl Default for Word2VecParams {
    fn default() -> Self {
        Self {
            num_features: crate::config::EMBEDDING_DIM,
            min_word_count: crate::config::MIN_WORD_COUNT,
            context: crate::config::CONTEXT,
            negative: 5,
            sample: 1e-3,
            epochs: 5,
            learning_rate: 0.025,
            seed: crate::config::SEED,
        }
    }
}

impl Word2VecParams {
    /// File stem of a cached model, e.g. `50features_1minwords_10context`.
    pub fn model_name(&self) -> String {
        format!(
            "{}features_{}minwords_{}context",
            self.num_features, self.min_word_count, self.context
        )
    }
}

/// Trains embeddings for `vocabulary` on the given id sentences.
///
/// Returns a `[vocab_size, num_features]` matrix. Rows for padding, unknown
/// and too rare words are drawn from U(-0.25, 0.25).
pub fn train_word2vec(
    v_sentences: &[Vec<usize>],
    vocabulary: &Vocabulary,
    params: &Word2VecParams,
) -> Result<Array2<f32>> {
    if params.num_features == 0 {
        return Err(CnnError::InvalidParams("num_features must be positive".into()));
    }
    if params.context == 0 {
        return Err(CnnError::InvalidParams("context must be positive".into()));
    }

    let t_start = Instant::now();
    let i_vocab = vocabulary.len();
    let i_dim = params.num_features;
    let mut rng = ChaCha8Rng::seed_from_u64(params.seed);

    // ---------------- Frequencies ----------------
    let mut v_counts = vec![0usize; i_vocab];
    for v_sent in v_sentences {
        for &i_id in v_sent {
            if i_id < i_vocab {
                v_counts[i_id] += 1;
            }
        }
    }
    let v_trainable: Vec<bool> = (0..i_vocab)
        .map(|i| i != PAD_ID && i != UNK_ID && v_counts[i] >= params.min_word_count.max(1))
        .collect();
    let i_total_words: usize = (0..i_vocab).filter(|&i| v_trainable[i]).map(|i| v_counts[i]).sum();

    // fallback rows for everything the model never learns
    let mut m_out = uniform_init((i_vocab, i_dim), 0.25, &mut rng);
    if i_total_words == 0 {
        warn!("no word reaches min_word_count, embeddings stay random");
        return Ok(m_out);
    }

    // ---------------- Noise distribution (unigram^0.75) ----------------
    let v_noise_weights: Vec<f64> = (0..i_vocab)
        .map(|i| if v_trainable[i] { (v_counts[i] as f64).powf(0.75) } else { 0.0 })
        .collect();
    let noise = WeightedIndex::new(&v_noise_weights)
        .map_err(|e| CnnError::Data(format!("noise distribution: {e}")))?;

    // ---------------- Parameters ----------------
    let d_init = 0.5 / i_dim as f32;
    let mut syn0 = uniform_init((i_vocab, i_dim), d_init, &mut rng);
    let mut syn1neg = Array2::<f32>::zeros((i_vocab, i_dim));

    let d_threshold = params.sample * i_total_words as f64;
    let i_planned = (i_total_words * params.epochs.max(1)) as f64;
    let mut i_processed: usize = 0;

    let mut a_hidden = Array1::<f32>::zeros(i_dim);
    let mut a_err = Array1::<f32>::zeros(i_dim);

    for i_epoch in 0..params.epochs.max(1) {
        let mut d_loss = 0.0f64;
        let mut i_updates: usize = 0;

        for v_sent in v_sentences {
            // drop padding / rare words, subsample frequent ones
            let v_kept: Vec<usize> = v_sent
                .iter()
                .copied()
                .filter(|&i| i < i_vocab && v_trainable[i])
                .filter(|&i| {
                    if d_threshold <= 0.0 {
                        return true;
                    }
                    let d_freq = v_counts[i] as f64;
                    let d_keep = ((d_freq / d_threshold).sqrt() + 1.0) * d_threshold / d_freq;
                    d_keep >= 1.0 || rng.gen::<f64>() < d_keep
                })
                .collect();
            i_processed += v_sent.iter().filter(|&&i| i < i_vocab && v_trainable[i]).count();

            let d_progress = (i_processed as f64 / i_planned).min(1.0) as f32;
            let d_alpha = (params.learning_rate * (1.0 - d_progress)).max(params.learning_rate * 1e-4);

            for i_pos in 0..v_kept.len() {
                let i_reduce = rng.gen_range(0..params.context);
                let i_window = params.context - i_reduce;
                let i_lo = i_pos.saturating_sub(i_window);
                let i_hi = (i_pos + i_window).min(v_kept.len() - 1);

                let v_ctx: Vec<usize> = (i_lo..=i_hi).filter(|&j| j != i_pos).map(|j| v_kept[j]).collect();
                if v_ctx.is_empty() {
                    continue;
                }

                a_hidden.fill(0.0);
                for &i_c in &v_ctx {
                    a_hidden += &syn0.row(i_c);
                }
                a_hidden /= v_ctx.len() as f32;
                a_err.fill(0.0);

                let i_target = v_kept[i_pos];
                for i_neg in 0..=params.negative {
                    let (i_word, d_label) = if i_neg == 0 {
                        (i_target, 1.0f32)
                    } else {
                        let i_sample = noise.sample(&mut rng);
                        if i_sample == i_target {
                            continue;
                        }
                        (i_sample, 0.0f32)
                    };

                    let d_f = sigmoid(a_hidden.dot(&syn1neg.row(i_word)));
                    let d_g = (d_label - d_f) * d_alpha;
                    d_loss -= if d_label > 0.5 {
                        (d_f.max(1e-7) as f64).ln()
                    } else {
                        ((1.0 - d_f).max(1e-7) as f64).ln()
                    };

                    a_err.scaled_add(d_g, &syn1neg.row(i_word));
                    let mut row = syn1neg.row_mut(i_word);
                    row.scaled_add(d_g, &a_hidden);
                }

                for &i_c in &v_ctx {
                    let mut row = syn0.row_mut(i_c);
                    row += &a_err;
                }
                i_updates += 1;
            }
        }

        debug!(
            epoch = i_epoch,
            updates = i_updates,
            loss = %format!("{:.4}", d_loss / i_updates.max(1) as f64),
            "word2vec epoch"
        );
    }

    for i in 0..i_vocab {
        if v_trainable[i] {
            m_out.row_mut(i).assign(&syn0.row(i));
        }
    }

    info!(
        model = %params.model_name(),
        vocab = i_vocab,
        trained_words = v_trainable.iter().filter(|&&b| b).count(),
        secs = %format!("{:.2}", t_start.elapsed().as_secs_f32()),
        "trained word2vec embeddings"
    );
    Ok(m_out)
}

/// One cache entry; its lock is held while the matrix is loaded or trained,
/// so concurrent rounds with the same key train it once.
type Slot = Arc<Mutex<Option<Arc<Array2<f32>>>>>;

/// Trained embedding matrices keyed by [`Word2VecParams::model_name`].
#[derive(Default)]
pub struct EmbeddingCache {
    memory: Mutex<HashMap<String, Slot>>,
    dir: Option<PathBuf>,
}

impl EmbeddingCache {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            dir: Some(dir.into()),
        }
    }

    /// Number of finished matrices; entries still training are not counted.
    pub fn len(&self) -> usize {
        self.memory
            .lock()
            .map(|m| {
                m.values()
                    .filter(|slot| matches!(slot.try_lock(), Ok(g) if g.is_some()))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_or_train(
        &self,
        v_sentences: &[Vec<usize>],
        vocabulary: &Vocabulary,
        params: &Word2VecParams,
    ) -> Result<Arc<Array2<f32>>> {
        let s_name = params.model_name();
        let slot = self.slot(&s_name)?;
        let mut entry = slot
            .lock()
            .map_err(|_| CnnError::Data(format!("embedding cache entry {s_name} poisoned")))?;
        if let Some(m) = entry.as_ref() {
            return Ok(Arc::clone(m));
        }

        let m = match self.load_from_disk(&s_name, vocabulary.len(), params.num_features)? {
            Some(m) => {
                info!(model = %s_name, "loaded cached word2vec embeddings");
                m
            }
            None => {
                let m = train_word2vec(v_sentences, vocabulary, params)?;
                self.save_to_disk(&s_name, &m)?;
                m
            }
        };
        let arc = Arc::new(m);
        *entry = Some(Arc::clone(&arc));
        Ok(arc)
    }

    fn slot(&self, s_name: &str) -> Result<Slot> {
        let mut map = self
            .memory
            .lock()
            .map_err(|_| CnnError::Data("embedding cache lock poisoned".into()))?;
        Ok(Arc::clone(map.entry(s_name.to_string()).or_default()))
    }

    fn path_for(&self, s_name: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{s_name}.bin")))
    }

    fn load_from_disk(&self, s_name: &str, i_rows: usize, i_cols: usize) -> Result<Option<Array2<f32>>> {
        let Some(path) = self.path_for(s_name) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let mut r = BufReader::new(File::open(&path)?);
        let m: Array2<f32> = bincode::serde::decode_from_std_read(&mut r, bincode::config::standard())?;
        if m.dim() != (i_rows, i_cols) {
            warn!(
                path = %path.display(),
                cached = ?m.dim(),
                expected = ?(i_rows, i_cols),
                "cached embeddings do not match vocabulary, retraining"
            );
            return Ok(None);
        }
        Ok(Some(m))
    }

    fn save_to_disk(&self, s_name: &str, m: &Array2<f32>) -> Result<()> {
        let Some(path) = self.path_for(s_name) else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut w = BufWriter::new(File::create(&path)?);
        bincode::serde::encode_into_std_write(m, &mut w, bincode::config::standard())?;
        w.flush()?;
        debug!(path = %path.display(), "saved word2vec embeddings");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocabulary::IndexedCorpus;

    fn toy_corpus() -> IndexedCorpus {
        let mut texts = Vec::new();
        for _ in 0..40 {
            texts.push("the cat sat on the mat".to_string());
            texts.push("the dog sat on the rug".to_string());
            texts.push("stocks fell sharply in early trading".to_string());
        }
        IndexedCorpus::from_texts(&texts, 10, 100).unwrap()
    }

    fn small_params() -> Word2VecParams {
        Word2VecParams {
            num_features: 8,
            context: 2,
            epochs: 3,
            sample: 0.0,
            ..Word2VecParams::default()
        }
    }

    #[test]
    fn matrix_has_one_row_per_word() {
        let corpus = toy_corpus();
        let m = train_word2vec(&corpus.sequences, &corpus.vocabulary, &small_params()).unwrap();
        assert_eq!(m.dim(), (corpus.vocabulary.len(), 8));
        assert!(m.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn training_is_deterministic_for_a_seed() {
        let corpus = toy_corpus();
        let a = train_word2vec(&corpus.sequences, &corpus.vocabulary, &small_params()).unwrap();
        let b = train_word2vec(&corpus.sequences, &corpus.vocabulary, &small_params()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rare_words_keep_fallback_range() {
        let corpus = toy_corpus();
        let params = Word2VecParams {
            min_word_count: 1000,
            ..small_params()
        };
        let m = train_word2vec(&corpus.sequences, &corpus.vocabulary, &params).unwrap();
        assert!(m.iter().all(|x| x.abs() <= 0.25));
    }

    #[test]
    fn model_name_matches_cache_layout() {
        let p = Word2VecParams {
            num_features: 20,
            min_word_count: 1,
            context: 5,
            ..Word2VecParams::default()
        };
        assert_eq!(p.model_name(), "20features_1minwords_5context");
    }

    #[test]
    fn cache_reuses_trained_matrix() {
        let corpus = toy_corpus();
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::with_dir(dir.path());
        let a = cache
            .get_or_train(&corpus.sequences, &corpus.vocabulary, &small_params())
            .unwrap();
        let b = cache
            .get_or_train(&corpus.sequences, &corpus.vocabulary, &small_params())
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert!(dir.path().join("8features_1minwords_2context.bin").exists());

        let fresh = EmbeddingCache::with_dir(dir.path());
        let c = fresh
            .get_or_train(&corpus.sequences, &corpus.vocabulary, &small_params())
            .unwrap();
        assert_eq!(*a, *c);
    }

    #[test]
    fn concurrent_requests_for_one_key_share_a_matrix() {
        let corpus = toy_corpus();
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::with_dir(dir.path());
        let v_results: Vec<Arc<Array2<f32>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        cache
                            .get_or_train(&corpus.sequences, &corpus.vocabulary, &small_params())
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(v_results.iter().all(|m| Arc::ptr_eq(m, &v_results[0])));
        assert_eq!(cache.len(), 1);
    }
}
