// search.rs
// ============================================================================
// Note:     Hyperparameter grid scan. The grid is the Cartesian product of
//           one value list per CnnParams field; a scan trains one model per
//           selected combination ("round") and keeps the round metrics in
//           memory and appended to <output_dir>/<experiment_name>/results.csv.
// ============================================================================

#![forbid(unsafe_code)]

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{info, warn};

use crate::config::SearchConfig;
use crate::error::{CnnError, Result};
use crate::model::CnnParams;
use crate::train::History;

pub const RESULTS_FILE: &str = "results.csv";

// ---------------------------------------------------------------------------
// ParamGrid
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGrid {
    pub embedding_dim: Vec<usize>,
    pub context: Vec<usize>,
    pub sequence_length: Vec<usize>,
    pub filter_sizes: Vec<Vec<usize>>,
    pub num_filters: Vec<usize>,
    pub emb_drop: Vec<f32>,
    pub hidden_drop: Vec<f32>,
    pub hidden_dims: Vec<usize>,
    pub batch_size: Vec<usize>,
}

impl ParamGrid {
    /// Grid from the `[search]` section. An empty `sequence_length` list
    /// becomes `[i_actual_length]`.
    pub fn from_config(cfg: &SearchConfig, i_actual_length: usize) -> Self {
        let sequence_length = if cfg.sequence_length.is_empty() {
            vec![i_actual_length]
        } else {
            cfg.sequence_length.clone()
        };
        Self {
            embedding_dim: cfg.embedding_dim.clone(),
            context: cfg.context.clone(),
            sequence_length,
            filter_sizes: cfg.filter_sizes.clone(),
            num_filters: cfg.num_filters.clone(),
            emb_drop: cfg.emb_drop.clone(),
            hidden_drop: cfg.hidden_drop.clone(),
            hidden_dims: cfg.hidden_dims.clone(),
            batch_size: cfg.batch_size.clone(),
        }
    }

    fn axis_lengths(&self) -> [usize; 9] {
        [
            self.embedding_dim.len(),
            self.context.len(),
            self.sequence_length.len(),
            self.filter_sizes.len(),
            self.num_filters.len(),
            self.emb_drop.len(),
            self.hidden_drop.len(),
            self.hidden_dims.len(),
            self.batch_size.len(),
        ]
    }

    /// Number of combinations, 0 when any axis is empty.
    pub fn size(&self) -> usize {
        self.axis_lengths()
            .iter()
            .try_fold(1usize, |acc, &n| acc.checked_mul(n))
            .unwrap_or(usize::MAX)
    }

    /// All combinations in declaration order: the first axis varies slowest.
    pub fn combinations(&self) -> Vec<CnnParams> {
        // Cartesian product over axis indices
        let mut v_result: Vec<Vec<usize>> = vec![Vec::new()];
        for &i_len in self.axis_lengths().iter() {
            let mut v_next = Vec::with_capacity(v_result.len() * i_len);
            for existing in &v_result {
                for i in 0..i_len {
                    let mut combo = existing.clone();
                    combo.push(i);
                    v_next.push(combo);
                }
            }
            v_result = v_next;
        }

        v_result
            .into_iter()
            .map(|c| CnnParams {
                embedding_dim: self.embedding_dim[c[0]],
                context: self.context[c[1]],
                sequence_length: self.sequence_length[c[2]],
                filter_sizes: self.filter_sizes[c[3]].clone(),
                num_filters: self.num_filters[c[4]],
                emb_drop: self.emb_drop[c[5]],
                hidden_drop: self.hidden_drop[c[6]],
                hidden_dims: self.hidden_dims[c[7]],
                batch_size: self.batch_size[c[8]],
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Round records
// ---------------------------------------------------------------------------

/// Outcome of one round.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRecord {
    pub round: usize,
    pub params: CnnParams,
    /// final epoch
    pub loss: f32,
    pub accuracy: f32,
    pub val_loss: f32,
    pub val_accuracy: f32,
    pub best_val_accuracy: f32,
    pub epochs: usize,
    pub duration_secs: f64,
}

impl ScanRecord {
    pub fn from_history(round: usize, params: CnnParams, history: &History, duration_secs: f64) -> Option<Self> {
        let last = history.last()?;
        Some(Self {
            round,
            params,
            loss: last.loss,
            accuracy: last.accuracy,
            val_loss: last.val_loss,
            val_accuracy: last.val_accuracy,
            best_val_accuracy: history.best_val_accuracy().unwrap_or(last.val_accuracy),
            epochs: history.epochs(),
            duration_secs,
        })
    }
}

/// Flat CSV form of [`ScanRecord`]; filter sizes are written as `3-8`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRow {
    round: usize,
    loss: f32,
    accuracy: f32,
    val_loss: f32,
    val_accuracy: f32,
    best_val_accuracy: f32,
    epochs: usize,
    duration_secs: f64,
    embedding_dim: usize,
    context: usize,
    sequence_length: usize,
    filter_sizes: String,
    num_filters: usize,
    emb_drop: f32,
    hidden_drop: f32,
    hidden_dims: usize,
    batch_size: usize,
}

impl From<&ScanRecord> for ScanRow {
    fn from(r: &ScanRecord) -> Self {
        let v: Vec<String> = r.params.filter_sizes.iter().map(|k| k.to_string()).collect();
        Self {
            round: r.round,
            loss: r.loss,
            accuracy: r.accuracy,
            val_loss: r.val_loss,
            val_accuracy: r.val_accuracy,
            best_val_accuracy: r.best_val_accuracy,
            epochs: r.epochs,
            duration_secs: r.duration_secs,
            embedding_dim: r.params.embedding_dim,
            context: r.params.context,
            sequence_length: r.params.sequence_length,
            filter_sizes: v.join("-"),
            num_filters: r.params.num_filters,
            emb_drop: r.params.emb_drop,
            hidden_drop: r.params.hidden_drop,
            hidden_dims: r.params.hidden_dims,
            batch_size: r.params.batch_size,
        }
    }
}

impl TryFrom<ScanRow> for ScanRecord {
    type Error = CnnError;

    fn try_from(row: ScanRow) -> Result<Self> {
        let filter_sizes = row
            .filter_sizes
            .split('-')
            .map(|s| {
                s.trim().parse::<usize>().map_err(|_| {
                    CnnError::Data(format!("invalid filter_sizes '{}' in round {}", row.filter_sizes, row.round))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            round: row.round,
            params: CnnParams {
                embedding_dim: row.embedding_dim,
                context: row.context,
                sequence_length: row.sequence_length,
                filter_sizes,
                num_filters: row.num_filters,
                emb_drop: row.emb_drop,
                hidden_drop: row.hidden_drop,
                hidden_dims: row.hidden_dims,
                batch_size: row.batch_size,
            },
            loss: row.loss,
            accuracy: row.accuracy,
            val_loss: row.val_loss,
            val_accuracy: row.val_accuracy,
            best_val_accuracy: row.best_val_accuracy,
            epochs: row.epochs,
            duration_secs: row.duration_secs,
        })
    }
}

/// Reads a results table written by [`Scan::run`].
pub fn read_results_csv(path: impl AsRef<Path>) -> Result<Vec<ScanRecord>> {
    let mut rdr = csv::Reader::from_path(path)?;
    rdr.deserialize::<ScanRow>()
        .map(|row| ScanRecord::try_from(row?))
        .collect()
}

#[derive(Debug, Clone)]
pub struct ScanResults {
    pub experiment_name: String,
    /// completed rounds, ordered by round number
    pub records: Vec<ScanRecord>,
    pub planned: usize,
    pub failed: usize,
    pub interrupted: bool,
    pub results_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Scan
// ---------------------------------------------------------------------------

pub struct Scan {
    grid: ParamGrid,
    experiment_name: String,
    round_limit: Option<usize>,
    fraction_limit: Option<f64>,
    shuffle_seed: Option<u64>,
    concurrency: usize,
    output_dir: Option<PathBuf>,
    stop: Option<Arc<AtomicBool>>,
}

impl Scan {
    pub fn new(grid: ParamGrid, experiment_name: impl Into<String>) -> Self {
        Self {
            grid,
            experiment_name: experiment_name.into(),
            round_limit: None,
            fraction_limit: None,
            shuffle_seed: None,
            concurrency: 1,
            output_dir: None,
            stop: None,
        }
    }

    /// Scan configured from the `[search]` section.
    pub fn from_config(grid: ParamGrid, cfg: &SearchConfig, seed: u64) -> Self {
        let mut scan = Self::new(grid, cfg.experiment_name.clone())
            .concurrency(cfg.concurrency)
            .output_dir(&cfg.output_dir);
        scan.round_limit = cfg.round_limit;
        scan.fraction_limit = cfg.fraction_limit;
        if cfg.shuffle {
            scan = scan.shuffle(seed);
        }
        scan
    }

    pub fn round_limit(mut self, i_rounds: usize) -> Self {
        self.round_limit = Some(i_rounds);
        self
    }

    pub fn fraction_limit(mut self, d_fraction: f64) -> Self {
        self.fraction_limit = Some(d_fraction);
        self
    }

    pub fn shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    pub fn concurrency(mut self, i_threads: usize) -> Self {
        self.concurrency = i_threads.max(1);
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    pub fn experiment_dir(&self) -> Option<PathBuf> {
        self.output_dir.as_ref().map(|d| d.join(&self.experiment_name))
    }

    /// Combinations the scan will visit, after ordering and limits.
    pub fn planned_rounds(&self) -> Result<Vec<CnnParams>> {
        if self.grid.size() == 0 {
            return Err(CnnError::InvalidParams("parameter grid is empty".into()));
        }
        let mut v_rounds = self.grid.combinations();
        if let Some(seed) = self.shuffle_seed {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            v_rounds.shuffle(&mut rng);
        }

        let mut i_keep = v_rounds.len();
        if let Some(d_fraction) = self.fraction_limit {
            if !(d_fraction > 0.0 && d_fraction <= 1.0) {
                return Err(CnnError::InvalidParams(format!(
                    "fraction_limit must be in (0, 1], got {}",
                    d_fraction
                )));
            }
            i_keep = i_keep.min((v_rounds.len() as f64 * d_fraction) as usize);
        }
        if let Some(i_limit) = self.round_limit {
            i_keep = i_keep.min(i_limit);
        }
        if i_keep == 0 {
            return Err(CnnError::InvalidParams("limits leave no rounds to run".into()));
        }
        v_rounds.truncate(i_keep);
        Ok(v_rounds)
    }

    fn is_stopped(&self) -> bool {
        self.stop.as_ref().map(|f| f.load(AtomicOrdering::Relaxed)).unwrap_or(false)
    }

    /// Runs every planned round through `model_fn`.
    ///
    /// Failed rounds are logged and skipped. After Ctrl+C no new round starts;
    /// the rounds finished so far are returned.
    pub fn run<F>(&self, model_fn: F) -> Result<ScanResults>
    where
        F: Fn(&CnnParams) -> Result<History> + Sync,
    {
        let v_rounds = self.planned_rounds()?;
        let i_planned = v_rounds.len();
        info!(
            experiment = %self.experiment_name,
            grid = self.grid.size(),
            rounds = i_planned,
            concurrency = self.concurrency,
            "starting scan"
        );

        let writer = match self.experiment_dir() {
            Some(dir) => Some(ResultsWriter::create(&dir)?),
            None => None,
        };

        let run_round = |i_round: usize, params: &CnnParams| -> Option<std::result::Result<ScanRecord, ()>> {
            if self.is_stopped() {
                return None;
            }
            let t_start = Instant::now();
            info!(round = i_round + 1, of = i_planned, params = ?params, "round started");
            let outcome = model_fn(params).and_then(|history| {
                ScanRecord::from_history(i_round, params.clone(), &history, t_start.elapsed().as_secs_f64())
                    .ok_or_else(|| CnnError::Data("round finished without a completed epoch".into()))
            });
            match outcome {
                Ok(record) => {
                    info!(
                        round = i_round + 1,
                        val_accuracy = %format!("{:.4}", record.val_accuracy),
                        epochs = record.epochs,
                        "round finished"
                    );
                    if let Some(w) = writer.as_ref() {
                        if let Err(e) = w.append(&record) {
                            warn!(round = i_round + 1, error = %e, "could not write round result");
                        }
                    }
                    Some(Ok(record))
                }
                Err(e) => {
                    warn!(round = i_round + 1, error = %e, "round failed, skipping");
                    Some(Err(()))
                }
            }
        };

        let v_outcomes: Vec<Option<std::result::Result<ScanRecord, ()>>> = if self.concurrency > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.concurrency)
                .build()
                .map_err(|e| CnnError::InvalidParams(format!("thread pool: {e}")))?;
            pool.install(|| {
                v_rounds
                    .par_iter()
                    .enumerate()
                    .map(|(i, p)| run_round(i, p))
                    .collect()
            })
        } else {
            v_rounds.iter().enumerate().map(|(i, p)| run_round(i, p)).collect()
        };

        let b_interrupted = v_outcomes.iter().any(|o| o.is_none());
        let i_failed = v_outcomes.iter().filter(|o| matches!(o, Some(Err(())))).count();
        let records: Vec<ScanRecord> = v_outcomes.into_iter().flatten().flatten().collect();

        if b_interrupted {
            if records.is_empty() {
                return Err(CnnError::Cancelled { completed: 0 });
            }
            warn!(completed = records.len(), planned = i_planned, "scan interrupted (Ctrl+C)");
        }
        info!(completed = records.len(), failed = i_failed, "scan finished");

        Ok(ScanResults {
            experiment_name: self.experiment_name.clone(),
            records,
            planned: i_planned,
            failed: i_failed,
            interrupted: b_interrupted,
            results_path: writer.map(|w| w.path),
        })
    }
}

/// Appends one CSV line per finished round, shared across worker threads.
struct ResultsWriter {
    path: PathBuf,
    inner: Mutex<csv::Writer<File>>,
}

impl ResultsWriter {
    fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(RESULTS_FILE);
        // earlier scans of the same experiment are kept, the header is
        // written once
        let b_fresh = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = csv::WriterBuilder::new().has_headers(b_fresh).from_writer(file);
        Ok(Self {
            path,
            inner: Mutex::new(writer),
        })
    }

    fn append(&self, record: &ScanRecord) -> Result<()> {
        let mut w = self
            .inner
            .lock()
            .map_err(|_| CnnError::Data("results writer lock poisoned".into()))?;
        w.serialize(ScanRow::from(record))?;
        w.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::EpochMetrics;

    fn small_grid() -> ParamGrid {
        ParamGrid {
            embedding_dim: vec![20, 50],
            context: vec![5],
            sequence_length: vec![12],
            filter_sizes: vec![vec![3, 8], vec![2, 3, 8]],
            num_filters: vec![8],
            emb_drop: vec![0.5, 0.7],
            hidden_drop: vec![0.7],
            hidden_dims: vec![70],
            batch_size: vec![64],
        }
    }

    fn fake_history(d_val_acc: f32) -> History {
        let mut h = History::default();
        h.push(EpochMetrics { loss: 0.7, accuracy: 0.5, val_loss: 0.7, val_accuracy: d_val_acc + 0.05 });
        h.push(EpochMetrics { loss: 0.6, accuracy: 0.6, val_loss: 0.6, val_accuracy: d_val_acc });
        h
    }

    #[test]
    fn default_grid_matches_experiment_size() {
        let grid = ParamGrid::from_config(&SearchConfig::default(), 57);
        assert_eq!(grid.sequence_length, vec![57]);
        assert_eq!(grid.size(), 3 * 3 * 1 * 2 * 4 * 3 * 3 * 2 * 2);
    }

    #[test]
    fn combinations_follow_declaration_order() {
        let combos = small_grid().combinations();
        assert_eq!(combos.len(), 8);
        assert_eq!(combos[0].embedding_dim, 20);
        assert_eq!(combos[0].filter_sizes, vec![3, 8]);
        assert_eq!(combos[1].emb_drop, 0.7);
        assert_eq!(combos[2].filter_sizes, vec![2, 3, 8]);
        assert_eq!(combos[4].embedding_dim, 50);
    }

    #[test]
    fn empty_axis_is_rejected() {
        let mut grid = small_grid();
        grid.batch_size.clear();
        assert_eq!(grid.size(), 0);
        let err = Scan::new(grid, "x").run(|_| Ok(fake_history(0.5))).unwrap_err();
        assert!(matches!(err, CnnError::InvalidParams(_)));
    }

    #[test]
    fn limits_and_shuffle_select_rounds() {
        let scan = Scan::new(small_grid(), "x").fraction_limit(0.5);
        assert_eq!(scan.planned_rounds().unwrap().len(), 4);
        let scan = Scan::new(small_grid(), "x").fraction_limit(0.5).round_limit(3);
        assert_eq!(scan.planned_rounds().unwrap().len(), 3);

        let a = Scan::new(small_grid(), "x").shuffle(9).planned_rounds().unwrap();
        let b = Scan::new(small_grid(), "x").shuffle(9).planned_rounds().unwrap();
        assert_eq!(a, b);
        let mut sorted = a.clone();
        sorted.sort_by_key(|p| (p.embedding_dim, p.filter_sizes.len(), (p.emb_drop * 10.0) as usize));
        let mut plain = small_grid().combinations();
        plain.sort_by_key(|p| (p.embedding_dim, p.filter_sizes.len(), (p.emb_drop * 10.0) as usize));
        assert_eq!(sorted, plain);

        assert!(Scan::new(small_grid(), "x").fraction_limit(0.0).planned_rounds().is_err());
    }

    #[test]
    fn failed_rounds_are_skipped() {
        let results = Scan::new(small_grid(), "x")
            .run(|p| {
                if p.embedding_dim == 20 {
                    Err(CnnError::Data("boom".into()))
                } else {
                    Ok(fake_history(0.6))
                }
            })
            .unwrap();
        assert_eq!(results.planned, 8);
        assert_eq!(results.failed, 4);
        assert_eq!(results.records.len(), 4);
        assert!(results.records.iter().all(|r| r.params.embedding_dim == 50));
        let r = &results.records[0];
        assert_eq!(r.epochs, 2);
        assert!((r.val_accuracy - 0.6).abs() < 1e-6);
        assert!((r.best_val_accuracy - 0.65).abs() < 1e-6);
    }

    #[test]
    fn parallel_scan_writes_results_csv() {
        let dir = tempfile::tempdir().unwrap();
        let results = Scan::new(small_grid(), "exp")
            .concurrency(3)
            .output_dir(dir.path())
            .run(|p| Ok(fake_history(p.emb_drop)))
            .unwrap();
        assert_eq!(results.records.len(), 8);
        let rounds: Vec<usize> = results.records.iter().map(|r| r.round).collect();
        assert_eq!(rounds, (0..8).collect::<Vec<_>>());

        let path = dir.path().join("exp").join(RESULTS_FILE);
        assert_eq!(results.results_path.as_deref(), Some(path.as_path()));
        let mut back = read_results_csv(&path).unwrap();
        back.sort_by_key(|r| r.round);
        assert_eq!(back.len(), 8);
        assert_eq!(back[2].params.filter_sizes, vec![2, 3, 8]);
        assert_eq!(back[2].params, results.records[2].params);
    }

    #[test]
    fn repeated_scans_append_to_results_csv() {
        let dir = tempfile::tempdir().unwrap();
        for i_limit in [2, 1] {
            Scan::new(small_grid(), "exp")
                .round_limit(i_limit)
                .output_dir(dir.path())
                .run(|_| Ok(fake_history(0.6)))
                .unwrap();
        }
        let path = dir.path().join("exp").join(RESULTS_FILE);
        let back = read_results_csv(&path).unwrap();
        assert_eq!(back.len(), 3);
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with("round,")).count(), 1);
    }

    #[test]
    fn stop_flag_set_before_run_cancels() {
        let flag = Arc::new(AtomicBool::new(true));
        let err = Scan::new(small_grid(), "x")
            .stop_flag(flag)
            .run(|_| Ok(fake_history(0.5)))
            .unwrap_err();
        assert!(matches!(err, CnnError::Cancelled { completed: 0 }));
    }

    #[test]
    fn stop_flag_set_mid_scan_keeps_finished_rounds() {
        let flag = Arc::new(AtomicBool::new(false));
        let flag_in_round = Arc::clone(&flag);
        let results = Scan::new(small_grid(), "x")
            .stop_flag(Arc::clone(&flag))
            .run(move |_| {
                flag_in_round.store(true, AtomicOrdering::SeqCst);
                Ok(fake_history(0.5))
            })
            .unwrap();
        assert!(results.interrupted);
        assert_eq!(results.records.len(), 1);
    }
}
