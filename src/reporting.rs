// reporting.rs
// ============================================================================
// Note:     Post scan analysis over finished rounds: best parameter sets,
//           extreme metric values, round count. Works on live scan results
//           or on a results.csv read back from disk.
// ============================================================================

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{CnnError, Result};
use crate::search::{read_results_csv, ScanRecord, ScanResults};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Metric {
    #[default]
    ValAccuracy,
    BestValAccuracy,
    Accuracy,
    ValLoss,
    Loss,
}

impl Metric {
    pub fn value(&self, r: &ScanRecord) -> f32 {
        match self {
            Metric::ValAccuracy => r.val_accuracy,
            Metric::BestValAccuracy => r.best_val_accuracy,
            Metric::Accuracy => r.accuracy,
            Metric::ValLoss => r.val_loss,
            Metric::Loss => r.loss,
        }
    }

    pub fn higher_is_better(&self) -> bool {
        !matches!(self, Metric::ValLoss | Metric::Loss)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::ValAccuracy => "val_accuracy",
            Metric::BestValAccuracy => "best_val_accuracy",
            Metric::Accuracy => "accuracy",
            Metric::ValLoss => "val_loss",
            Metric::Loss => "loss",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = CnnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "val_accuracy" | "val_acc" => Ok(Metric::ValAccuracy),
            "best_val_accuracy" => Ok(Metric::BestValAccuracy),
            "accuracy" | "acc" => Ok(Metric::Accuracy),
            "val_loss" => Ok(Metric::ValLoss),
            "loss" => Ok(Metric::Loss),
            other => Err(CnnError::InvalidParams(format!("Unknown metric: {other}"))),
        }
    }
}

pub struct Reporting {
    records: Vec<ScanRecord>,
}

impl Reporting {
    pub fn new(results: &ScanResults) -> Self {
        Self {
            records: results.records.clone(),
        }
    }

    pub fn from_records(records: Vec<ScanRecord>) -> Self {
        Self { records }
    }

    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_records(read_results_csv(path)?))
    }

    pub fn rounds(&self) -> usize {
        self.records.len()
    }

    pub fn high(&self, metric: Metric) -> Option<f32> {
        self.records.iter().map(|r| metric.value(r)).reduce(f32::max)
    }

    pub fn low(&self, metric: Metric) -> Option<f32> {
        self.records.iter().map(|r| metric.value(r)).reduce(f32::min)
    }

    /// Top `n` rounds, best first. Ties keep round order, NaN metrics
    /// (diverged rounds) come last.
    pub fn best_params(&self, metric: Metric, n: usize) -> Vec<&ScanRecord> {
        let mut v: Vec<&ScanRecord> = self.records.iter().collect();
        v.sort_by(|a, b| {
            let (d_a, d_b) = (metric.value(a), metric.value(b));
            let ord = match (d_a.is_nan(), d_b.is_nan()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) if metric.higher_is_better() => d_b.total_cmp(&d_a),
                (false, false) => d_a.total_cmp(&d_b),
            };
            ord.then(a.round.cmp(&b.round))
        });
        v.truncate(n);
        v
    }
}

/// Text table of `best_params` for the console.
pub fn format_best(records: &[&ScanRecord], metric: Metric) -> String {
    let mut s_out = format!(
        "{:>5} {:>10} {:>6} {:>7} {:>6} {:>10} {:>7} {:>8} {:>11} {:>6} {:>5}\n",
        "round", metric.as_str(), "emb", "context", "seq", "filters", "n_filt", "emb_drop", "hidden_drop", "hidden", "batch"
    );
    for r in records {
        s_out.push_str(&format!(
            "{:>5} {:>10.4} {:>6} {:>7} {:>6} {:>10} {:>7} {:>8} {:>11} {:>6} {:>5}\n",
            r.round,
            metric.value(r),
            r.params.embedding_dim,
            r.params.context,
            r.params.sequence_length,
            r.params.filter_sizes_label(),
            r.params.num_filters,
            r.params.emb_drop,
            r.params.hidden_drop,
            r.params.hidden_dims,
            r.params.batch_size
        ));
    }
    s_out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CnnParams;

    fn record(round: usize, d_val_acc: f32, d_val_loss: f32) -> ScanRecord {
        ScanRecord {
            round,
            params: CnnParams {
                embedding_dim: 20 + round,
                context: 5,
                sequence_length: 30,
                filter_sizes: vec![3, 8],
                num_filters: 8,
                emb_drop: 0.5,
                hidden_drop: 0.7,
                hidden_dims: 70,
                batch_size: 64,
            },
            loss: 0.5,
            accuracy: 0.7,
            val_loss: d_val_loss,
            val_accuracy: d_val_acc,
            best_val_accuracy: d_val_acc,
            epochs: 3,
            duration_secs: 1.0,
        }
    }

    fn report() -> Reporting {
        Reporting::from_records(vec![record(0, 0.6, 0.5), record(1, 0.8, 0.7), record(2, 0.8, 0.3), record(3, 0.5, 0.9)])
    }

    #[test]
    fn best_params_sorts_accuracy_descending_with_stable_ties() {
        let r = report();
        let best: Vec<usize> = r.best_params(Metric::ValAccuracy, 3).iter().map(|x| x.round).collect();
        assert_eq!(best, vec![1, 2, 0]);
    }

    #[test]
    fn best_params_sorts_loss_ascending() {
        let r = report();
        let best: Vec<usize> = r.best_params(Metric::ValLoss, 2).iter().map(|x| x.round).collect();
        assert_eq!(best, vec![2, 0]);
    }

    #[test]
    fn nan_metrics_sort_last_in_both_directions() {
        let records: Vec<ScanRecord> = (0..64)
            .map(|i| {
                let d = if i % 3 == 0 { f32::NAN } else { (i % 7) as f32 / 10.0 };
                record(i, d, d)
            })
            .collect();
        let r = Reporting::from_records(records);

        for metric in [Metric::ValAccuracy, Metric::ValLoss] {
            let best = r.best_params(metric, 64);
            assert_eq!(best.len(), 64);
            let i_finite = best.iter().take_while(|x| !metric.value(x).is_nan()).count();
            assert_eq!(i_finite, 42);
            assert!(best[i_finite..].iter().all(|x| metric.value(x).is_nan()));
            let v_nan_rounds: Vec<usize> = best[i_finite..].iter().map(|x| x.round).collect();
            assert!(v_nan_rounds.windows(2).all(|w| w[0] < w[1]));
        }
        assert_eq!(r.best_params(Metric::ValAccuracy, 1)[0].val_accuracy, 0.6);
        assert_eq!(r.best_params(Metric::ValLoss, 1)[0].val_loss, 0.0);
    }

    #[test]
    fn high_low_and_rounds() {
        let r = report();
        assert_eq!(r.rounds(), 4);
        assert_eq!(r.high(Metric::ValAccuracy), Some(0.8));
        assert_eq!(r.low(Metric::ValAccuracy), Some(0.5));
        assert_eq!(Reporting::from_records(Vec::new()).high(Metric::Loss), None);
    }

    #[test]
    fn metric_names_parse() {
        assert_eq!("val_acc".parse::<Metric>().unwrap(), Metric::ValAccuracy);
        assert_eq!("loss".parse::<Metric>().unwrap(), Metric::Loss);
        assert!("f1".parse::<Metric>().is_err());
    }

    #[test]
    fn format_best_lists_filter_sizes() {
        let r = report();
        let s = format_best(&r.best_params(Metric::ValAccuracy, 1), Metric::ValAccuracy);
        assert!(s.contains("(3,8)"));
        assert!(s.lines().count() == 2);
    }
}
