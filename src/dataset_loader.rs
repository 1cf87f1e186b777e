// dataset_loader.rs
// ============================================================================
// Note:     Reads the labeled training CSV, cleans the raw texts and splits
//           indexed sequences into train / validation parts.
// ============================================================================

#![forbid(unsafe_code)]

use csv::ReaderBuilder;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::{fs, path::Path};
use tracing::{debug, info};

use crate::error::{CnnError, Result};

/// Raw texts with one binary label each.
#[derive(Debug, Clone, Default)]
pub struct LabeledTexts {
    pub texts: Vec<String>,
    pub labels: Vec<f32>,
}

impl LabeledTexts {
    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    /// Share of positive labels.
    pub fn positive_rate(&self) -> f64 {
        if self.labels.is_empty() {
            return 0.0;
        }
        self.labels.iter().filter(|&&y| y >= 0.5).count() as f64 / self.labels.len() as f64
    }
}

/// Indexed sequences after the train / validation split.
#[derive(Debug, Clone)]
pub struct DataSplit {
    pub x_train: Vec<Vec<usize>>,
    pub y_train: Vec<f32>,
    pub x_val: Vec<Vec<usize>>,
    pub y_val: Vec<f32>,
}

//===================================================================
//  load_labeled_csv
//      Reads `x_col` as text and averages the `y_cols` ratings into a
//      binary label (mean >= threshold -> 1.0). Rows with an empty
//      text are skipped.
//===================================================================
pub fn load_labeled_csv(
    path: impl AsRef<Path>,
    x_col: &str,
    y_cols: &[String],
    d_label_threshold: f64,
) -> Result<LabeledTexts> {
    let file_path = path.as_ref();
    let file = fs::File::open(file_path).map_err(|e| {
        CnnError::Data(format!("CSV file {:?} could not be opened: {}", file_path, e))
    })?;
    read_labeled_csv(file, x_col, y_cols, d_label_threshold)
}

/// Same as [`load_labeled_csv`] for any reader (tests, stdin).
pub fn read_labeled_csv<R: std::io::Read>(
    reader: R,
    x_col: &str,
    y_cols: &[String],
    d_label_threshold: f64,
) -> Result<LabeledTexts> {
    if y_cols.is_empty() {
        return Err(CnnError::Data("at least one label column is required".into()));
    }

    let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(reader);
    let headers = rdr.headers()?.clone();

    let column = |name: &str| -> Result<usize> {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| CnnError::Data(format!("column '{}' not found in CSV header", name)))
    };
    let i_x = column(x_col)?;
    let v_y: Vec<usize> = y_cols.iter().map(|c| column(c)).collect::<Result<_>>()?;

    let mut data = LabeledTexts::default();
    let mut i_skipped: usize = 0;

    for (i_row, result) in rdr.records().enumerate() {
        let record = result?;
        let s_text = record.get(i_x).unwrap_or("").trim();
        if s_text.is_empty() {
            i_skipped += 1;
            debug!(row = i_row + 2, "skipping row with empty text");
            continue;
        }

        let mut d_sum = 0.0;
        for &i_col in &v_y {
            let s_val = record.get(i_col).unwrap_or("").trim();
            let d_val: f64 = s_val.parse().map_err(|_| {
                CnnError::Data(format!(
                    "row {}: rating '{}' in column '{}' is not a number",
                    i_row + 2,
                    s_val,
                    &headers[i_col]
                ))
            })?;
            d_sum += d_val;
        }
        let d_mean = d_sum / v_y.len() as f64;

        data.texts.push(s_text.to_string());
        data.labels.push(if d_mean >= d_label_threshold { 1.0 } else { 0.0 });
    }

    if data.is_empty() {
        return Err(CnnError::Data("dataset contains no usable rows".into()));
    }

    info!(
        rows = data.len(),
        skipped = i_skipped,
        positive_rate = %format!("{:.3}", data.positive_rate()),
        "loaded labeled texts"
    );
    Ok(data)
}

/// Sentence cleaning as used for CNN sentence classification: keep
/// alphanumerics and `(),!?'` plus backtick, split contractions, isolate
/// punctuation, lowercase.
pub fn clean_text(s_input: &str) -> String {
    let s_kept: String = s_input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "(),!?'`".contains(c) {
                c
            } else {
                ' '
            }
        })
        .collect();

    let s_out = s_kept
        .replace("'s", " 's")
        .replace("'ve", " 've")
        .replace("n't", " n't")
        .replace("'re", " 're")
        .replace("'d", " 'd")
        .replace("'ll", " 'll")
        .replace(',', " , ")
        .replace('!', " ! ")
        .replace('(', " ( ")
        .replace(')', " ) ")
        .replace('?', " ? ");

    s_out
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Seeded shuffle, then the first `floor(n * train_percent)` rows train.
pub fn split_train_val(
    x: Vec<Vec<usize>>,
    y: Vec<f32>,
    d_train_percent: f64,
    seed: u64,
) -> Result<DataSplit> {
    if x.len() != y.len() {
        return Err(CnnError::Data(format!(
            "x has {} rows but y has {}",
            x.len(),
            y.len()
        )));
    }
    if !(0.0..=1.0).contains(&d_train_percent) {
        return Err(CnnError::InvalidParams(format!(
            "train_percent must be in [0, 1], got {}",
            d_train_percent
        )));
    }

    let mut v_idx: Vec<usize> = (0..x.len()).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    v_idx.shuffle(&mut rng);

    let i_train = (x.len() as f64 * d_train_percent) as usize;
    if i_train == 0 || i_train == x.len() {
        return Err(CnnError::Data(format!(
            "split of {} rows at {} leaves an empty train or validation set",
            x.len(),
            d_train_percent
        )));
    }

    let (v_train_idx, v_val_idx) = v_idx.split_at(i_train);
    Ok(DataSplit {
        x_train: v_train_idx.iter().map(|&i| x[i].clone()).collect(),
        y_train: v_train_idx.iter().map(|&i| y[i]).collect(),
        x_val: v_val_idx.iter().map(|&i| x[i].clone()).collect(),
        y_val: v_val_idx.iter().map(|&i| y[i]).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ratings() -> Vec<String> {
        vec!["r1".to_string(), "r2".to_string()]
    }

    #[test]
    fn labels_come_from_mean_rating() {
        let csv = "inputtext,r1,r2\nGreat movie,5,4\nawful,1,2\nok then,3,3\n";
        let data = read_labeled_csv(csv.as_bytes(), "inputtext", &ratings(), 3.0).unwrap();
        assert_eq!(data.texts, vec!["Great movie", "awful", "ok then"]);
        assert_eq!(data.labels, vec![1.0, 0.0, 1.0]);
    }

    #[test]
    fn empty_texts_are_skipped() {
        let csv = "inputtext,r1,r2\n,5,5\nfine,4,4\n";
        let data = read_labeled_csv(csv.as_bytes(), "inputtext", &ratings(), 3.0).unwrap();
        assert_eq!(data.len(), 1);
    }

    #[test]
    fn missing_column_is_a_data_error() {
        let csv = "text,r1,r2\nhello,1,1\n";
        let err = read_labeled_csv(csv.as_bytes(), "inputtext", &ratings(), 3.0).unwrap_err();
        assert!(matches!(err, CnnError::Data(_)));
    }

    #[test]
    fn empty_and_header_only_files_are_data_errors() {
        for csv in ["", "inputtext,r1,r2\n", "inputtext,r1,r2\n,4,4\n"] {
            let err = read_labeled_csv(csv.as_bytes(), "inputtext", &ratings(), 3.0).unwrap_err();
            assert!(matches!(err, CnnError::Data(_)), "{csv:?}");
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        fs::write(&path, "").unwrap();
        assert!(matches!(
            load_labeled_csv(&path, "inputtext", &ratings(), 3.0),
            Err(CnnError::Data(_))
        ));
    }

    #[test]
    fn non_numeric_rating_is_rejected() {
        let csv = "inputtext,r1,r2\nhello,five,1\n";
        assert!(read_labeled_csv(csv.as_bytes(), "inputtext", &ratings(), 3.0).is_err());
    }

    #[test]
    fn clean_text_splits_contractions_and_punctuation() {
        assert_eq!(
            clean_text("It's GREAT, isn't it?! (really)"),
            "it 's great , is n't it ? ! ( really )"
        );
        assert_eq!(clean_text("  tabs\tand\nnewlines  "), "tabs and newlines");
        assert_eq!(clean_text("price: $5.00 #deal"), "price 5 00 deal");
    }

    #[test]
    fn split_is_seeded_and_disjoint() {
        let x: Vec<Vec<usize>> = (0..20).map(|i| vec![i]).collect();
        let y: Vec<f32> = (0..20).map(|i| (i % 2) as f32).collect();

        let a = split_train_val(x.clone(), y.clone(), 0.9, 0).unwrap();
        let b = split_train_val(x, y, 0.9, 0).unwrap();
        assert_eq!(a.x_train.len(), 18);
        assert_eq!(a.x_val.len(), 2);
        assert_eq!(a.x_train, b.x_train);

        let mut seen: Vec<usize> = a.x_train.iter().chain(a.x_val.iter()).map(|r| r[0]).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
        for (row, label) in a.x_val.iter().zip(a.y_val.iter()) {
            assert_eq!((row[0] % 2) as f32, *label);
        }
    }

    #[test]
    fn split_rejects_empty_side() {
        let x: Vec<Vec<usize>> = (0..3).map(|i| vec![i]).collect();
        let y = vec![0.0; 3];
        assert!(split_train_val(x, y, 0.2, 0).is_err());
    }
}
