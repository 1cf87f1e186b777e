// vocabulary.rs
// ============================================================================
// Note:     Word level vocabulary with reserved padding / unknown tokens and
//           fixed width index sequences for the CNN input.
// ============================================================================

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::dataset_loader::clean_text;
use crate::error::{CnnError, Result};

pub const S_PAD: &str = "<PAD/>";
pub const S_UNK: &str = "<UNK/>";
pub const PAD_ID: usize = 0;
pub const UNK_ID: usize = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vocabulary {
    /// id -> word, most frequent first after the two reserved entries
    words: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    counts: Vec<usize>,
}

impl Vocabulary {
    /// Builds the vocabulary from tokenized texts, keeping at most
    /// `max_words` entries including `<PAD/>` and `<UNK/>`.
    pub fn build(v_tokenized: &[Vec<String>], i_max_words: usize) -> Result<Self> {
        if i_max_words < 3 {
            return Err(CnnError::InvalidParams(format!(
                "max_words must leave room for at least one word, got {}",
                i_max_words
            )));
        }

        // count + first position for stable tie breaking
        let mut m_counts: HashMap<&str, (usize, usize)> = HashMap::new();
        let mut i_pos: usize = 0;
        for v_tokens in v_tokenized {
            for s_tok in v_tokens {
                let entry = m_counts.entry(s_tok.as_str()).or_insert((0, i_pos));
                entry.0 += 1;
                i_pos += 1;
            }
        }

        let mut v_sorted: Vec<(&str, usize, usize)> = m_counts
            .into_iter()
            .filter(|(w, _)| *w != S_PAD && *w != S_UNK)
            .map(|(w, (c, first))| (w, c, first))
            .collect();
        v_sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        v_sorted.truncate(i_max_words - 2);

        let mut words = vec![S_PAD.to_string(), S_UNK.to_string()];
        let mut counts = vec![0, 0];
        for (w, c, _) in v_sorted {
            words.push(w.to_string());
            counts.push(c);
        }

        let mut vocab = Self {
            words,
            index: HashMap::new(),
            counts,
        };
        vocab.rebuild_index();
        Ok(vocab)
    }

    /// Restores the lookup table after deserialization.
    pub fn rebuild_index(&mut self) {
        self.index = self
            .words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn id(&self, s_word: &str) -> usize {
        self.index.get(s_word).copied().unwrap_or(UNK_ID)
    }

    pub fn word(&self, i_id: usize) -> Option<&str> {
        self.words.get(i_id).map(|s| s.as_str())
    }

    /// Corpus frequency of the word behind `i_id` (0 for reserved ids).
    pub fn count(&self, i_id: usize) -> usize {
        self.counts.get(i_id).copied().unwrap_or(0)
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// Truncates to `i_width` tokens, then right pads with `<PAD/>`.
    pub fn encode(&self, v_tokens: &[String], i_width: usize) -> Vec<usize> {
        let mut v_ids: Vec<usize> = v_tokens.iter().take(i_width).map(|t| self.id(t)).collect();
        v_ids.resize(i_width, PAD_ID);
        v_ids
    }
}

pub fn tokenize(s_text: &str) -> Vec<String> {
    clean_text(s_text)
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Texts turned into padded id sequences of one common width.
#[derive(Clone, Debug)]
pub struct IndexedCorpus {
    pub vocabulary: Vocabulary,
    pub sequences: Vec<Vec<usize>>,
    /// `min(longest text, sequence_length)`, at least 1
    pub width: usize,
}

impl IndexedCorpus {
    pub fn from_texts(v_texts: &[String], i_sequence_length: usize, i_max_words: usize) -> Result<Self> {
        if i_sequence_length == 0 {
            return Err(CnnError::InvalidParams("sequence_length must be positive".into()));
        }
        let v_tokenized: Vec<Vec<String>> = v_texts.iter().map(|t| tokenize(t)).collect();
        let vocabulary = Vocabulary::build(&v_tokenized, i_max_words)?;

        let i_longest = v_tokenized.iter().map(|t| t.len()).max().unwrap_or(0);
        let width = i_longest.min(i_sequence_length).max(1);

        let sequences = v_tokenized
            .iter()
            .map(|t| vocabulary.encode(t, width))
            .collect();

        Ok(Self {
            vocabulary,
            sequences,
            width,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(s: &str) -> Vec<String> {
        s.split(' ').map(|t| t.to_string()).collect()
    }

    #[test]
    fn reserved_ids_come_first() {
        let vocab = Vocabulary::build(&[toks("a b")], 10).unwrap();
        assert_eq!(vocab.word(PAD_ID), Some(S_PAD));
        assert_eq!(vocab.word(UNK_ID), Some(S_UNK));
        assert_eq!(vocab.len(), 4);
    }

    #[test]
    fn sorted_by_frequency_then_first_appearance() {
        let vocab = Vocabulary::build(&[toks("c b a b a a"), toks("d c")], 10).unwrap();
        assert_eq!(&vocab.words()[2..], &["a", "c", "b", "d"]);
        assert_eq!(vocab.count(vocab.id("a")), 3);
    }

    #[test]
    fn cap_maps_rare_words_to_unknown() {
        let vocab = Vocabulary::build(&[toks("x x x y y z")], 4).unwrap();
        assert_eq!(vocab.len(), 4);
        assert_eq!(vocab.id("z"), UNK_ID);
        assert_eq!(vocab.id("never-seen"), UNK_ID);
    }

    #[test]
    fn encode_truncates_and_pads() {
        let vocab = Vocabulary::build(&[toks("a b c")], 10).unwrap();
        assert_eq!(vocab.encode(&toks("a b"), 4), vec![2, 3, PAD_ID, PAD_ID]);
        assert_eq!(vocab.encode(&toks("a b c a"), 2), vec![2, 3]);
    }

    #[test]
    fn corpus_width_tracks_longest_text() {
        let texts = vec!["good film".to_string(), "not a good film at all".to_string()];
        let corpus = IndexedCorpus::from_texts(&texts, 400, 100).unwrap();
        assert_eq!(corpus.width, 6);
        assert!(corpus.sequences.iter().all(|s| s.len() == 6));

        let capped = IndexedCorpus::from_texts(&texts, 3, 100).unwrap();
        assert_eq!(capped.width, 3);
    }

    #[test]
    fn index_survives_serde_round_trip() {
        let vocab = Vocabulary::build(&[toks("a b")], 10).unwrap();
        let s = serde_json::to_string(&vocab).unwrap();
        let mut back: Vocabulary = serde_json::from_str(&s).unwrap();
        back.rebuild_index();
        assert_eq!(back.id("b"), vocab.id("b"));
    }
}
