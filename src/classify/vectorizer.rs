//! TF-IDF text vectorizer shared by every classifier.

use crate::error::ClassifyError;

use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

/// Sparse feature vector as `(feature index, weight)` pairs sorted by index.
pub type SparseVector = Vec<(usize, f64)>;

/// Lowercased TF-IDF with smoothed idf and L2-normalised rows.
#[derive(Debug, Clone)]
pub struct TfidfVectorizer {
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
}

impl TfidfVectorizer {
    /// Learn vocabulary and idf weights, returning the fitted vectorizer and
    /// the transformed documents in input order.
    pub fn fit_transform(documents: &[&str]) -> Result<(Self, Vec<SparseVector>), ClassifyError> {
        let tokenized: Vec<Vec<String>> = documents.iter().map(|doc| tokenize(doc)).collect();

        let terms: BTreeSet<&str> = tokenized
            .iter()
            .flat_map(|tokens| tokens.iter().map(String::as_str))
            .collect();
        if terms.is_empty() {
            return Err(ClassifyError::Training(
                "empty vocabulary; documents contain no usable tokens".to_string(),
            ));
        }

        let vocabulary: HashMap<String, usize> = terms
            .into_iter()
            .enumerate()
            .map(|(index, term)| (term.to_string(), index))
            .collect();

        let mut document_frequency = vec![0usize; vocabulary.len()];
        for tokens in &tokenized {
            let unique: BTreeSet<usize> = tokens.iter().map(|token| vocabulary[token]).collect();
            for index in unique {
                document_frequency[index] += 1;
            }
        }

        let n = documents.len() as f64;
        let idf = document_frequency
            .into_iter()
            .map(|df| ((1.0 + n) / (1.0 + df as f64)).ln() + 1.0)
            .collect();

        let vectorizer = Self { vocabulary, idf };
        let rows = tokenized
            .iter()
            .map(|tokens| vectorizer.weigh(tokens))
            .collect();

        Ok((vectorizer, rows))
    }

    pub fn transform(&self, text: &str) -> SparseVector {
        self.weigh(&tokenize(text))
    }

    pub fn n_features(&self) -> usize {
        self.idf.len()
    }

    /// Out-of-vocabulary tokens are dropped.
    fn weigh(&self, tokens: &[String]) -> SparseVector {
        let mut counts: HashMap<usize, f64> = HashMap::new();
        for token in tokens {
            if let Some(&index) = self.vocabulary.get(token) {
                *counts.entry(index).or_insert(0.0) += 1.0;
            }
        }

        let mut row: SparseVector = counts
            .into_iter()
            .map(|(index, count)| (index, count * self.idf[index]))
            .collect();
        row.sort_unstable_by_key(|(index, _)| *index);

        let norm = row.iter().map(|(_, weight)| weight * weight).sum::<f64>().sqrt();
        if norm > 0.0 {
            for (_, weight) in &mut row {
                *weight /= norm;
            }
        }

        row
    }
}

fn token_regex() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r"[\p{L}\p{N}_]{2,}").expect("valid token regex"))
}

/// Lowercased runs of two or more letters, digits or underscores. Combining
/// marks break a run, so a lowercased `İ` (`i` + U+0307) splits off its `i`.
fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    token_regex()
        .find_iter(&lowered)
        .map(|token| token.as_str().to_string())
        .collect()
}
