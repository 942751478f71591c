//! Multinomial Naive Bayes over sparse TF-IDF rows.

use crate::classify::vectorizer::SparseVector;
use crate::error::ClassifyError;

use std::collections::BTreeSet;

/// Laplace smoothing.
const ALPHA: f64 = 1.0;

/// Winning label and its posterior probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction<'a> {
    pub label: &'a str,
    pub probability: f64,
}

/// One categorical classifier. Classes are held in sorted order.
#[derive(Debug, Clone)]
pub struct MultinomialNb {
    classes: Vec<String>,
    class_log_prior: Vec<f64>,
    /// `[class][feature]` smoothed log probabilities.
    feature_log_prob: Vec<Vec<f64>>,
}

impl MultinomialNb {
    pub fn fit(
        rows: &[SparseVector],
        labels: &[&str],
        n_features: usize,
    ) -> Result<Self, ClassifyError> {
        if rows.is_empty() {
            return Err(ClassifyError::Training("no training rows".to_string()));
        }
        if rows.len() != labels.len() {
            return Err(ClassifyError::Training(format!(
                "{} rows but {} labels",
                rows.len(),
                labels.len()
            )));
        }

        let classes: Vec<String> = labels
            .iter()
            .copied()
            .collect::<BTreeSet<&str>>()
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut class_count = vec![0usize; classes.len()];
        let mut feature_count = vec![vec![0.0f64; n_features]; classes.len()];

        for (row, label) in rows.iter().zip(labels) {
            let class = classes
                .binary_search_by(|class| class.as_str().cmp(label))
                .map_err(|_| ClassifyError::Training(format!("unindexed label '{label}'")))?;
            class_count[class] += 1;
            for &(feature, weight) in row {
                let slot = feature_count[class].get_mut(feature).ok_or_else(|| {
                    ClassifyError::Training(format!(
                        "feature index {feature} outside {n_features} features"
                    ))
                })?;
                *slot += weight;
            }
        }

        let total = rows.len() as f64;
        let class_log_prior = class_count
            .iter()
            .map(|&count| (count as f64 / total).ln())
            .collect();

        let feature_log_prob = feature_count
            .into_iter()
            .map(|counts| {
                let denominator = (counts.iter().sum::<f64>() + ALPHA * n_features as f64).ln();
                counts
                    .into_iter()
                    .map(|count| (count + ALPHA).ln() - denominator)
                    .collect()
            })
            .collect();

        Ok(Self {
            classes,
            class_log_prior,
            feature_log_prob,
        })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Most probable class; ties go to the class that sorts first.
    pub fn predict(&self, row: &SparseVector) -> Prediction<'_> {
        let posteriors = self.predict_proba(row);

        let mut best = 0;
        for (index, posterior) in posteriors.iter().enumerate().skip(1) {
            if *posterior > posteriors[best] {
                best = index;
            }
        }

        Prediction {
            label: &self.classes[best],
            probability: posteriors[best].clamp(0.0, 1.0),
        }
    }

    /// Posterior probability per class, in `classes()` order.
    pub fn predict_proba(&self, row: &SparseVector) -> Vec<f64> {
        let scores = self.joint_log_likelihood(row);
        let normalizer = log_sum_exp(&scores);
        scores
            .into_iter()
            .map(|score| (score - normalizer).exp())
            .collect()
    }

    fn joint_log_likelihood(&self, row: &SparseVector) -> Vec<f64> {
        self.class_log_prior
            .iter()
            .zip(&self.feature_log_prob)
            .map(|(prior, log_probs)| {
                prior
                    + row
                        .iter()
                        .filter_map(|&(feature, weight)| {
                            log_probs.get(feature).map(|log_prob| weight * log_prob)
                        })
                        .sum::<f64>()
            })
            .collect()
    }
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|value| (value - max).exp()).sum::<f64>().ln()
}
