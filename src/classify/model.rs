//! Six independent classifiers over one shared TF-IDF embedding.
//!
//! Every classifier is fitted on the same rows in the same order, so all six
//! predictions for a text come from one document vector. The trained model is
//! immutable and safe to share across tasks without locking.

use crate::classify::corpus::{TrainingCorpus, TrainingRecord};
use crate::classify::naive_bayes::MultinomialNb;
use crate::classify::vectorizer::{SparseVector, TfidfVectorizer};
use crate::error::ClassifyError;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Action used when the predicted subcategory has no training mapping.
pub const DEFAULT_ACTION: &str = "inceleme";

/// A predicted label dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Category,
    Subcategory,
    Priority,
    Sentiment,
    Urgency,
    Department,
}

impl Dimension {
    pub const ALL: [Dimension; 6] = [
        Self::Category,
        Self::Subcategory,
        Self::Priority,
        Self::Sentiment,
        Self::Urgency,
        Self::Department,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Subcategory => "subcategory",
            Self::Priority => "priority",
            Self::Sentiment => "sentiment",
            Self::Urgency => "urgency",
            Self::Department => "department",
        }
    }

    fn label_of(self, record: &TrainingRecord) -> &str {
        match self {
            Self::Category => &record.category,
            Self::Subcategory => &record.subcategory,
            Self::Priority => &record.priority,
            Self::Sentiment => &record.sentiment,
            Self::Urgency => &record.urgency,
            Self::Department => &record.department,
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full multi-label prediction for one text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub category: String,
    pub subcategory: String,
    pub priority: String,
    pub sentiment: String,
    pub urgency: String,
    pub department: String,
    pub action_required: String,
    pub response_template: String,
    /// Mean of the category and subcategory winning posteriors, 4 decimals.
    pub confidence_score: f64,
}

impl AnalysisResult {
    pub fn label(&self, dimension: Dimension) -> &str {
        match dimension {
            Dimension::Category => &self.category,
            Dimension::Subcategory => &self.subcategory,
            Dimension::Priority => &self.priority,
            Dimension::Sentiment => &self.sentiment,
            Dimension::Urgency => &self.urgency,
            Dimension::Department => &self.department,
        }
    }
}

/// Subcategory to action/template lookups built at training time.
///
/// Later records override earlier ones for the same subcategory.
#[derive(Debug, Clone, Default)]
pub struct SubcategoryRoutes {
    actions: HashMap<String, String>,
    templates: HashMap<String, String>,
}

impl SubcategoryRoutes {
    pub fn from_records(records: &[TrainingRecord]) -> Self {
        let mut routes = Self::default();
        for record in records {
            routes
                .actions
                .insert(record.subcategory.clone(), record.action_required.clone());
            routes
                .templates
                .insert(record.subcategory.clone(), record.response_template.clone());
        }
        routes
    }

    pub fn action_for(&self, subcategory: &str) -> &str {
        self.actions
            .get(subcategory)
            .map(String::as_str)
            .unwrap_or(DEFAULT_ACTION)
    }

    pub fn template_for(&self, subcategory: &str, category: &str) -> String {
        self.templates
            .get(subcategory)
            .cloned()
            .unwrap_or_else(|| format!("{category}_standard"))
    }
}

#[derive(Debug, Clone)]
struct Classifiers {
    category: MultinomialNb,
    subcategory: MultinomialNb,
    priority: MultinomialNb,
    sentiment: MultinomialNb,
    urgency: MultinomialNb,
    department: MultinomialNb,
}

impl Classifiers {
    fn get(&self, dimension: Dimension) -> &MultinomialNb {
        match dimension {
            Dimension::Category => &self.category,
            Dimension::Subcategory => &self.subcategory,
            Dimension::Priority => &self.priority,
            Dimension::Sentiment => &self.sentiment,
            Dimension::Urgency => &self.urgency,
            Dimension::Department => &self.department,
        }
    }
}

#[derive(Debug, Clone)]
struct TrainedModel {
    vectorizer: TfidfVectorizer,
    classifiers: Classifiers,
    routes: SubcategoryRoutes,
}

/// The multi-dimensional message classifier.
#[derive(Debug, Clone, Default)]
pub struct ClassificationModel {
    trained: Option<TrainedModel>,
}

impl ClassificationModel {
    pub fn untrained() -> Self {
        Self::default()
    }

    /// Train a fresh model from a corpus.
    pub fn from_corpus(corpus: &TrainingCorpus) -> Result<Self, ClassifyError> {
        let mut model = Self::untrained();
        model.train(corpus)?;
        Ok(model)
    }

    /// Fit the vectorizer and all six classifiers. On failure the model keeps
    /// its previous state.
    pub fn train(&mut self, corpus: &TrainingCorpus) -> Result<(), ClassifyError> {
        if corpus.is_empty() {
            return Err(ClassifyError::Training("training corpus is empty".to_string()));
        }

        let records = corpus.records();
        let bodies: Vec<&str> = records.iter().map(|record| record.body.as_str()).collect();
        let (vectorizer, rows) = TfidfVectorizer::fit_transform(&bodies)?;
        let n_features = vectorizer.n_features();

        let fit = |dimension: Dimension| -> Result<MultinomialNb, ClassifyError> {
            let labels: Vec<&str> = records
                .iter()
                .map(|record| dimension.label_of(record))
                .collect();
            MultinomialNb::fit(&rows, &labels, n_features).map_err(|error| {
                ClassifyError::Training(format!("{dimension} classifier: {error}"))
            })
        };

        let classifiers = Classifiers {
            category: fit(Dimension::Category)?,
            subcategory: fit(Dimension::Subcategory)?,
            priority: fit(Dimension::Priority)?,
            sentiment: fit(Dimension::Sentiment)?,
            urgency: fit(Dimension::Urgency)?,
            department: fit(Dimension::Department)?,
        };

        self.trained = Some(TrainedModel {
            vectorizer,
            classifiers,
            routes: SubcategoryRoutes::from_records(records),
        });

        tracing::info!(
            records = records.len(),
            features = n_features,
            categories = self.label_set(Dimension::Category).len(),
            "classification model trained"
        );
        Ok(())
    }

    pub fn is_trained(&self) -> bool {
        self.trained.is_some()
    }

    /// Labels a dimension can predict, sorted. Empty before training.
    pub fn label_set(&self, dimension: Dimension) -> &[String] {
        self.trained
            .as_ref()
            .map(|model| model.classifiers.get(dimension).classes())
            .unwrap_or_default()
    }

    /// Category label only.
    pub fn predict_basic(&self, text: &str) -> Result<String, ClassifyError> {
        let model = self.trained.as_ref().ok_or(ClassifyError::Untrained)?;
        let row = model.vectorizer.transform(text);
        Ok(model.classifiers.category.predict(&row).label.to_string())
    }

    pub fn predict_detailed(&self, text: &str) -> Result<AnalysisResult, ClassifyError> {
        let model = self.trained.as_ref().ok_or(ClassifyError::Untrained)?;
        let row: SparseVector = model.vectorizer.transform(text);
        let classifiers = &model.classifiers;

        let category = classifiers.category.predict(&row);
        let subcategory = classifiers.subcategory.predict(&row);
        let label = |dimension: Dimension| classifiers.get(dimension).predict(&row).label.to_string();

        Ok(AnalysisResult {
            category: category.label.to_string(),
            subcategory: subcategory.label.to_string(),
            priority: label(Dimension::Priority),
            sentiment: label(Dimension::Sentiment),
            urgency: label(Dimension::Urgency),
            department: label(Dimension::Department),
            action_required: model.routes.action_for(subcategory.label).to_string(),
            response_template: model.routes.template_for(subcategory.label, category.label),
            confidence_score: round4((category.probability + subcategory.probability) / 2.0),
        })
    }
}

fn round4(value: f64) -> f64 {
    ((value * 10_000.0).round() / 10_000.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::{ClassificationModel, DEFAULT_ACTION, Dimension, SubcategoryRoutes, round4};
    use crate::classify::corpus::{TrainingCorpus, TrainingRecord};
    use crate::error::ClassifyError;

    fn record(
        body: &str,
        category: &str,
        subcategory: &str,
        priority: &str,
        department: &str,
    ) -> TrainingRecord {
        TrainingRecord {
            body: body.to_string(),
            category: category.to_string(),
            subcategory: subcategory.to_string(),
            priority: priority.to_string(),
            sentiment: if priority == "high" { "negative" } else { "neutral" }.to_string(),
            urgency: priority.to_string(),
            department: department.to_string(),
            action_required: format!("handle_{subcategory}"),
            response_template: format!("{category}_{subcategory}"),
        }
    }

    fn corpus() -> TrainingCorpus {
        TrainingCorpus::new(vec![
            record(
                "My invoice shows a double charge, please fix this billing error",
                "billing",
                "double_charge",
                "high",
                "finance",
            ),
            record(
                "Question about the invoice amount and billing period",
                "billing",
                "invoice_question",
                "low",
                "finance",
            ),
            record(
                "The courier was rude and the package arrived damaged",
                "complaint",
                "delivery",
                "high",
                "support",
            ),
        ])
    }

    fn decimals_ok(score: f64) -> bool {
        let scaled = score * 10_000.0;
        (scaled - scaled.round()).abs() < 1e-6
    }

    #[test]
    fn confidence_is_mean_of_category_and_subcategory_posteriors() {
        let model = ClassificationModel::from_corpus(&corpus()).unwrap();
        let text = "I was charged twice on my invoice, billing mistake";

        let trained = model.trained.as_ref().unwrap();
        let row = trained.vectorizer.transform(text);
        let category = trained.classifiers.category.predict(&row).probability;
        let subcategory = trained.classifiers.subcategory.predict(&row).probability;

        let result = model.predict_detailed(text).unwrap();
        assert_eq!(
            result.confidence_score,
            round4((category + subcategory) / 2.0)
        );
    }

    #[test]
    fn predicts_billing_for_similar_text() {
        let model = ClassificationModel::from_corpus(&corpus()).unwrap();

        let result = model
            .predict_detailed("I was charged twice on my invoice, billing mistake")
            .unwrap();
        assert_eq!(result.category, "billing");
        assert_eq!(result.department, "finance");
        assert!((0.0..=1.0).contains(&result.confidence_score));
        assert!(decimals_ok(result.confidence_score));

        assert_eq!(
            model.predict_basic("damaged package and rude courier").unwrap(),
            "complaint"
        );
    }

    #[test]
    fn actions_and_templates_follow_predicted_subcategory() {
        let model = ClassificationModel::from_corpus(&corpus()).unwrap();
        let result = model
            .predict_detailed("rude courier, damaged package")
            .unwrap();

        assert_eq!(result.subcategory, "delivery");
        assert_eq!(result.action_required, "handle_delivery");
        assert_eq!(result.response_template, "complaint_delivery");
    }

    #[test]
    fn predictions_are_deterministic() {
        let model = ClassificationModel::from_corpus(&corpus()).unwrap();
        let text = "billing invoice charge";
        let first = model.predict_detailed(text).unwrap();
        let second = model.predict_detailed(text).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            first.confidence_score.to_bits(),
            second.confidence_score.to_bits()
        );
    }

    #[test]
    fn confidence_stays_in_range_for_any_input() {
        let model = ClassificationModel::from_corpus(&corpus()).unwrap();
        for text in [
            "",
            "zzz qqq",
            "invoice",
            "courier courier courier damaged",
            "Siparişim bozuk geldi!",
        ] {
            let score = model.predict_detailed(text).unwrap().confidence_score;
            assert!((0.0..=1.0).contains(&score), "{text}: {score}");
            assert!(decimals_ok(score), "{text}: {score}");
        }
    }

    #[test]
    fn unknown_subcategory_falls_back_to_defaults() {
        let routes = SubcategoryRoutes::from_records(corpus().records());
        assert_eq!(routes.action_for("never_seen"), DEFAULT_ACTION);
        assert_eq!(routes.template_for("never_seen", "billing"), "billing_standard");
        assert_eq!(routes.action_for("delivery"), "handle_delivery");
    }

    #[test]
    fn later_records_override_route_mappings() {
        let mut records = corpus().records().to_vec();
        let mut override_record = records[2].clone();
        override_record.action_required = "escalate".to_string();
        records.push(override_record);

        let routes = SubcategoryRoutes::from_records(&records);
        assert_eq!(routes.action_for("delivery"), "escalate");
    }

    #[test]
    fn untrained_model_rejects_predictions() {
        let model = ClassificationModel::untrained();
        assert!(!model.is_trained());
        assert!(model.label_set(Dimension::Category).is_empty());
        assert!(matches!(
            model.predict_basic("anything"),
            Err(ClassifyError::Untrained)
        ));
        assert!(matches!(
            model.predict_detailed("anything"),
            Err(ClassifyError::Untrained)
        ));
    }

    #[test]
    fn empty_corpus_fails_training_and_keeps_state() {
        let mut model = ClassificationModel::untrained();
        let result = model.train(&TrainingCorpus::default());
        assert!(matches!(result, Err(ClassifyError::Training(_))));
        assert!(!model.is_trained());

        let mut model = ClassificationModel::from_corpus(&corpus()).unwrap();
        assert!(model.train(&TrainingCorpus::default()).is_err());
        assert!(model.is_trained());
    }

    #[test]
    fn label_sets_cover_training_labels() {
        let model = ClassificationModel::from_corpus(&corpus()).unwrap();
        assert_eq!(
            model.label_set(Dimension::Category),
            ["billing".to_string(), "complaint".to_string()]
        );
        assert_eq!(
            model.label_set(Dimension::Priority),
            ["high".to_string(), "low".to_string()]
        );
    }
}
