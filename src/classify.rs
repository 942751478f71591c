//! Multi-label message classification: TF-IDF features, Naive Bayes per dimension.

pub mod corpus;
pub mod model;
pub mod naive_bayes;
pub mod vectorizer;

pub use corpus::{TrainingCorpus, TrainingRecord};
pub use model::{AnalysisResult, ClassificationModel, DEFAULT_ACTION, Dimension};
