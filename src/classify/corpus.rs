//! Labelled training corpus loading and validation.

use crate::error::ClassifyError;

use serde::{Deserialize, Serialize};
use std::path::Path;

const REQUIRED_FIELDS: [&str; 9] = [
    "body",
    "category",
    "subcategory",
    "priority",
    "sentiment",
    "urgency",
    "department",
    "action_required",
    "response_template",
];

/// One labelled example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub body: String,
    pub category: String,
    pub subcategory: String,
    pub priority: String,
    pub sentiment: String,
    pub urgency: String,
    pub department: String,
    pub action_required: String,
    pub response_template: String,
}

/// Ordered training records. Row order is shared by every classifier.
#[derive(Debug, Clone, Default)]
pub struct TrainingCorpus {
    records: Vec<TrainingRecord>,
}

impl TrainingCorpus {
    pub fn new(records: Vec<TrainingRecord>) -> Self {
        Self { records }
    }

    /// Parse a JSON array of records, naming the first record and field that is
    /// missing or not a string.
    pub fn from_json_str(json: &str) -> Result<Self, ClassifyError> {
        let values: Vec<serde_json::Value> = serde_json::from_str(json).map_err(|error| {
            ClassifyError::Training(format!("corpus is not a JSON array of records: {error}"))
        })?;

        let mut records = Vec::with_capacity(values.len());
        for (index, value) in values.into_iter().enumerate() {
            let object = value.as_object().ok_or_else(|| {
                ClassifyError::Training(format!("record {index} is not a JSON object"))
            })?;

            for field in REQUIRED_FIELDS {
                match object.get(field) {
                    Some(serde_json::Value::String(_)) => {}
                    Some(_) => {
                        return Err(ClassifyError::Training(format!(
                            "record {index} field '{field}' must be a string"
                        )));
                    }
                    None => {
                        return Err(ClassifyError::Training(format!(
                            "record {index} is missing required field '{field}'"
                        )));
                    }
                }
            }

            let record = serde_json::from_value(value).map_err(|error| {
                ClassifyError::Training(format!("record {index} is invalid: {error}"))
            })?;
            records.push(record);
        }

        Ok(Self { records })
    }

    pub fn from_path(path: &Path) -> Result<Self, ClassifyError> {
        let json = std::fs::read_to_string(path).map_err(|error| {
            ClassifyError::Training(format!(
                "failed to read training data {}: {error}",
                path.display()
            ))
        })?;
        Self::from_json_str(&json)
    }

    pub fn records(&self) -> &[TrainingRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
