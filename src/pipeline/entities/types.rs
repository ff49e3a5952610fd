use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::pipeline::service::ServiceError;

/// Category assigned to an extracted span by the medical entity service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityCategory {
    MedicalCondition,
    Anatomy,
    Medication,
    TestTreatmentProcedure,
    ProtectedHealthInformation,
    TimeExpression,
    BehavioralEnvironmentalSocial,
    #[serde(other)]
    Other,
}

/// One candidate ICD-10-CM concept linked to a span, with the extractor's score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodedConcept {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Confidence in [0, 1] as reported by the extractor.
    pub score: f32,
}

/// A span of note text with its candidate codes, in extractor order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodedEntity {
    pub text: String,
    pub category: EntityCategory,
    pub codes: Vec<CodedConcept>,
}

/// A `CodedEntity` whose codes all passed the confidence threshold.
///
/// Serialized as-is into the first-pass prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredEntity {
    pub text: String,
    pub category: EntityCategory,
    pub codes: Vec<CodedConcept>,
}

/// Medical entity / ICD-10 coding service.
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<Vec<CodedEntity>, ServiceError>;
}
