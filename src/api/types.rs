//! Invocation event / response and the shared API context.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::pipeline::orchestrator::{DiagnosisPipeline, RunDiagnostics, RunOutcome, RunStatus};

/// Shared context for all routes.
#[derive(Clone)]
pub struct ApiContext {
    pub pipeline: Arc<DiagnosisPipeline>,
}

impl ApiContext {
    pub fn new(pipeline: Arc<DiagnosisPipeline>) -> Self {
        Self { pipeline }
    }
}

/// One review request: the raw note text.
#[derive(Debug, Clone, Deserialize)]
pub struct InvocationEvent {
    pub body: String,
}

/// Reply to an invocation. `body` is the final model text.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResponse {
    pub status_code: u16,
    pub body: String,
    pub status: RunStatus,
    pub diagnostics: RunDiagnostics,
    /// Final recommendation in its wire shape (`Active_Condition` / `Inactive_Condition`).
    pub recommendation: Option<serde_json::Value>,
}

impl From<RunOutcome> for InvocationResponse {
    fn from(outcome: RunOutcome) -> Self {
        Self {
            status_code: status_code_for(&outcome),
            body: outcome.final_text,
            status: outcome.status,
            recommendation: outcome.recommendation.as_ref().map(|r| r.to_block_json()),
            diagnostics: outcome.diagnostics,
        }
    }
}

/// 200 for SUCCESS / PARTIAL, 500 for an internal defect, 502 when a
/// collaborator failed.
pub fn status_code_for(outcome: &RunOutcome) -> u16 {
    match &outcome.diagnostics.failure {
        None => 200,
        Some(failure) if failure.kind.is_internal() => 500,
        Some(_) => 502,
    }
}

/// Run the review pipeline for one event.
///
/// Blank notes are rejected before any collaborator is called.
pub async fn handle_invocation(
    pipeline: &DiagnosisPipeline,
    event: InvocationEvent,
) -> Result<InvocationResponse, ApiError> {
    if event.body.trim().is_empty() {
        return Err(ApiError::BadRequest("Note body is empty".into()));
    }

    let outcome = pipeline.run(&event.body).await;
    Ok(InvocationResponse::from(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::entities::{CodedConcept, CodedEntity, EntityCategory};
    use crate::pipeline::orchestrator::PipelineOptions;
    use crate::pipeline::service::{ServiceError, ServiceKind};
    use crate::pipeline::testing::{ScriptedExtractor, ScriptedGenerator, ScriptedRetriever};

    const BLOCK: &str = r#"<recommendation>{"Active_Condition": [{"Review": {"DX_Code": "I26.99", "Description": "Pulmonary embolism", "Memo": {"date": "2023-07-22", "note": "CT angiogram"}}}], "Inactive_Condition": []}</recommendation>"#;

    fn pipeline(extractor: ScriptedExtractor, generator: ScriptedGenerator) -> DiagnosisPipeline {
        DiagnosisPipeline::new(
            Arc::new(extractor),
            Arc::new(generator),
            Arc::new(ScriptedRetriever::new()),
            PipelineOptions::default(),
        )
    }

    fn pe_entities() -> Vec<CodedEntity> {
        vec![CodedEntity {
            text: "pulmonary embolism".into(),
            category: EntityCategory::MedicalCondition,
            codes: vec![CodedConcept {
                code: "I26.99".into(),
                description: Some("Other pulmonary embolism without acute cor pulmonale".into()),
                score: 0.9,
            }],
        }]
    }

    #[tokio::test]
    async fn success_maps_to_200_with_wire_recommendation() {
        let p = pipeline(
            ScriptedExtractor::returning(pe_entities()),
            ScriptedGenerator::new().reply(BLOCK).reply(BLOCK),
        );

        let response = handle_invocation(
            &p,
            InvocationEvent {
                body: "Acute PE on CT".into(),
            },
        )
        .await
        .unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(response.status, RunStatus::Success);
        assert_eq!(response.body, BLOCK);
        let rec = response.recommendation.unwrap();
        assert_eq!(rec["Active_Condition"][0]["Review"]["DX_Code"], "I26.99");
    }

    #[tokio::test]
    async fn collaborator_failure_maps_to_502() {
        let p = pipeline(
            ScriptedExtractor::failing(ServiceError::Timeout {
                kind: ServiceKind::EntityExtraction,
                after: std::time::Duration::from_secs(120),
            }),
            ScriptedGenerator::new(),
        );

        let response = handle_invocation(
            &p,
            InvocationEvent {
                body: "note".into(),
            },
        )
        .await
        .unwrap();

        assert_eq!(response.status_code, 502);
        assert_eq!(response.status, RunStatus::Failed);
        assert!(response.recommendation.is_none());
    }

    #[tokio::test]
    async fn blank_note_is_rejected_without_calls() {
        let extractor = Arc::new(ScriptedExtractor::returning(vec![]));
        let p = DiagnosisPipeline::new(
            extractor.clone(),
            Arc::new(ScriptedGenerator::new()),
            Arc::new(ScriptedRetriever::new()),
            PipelineOptions::default(),
        );

        let err = handle_invocation(
            &p,
            InvocationEvent {
                body: "  \n ".into(),
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ApiError::BadRequest(_)));
        assert_eq!(extractor.calls(), 0);
    }

    #[tokio::test]
    async fn response_serializes_status_code_in_camel_case() {
        let p = pipeline(
            ScriptedExtractor::returning(pe_entities()),
            ScriptedGenerator::new().reply(BLOCK).reply("no block"),
        );
        let event: InvocationEvent = serde_json::from_str(r#"{"body": "Acute PE"}"#).unwrap();

        let response = handle_invocation(&p, event).await.unwrap();
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["status"], "PARTIAL");
        assert_eq!(json["body"], "no block");
        assert!(json["recommendation"].is_null());
        assert_eq!(json["diagnostics"]["degradations"][0]["kind"], "parse_miss");
    }
}
