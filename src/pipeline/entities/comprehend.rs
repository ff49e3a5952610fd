use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::types::{CodedConcept, CodedEntity, EntityCategory, EntityExtractor};
use crate::pipeline::service::{build_http_client, send_json, ServiceError, ServiceKind};

const INFER_ICD10_TARGET: &str = "ComprehendMedical_20181030.InferICD10CM";
const AMZ_JSON_CONTENT_TYPE: &str = "application/x-amz-json-1.1";

/// HTTP client for the medical entity / ICD-10-CM inference endpoint.
pub struct ComprehendMedicalClient {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl ComprehendMedicalClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, ServiceError> {
        let client = build_http_client(timeout).map_err(|e| ServiceError::HttpClient {
            kind: ServiceKind::EntityExtraction,
            message: e.to_string(),
        })?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
            timeout,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct InferRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InferResponse {
    #[serde(default)]
    entities: Vec<WireEntity>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireEntity {
    text: String,
    category: EntityCategory,
    #[serde(rename = "ICD10CMConcepts", default)]
    concepts: Vec<WireConcept>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireConcept {
    code: String,
    description: Option<String>,
    score: f32,
}

impl From<WireEntity> for CodedEntity {
    fn from(wire: WireEntity) -> Self {
        CodedEntity {
            text: wire.text,
            category: wire.category,
            codes: wire
                .concepts
                .into_iter()
                .map(|c| CodedConcept {
                    code: c.code,
                    description: c.description,
                    score: c.score,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl EntityExtractor for ComprehendMedicalClient {
    async fn extract(&self, text: &str) -> Result<Vec<CodedEntity>, ServiceError> {
        let request = self
            .client
            .post(format!("{}/", self.endpoint))
            .header("X-Amz-Target", INFER_ICD10_TARGET)
            .header(reqwest::header::CONTENT_TYPE, AMZ_JSON_CONTENT_TYPE);

        let response: InferResponse = send_json(
            ServiceKind::EntityExtraction,
            &self.endpoint,
            self.timeout,
            request,
            &InferRequest { text },
        )
        .await?;

        tracing::debug!(
            entities = response.entities.len(),
            "Entity extraction returned"
        );

        Ok(response.entities.into_iter().map(CodedEntity::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::spawn_stub;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;

    const SAMPLE_RESPONSE: &str = r#"{
        "Entities": [
            {
                "Id": 0,
                "Text": "unprovoked PE",
                "Category": "MEDICAL_CONDITION",
                "Type": "DX_NAME",
                "Score": 0.97,
                "BeginOffset": 4,
                "EndOffset": 17,
                "Traits": [],
                "ICD10CMConcepts": [
                    {"Description": "Other pulmonary embolism without acute cor pulmonale", "Code": "I26.99", "Score": 0.95},
                    {"Description": "Septic pulmonary embolism", "Code": "I26.90", "Score": 0.41}
                ]
            },
            {
                "Text": "foot",
                "Category": "ANATOMY",
                "ICD10CMConcepts": []
            }
        ],
        "ModelVersion": "0.1.0"
    }"#;

    #[tokio::test]
    async fn parses_entities_and_sends_target_header() {
        let app = Router::new().route(
            "/",
            post(|headers: HeaderMap, body: String| async move {
                assert_eq!(
                    headers.get("X-Amz-Target").unwrap(),
                    "ComprehendMedical_20181030.InferICD10CM"
                );
                let req: serde_json::Value = serde_json::from_str(&body).unwrap();
                assert_eq!(req["Text"], "Had unprovoked PE.");
                SAMPLE_RESPONSE
            }),
        );
        let endpoint = spawn_stub(app).await;

        let client = ComprehendMedicalClient::new(&endpoint, Duration::from_secs(5)).unwrap();
        let entities = client.extract("Had unprovoked PE.").await.unwrap();

        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].text, "unprovoked PE");
        assert_eq!(entities[0].category, EntityCategory::MedicalCondition);
        assert_eq!(entities[0].codes.len(), 2);
        assert_eq!(entities[0].codes[0].code, "I26.99");
        assert!((entities[0].codes[0].score - 0.95).abs() < f32::EPSILON);
        assert_eq!(entities[1].category, EntityCategory::Anatomy);
        assert!(entities[1].codes.is_empty());
    }

    #[tokio::test]
    async fn service_error_status_is_reported() {
        let app = Router::new().route(
            "/",
            post(|| async { (StatusCode::BAD_REQUEST, "TextSizeLimitExceededException") }),
        );
        let endpoint = spawn_stub(app).await;

        let client = ComprehendMedicalClient::new(&endpoint, Duration::from_secs(5)).unwrap();
        let err = client.extract("x").await.unwrap_err();

        assert_eq!(
            err,
            ServiceError::Status {
                kind: ServiceKind::EntityExtraction,
                status: 400,
                body: "TextSizeLimitExceededException".into(),
            }
        );
    }

    #[tokio::test]
    async fn garbage_body_is_a_parsing_error() {
        let app = Router::new().route("/", post(|| async { "not json" }));
        let endpoint = spawn_stub(app).await;

        let client = ComprehendMedicalClient::new(&endpoint, Duration::from_secs(5)).unwrap();
        let err = client.extract("x").await.unwrap_err();

        assert!(matches!(
            err,
            ServiceError::ResponseParsing { kind: ServiceKind::EntityExtraction, .. }
        ));
    }
}
