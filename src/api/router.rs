//! HTTP router for the review service.
//!
//! `POST /process` takes the raw note as the request body and delegates to
//! [`handle_invocation`]. `GET /health` reports liveness and version.
//! Responses carry `Cache-Control: no-store` since they contain PHI.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::api::error::ApiError;
use crate::api::types::{handle_invocation, ApiContext, InvocationEvent};
use crate::pipeline::orchestrator::DiagnosisPipeline;

/// Build the service router around a shared pipeline.
pub fn review_router(pipeline: Arc<DiagnosisPipeline>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/process", post(process))
        .with_state(ApiContext::new(pipeline))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(TraceLayer::new_for_http())
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// `GET /health`
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: crate::config::APP_VERSION,
    })
}

/// `POST /process`. The HTTP status mirrors `statusCode` in the body.
async fn process(State(ctx): State<ApiContext>, body: String) -> Result<Response, ApiError> {
    let response = handle_invocation(&ctx.pipeline, InvocationEvent { body }).await?;
    let status =
        StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Ok((status, Json(response)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::pipeline::entities::{CodedConcept, CodedEntity, EntityCategory};
    use crate::pipeline::orchestrator::PipelineOptions;
    use crate::pipeline::service::{ServiceError, ServiceKind};
    use crate::pipeline::testing::{ScriptedExtractor, ScriptedGenerator, ScriptedRetriever};

    const BLOCK: &str = r#"<recommendation>{"Active_Condition": [{"Review": {"DX_Code": "I26.99", "Description": "Pulmonary embolism", "Memo": {"date": "2023-07-22", "note": "CT angiogram"}}}]}</recommendation>"#;

    fn router(
        extractor: ScriptedExtractor,
        generator: ScriptedGenerator,
        retriever: ScriptedRetriever,
    ) -> Router {
        review_router(Arc::new(DiagnosisPipeline::new(
            Arc::new(extractor),
            Arc::new(generator),
            Arc::new(retriever),
            PipelineOptions::default(),
        )))
    }

    fn pe_extractor() -> ScriptedExtractor {
        ScriptedExtractor::returning(vec![CodedEntity {
            text: "pulmonary embolism".into(),
            category: EntityCategory::MedicalCondition,
            codes: vec![CodedConcept {
                code: "I26.99".into(),
                description: None,
                score: 0.93,
            }],
        }])
    }

    fn process_request(note: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/process")
            .header("Content-Type", "text/plain")
            .body(Body::from(note.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = router(
            pe_extractor(),
            ScriptedGenerator::new(),
            ScriptedRetriever::new(),
        );

        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn process_success_returns_200() {
        let app = router(
            pe_extractor(),
            ScriptedGenerator::new().reply(BLOCK).reply(BLOCK),
            ScriptedRetriever::new(),
        );

        let response = app
            .oneshot(process_request("CT angiogram confirms acute PE."))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-store");
        let json = json_body(response).await;
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["status"], "SUCCESS");
        assert_eq!(json["recommendation"]["Active_Condition"][0]["Review"]["DX_Code"], "I26.99");
    }

    #[tokio::test]
    async fn partial_run_still_returns_200() {
        let app = router(
            pe_extractor(),
            ScriptedGenerator::new().reply(BLOCK).reply(BLOCK),
            ScriptedRetriever::new().fail("Pulmonary embolism"),
        );

        let response = app.oneshot(process_request("Acute PE.")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "PARTIAL");
        assert_eq!(json["diagnostics"]["degradations"][0]["kind"], "retrieval_service");
        assert_eq!(
            json["diagnostics"]["degradations"][0]["condition"],
            "Pulmonary embolism"
        );
    }

    #[tokio::test]
    async fn generation_failure_returns_502() {
        let app = router(
            pe_extractor(),
            ScriptedGenerator::new().fail(ServiceError::Connection {
                kind: ServiceKind::Generation,
                endpoint: "http://127.0.0.1:1".into(),
            }),
            ScriptedRetriever::new(),
        );

        let response = app.oneshot(process_request("Acute PE.")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = json_body(response).await;
        assert_eq!(json["statusCode"], 502);
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["diagnostics"]["failure"]["kind"], "generation_service");
        assert_eq!(json["diagnostics"]["failure"]["stage"], "first_generate");
    }

    #[tokio::test]
    async fn empty_body_is_rejected_with_400() {
        let app = router(
            pe_extractor(),
            ScriptedGenerator::new(),
            ScriptedRetriever::new(),
        );

        let response = app.oneshot(process_request("")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert_eq!(json["error"]["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let app = router(
            pe_extractor(),
            ScriptedGenerator::new(),
            ScriptedRetriever::new(),
        );

        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
