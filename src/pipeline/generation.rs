//! Text generation adapter.
//!
//! `LlmGenerate` is the seam the orchestrator depends on; `BedrockGenerator`
//! speaks the Anthropic messages body over HTTP. The adapter never retries.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::service::{build_http_client, send_json, ServiceError, ServiceKind};

const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

/// Decoding parameters. Temperature is pinned to 0.0 by `deterministic`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DecodingParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl DecodingParams {
    pub fn deterministic(max_tokens: u32) -> Self {
        Self {
            temperature: 0.0,
            max_tokens,
        }
    }
}

/// Generated text plus usage metering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Text generation service.
#[async_trait]
pub trait LlmGenerate: Send + Sync {
    async fn generate(&self, prompt: &str, params: &DecodingParams)
        -> Result<Generation, ServiceError>;
}

/// HTTP generator for `{endpoint}/model/{model_id}/invoke`.
pub struct BedrockGenerator {
    endpoint: String,
    model_id: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl BedrockGenerator {
    pub fn new(endpoint: &str, model_id: &str, timeout: Duration) -> Result<Self, ServiceError> {
        let client = build_http_client(timeout).map_err(|e| ServiceError::HttpClient {
            kind: ServiceKind::Generation,
            message: e.to_string(),
        })?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model_id: model_id.to_string(),
            client,
            timeout,
        })
    }
}

/// Request body for the messages API
#[derive(Serialize)]
struct InvokeRequest<'a> {
    anthropic_version: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: [ContentIn<'a>; 1],
}

#[derive(Serialize)]
struct ContentIn<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    text: &'a str,
}

/// Response body from the messages API
#[derive(Deserialize)]
struct InvokeResponse {
    #[serde(default)]
    content: Vec<ContentOut>,
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentOut {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[async_trait]
impl LlmGenerate for BedrockGenerator {
    async fn generate(
        &self,
        prompt: &str,
        params: &DecodingParams,
    ) -> Result<Generation, ServiceError> {
        let body = InvokeRequest {
            anthropic_version: ANTHROPIC_VERSION,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            messages: [Message {
                role: "user",
                content: [ContentIn {
                    kind: "text",
                    text: prompt,
                }],
            }],
        };

        let url = format!("{}/model/{}/invoke", self.endpoint, self.model_id);
        let response: InvokeResponse = send_json(
            ServiceKind::Generation,
            &self.endpoint,
            self.timeout,
            self.client.post(&url),
            &body,
        )
        .await?;

        tracing::info!(
            model = %self.model_id,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            content_blocks = response.content.len(),
            "Generation usage"
        );

        // The last text block carries the answer.
        let text = response
            .content
            .into_iter()
            .filter(|c| c.kind == "text")
            .filter_map(|c| c.text)
            .last()
            .ok_or_else(|| {
                ServiceError::parsing(ServiceKind::Generation, "response has no text content")
            })?;

        Ok(Generation {
            text,
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        })
    }
}
