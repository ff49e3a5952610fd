use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use super::service::{build_http_client, send_json, ServiceError, ServiceKind};

/// One ranked passage from the knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedPassage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
}

/// Passages retrieved for one condition, in rank order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub query_condition: String,
    pub passages: Vec<RetrievedPassage>,
}

/// Semantic retrieval over the coding-guideline knowledge base.
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    async fn retrieve(&self, query: &str, top_k: usize)
        -> Result<Vec<RetrievedPassage>, ServiceError>;
}

/// Natural-language query sent for a condition description.
pub fn retrieval_query(condition: &str) -> String {
    format!("Find all the information about {condition}")
}

// ═══════════════════════════════════════════════════════════
// Fan-out
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
pub struct RetrievalOptions {
    pub top_k: usize,
    /// Max calls in flight.
    pub fanout: usize,
    pub timeout: Duration,
    pub dedupe: bool,
}

/// Result of retrieving for a single condition. A failed call still yields
/// a `RetrievalResult` (with no passages) plus the error.
#[derive(Debug, Clone)]
pub struct ConditionRetrieval {
    pub result: RetrievalResult,
    pub error: Option<ServiceError>,
}

/// Retrieve passages for every condition with at most `fanout` calls in
/// flight. Output order follows `conditions` (first occurrence order when
/// deduplicating), whatever order the calls finish in.
pub async fn retrieve_for_conditions(
    retriever: &dyn KnowledgeRetriever,
    conditions: &[String],
    options: &RetrievalOptions,
) -> Vec<ConditionRetrieval> {
    let conditions = if options.dedupe {
        dedupe_preserving_order(conditions)
    } else {
        conditions.to_vec()
    };

    stream::iter(conditions.into_iter().map(|condition| async move {
        let query = retrieval_query(&condition);
        let outcome =
            match tokio::time::timeout(options.timeout, retriever.retrieve(&query, options.top_k))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(ServiceError::Timeout {
                    kind: ServiceKind::Retrieval,
                    after: options.timeout,
                }),
            };

        match outcome {
            Ok(passages) => ConditionRetrieval {
                result: RetrievalResult {
                    query_condition: condition,
                    passages,
                },
                error: None,
            },
            Err(e) => ConditionRetrieval {
                result: RetrievalResult {
                    query_condition: condition,
                    passages: Vec::new(),
                },
                error: Some(e),
            },
        }
    }))
    .buffered(options.fanout.max(1))
    .collect()
    .await
}

fn dedupe_preserving_order(conditions: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    conditions
        .iter()
        .filter(|c| seen.insert(c.as_str()))
        .cloned()
        .collect()
}

/// Guidelines payload for the second-pass prompt.
pub fn guidelines_json(results: &[RetrievalResult]) -> String {
    #[derive(Serialize)]
    struct Guideline<'a> {
        medical_condition: &'a str,
        kb_context: &'a [RetrievedPassage],
    }

    let guidelines: Vec<Guideline<'_>> = results
        .iter()
        .map(|r| Guideline {
            medical_condition: &r.query_condition,
            kb_context: &r.passages,
        })
        .collect();

    serde_json::to_string(&guidelines).unwrap_or_else(|_| "[]".to_string())
}

// ═══════════════════════════════════════════════════════════
// HTTP adapter
// ═══════════════════════════════════════════════════════════

/// HTTP client for `{endpoint}/knowledgebases/{id}/retrieve`.
pub struct KnowledgeBaseClient {
    endpoint: String,
    knowledge_base_id: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl KnowledgeBaseClient {
    pub fn new(
        endpoint: &str,
        knowledge_base_id: &str,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = build_http_client(timeout).map_err(|e| ServiceError::HttpClient {
            kind: ServiceKind::Retrieval,
            message: e.to_string(),
        })?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            knowledge_base_id: knowledge_base_id.to_string(),
            client,
            timeout,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveRequest<'a> {
    retrieval_query: RetrievalQuery<'a>,
    retrieval_configuration: RetrievalConfiguration,
}

#[derive(Serialize)]
struct RetrievalQuery<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RetrievalConfiguration {
    vector_search_configuration: VectorSearchConfiguration,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VectorSearchConfiguration {
    number_of_results: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveResponse {
    #[serde(default)]
    retrieval_results: Vec<WireResult>,
}

#[derive(Deserialize)]
struct WireResult {
    content: WireContent,
    #[serde(default)]
    location: Option<WireLocation>,
    #[serde(default)]
    score: Option<f64>,
}

#[derive(Deserialize)]
struct WireContent {
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLocation {
    #[serde(default)]
    s3_location: Option<WireUri>,
    #[serde(default)]
    web_location: Option<WireUrl>,
}

#[derive(Deserialize)]
struct WireUri {
    uri: String,
}

#[derive(Deserialize)]
struct WireUrl {
    url: String,
}

#[async_trait]
impl KnowledgeRetriever for KnowledgeBaseClient {
    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedPassage>, ServiceError> {
        let url = format!(
            "{}/knowledgebases/{}/retrieve",
            self.endpoint, self.knowledge_base_id
        );
        let body = RetrieveRequest {
            retrieval_query: RetrievalQuery { text: query },
            retrieval_configuration: RetrievalConfiguration {
                vector_search_configuration: VectorSearchConfiguration {
                    number_of_results: top_k,
                },
            },
        };

        let response: RetrieveResponse = send_json(
            ServiceKind::Retrieval,
            &self.endpoint,
            self.timeout,
            self.client.post(&url),
            &body,
        )
        .await?;

        Ok(response
            .retrieval_results
            .into_iter()
            .map(|r| RetrievedPassage {
                text: r.content.text,
                score: r.score,
                source_uri: r.location.and_then(|l| {
                    l.s3_location
                        .map(|s| s.uri)
                        .or_else(|| l.web_location.map(|w| w.url))
                }),
            })
            .collect())
    }
}
