//! Test doubles for the three collaborators plus a local HTTP stub server.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::entities::{CodedEntity, EntityExtractor};
use super::generation::{DecodingParams, Generation, LlmGenerate};
use super::retrieval::{KnowledgeRetriever, RetrievedPassage};
use super::service::{ServiceError, ServiceKind};

/// Serve `router` on an ephemeral localhost port and return its base URL.
pub async fn spawn_stub(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

// ── Extractor ─────────────────────────────────────────────

pub struct ScriptedExtractor {
    response: Result<Vec<CodedEntity>, ServiceError>,
    calls: AtomicUsize,
}

impl ScriptedExtractor {
    pub fn returning(entities: Vec<CodedEntity>) -> Self {
        Self {
            response: Ok(entities),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: ServiceError) -> Self {
        Self {
            response: Err(error),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntityExtractor for ScriptedExtractor {
    async fn extract(&self, _text: &str) -> Result<Vec<CodedEntity>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response.clone()
    }
}

// ── Generator ─────────────────────────────────────────────

/// Replies from a queue, one per call, and records every prompt.
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<Generation, ServiceError>>>,
    prompts: Mutex<Vec<String>>,
    params: Mutex<Vec<DecodingParams>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            params: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(self, text: &str) -> Self {
        self.replies.lock().unwrap().push_back(Ok(Generation {
            text: text.to_string(),
            input_tokens: 100,
            output_tokens: 50,
        }));
        self
    }

    pub fn fail(self, error: ServiceError) -> Self {
        self.replies.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn params(&self) -> Vec<DecodingParams> {
        self.params.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmGenerate for ScriptedGenerator {
    async fn generate(
        &self,
        prompt: &str,
        params: &DecodingParams,
    ) -> Result<Generation, ServiceError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.params.lock().unwrap().push(*params);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ServiceError::parsing(ServiceKind::Generation, "no scripted reply")))
    }
}

// ── Retriever ─────────────────────────────────────────────

/// Answers every query with one passage "Guideline for {condition}".
/// Tracks calls in flight so tests can assert the concurrency bound.
pub struct ScriptedRetriever {
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    failing: HashSet<String>,
    calls: AtomicUsize,
    completed: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl ScriptedRetriever {
    pub fn new() -> Self {
        Self {
            delays: HashMap::new(),
            default_delay: Duration::ZERO,
            failing: HashSet::new(),
            calls: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn delay(mut self, condition: &str, delay: Duration) -> Self {
        self.delays.insert(condition.to_string(), delay);
        self
    }

    pub fn default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn fail(mut self, condition: &str) -> Self {
        self.failing.insert(condition.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls that ran to completion (not dropped mid-flight).
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl KnowledgeRetriever for ScriptedRetriever {
    async fn retrieve(
        &self,
        query: &str,
        _top_k: usize,
    ) -> Result<Vec<RetrievedPassage>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let condition = query
            .strip_prefix("Find all the information about ")
            .unwrap_or(query)
            .to_string();
        let delay = self
            .delays
            .get(&condition)
            .copied()
            .unwrap_or(self.default_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);

        if self.failing.contains(&condition) {
            return Err(ServiceError::Status {
                kind: ServiceKind::Retrieval,
                status: 500,
                body: "InternalServerException".into(),
            });
        }

        Ok(vec![RetrievedPassage {
            text: format!("Guideline for {condition}"),
            score: Some(0.5),
            source_uri: None,
        }])
    }
}
