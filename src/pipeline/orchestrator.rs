//! Diagnosis review orchestrator.
//!
//! Drives one run through the fixed stage sequence:
//! extract → filter → first prompt → first generation → parse →
//! retrieval fan-out → second prompt → second generation → final parse.
//!
//! Collaborators are injected as trait objects so the orchestrator is fully
//! testable with scripted implementations. Entity extraction, either
//! generation call, or an unbound prompt placeholder fail the run. Parse
//! issues and per-condition retrieval failures are recorded as degradations
//! and the run continues with what it has.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{self, ServiceConfig};
use crate::pipeline::diagnostic;
use crate::pipeline::entities::{filter_entities, EntityExtractor};
use crate::pipeline::generation::{DecodingParams, Generation, LlmGenerate};
use crate::pipeline::prompt_templates::{
    compose, Placeholder, PromptBindings, PromptError, PromptVariant,
};
use crate::pipeline::recommendation::{parse_recommendation, ParseIssue, Recommendation};
use crate::pipeline::retrieval::{
    guidelines_json, retrieve_for_conditions, KnowledgeRetriever, RetrievalOptions,
    RetrievalResult,
};
use crate::pipeline::service::{ServiceError, ServiceKind};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that end a run. Retrieval has no variant: a failed condition
/// only degrades the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Extraction(ServiceError),

    #[error(transparent)]
    Generation(ServiceError),

    #[error(transparent)]
    Prompt(#[from] PromptError),
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Extraction(_) => FailureKind::ExtractionService,
            Self::Generation(_) => FailureKind::GenerationService,
            Self::Prompt(PromptError::MissingBinding { .. }) => FailureKind::MissingBinding,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ExtractionService,
    GenerationService,
    MissingBinding,
}

impl FailureKind {
    /// A defect in this service rather than in one of its collaborators.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::MissingBinding)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationKind {
    ParseMiss,
    ParseError,
    IncompleteRecords,
    RetrievalService,
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Start,
    Extracting,
    FirstPrompt,
    FirstGenerate,
    FirstParse,
    Retrieving,
    SecondPrompt,
    SecondGenerate,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub stage: RunStage,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Degradation {
    pub kind: DegradationKind,
    pub stage: RunStage,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalSummary {
    pub condition: String,
    pub passages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassUsage {
    pub pass: PromptVariant,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Everything recorded about a run besides its final text.
#[derive(Debug, Clone, Serialize)]
pub struct RunDiagnostics {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Last stage reached (`Failed` for failed runs).
    pub stage: RunStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub degradations: Vec<Degradation>,
    pub filtered_entity_count: usize,
    pub conditions: Vec<String>,
    pub retrieval: Vec<RetrievalSummary>,
    pub usage: Vec<PassUsage>,
}

/// Result of a run. Always produced, even for failed runs.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub final_text: String,
    pub status: RunStatus,
    pub diagnostics: RunDiagnostics,
    /// Parsed final recommendation, when the final text carried one.
    pub recommendation: Option<Recommendation>,
}

/// Per-invocation aggregate. Owned by one `run` call.
struct PipelineRun {
    diagnostics: RunDiagnostics,
    dump_dir: Option<PathBuf>,
    final_text: String,
    recommendation: Option<Recommendation>,
}

impl PipelineRun {
    fn new(dump_base: Option<&Path>) -> Self {
        let run_id = Uuid::new_v4();
        Self {
            diagnostics: RunDiagnostics {
                run_id,
                started_at: Utc::now(),
                stage: RunStage::Start,
                failure: None,
                degradations: Vec::new(),
                filtered_entity_count: 0,
                conditions: Vec::new(),
                retrieval: Vec::new(),
                usage: Vec::new(),
            },
            dump_dir: diagnostic::dump_dir_for(dump_base, &run_id),
            final_text: String::new(),
            recommendation: None,
        }
    }

    fn enter(&mut self, stage: RunStage) {
        tracing::debug!(from = ?self.diagnostics.stage, to = ?stage, "Stage transition");
        self.diagnostics.stage = stage;
    }

    fn degrade(&mut self, kind: DegradationKind, detail: String, condition: Option<String>) {
        let stage = self.diagnostics.stage;
        tracing::warn!(?kind, ?stage, detail = %detail, "Run degraded");
        self.diagnostics.degradations.push(Degradation {
            kind,
            stage,
            detail,
            condition,
        });
    }

    fn degrade_parse(&mut self, issue: &ParseIssue) {
        let kind = match issue {
            ParseIssue::Miss => DegradationKind::ParseMiss,
            ParseIssue::Malformed(_) => DegradationKind::ParseError,
        };
        self.degrade(kind, issue.to_string(), None);
    }

    fn fail(&mut self, error: PipelineError) {
        let stage = self.diagnostics.stage;
        let kind = error.kind();
        tracing::error!(?kind, ?stage, error = %error, "Run failed");
        self.diagnostics.failure = Some(RunFailure {
            kind,
            stage,
            message: error.to_string(),
        });
        self.diagnostics.stage = RunStage::Failed;
    }

    fn record_usage(&mut self, pass: PromptVariant, generation: &Generation) {
        self.diagnostics.usage.push(PassUsage {
            pass,
            input_tokens: generation.input_tokens,
            output_tokens: generation.output_tokens,
        });
    }

    fn dump_json<T: Serialize>(&self, filename: &str, value: &T) {
        if let Some(dir) = &self.dump_dir {
            diagnostic::dump_json(dir, filename, value);
        }
    }

    fn dump_text(&self, filename: &str, text: &str) {
        if let Some(dir) = &self.dump_dir {
            diagnostic::dump_text(dir, filename, text);
        }
    }

    fn finish(self) -> RunOutcome {
        let status = if self.diagnostics.failure.is_some() {
            RunStatus::Failed
        } else if !self.diagnostics.degradations.is_empty() {
            RunStatus::Partial
        } else {
            RunStatus::Success
        };

        let outcome = RunOutcome {
            final_text: self.final_text,
            status,
            diagnostics: self.diagnostics,
            recommendation: self.recommendation,
        };
        if let Some(dir) = &self.dump_dir {
            diagnostic::dump_json(dir, diagnostic::OUTCOME_FILE, &outcome);
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Tunables for a run, usually taken from [`ServiceConfig`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub confidence_threshold: f32,
    pub number_of_results: usize,
    pub retrieval_fanout: usize,
    pub call_timeout: Duration,
    pub max_tokens: u32,
    pub dedupe_retrieval: bool,
    pub dump_dir: Option<PathBuf>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: config::DEFAULT_CONFIDENCE_THRESHOLD,
            number_of_results: config::DEFAULT_NUMBER_OF_RESULTS,
            retrieval_fanout: config::DEFAULT_RETRIEVAL_FANOUT,
            call_timeout: Duration::from_secs(config::DEFAULT_CALL_TIMEOUT_SECS),
            max_tokens: config::DEFAULT_MAX_TOKENS,
            dedupe_retrieval: false,
            dump_dir: None,
        }
    }
}

impl From<&ServiceConfig> for PipelineOptions {
    fn from(cfg: &ServiceConfig) -> Self {
        Self {
            confidence_threshold: cfg.confidence_threshold,
            number_of_results: cfg.number_of_results,
            retrieval_fanout: cfg.retrieval_fanout,
            call_timeout: cfg.call_timeout,
            max_tokens: cfg.max_tokens,
            dedupe_retrieval: cfg.dedupe_retrieval,
            dump_dir: cfg.dump_dir.clone(),
        }
    }
}

/// Two-pass diagnosis review over injected collaborators.
///
/// Holds no per-run state, so one instance serves concurrent runs.
pub struct DiagnosisPipeline {
    extractor: Arc<dyn EntityExtractor>,
    generator: Arc<dyn LlmGenerate>,
    retriever: Arc<dyn KnowledgeRetriever>,
    options: PipelineOptions,
}

impl DiagnosisPipeline {
    pub fn new(
        extractor: Arc<dyn EntityExtractor>,
        generator: Arc<dyn LlmGenerate>,
        retriever: Arc<dyn KnowledgeRetriever>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            extractor,
            generator,
            retriever,
            options,
        }
    }

    /// Review one note. Never returns an error: failures are reported
    /// through `RunOutcome::status` and the diagnostics.
    pub async fn run(&self, note: &str) -> RunOutcome {
        let mut run = PipelineRun::new(self.options.dump_dir.as_deref());
        let span = tracing::info_span!("diagnosis_run", run_id = %run.diagnostics.run_id);

        async {
            tracing::info!(note_len = note.len(), "Run started");
            if let Err(e) = self.drive(&mut run, note).await {
                run.fail(e);
            }
            let outcome = run.finish();
            tracing::info!(
                status = ?outcome.status,
                degradations = outcome.diagnostics.degradations.len(),
                "Run finished"
            );
            outcome
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, run: &mut PipelineRun, note: &str) -> Result<(), PipelineError> {
        let params = DecodingParams::deterministic(self.options.max_tokens);

        // Extraction
        run.enter(RunStage::Extracting);
        let entities = self
            .bounded(ServiceKind::EntityExtraction, self.extractor.extract(note))
            .await
            .map_err(PipelineError::Extraction)?;
        let filtered = filter_entities(&entities, self.options.confidence_threshold);
        tracing::debug!(
            extracted = entities.len(),
            kept = filtered.len(),
            "Entities filtered"
        );
        run.diagnostics.filtered_entity_count = filtered.len();
        run.dump_json(diagnostic::ENTITIES_FILE, &filtered);

        // First pass
        run.enter(RunStage::FirstPrompt);
        let entities_json = serde_json::to_string(&filtered).unwrap_or_else(|_| "[]".to_string());
        let bindings = PromptBindings::new()
            .bind(Placeholder::NoteText, note)
            .bind(Placeholder::CodedEntitiesJson, entities_json);
        let first_prompt = compose(PromptVariant::FirstPass, &bindings)?;
        run.dump_text(diagnostic::FIRST_PROMPT_FILE, &first_prompt);

        run.enter(RunStage::FirstGenerate);
        let first = self
            .bounded(
                ServiceKind::Generation,
                self.generator.generate(&first_prompt, &params),
            )
            .await
            .map_err(PipelineError::Generation)?;
        run.record_usage(PromptVariant::FirstPass, &first);
        run.dump_text(diagnostic::FIRST_RESPONSE_FILE, &first.text);

        // The parse only selects conditions; the second pass gets the whole
        // first response, reasoning included.
        run.enter(RunStage::FirstParse);
        let first_recommendation = match parse_recommendation(&first.text) {
            Ok(parsed) => {
                if parsed.skipped_records > 0 {
                    run.degrade(
                        DegradationKind::IncompleteRecords,
                        format!("{} incomplete records skipped", parsed.skipped_records),
                        None,
                    );
                }
                parsed.recommendation
            }
            Err(issue) => {
                run.degrade_parse(&issue);
                Recommendation::default()
            }
        };

        // Retrieval
        run.enter(RunStage::Retrieving);
        let conditions = first_recommendation.flatten();
        run.diagnostics.conditions = conditions.clone();
        let retrieval_options = RetrievalOptions {
            top_k: self.options.number_of_results,
            fanout: self.options.retrieval_fanout,
            timeout: self.options.call_timeout,
            dedupe: self.options.dedupe_retrieval,
        };
        let retrieved =
            retrieve_for_conditions(self.retriever.as_ref(), &conditions, &retrieval_options).await;

        let mut results: Vec<RetrievalResult> = Vec::with_capacity(retrieved.len());
        for item in retrieved {
            run.diagnostics.retrieval.push(RetrievalSummary {
                condition: item.result.query_condition.clone(),
                passages: item.result.passages.len(),
                error: item.error.as_ref().map(ToString::to_string),
            });
            if let Some(e) = item.error {
                run.degrade(
                    DegradationKind::RetrievalService,
                    e.to_string(),
                    Some(item.result.query_condition.clone()),
                );
            }
            results.push(item.result);
        }
        run.dump_json(diagnostic::RETRIEVAL_FILE, &results);

        // Second pass
        run.enter(RunStage::SecondPrompt);
        let bindings = PromptBindings::new()
            .bind(Placeholder::NoteText, note)
            .bind(Placeholder::FirstPassRecommendation, first.text.as_str())
            .bind(Placeholder::RetrievedGuidelinesJson, guidelines_json(&results));
        let second_prompt = compose(PromptVariant::SecondPass, &bindings)?;
        run.dump_text(diagnostic::SECOND_PROMPT_FILE, &second_prompt);

        run.enter(RunStage::SecondGenerate);
        let second = self
            .bounded(
                ServiceKind::Generation,
                self.generator.generate(&second_prompt, &params),
            )
            .await
            .map_err(PipelineError::Generation)?;
        run.record_usage(PromptVariant::SecondPass, &second);
        run.dump_text(diagnostic::SECOND_RESPONSE_FILE, &second.text);

        match parse_recommendation(&second.text) {
            Ok(parsed) => {
                if parsed.skipped_records > 0 {
                    run.degrade(
                        DegradationKind::IncompleteRecords,
                        format!("{} incomplete records skipped", parsed.skipped_records),
                        None,
                    );
                }
                run.recommendation = Some(parsed.recommendation);
            }
            Err(issue) => run.degrade_parse(&issue),
        }
        run.final_text = second.text;

        run.enter(RunStage::Done);
        Ok(())
    }

    /// Apply the per-call timeout to a collaborator call.
    async fn bounded<T>(
        &self,
        kind: ServiceKind,
        call: impl Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, ServiceError> {
        let after = self.options.call_timeout;
        tokio::time::timeout(after, call)
            .await
            .unwrap_or(Err(ServiceError::Timeout { kind, after }))
    }
}
