use std::process::ExitCode;
use std::sync::Arc;

use icd10_review::api::start_server;
use icd10_review::config::{self, ServiceConfig};
use icd10_review::pipeline::entities::ComprehendMedicalClient;
use icd10_review::pipeline::generation::BedrockGenerator;
use icd10_review::pipeline::orchestrator::{DiagnosisPipeline, PipelineOptions};
use icd10_review::pipeline::retrieval::KnowledgeBaseClient;
use icd10_review::pipeline::service::ServiceError;

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine; variables may come from the environment.
    let _ = dotenvy::dotenv();
    icd10_review::init_tracing();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let cfg = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let pipeline = match build_pipeline(&cfg) {
        Ok(pipeline) => Arc::new(pipeline),
        Err(e) => {
            tracing::error!(error = %e, "Failed to build service clients");
            return ExitCode::FAILURE;
        }
    };

    let mut server = match start_server(pipeline, cfg.bind_addr).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(addr = %cfg.bind_addr, error = %e, "Failed to bind");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
    server.shutdown();
    server.stopped().await;

    ExitCode::SUCCESS
}

fn build_pipeline(cfg: &ServiceConfig) -> Result<DiagnosisPipeline, ServiceError> {
    let extractor = ComprehendMedicalClient::new(&cfg.entity_endpoint, cfg.call_timeout)?;
    let generator =
        BedrockGenerator::new(&cfg.generation_endpoint, &cfg.model_id, cfg.call_timeout)?;
    let retriever = KnowledgeBaseClient::new(
        &cfg.retrieval_endpoint,
        &cfg.knowledge_base_id,
        cfg.call_timeout,
    )?;

    tracing::info!(
        model = %cfg.model_id,
        threshold = cfg.confidence_threshold,
        top_k = cfg.number_of_results,
        fanout = cfg.retrieval_fanout,
        timeout_secs = cfg.call_timeout.as_secs(),
        dump = cfg.dump_dir.is_some(),
        "Pipeline configured"
    );

    Ok(DiagnosisPipeline::new(
        Arc::new(extractor),
        Arc::new(generator),
        Arc::new(retriever),
        PipelineOptions::from(cfg),
    ))
}
