use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "icd10-review";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix shared by every deployment variable.
pub const ENV_PREFIX: &str = "ICD10_REVIEW_";

pub const DEFAULT_MODEL_ID: &str = "anthropic.claude-3-haiku-20240307-v1:0";
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.70;
pub const DEFAULT_NUMBER_OF_RESULTS: usize = 5;
pub const DEFAULT_RETRIEVAL_FANOUT: usize = 5;
pub const MAX_RETRIEVAL_FANOUT: usize = 10;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

/// Default tracing filter when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "icd10_review=debug,tower_http=info"
    } else {
        "icd10_review=info"
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    Missing(String),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// Deployment-scoped configuration for one service instance.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Base URLs of the gateways that sign and forward each call.
    pub entity_endpoint: String,
    pub generation_endpoint: String,
    pub retrieval_endpoint: String,
    pub knowledge_base_id: String,
    pub model_id: String,
    pub max_tokens: u32,
    /// Minimum extractor score for a coded concept to survive filtering.
    pub confidence_threshold: f32,
    /// `numberOfResults` requested from the knowledge base per condition.
    pub number_of_results: usize,
    /// Maximum retrieval calls in flight at once.
    pub retrieval_fanout: usize,
    pub call_timeout: Duration,
    pub dedupe_retrieval: bool,
    pub bind_addr: SocketAddr,
    pub dump_dir: Option<PathBuf>,
}

impl ServiceConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary lookup (keys are the full variable names).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| -> Option<String> {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let required = |name: &str| -> Result<String, ConfigError> {
            get(name).ok_or_else(|| ConfigError::Missing(format!("{ENV_PREFIX}{name}")))
        };

        // Requests leave unsigned, so there is no provider default to fall back on.
        let endpoint = |name: &str| -> Result<String, ConfigError> {
            let url = required(name)?;
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(invalid(name, "expected an http(s) URL"));
            }
            Ok(url.trim_end_matches('/').to_string())
        };

        let entity_endpoint = endpoint("ENTITY_ENDPOINT")?;
        let generation_endpoint = endpoint("GENERATION_ENDPOINT")?;
        let retrieval_endpoint = endpoint("RETRIEVAL_ENDPOINT")?;
        let knowledge_base_id = required("KNOWLEDGE_BASE_ID")?;

        let confidence_threshold: f32 =
            parse_or(&get, "CONFIDENCE_THRESHOLD", DEFAULT_CONFIDENCE_THRESHOLD)?;
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(invalid("CONFIDENCE_THRESHOLD", "must be between 0.0 and 1.0"));
        }

        let number_of_results: usize =
            parse_or(&get, "NUMBER_OF_RESULTS", DEFAULT_NUMBER_OF_RESULTS)?;
        if number_of_results == 0 {
            return Err(invalid("NUMBER_OF_RESULTS", "must be at least 1"));
        }

        let retrieval_fanout: usize = parse_or(&get, "RETRIEVAL_FANOUT", DEFAULT_RETRIEVAL_FANOUT)?;
        if !(1..=MAX_RETRIEVAL_FANOUT).contains(&retrieval_fanout) {
            return Err(invalid(
                "RETRIEVAL_FANOUT",
                &format!("must be between 1 and {MAX_RETRIEVAL_FANOUT}"),
            ));
        }

        let timeout_secs: u64 = parse_or(&get, "CALL_TIMEOUT_SECS", DEFAULT_CALL_TIMEOUT_SECS)?;
        if timeout_secs == 0 {
            return Err(invalid("CALL_TIMEOUT_SECS", "must be at least 1"));
        }

        let max_tokens: u32 = parse_or(&get, "MAX_TOKENS", DEFAULT_MAX_TOKENS)?;
        if max_tokens == 0 {
            return Err(invalid("MAX_TOKENS", "must be at least 1"));
        }

        let dedupe_retrieval = match get("DEDUPE_RETRIEVAL") {
            None => false,
            Some(raw) => parse_bool(&raw).ok_or_else(|| {
                invalid("DEDUPE_RETRIEVAL", "expected true/false, yes/no or 1/0")
            })?,
        };

        let bind_addr: SocketAddr = match get("BIND_ADDR") {
            Some(raw) => raw
                .parse()
                .map_err(|e: std::net::AddrParseError| invalid("BIND_ADDR", &e.to_string()))?,
            None => DEFAULT_BIND_ADDR
                .parse()
                .map_err(|e: std::net::AddrParseError| invalid("BIND_ADDR", &e.to_string()))?,
        };

        Ok(Self {
            entity_endpoint,
            generation_endpoint,
            retrieval_endpoint,
            knowledge_base_id,
            model_id: get("MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            max_tokens,
            confidence_threshold,
            number_of_results,
            retrieval_fanout,
            call_timeout: Duration::from_secs(timeout_secs),
            dedupe_retrieval,
            bind_addr,
            dump_dir: get("DUMP_DIR").map(PathBuf::from),
        })
    }
}

fn invalid(name: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: format!("{ENV_PREFIX}{name}"),
        reason: reason.to_string(),
    }
}

fn parse_or<T, G>(get: &G, name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| invalid(name, &e.to_string())),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
