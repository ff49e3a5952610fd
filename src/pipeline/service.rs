//! Shared plumbing for the three external collaborators (entity extraction,
//! text generation, knowledge retrieval): one error type tagged with the
//! service it came from, and a JSON POST helper that maps reqwest failures
//! onto it.

use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which collaborator a call went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    EntityExtraction,
    Generation,
    Retrieval,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntityExtraction => write!(f, "entity extraction"),
            Self::Generation => write!(f, "generation"),
            Self::Retrieval => write!(f, "retrieval"),
        }
    }
}

/// Failure of an external service call. Never retried by the adapters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("{kind} service unreachable at {endpoint}")]
    Connection { kind: ServiceKind, endpoint: String },

    #[error("{kind} call timed out after {}s", .after.as_secs())]
    Timeout { kind: ServiceKind, after: Duration },

    #[error("{kind} service returned error (status {status}): {body}")]
    Status {
        kind: ServiceKind,
        status: u16,
        body: String,
    },

    #[error("{kind} HTTP client error: {message}")]
    HttpClient { kind: ServiceKind, message: String },

    #[error("{kind} response parsing error: {message}")]
    ResponseParsing { kind: ServiceKind, message: String },
}

impl ServiceError {
    pub fn kind(&self) -> ServiceKind {
        match self {
            Self::Connection { kind, .. }
            | Self::Timeout { kind, .. }
            | Self::Status { kind, .. }
            | Self::HttpClient { kind, .. }
            | Self::ResponseParsing { kind, .. } => *kind,
        }
    }

    pub fn parsing(kind: ServiceKind, message: impl Into<String>) -> Self {
        Self::ResponseParsing {
            kind,
            message: message.into(),
        }
    }
}

/// Build the shared reqwest client. Timeouts bound both connect and read.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
}

/// Map a reqwest send error to a `ServiceError`.
pub fn classify_send_error(
    kind: ServiceKind,
    endpoint: &str,
    timeout: Duration,
    e: reqwest::Error,
) -> ServiceError {
    if e.is_timeout() {
        ServiceError::Timeout {
            kind,
            after: timeout,
        }
    } else if e.is_connect() {
        ServiceError::Connection {
            kind,
            endpoint: endpoint.to_string(),
        }
    } else {
        ServiceError::HttpClient {
            kind,
            message: e.to_string(),
        }
    }
}

/// POST a JSON body and decode a JSON response.
///
/// `request` is a pre-configured builder (URL and extra headers already set).
pub async fn send_json<B, R>(
    kind: ServiceKind,
    endpoint: &str,
    timeout: Duration,
    request: reqwest::RequestBuilder,
    body: &B,
) -> Result<R, ServiceError>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let response = request
        .json(body)
        .send()
        .await
        .map_err(|e| classify_send_error(kind, endpoint, timeout, e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ServiceError::Status {
            kind,
            status: status.as_u16(),
            body,
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| classify_send_error(kind, endpoint, timeout, e))?;

    serde_json::from_slice(&bytes).map_err(|e| ServiceError::parsing(kind, e.to_string()))
}
