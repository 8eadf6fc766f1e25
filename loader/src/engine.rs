//! Engine invoker: opaque entity-resolution calls with error classification
//!
//! The engine is an external collaborator with a JSON-in/JSON-out-or-error
//! contract. The invoker applies no retry of its own; it only classifies
//! failures so the dispatcher can decide what happens next.

use async_trait::async_trait;
use loader_common::{Action, Record};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// How the loader must react to a failed engine call.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Per-record validation or business rejection. Not retryable; the
    /// record goes to the failure sink.
    #[error("record rejected: {0}")]
    Rejected(String),

    /// Transient resource problem; the call may be retried.
    #[error("engine unavailable: {0}")]
    Transient(String),

    /// Structural or licensing failure; the process must shut down.
    #[error("fatal engine failure: {0}")]
    Fatal(String),
}

/// Result of one engine call: an info payload for with-info actions,
/// nothing otherwise.
pub type EngineResult = std::result::Result<Option<Value>, EngineError>;

/// The entity-resolution engine collaborator.
///
/// One shared thread-safe handle serves every worker; a deployment that
/// wants per-worker handles constructs one invoker per worker instead.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn call(&self, action: Action, record: &Record) -> EngineResult;
}

/// Engine that accepts every record without doing anything.
///
/// Backs the acceptance-test subcommand, where the point is to exercise
/// consumption and acknowledgment, not resolution.
pub struct NullEngine;

#[async_trait]
impl Engine for NullEngine {
    async fn call(&self, action: Action, record: &Record) -> EngineResult {
        debug!(
            action = %action,
            record_id = record.record_id(),
            "null engine accepted record"
        );
        if action.with_info() {
            Ok(Some(Value::Object(serde_json::Map::new())))
        } else {
            Ok(None)
        }
    }
}

/// HTTP-backed engine speaking the JSON-in/JSON-out contract.
///
/// Each action posts the record to `{base}/{wire-name}`. A 2xx response
/// with a body is the info payload; 401/403 are treated as licensing or
/// authorization failures and shut the loader down; other 4xx responses
/// reject the record; 5xx and transport failures are transient.
pub struct HttpEngine {
    base_url: String,
    client: reqwest::Client,
}

impl HttpEngine {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpEngine {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Engine for HttpEngine {
    async fn call(&self, action: Action, record: &Record) -> EngineResult {
        let url = format!("{}/{}", self.base_url, action.wire_name());
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(record.to_engine_json())
            .send()
            .await
            .map_err(|err| EngineError::Transient(format!("{url}: {err}")))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            debug!(%url, %status, record_id = record.record_id(), "engine call succeeded");
            if !action.with_info() || body.trim().is_empty() {
                return Ok(None);
            }
            let info: Value = serde_json::from_str(&body)
                .map_err(|err| EngineError::Transient(format!("unparseable info payload: {err}")))?;
            return Ok(Some(info));
        }

        let detail = format!("{status} from {url}: {body}");
        match status.as_u16() {
            401 | 403 => Err(EngineError::Fatal(detail)),
            code if (400..500).contains(&code) => Err(EngineError::Rejected(detail)),
            _ => Err(EngineError::Transient(detail)),
        }
    }
}
