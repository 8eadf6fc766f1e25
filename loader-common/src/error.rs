//! Common error types for the stream loader

use thiserror::Error;

/// Common result type for loader operations
pub type Result<T> = std::result::Result<T, Error>;

/// Process exit status for configuration problems.
pub const EXIT_CONFIG: i32 = 2;
/// Process exit status for fatal engine failures (licensing, corruption).
pub const EXIT_ENGINE_FATAL: i32 = 3;
/// Process exit status for an unreachable or broken input source.
pub const EXIT_SOURCE: i32 = 4;
/// Process exit status for a governor veto configured as fatal.
pub const EXIT_GOVERNOR: i32 = 5;
/// Process exit status for exhausted sink publish retries.
pub const EXIT_SINK: i32 = 6;
/// Process exit status for any other internal failure.
pub const EXIT_INTERNAL: i32 = 1;

/// Error taxonomy shared by every stage of the loader pipeline.
///
/// Per-record failures (`MalformedRecord`, `UnknownDirective`,
/// `EngineRejected`) are resolved inside the dispatcher and never take the
/// process down. `EngineFatal`, an exhausted `EngineTransient`, and an
/// exhausted `SinkPublish` escalate to an orderly shutdown with a distinct
/// exit status per category so an orchestrator can tell them apart.
#[derive(Error, Debug)]
pub enum Error {
    /// Message body or array element was not a usable JSON record
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// Directive envelope carried an unrecognized action name
    #[error("unknown directive action: {0}")]
    UnknownDirective(String),

    /// The governor refused the record
    #[error("governor veto: {0}")]
    GovernorVeto(String),

    /// Engine rejected this record (validation/business error)
    #[error("record rejected by engine: {0}")]
    EngineRejected(String),

    /// Engine resource temporarily unavailable; the call may be retried
    #[error("engine temporarily unavailable: {0}")]
    EngineTransient(String),

    /// Structural or licensing failure in the engine
    #[error("fatal engine error: {0}")]
    EngineFatal(String),

    /// Publishing to an info or failure sink failed
    #[error("sink publish failed: {0}")]
    SinkPublish(String),

    /// Broker/transport failure on the input side
    #[error("source error: {0}")]
    Source(String),

    /// Configuration loading or validation error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal loader error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failed operation may be attempted again.
    ///
    /// Retry policy itself (bound, backoff) belongs to the dispatcher; this
    /// only classifies. `SinkPublish` is retryable against the sink but
    /// escalates to fatal once the dispatcher's cap is exhausted.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::EngineTransient(_) | Error::SinkPublish(_) | Error::Source(_)
        )
    }

    /// Short stable label for logs and failure-sink payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MalformedRecord(_) => "malformed_record",
            Error::UnknownDirective(_) => "unknown_directive",
            Error::GovernorVeto(_) => "governor_veto",
            Error::EngineRejected(_) => "engine_rejected",
            Error::EngineTransient(_) => "engine_transient",
            Error::EngineFatal(_) => "engine_fatal",
            Error::SinkPublish(_) => "sink_publish",
            Error::Source(_) => "source",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
        }
    }

    /// Exit status used when this error terminates the process.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => EXIT_CONFIG,
            Error::EngineFatal(_) => EXIT_ENGINE_FATAL,
            Error::EngineTransient(_) => EXIT_ENGINE_FATAL,
            Error::Source(_) => EXIT_SOURCE,
            Error::GovernorVeto(_) => EXIT_GOVERNOR,
            Error::SinkPublish(_) => EXIT_SINK,
            _ => EXIT_INTERNAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::EngineTransient("db down".into()).is_retryable());
        assert!(Error::SinkPublish("broker gone".into()).is_retryable());
        assert!(!Error::EngineRejected("bad record".into()).is_retryable());
        assert!(!Error::MalformedRecord("not json".into()).is_retryable());
        assert!(!Error::EngineFatal("license".into()).is_retryable());
    }

    #[test]
    fn exit_codes_are_distinct_per_category() {
        let codes = [
            Error::Config("x".into()).exit_code(),
            Error::EngineFatal("x".into()).exit_code(),
            Error::Source("x".into()).exit_code(),
            Error::GovernorVeto("x".into()).exit_code(),
            Error::SinkPublish("x".into()).exit_code(),
        ];
        let mut deduped = codes.to_vec();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), codes.len());
        assert!(codes.iter().all(|c| *c != 0));
    }
}
