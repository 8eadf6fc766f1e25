//! Pre-dispatch governor gate
//!
//! A deployment can inject a gate that inspects each record before the
//! engine call, typically to protect a shared external resource the engine
//! leans on. The gate is a single-method capability; swapping one in never
//! requires touching the dispatch core.

use std::time::Duration;

use async_trait::async_trait;
use loader_common::Record;

/// What the governor wants done with one record.
#[derive(Debug, Clone, PartialEq)]
pub enum GovernorDecision {
    /// Dispatch the record.
    Proceed,
    /// Hold the record and ask again after the given pause.
    Delay(Duration),
    /// Refuse the record outright.
    Veto(String),
}

/// Injectable pre-dispatch gate.
#[async_trait]
pub trait Governor: Send + Sync {
    async fn before_call(&self, record: &Record) -> GovernorDecision;
}

/// Pass-through gate used when no governor is configured.
pub struct NoopGovernor;

#[async_trait]
impl Governor for NoopGovernor {
    async fn before_call(&self, _record: &Record) -> GovernorDecision {
        GovernorDecision::Proceed
    }
}
