//! Terminal outcome of one unit of work

use serde_json::Value;

use crate::error::Error;

/// What became of one record after the engine call.
///
/// Produced by the engine invocation (retries already applied) and consumed
/// immediately by outcome routing: a success with an info payload goes to
/// the info sink, a failure goes to the failure sink or escalates,
/// depending on its error category.
#[derive(Debug)]
pub enum Outcome {
    /// Engine call succeeded; `info` is present for with-info actions.
    Success { info: Option<Value> },
    /// Engine call failed. `retryable` is false once retries are exhausted
    /// or the error category never allowed them.
    Failure { error: Error, retryable: bool },
}
