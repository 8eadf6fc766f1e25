//! # Loader Common Library
//!
//! Shared code for the stream loader:
//! - Error taxonomy and process exit codes
//! - Record model and the wire-body codec
//! - Directive envelope parsing and action resolution
//! - Outcome type consumed by outcome routing
//! - Configuration types and layered value resolution

pub mod config;
pub mod directive;
pub mod error;
pub mod outcome;
pub mod record;

pub use config::LoaderConfig;
pub use directive::{resolve_action, Action, Directive};
pub use error::{Error, Result};
pub use outcome::Outcome;
pub use record::{DecodedRecord, Record, RecordCodec};
