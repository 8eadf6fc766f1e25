//! Record model and the wire-body codec
//!
//! A raw message body is either a single JSON object or a JSON array of
//! objects; every element becomes an independent record sharing the same
//! acknowledgment unit. The codec strips the directive envelope, applies
//! configured `DATA_SOURCE`/`ENTITY_TYPE` defaults, and guarantees the
//! identity fields the engine requires are present.

use serde_json::{Map, Value};

use crate::directive::{Directive, DEFAULT_DIRECTIVE_KEY};
use crate::error::{Error, Result};

/// Field naming the data source a record belongs to.
pub const DATA_SOURCE_FIELD: &str = "DATA_SOURCE";
/// Field carrying the record's identifier within its data source.
pub const RECORD_ID_FIELD: &str = "RECORD_ID";
/// Field naming the entity type of a record.
pub const ENTITY_TYPE_FIELD: &str = "ENTITY_TYPE";

/// One engine-ready record: a JSON object guaranteed to carry
/// `DATA_SOURCE` and `RECORD_ID`, with the directive envelope removed.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    pub fn data_source(&self) -> &str {
        self.fields
            .get(DATA_SOURCE_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn record_id(&self) -> &str {
        self.fields
            .get(RECORD_ID_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// The record as a JSON value, for sinks and failure payloads.
    pub fn as_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Serialized form handed to the engine. Keys are emitted in sorted
    /// order, which keeps log lines and engine payloads deterministic.
    pub fn to_engine_json(&self) -> String {
        // serde_json's default map is ordered by key.
        Value::Object(self.fields.clone()).to_string()
    }
}

/// Parses raw message bodies into engine-ready records.
#[derive(Debug, Clone)]
pub struct RecordCodec {
    directive_key: String,
    default_data_source: Option<String>,
    default_entity_type: Option<String>,
}

/// One decoded element: the record plus its directive envelope, if any.
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    pub record: Record,
    pub directive: Option<Directive>,
}

impl Default for RecordCodec {
    fn default() -> Self {
        RecordCodec {
            directive_key: DEFAULT_DIRECTIVE_KEY.to_string(),
            default_data_source: None,
            default_entity_type: None,
        }
    }
}

impl RecordCodec {
    pub fn new(
        directive_key: impl Into<String>,
        default_data_source: Option<String>,
        default_entity_type: Option<String>,
    ) -> Self {
        RecordCodec {
            directive_key: directive_key.into(),
            default_data_source,
            default_entity_type,
        }
    }

    /// Decode one raw message body.
    ///
    /// A JSON array yields one entry per element and a malformed element
    /// fails that element only, never its siblings. A body that is not
    /// valid JSON yields a single failed entry.
    pub fn decode(&self, body: &str) -> Vec<Result<DecodedRecord>> {
        let parsed: Value = match serde_json::from_str(body.trim()) {
            Ok(value) => value,
            Err(err) => {
                return vec![Err(Error::MalformedRecord(format!(
                    "body is not valid JSON: {err}"
                )))];
            }
        };

        match parsed {
            Value::Array(elements) => elements
                .iter()
                .map(|element| self.decode_element(element))
                .collect(),
            other => vec![self.decode_element(&other)],
        }
    }

    fn decode_element(&self, value: &Value) -> Result<DecodedRecord> {
        let Value::Object(object) = value else {
            return Err(Error::MalformedRecord(format!(
                "element is not a JSON object: {value}"
            )));
        };
        let mut fields = object.clone();

        let directive = match fields.remove(&self.directive_key) {
            Some(envelope) => Some(Directive::from_value(&envelope)?),
            None => None,
        };

        self.apply_default(&mut fields, DATA_SOURCE_FIELD, &self.default_data_source);
        self.apply_default(&mut fields, ENTITY_TYPE_FIELD, &self.default_entity_type);
        normalize_string_field(&mut fields, DATA_SOURCE_FIELD)?;
        normalize_string_field(&mut fields, RECORD_ID_FIELD)?;

        Ok(DecodedRecord {
            record: Record { fields },
            directive,
        })
    }

    fn apply_default(
        &self,
        fields: &mut Map<String, Value>,
        field: &str,
        default: &Option<String>,
    ) {
        if !fields.contains_key(field) {
            if let Some(value) = default {
                fields.insert(field.to_string(), Value::String(value.clone()));
            }
        }
    }
}

/// Require `field` to be present and coerce numeric identifiers to strings,
/// the form the engine expects.
fn normalize_string_field(fields: &mut Map<String, Value>, field: &str) -> Result<()> {
    match fields.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(()),
        Some(Value::Number(n)) => {
            let coerced = n.to_string();
            fields.insert(field.to_string(), Value::String(coerced));
            Ok(())
        }
        Some(other) => Err(Error::MalformedRecord(format!(
            "{field} is not a usable identifier: {other}"
        ))),
        None => Err(Error::MalformedRecord(format!("missing {field}"))),
    }
}
