//! Per-record control directives and engine action resolution
//!
//! A record may carry a directive envelope (a JSON property, by default
//! `senzingStreamLoader`) naming the engine operation to apply to that
//! record. The envelope is stripped before the record reaches the engine;
//! an explicit directive action always wins over the subcommand default.

use serde_json::Value;

use crate::error::{Error, Result};

/// Default JSON property carrying the per-record directive envelope.
pub const DEFAULT_DIRECTIVE_KEY: &str = "senzingStreamLoader";

/// The six engine operations a record can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Add,
    AddWithInfo,
    Reevaluate,
    ReevaluateWithInfo,
    Delete,
    DeleteWithInfo,
}

impl Action {
    /// True for the variants whose successful call yields an info payload.
    pub fn with_info(self) -> bool {
        matches!(
            self,
            Action::AddWithInfo | Action::ReevaluateWithInfo | Action::DeleteWithInfo
        )
    }

    /// Name used on the wire, in directive envelopes and info payloads.
    pub fn wire_name(self) -> &'static str {
        match self {
            Action::Add => "addRecord",
            Action::AddWithInfo => "addRecordWithInfo",
            Action::Reevaluate => "reevaluateRecord",
            Action::ReevaluateWithInfo => "reevaluateRecordWithInfo",
            Action::Delete => "deleteRecord",
            Action::DeleteWithInfo => "deleteRecordWithInfo",
        }
    }

    /// Parse a wire-format action name.
    pub fn from_wire_name(name: &str) -> Result<Action> {
        match name {
            "addRecord" => Ok(Action::Add),
            "addRecordWithInfo" => Ok(Action::AddWithInfo),
            "reevaluateRecord" => Ok(Action::Reevaluate),
            "reevaluateRecordWithInfo" => Ok(Action::ReevaluateWithInfo),
            "deleteRecord" => Ok(Action::Delete),
            "deleteRecordWithInfo" => Ok(Action::DeleteWithInfo),
            other => Err(Error::UnknownDirective(other.to_string())),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Parsed directive envelope. An absent `action` means "use the
/// subcommand default".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Directive {
    pub action: Option<Action>,
}

impl Directive {
    /// Parse the value of the directive property.
    ///
    /// The value must be a JSON object; its optional `action` field must
    /// name one of the six wire-format actions.
    pub fn from_value(value: &Value) -> Result<Directive> {
        let Value::Object(fields) = value else {
            return Err(Error::MalformedRecord(
                "directive envelope is not a JSON object".to_string(),
            ));
        };

        let action = match fields.get("action") {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) => Some(Action::from_wire_name(name)?),
            Some(other) => {
                return Err(Error::UnknownDirective(other.to_string()));
            }
        };

        Ok(Directive { action })
    }
}

/// Resolve the engine action for one record.
///
/// An explicit directive action wins outright regardless of subcommand;
/// otherwise the subcommand's default action applies. Total; no error cases.
pub fn resolve_action(directive: Option<&Directive>, default_action: Action) -> Action {
    directive
        .and_then(|d| d.action)
        .unwrap_or(default_action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALL_ACTIONS: [Action; 6] = [
        Action::Add,
        Action::AddWithInfo,
        Action::Reevaluate,
        Action::ReevaluateWithInfo,
        Action::Delete,
        Action::DeleteWithInfo,
    ];

    #[test]
    fn wire_names_round_trip() {
        for action in ALL_ACTIONS {
            assert_eq!(Action::from_wire_name(action.wire_name()).unwrap(), action);
        }
    }

    #[test]
    fn unknown_action_name_is_rejected() {
        let err = Action::from_wire_name("upsertRecord").unwrap_err();
        assert!(matches!(err, Error::UnknownDirective(_)));
    }

    #[test]
    fn directive_action_wins_over_every_default() {
        for directive_action in ALL_ACTIONS {
            for default_action in [Action::Add, Action::AddWithInfo] {
                let directive = Directive {
                    action: Some(directive_action),
                };
                assert_eq!(
                    resolve_action(Some(&directive), default_action),
                    directive_action
                );
            }
        }
    }

    #[test]
    fn default_applies_without_directive() {
        assert_eq!(resolve_action(None, Action::Add), Action::Add);
        assert_eq!(
            resolve_action(None, Action::AddWithInfo),
            Action::AddWithInfo
        );

        // An envelope without an action field also falls through.
        let empty = Directive::default();
        assert_eq!(resolve_action(Some(&empty), Action::Delete), Action::Delete);
    }

    #[test]
    fn envelope_parsing() {
        let directive =
            Directive::from_value(&json!({"action": "deleteRecordWithInfo"})).unwrap();
        assert_eq!(directive.action, Some(Action::DeleteWithInfo));

        let empty = Directive::from_value(&json!({})).unwrap();
        assert_eq!(empty.action, None);

        assert!(matches!(
            Directive::from_value(&json!({"action": "noSuchAction"})),
            Err(Error::UnknownDirective(_))
        ));
        assert!(matches!(
            Directive::from_value(&json!("addRecord")),
            Err(Error::MalformedRecord(_))
        ));
        assert!(matches!(
            Directive::from_value(&json!({"action": 7})),
            Err(Error::UnknownDirective(_))
        ));
    }
}
