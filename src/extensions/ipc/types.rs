//! Wire message definitions for host <-> worker communication.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::extensions::error::{ExtensionError, ExtensionResult};

/// Identity of a dispatched query, echoed back by the worker.
pub type EventId = u64;

/// Messages the host sends to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Sent once, right after the session is accepted.
    Preferences { preferences: Map<String, Value> },

    /// A query typed by the user: `args` is `[query, trigger_id]`.
    InputTrigger {
        args: (String, Option<String>),
        event_id: EventId,
    },
}

/// A query routed to one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEvent {
    pub id: EventId,
    pub query: String,
    pub trigger_id: Option<String>,
}

impl QueryEvent {
    pub fn to_message(&self) -> OutboundMessage {
        OutboundMessage::InputTrigger {
            args: (self.query.clone(), self.trigger_id.clone()),
            event_id: self.id,
        }
    }
}

/// The echoed event inside a response. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRef {
    pub event_id: EventId,
}

/// Opaque result/action payload produced by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultAction(pub Value);

impl ResultAction {
    /// Whether the launcher should stay visible after running this action.
    ///
    /// An explicit `keep_app_open` flag wins; a list of results always keeps
    /// the launcher open so the user can pick one.
    pub fn keep_app_open(&self) -> bool {
        match &self.0 {
            Value::Object(obj) => obj
                .get("keep_app_open")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            Value::Array(_) => true,
            _ => false,
        }
    }
}

/// A worker's answer to a query event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub event: EventRef,
    pub action: ResultAction,
}

impl ResponseMessage {
    /// Decode an inbound message, rejecting anything that is not response-shaped.
    pub fn decode(message: Map<String, Value>) -> ExtensionResult<Self> {
        serde_json::from_value(Value::Object(message))
            .map_err(|e| ExtensionError::Protocol(format!("expected a response message: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_input_trigger_wire_shape() {
        let event = QueryEvent {
            id: 7,
            query: "wt berlin".to_string(),
            trigger_id: Some("forecast".to_string()),
        };
        let value = serde_json::to_value(event.to_message()).unwrap();
        assert_eq!(
            value,
            json!({"type": "input_trigger", "args": ["wt berlin", "forecast"], "event_id": 7})
        );
    }

    #[test]
    fn test_preferences_wire_shape() {
        let mut prefs = Map::new();
        prefs.insert("units".to_string(), json!("metric"));
        let value = serde_json::to_value(OutboundMessage::Preferences { preferences: prefs }).unwrap();
        assert_eq!(value, json!({"type": "preferences", "preferences": {"units": "metric"}}));
    }

    #[test]
    fn test_decode_response_ignores_extra_event_fields() {
        let msg = json!({
            "event": {"type": "input_trigger", "args": ["q", null], "event_id": 3},
            "action": {"type": "copy", "text": "hi", "keep_app_open": true}
        });
        let Value::Object(map) = msg else { unreachable!() };
        let response = ResponseMessage::decode(map).unwrap();
        assert_eq!(response.event.event_id, 3);
        assert!(response.action.keep_app_open());
    }

    #[test]
    fn test_decode_rejects_other_shapes() {
        let Value::Object(map) = json!({"hello": "world"}) else { unreachable!() };
        assert!(matches!(
            ResponseMessage::decode(map),
            Err(ExtensionError::Protocol(_))
        ));
    }

    #[test]
    fn test_keep_app_open_rules() {
        assert!(!ResultAction(json!({"type": "open"})).keep_app_open());
        assert!(ResultAction(json!([{"name": "a"}])).keep_app_open());
        assert!(!ResultAction(Value::Null).keep_app_open());
        assert!(!ResultAction(json!({"keep_app_open": false})).keep_app_open());
    }
}
