// Ingress normalization for event-stream payloads
//
// The backend is not consistent about field names, so every payload passes
// through here exactly once and comes out as a typed event. Alias tables are
// ordered: the first field present wins.

use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use serde_json::Value;

use super::parser::RawEvent;
use super::{SseError, SseEvent};
use crate::models::{Message, MessageStatus};

const ID_FIELDS: &[&str] = &["id", "messageId", "_id"];
const TEXT_FIELDS: &[&str] = &["text", "message", "content"];
const SENDER_FIELDS: &[&str] = &["senderId", "userId", "sender"];
const TIME_FIELDS: &[&str] = &["createdAt", "timestamp"];
const WRAPPER_FIELDS: &[&str] = &["data", "message", "payload"];

/// Event names that carry a status update, with the status implied by the name
fn implied_status(event: &str) -> Option<Option<MessageStatus>> {
    match event {
        "delivery" | "delivered" => Some(Some(MessageStatus::Delivered)),
        "read" => Some(Some(MessageStatus::Read)),
        "status" | "statusUpdate" => Some(None),
        _ => None,
    }
}

fn is_keep_alive(event: &str) -> bool {
    matches!(event, "ping" | "heartbeat" | "connected" | "keepalive")
}

/// Turn one dispatched frame into a pipeline event.
///
/// `None` means the frame was a keep-alive with nothing to report.
pub fn interpret(frame: &RawEvent) -> Option<Result<SseEvent, SseError>> {
    if is_keep_alive(&frame.event) {
        debug!("Keep-alive event '{}'", frame.event);
        return None;
    }

    if let Some(implied) = implied_status(&frame.event) {
        return Some(parse_json(&frame.data).and_then(|v| normalize_status_update(&v, implied)));
    }

    if frame.event != "message" {
        debug!("Ignoring unknown event '{}'", frame.event);
        return None;
    }

    let value = match parse_json(&frame.data) {
        Ok(value) => value,
        Err(e) => return Some(Err(e)),
    };

    // Some servers multiplex everything over `message` with a `type` tag
    if let Some(kind) = value.get("type").and_then(Value::as_str) {
        if is_keep_alive(kind) {
            return None;
        }
        if let Some(implied) = implied_status(kind) {
            return Some(normalize_status_update(&value, implied));
        }
    }

    Some(normalize_message(&value).map(SseEvent::Message))
}

fn parse_json(data: &str) -> Result<Value, SseError> {
    if data.trim().is_empty() {
        return Err(SseError::Parse("empty payload".to_string()));
    }
    serde_json::from_str(data).map_err(|e| SseError::Parse(e.to_string()))
}

/// `{"message": {...}}`, `{"data": {...}}` and `{"payload": {...}}` unwrap to the inner object
fn unwrap_envelope(value: &Value) -> &Value {
    for field in WRAPPER_FIELDS {
        if let Some(inner) = value.get(*field) {
            if inner.is_object() {
                return inner;
            }
        }
    }
    value
}

fn first_string(value: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| match value.get(*field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        // populated references: {"sender": {"_id": "..."}}
        obj @ Value::Object(_) => first_string(obj, ID_FIELDS),
        _ => None,
    })
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    TIME_FIELDS.iter().find_map(|field| match value.get(*field)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    })
}

/// Canonical Message from a loosely shaped payload
pub fn normalize_message(value: &Value) -> Result<Message, SseError> {
    let value = unwrap_envelope(value);
    if !value.is_object() {
        return Err(SseError::Parse("message payload is not an object".to_string()));
    }

    let id = first_string(value, ID_FIELDS)
        .ok_or_else(|| SseError::Parse("message payload has no id".to_string()))?;
    let text = first_string(value, TEXT_FIELDS).unwrap_or_default();
    let sender_id = first_string(value, SENDER_FIELDS)
        .ok_or_else(|| SseError::Parse(format!("message {} has no sender", id)))?;
    let created_at = parse_time(value).unwrap_or_else(|| {
        debug!("Message {} has no usable timestamp, using now", id);
        Utc::now()
    });
    let status = value
        .get("status")
        .and_then(Value::as_str)
        .and_then(MessageStatus::parse)
        .filter(|s| s.is_confirmed())
        .unwrap_or(MessageStatus::Sent);

    Ok(Message::confirmed(id, text, sender_id, created_at, status))
}

/// `(message id, status)` from a status payload; `implied` comes from the event name
pub fn normalize_status_update(
    value: &Value,
    implied: Option<MessageStatus>,
) -> Result<SseEvent, SseError> {
    let value = unwrap_envelope(value);
    let message_id = first_string(value, &["messageId", "id", "_id"])
        .ok_or_else(|| SseError::Parse("status update has no message id".to_string()))?;
    let status = value
        .get("status")
        .and_then(Value::as_str)
        .and_then(MessageStatus::parse)
        .or(implied)
        .ok_or_else(|| SseError::Parse(format!("status update for {} has no status", message_id)))?;

    Ok(SseEvent::StatusUpdate { message_id, status })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(event: &str, data: &str) -> RawEvent {
        RawEvent {
            event: event.to_string(),
            data: data.to_string(),
            id: None,
            retry: None,
        }
    }

    #[test]
    fn test_canonical_fields() {
        let msg = normalize_message(&json!({
            "id": "m1", "text": "hi", "senderId": "bob",
            "createdAt": "2024-05-01T10:00:00Z", "status": "delivered"
        }))
        .unwrap();
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.server_id.as_deref(), Some("m1"));
        assert_eq!(msg.text, "hi");
        assert_eq!(msg.sender_id, "bob");
        assert_eq!(msg.status, MessageStatus::Delivered);
        assert_eq!(msg.created_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn test_aliased_fields() {
        let msg = normalize_message(&json!({
            "messageId": 42, "message": "yo", "userId": "u7", "timestamp": 1714557600000i64
        }))
        .unwrap();
        assert_eq!(msg.id, "42");
        assert_eq!(msg.text, "yo");
        assert_eq!(msg.sender_id, "u7");
        assert_eq!(msg.created_at.timestamp_millis(), 1714557600000);
        assert_eq!(msg.status, MessageStatus::Sent);
    }

    #[test]
    fn test_alias_precedence() {
        let msg = normalize_message(&json!({
            "id": "primary", "messageId": "secondary", "text": "t", "senderId": "a", "userId": "b"
        }))
        .unwrap();
        assert_eq!(msg.id, "primary");
        assert_eq!(msg.sender_id, "a");
    }

    #[test]
    fn test_envelope_and_populated_sender() {
        let msg = normalize_message(&json!({
            "type": "message",
            "message": {"_id": "m9", "content": "wrapped", "sender": {"_id": "u1", "name": "Ann"}}
        }))
        .unwrap();
        assert_eq!(msg.id, "m9");
        assert_eq!(msg.text, "wrapped");
        assert_eq!(msg.sender_id, "u1");
    }

    #[test]
    fn test_local_statuses_from_server_are_treated_as_sent() {
        let msg = normalize_message(&json!({"id": "m", "text": "t", "senderId": "s", "status": "sending"}))
            .unwrap();
        assert_eq!(msg.status, MessageStatus::Sent);
    }

    #[test]
    fn test_missing_identity_is_a_parse_error() {
        assert!(matches!(
            normalize_message(&json!({"text": "orphan", "senderId": "s"})),
            Err(SseError::Parse(_))
        ));
        assert!(matches!(
            normalize_message(&json!({"id": "m", "text": "t"})),
            Err(SseError::Parse(_))
        ));
    }

    #[test]
    fn test_named_status_events() {
        match interpret(&frame("delivery", r#"{"messageId":"m1"}"#)) {
            Some(Ok(SseEvent::StatusUpdate { message_id, status })) => {
                assert_eq!(message_id, "m1");
                assert_eq!(status, MessageStatus::Delivered);
            }
            other => panic!("unexpected {:?}", other),
        }
        match interpret(&frame("statusUpdate", r#"{"messageId":"m1","status":"read"}"#)) {
            Some(Ok(SseEvent::StatusUpdate { status, .. })) => assert_eq!(status, MessageStatus::Read),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            interpret(&frame("status", r#"{"messageId":"m1"}"#)),
            Some(Err(SseError::Parse(_)))
        ));
    }

    #[test]
    fn test_typed_status_over_message_event() {
        match interpret(&frame("message", r#"{"type":"read","messageId":"m3"}"#)) {
            Some(Ok(SseEvent::StatusUpdate { message_id, status })) => {
                assert_eq!(message_id, "m3");
                assert_eq!(status, MessageStatus::Read);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_keep_alives_and_garbage() {
        assert!(interpret(&frame("ping", "")).is_none());
        assert!(interpret(&frame("connected", r#"{"clientId":"x"}"#)).is_none());
        assert!(interpret(&frame("message", r#"{"type":"ping"}"#)).is_none());
        assert!(interpret(&frame("typing", r#"{"userId":"x"}"#)).is_none());
        assert!(matches!(interpret(&frame("message", "{oops")), Some(Err(SseError::Parse(_)))));
    }
}
