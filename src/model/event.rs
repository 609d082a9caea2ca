use serde::{Deserialize, Serialize};

use crate::model::task::{TaskPatch, TaskRecord, is_temp_id};

/// Error type for push-event validation
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("malformed push event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("push event carries empty task id")]
    EmptyId,
    #[error("push event carries reserved temp id: {0}")]
    ReservedId(String),
}

/// One event body from the push channel, discriminated by `event_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data", rename_all = "snake_case")]
pub enum PushPayload {
    TaskCreated(TaskRecord),
    TaskUpdated(TaskRecord),
    TaskDeleted { id: String },
    TaskDelta { id: String, patch: TaskPatch },
}

impl PushPayload {
    /// Id of the task this event concerns.
    pub fn task_id(&self) -> &str {
        match self {
            PushPayload::TaskCreated(record) | PushPayload::TaskUpdated(record) => &record.id,
            PushPayload::TaskDeleted { id } | PushPayload::TaskDelta { id, .. } => id,
        }
    }
}

/// A server-pushed event: `{event_type, data, sequence_num}` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    pub sequence_num: u64,
    #[serde(flatten)]
    pub payload: PushPayload,
}

impl PushEvent {
    /// Parse and validate a raw channel value.
    ///
    /// The id must be non-empty and outside the reserved temp namespace;
    /// the server never legitimately emits temp-prefixed ids.
    pub fn parse(value: serde_json::Value) -> Result<Self, EventError> {
        let event: PushEvent = serde_json::from_value(value)?;
        let id = event.payload.task_id();
        if id.is_empty() {
            return Err(EventError::EmptyId);
        }
        if is_temp_id(id) {
            return Err(EventError::ReservedId(id.to_string()));
        }
        Ok(event)
    }
}

/// Request to replay push events missed after a disconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRequest {
    pub last_sequence_num: u64,
}

/// Replay reply: missed events in order plus the new watermark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayResponse {
    pub events: Vec<PushEvent>,
    pub watermark: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_deleted_event() {
        let value = json!({
            "event_type": "task_deleted",
            "data": { "id": "42" },
            "sequence_num": 7
        });
        let event = PushEvent::parse(value).unwrap();
        assert_eq!(event.sequence_num, 7);
        assert_eq!(event.payload, PushPayload::TaskDeleted { id: "42".into() });
    }

    #[test]
    fn parses_a_delta_event() {
        let value = json!({
            "event_type": "task_delta",
            "data": { "id": "42", "patch": { "status": "blocked" } },
            "sequence_num": 8
        });
        let event = PushEvent::parse(value).unwrap();
        assert_eq!(event.payload.task_id(), "42");
    }

    #[test]
    fn rejects_unknown_event_type() {
        let value = json!({
            "event_type": "task_exploded",
            "data": { "id": "42" },
            "sequence_num": 1
        });
        assert!(matches!(
            PushEvent::parse(value),
            Err(EventError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_temp_prefixed_id() {
        let value = json!({
            "event_type": "task_deleted",
            "data": { "id": "tmp-tab1-3" },
            "sequence_num": 2
        });
        assert!(matches!(
            PushEvent::parse(value),
            Err(EventError::ReservedId(_))
        ));
    }

    #[test]
    fn rejects_empty_id() {
        let value = json!({
            "event_type": "task_deleted",
            "data": { "id": "" },
            "sequence_num": 3
        });
        assert!(matches!(PushEvent::parse(value), Err(EventError::EmptyId)));
    }
}
