use serde::{Deserialize, Serialize};

use crate::model::task::{TaskPatch, TaskRecord};

/// HTTP verb for a task mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiMethod {
    Post,
    Patch,
    Delete,
}

/// A mutation request for the task endpoint, as data.
///
/// The engine never performs network IO itself; it hands these to the page
/// glue and is told the outcome via `complete`. Serializable so the
/// offline queue can persist them across reloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: ApiMethod,
    pub endpoint: String,
    pub payload: serde_json::Value,
    /// The task this request concerns; for creates this is the temp id,
    /// which reconciliation maps to the server id on success.
    pub task_id: String,
}

impl ApiRequest {
    /// POST /api/tasks with the optimistic record as payload.
    pub fn create(record: &TaskRecord) -> Self {
        ApiRequest {
            method: ApiMethod::Post,
            endpoint: "/api/tasks".to_string(),
            payload: serde_json::to_value(record).unwrap_or(serde_json::Value::Null),
            task_id: record.id.clone(),
        }
    }

    /// PATCH /api/tasks/{id} with the partial-field payload.
    pub fn update(id: &str, patch: &TaskPatch) -> Self {
        ApiRequest {
            method: ApiMethod::Patch,
            endpoint: format!("/api/tasks/{id}"),
            payload: serde_json::to_value(patch).unwrap_or(serde_json::Value::Null),
            task_id: id.to_string(),
        }
    }

    /// DELETE /api/tasks/{id}.
    pub fn delete(id: &str) -> Self {
        ApiRequest {
            method: ApiMethod::Delete,
            endpoint: format!("/api/tasks/{id}"),
            payload: serde_json::Value::Null,
            task_id: id.to_string(),
        }
    }

    pub fn is_create(&self) -> bool {
        self.method == ApiMethod::Post
    }

    /// Re-key a request from a temp id to the server-assigned id, fixing
    /// the endpoint and any id embedded in the payload.
    pub fn retarget(&mut self, id: &str) {
        self.task_id = id.to_string();
        match self.method {
            ApiMethod::Post => {
                if let Some(record) = self.payload.as_object_mut() {
                    record.insert("id".to_string(), serde_json::Value::String(id.to_string()));
                }
            }
            ApiMethod::Patch | ApiMethod::Delete => {
                self.endpoint = format!("/api/tasks/{id}");
            }
        }
    }
}

/// Successful reply from the task endpoint. Creates and updates return the
/// canonical record; deletes return nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub task: Option<TaskRecord>,
}

impl ApiResponse {
    pub fn task(record: TaskRecord) -> Self {
        ApiResponse { task: Some(record) }
    }

    pub fn empty() -> Self {
        ApiResponse { task: None }
    }
}

/// Failure class of a mutation attempt. Network failures are retryable;
/// validation rejections are not, since replaying a rejected payload is
/// pointless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Validation,
}

/// Failed reply from the task endpoint.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind:?} failure: {message}")]
pub struct ApiFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ApiFailure {
    pub fn network(message: impl Into<String>) -> Self {
        ApiFailure {
            kind: FailureKind::Network,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ApiFailure {
            kind: FailureKind::Validation,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Network
    }
}

pub type ApiResult = Result<ApiResponse, ApiFailure>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::task::TaskStatus;
    use chrono::{TimeZone, Utc};

    #[test]
    fn request_builders_set_endpoints() {
        let record = TaskRecord::new("tmp-a-1", "t", "ws", Utc.timestamp_opt(0, 0).unwrap());
        let create = ApiRequest::create(&record);
        assert_eq!(create.method, ApiMethod::Post);
        assert_eq!(create.endpoint, "/api/tasks");
        assert_eq!(create.task_id, "tmp-a-1");
        assert!(create.is_create());

        let update = ApiRequest::update("42", &TaskPatch::status(TaskStatus::Blocked));
        assert_eq!(update.method, ApiMethod::Patch);
        assert_eq!(update.endpoint, "/api/tasks/42");

        let delete = ApiRequest::delete("42");
        assert_eq!(delete.method, ApiMethod::Delete);
        assert_eq!(delete.payload, serde_json::Value::Null);
    }

    #[test]
    fn request_round_trips_for_durable_queueing() {
        let update = ApiRequest::update("42", &TaskPatch::status(TaskStatus::Completed));
        let json = serde_json::to_string(&update).unwrap();
        let back: ApiRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, update);
    }

    #[test]
    fn retarget_rewrites_id_endpoint_and_payload() {
        let record = TaskRecord::new("tmp-a-1", "t", "ws", Utc.timestamp_opt(0, 0).unwrap());
        let mut create = ApiRequest::create(&record);
        create.retarget("42");
        assert_eq!(create.task_id, "42");
        assert_eq!(create.endpoint, "/api/tasks");
        assert_eq!(create.payload["id"], "42");

        let mut update = ApiRequest::update("tmp-a-1", &TaskPatch::status(TaskStatus::Blocked));
        update.retarget("42");
        assert_eq!(update.task_id, "42");
        assert_eq!(update.endpoint, "/api/tasks/42");
    }

    #[test]
    fn failure_classes() {
        assert!(ApiFailure::network("timeout").is_retryable());
        assert!(!ApiFailure::validation("title required").is_retryable());
    }
}
