use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved prefix for locally-generated temporary ids.
///
/// The server id space must never produce ids with this prefix; every
/// ingestion boundary (hydrate, push, broadcast) rejects records that
/// carry it.
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Returns true if `id` is a locally-generated temporary id.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Generator for per-tab temporary ids.
///
/// Ids are `tmp-<seed>-<n>` where the seed is unique per tab, so two tabs
/// creating tasks at the same instant cannot collide.
#[derive(Debug, Clone)]
pub struct TempIdGen {
    seed: String,
    next: u64,
}

impl TempIdGen {
    pub fn new(seed: impl Into<String>) -> Self {
        TempIdGen {
            seed: seed.into(),
            next: 1,
        }
    }

    /// Produce the next temporary id.
    pub fn next_id(&mut self) -> String {
        let id = format!("{}{}-{}", TEMP_ID_PREFIX, self.seed, self.next);
        self.next += 1;
        id
    }
}

/// Task workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Pending,
    Blocked,
    Completed,
    Cancelled,
}

impl TaskStatus {
    /// Completed and cancelled tasks count as archived.
    pub fn is_archived(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// All statuses, in display order.
    pub fn all() -> [TaskStatus; 6] {
        [
            TaskStatus::Todo,
            TaskStatus::InProgress,
            TaskStatus::Pending,
            TaskStatus::Blocked,
            TaskStatus::Completed,
            TaskStatus::Cancelled,
        ]
    }
}

/// Task priority
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// A task record, the unit of truth in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Server-assigned stable id, or a `tmp-` id before confirmation
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Soft-delete marker; a set value means the record is tombstoned
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub workspace_id: String,
}

impl TaskRecord {
    /// Create a fresh record with the given id and title.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        workspace_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        TaskRecord {
            id: id.into(),
            title: title.into(),
            status: TaskStatus::Todo,
            priority: Priority::default(),
            due_date: None,
            assignee: None,
            labels: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            deleted_at: None,
            workspace_id: workspace_id.into(),
        }
    }

    pub fn is_archived(&self) -> bool {
        self.status.is_archived()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_temp(&self) -> bool {
        is_temp_id(&self.id)
    }
}

/// Partial-field update payload.
///
/// `None` fields are left untouched by `apply_to`. Used both for the update
/// endpoint and for delta push events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeSet<String>>,
}

impl TaskPatch {
    /// A patch that only changes the status.
    pub fn status(status: TaskStatus) -> Self {
        TaskPatch {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Apply this patch to a record, bumping `updated_at` and keeping
    /// `completed_at` consistent with the status.
    pub fn apply_to(&self, record: &mut TaskRecord, now: DateTime<Utc>) {
        if let Some(title) = &self.title {
            record.title = title.clone();
        }
        if let Some(status) = self.status {
            let was_archived = record.status.is_archived();
            record.status = status;
            if status == TaskStatus::Completed {
                record.completed_at = Some(now);
            } else if was_archived {
                record.completed_at = None;
            }
        }
        if let Some(priority) = self.priority {
            record.priority = priority;
        }
        if let Some(due) = self.due_date {
            record.due_date = Some(due);
        }
        if let Some(assignee) = &self.assignee {
            record.assignee = Some(assignee.clone());
        }
        if let Some(labels) = &self.labels {
            record.labels = labels.clone();
        }
        record.updated_at = now;
    }

    /// True if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        *self == TaskPatch::default()
    }
}
