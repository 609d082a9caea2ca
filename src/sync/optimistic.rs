use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::model::task::{Priority, TaskPatch, TaskRecord, TaskStatus, TempIdGen};
use crate::store::task_store::TaskStore;
use crate::sync::api::{ApiRequest, ApiResult};
use crate::sync::offline::RetryQueue;

/// Error type for mutation entry points
#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("task not found: {0}")]
    NotFound(String),
}

/// Handle for an in-flight mutation. Ordered by issue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub u64);

/// Fields the UI supplies when creating a task.
#[derive(Debug, Clone, Default)]
pub struct TaskDraft {
    pub title: String,
    pub priority: Priority,
    pub due_date: Option<DateTime<Utc>>,
    pub assignee: Option<String>,
    pub labels: BTreeSet<String>,
}

impl TaskDraft {
    pub fn new(title: impl Into<String>) -> Self {
        TaskDraft {
            title: title.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
enum OpKind {
    Create { temp_id: String },
    Update,
    Delete,
}

#[derive(Debug)]
struct InFlightOp {
    task_id: String,
    kind: OpKind,
    /// Pre-mutation record, restored verbatim on rollback
    snapshot: Option<TaskRecord>,
    request: ApiRequest,
}

/// How an asynchronously-arriving result was folded into the store.
#[derive(Debug, PartialEq)]
pub enum Resolution {
    /// Server result accepted; the store now holds the canonical record.
    /// `follow_ups` are requests that were deferred until a server id
    /// existed (edits made while the create was unconfirmed), re-keyed and
    /// ready for the caller to execute
    Reconciled {
        task_id: String,
        follow_ups: Vec<(OpId, ApiRequest)>,
    },
    /// Response for an op the layer no longer tracks (duplicate delivery)
    Stale,
    /// Response discarded: a newer local mutation or a delete owns the
    /// record. `follow_up` carries a delete request when the server
    /// confirmed a create for a task the user already deleted.
    Superseded { follow_up: Option<ApiRequest> },
    /// Network-class failure: rolled back and queued for offline replay
    QueuedForRetry { queue_entry: u64 },
    /// Validation-class failure: rolled back, surfaced, not retried
    Rejected { message: String },
}

/// How a server-confirmed create folded into local state.
#[derive(Debug, PartialEq)]
pub enum CreateOutcome {
    /// Record installed under its server id. `follow_ups` are deferred
    /// requests re-keyed from the temp id, oldest first
    Installed {
        task_id: String,
        follow_ups: Vec<(OpId, ApiRequest)>,
    },
    /// The user deleted the task before the server confirmed it; the
    /// caller must execute the cleanup delete
    Orphaned { cleanup: ApiRequest },
}

/// Applies speculative local changes ahead of server confirmation.
///
/// Each mutation updates the store synchronously, returns the network
/// request for the page glue to execute, and records a snapshot plus a
/// per-task op sequence. Completions arriving out of order are checked
/// against that sequence (last write wins): an earlier response never
/// overwrites a later optimistic state, and a delete always takes
/// precedence over an in-flight update.
pub struct OptimisticLayer {
    temp_ids: TempIdGen,
    next_op: u64,
    in_flight: HashMap<OpId, InFlightOp>,
    /// Newest op per task id; only the newest may apply its response
    latest_op: HashMap<String, OpId>,
    /// Ids deleted locally while other ops may still be in flight
    deleted: HashSet<String>,
}

impl OptimisticLayer {
    /// `tab_seed` keeps temp ids unique across tabs.
    pub fn new(tab_seed: impl Into<String>) -> Self {
        OptimisticLayer {
            temp_ids: TempIdGen::new(tab_seed),
            next_op: 1,
            in_flight: HashMap::new(),
            latest_op: HashMap::new(),
            deleted: HashSet::new(),
        }
    }

    fn begin(&mut self, op: InFlightOp) -> OpId {
        let id = OpId(self.next_op);
        self.next_op += 1;
        self.latest_op.insert(op.task_id.clone(), id);
        self.in_flight.insert(id, op);
        id
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    // -----------------------------------------------------------------------
    // Mutations (optimistic apply + request out)
    // -----------------------------------------------------------------------

    /// Create a task speculatively under a temp id.
    pub fn create(
        &mut self,
        store: &mut TaskStore,
        draft: TaskDraft,
        now: DateTime<Utc>,
    ) -> (OpId, ApiRequest) {
        let temp_id = self.temp_ids.next_id();
        let mut record = TaskRecord::new(&temp_id, draft.title, store.workspace_id(), now);
        record.status = TaskStatus::Todo;
        record.priority = draft.priority;
        record.due_date = draft.due_date;
        record.assignee = draft.assignee;
        record.labels = draft.labels;

        let request = ApiRequest::create(&record);
        store.upsert_task(record, true, now);
        let op = self.begin(InFlightOp {
            task_id: temp_id.clone(),
            kind: OpKind::Create { temp_id },
            snapshot: None,
            request: request.clone(),
        });
        (op, request)
    }

    /// Apply a partial update speculatively. Works on confirmed records
    /// and on still-pending temp records; for a pending record no request
    /// is dispatched yet (the server has no id for it), the edit rides on
    /// the pending record and is handed back re-keyed once the create
    /// confirms.
    pub fn update(
        &mut self,
        store: &mut TaskStore,
        id: &str,
        patch: TaskPatch,
        now: DateTime<Utc>,
    ) -> Result<(OpId, Option<ApiRequest>), MutationError> {
        let (snapshot, is_temp) = match store.get_task(id) {
            Some(record) => (record.clone(), false),
            None => match store.get_pending(id) {
                Some(record) => (record.clone(), true),
                None => return Err(MutationError::NotFound(id.to_string())),
            },
        };

        let mut updated = snapshot.clone();
        patch.apply_to(&mut updated, now);
        store.upsert_task(updated, is_temp, now);

        let request = ApiRequest::update(id, &patch);
        let op = self.begin(InFlightOp {
            task_id: id.to_string(),
            kind: OpKind::Update,
            snapshot: Some(snapshot),
            request: request.clone(),
        });
        Ok((op, (!is_temp).then_some(request)))
    }

    /// Status toggle: the most common dashboard mutation.
    pub fn set_status(
        &mut self,
        store: &mut TaskStore,
        id: &str,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(OpId, Option<ApiRequest>), MutationError> {
        self.update(store, id, TaskPatch::status(status), now)
    }

    /// Delete a task speculatively. Deleting a still-pending temp record
    /// is local-only (no request): the eventual create confirmation is
    /// answered with a follow-up delete instead.
    pub fn delete(
        &mut self,
        store: &mut TaskStore,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<(OpId, Option<ApiRequest>), MutationError> {
        if let Some(pending) = store.get_pending(id) {
            let snapshot = pending.clone();
            store.remove_task(id, now);
            self.deleted.insert(id.to_string());
            let op = self.begin(InFlightOp {
                task_id: id.to_string(),
                kind: OpKind::Delete,
                snapshot: Some(snapshot),
                request: ApiRequest::delete(id),
            });
            return Ok((op, None));
        }

        let snapshot = store
            .get_task(id)
            .cloned()
            .ok_or_else(|| MutationError::NotFound(id.to_string()))?;
        store.remove_task(id, now);
        self.deleted.insert(id.to_string());

        let request = ApiRequest::delete(id);
        let op = self.begin(InFlightOp {
            task_id: id.to_string(),
            kind: OpKind::Delete,
            snapshot: Some(snapshot),
            request: request.clone(),
        });
        Ok((op, Some(request)))
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Fold an asynchronously-arriving network result into the store.
    pub fn resolve(
        &mut self,
        store: &mut TaskStore,
        queue: &mut RetryQueue,
        op_id: OpId,
        result: ApiResult,
        now: DateTime<Utc>,
    ) -> Resolution {
        let Some(op) = self.in_flight.remove(&op_id) else {
            debug!(op = op_id.0, "dropping result for unknown op");
            return Resolution::Stale;
        };

        match result {
            Ok(response) => self.apply_success(store, op_id, op, response.task, now),
            Err(failure) => {
                self.roll_back(store, op_id, &op, now);
                if failure.is_retryable() {
                    let queue_entry = queue.enqueue(op.request, now);
                    Resolution::QueuedForRetry { queue_entry }
                } else {
                    Resolution::Rejected {
                        message: failure.message,
                    }
                }
            }
        }
    }

    fn apply_success(
        &mut self,
        store: &mut TaskStore,
        op_id: OpId,
        op: InFlightOp,
        task: Option<TaskRecord>,
        now: DateTime<Utc>,
    ) -> Resolution {
        match op.kind {
            OpKind::Create { temp_id } => {
                let Some(record) = task else {
                    warn!(temp_id, "create confirmation without a record, discarding");
                    return Resolution::Superseded { follow_up: None };
                };
                match self.confirm_create(store, &temp_id, record, now) {
                    CreateOutcome::Orphaned { cleanup } => Resolution::Superseded {
                        follow_up: Some(cleanup),
                    },
                    CreateOutcome::Installed {
                        task_id,
                        follow_ups,
                    } => Resolution::Reconciled {
                        task_id,
                        follow_ups,
                    },
                }
            }
            OpKind::Update => {
                let gone = store.get_task(&op.task_id).is_none()
                    && store.get_pending(&op.task_id).is_none();
                if self.deleted.contains(&op.task_id) || gone {
                    // Delete takes precedence over an in-flight update
                    return Resolution::Superseded { follow_up: None };
                }
                if self.latest_op.get(&op.task_id) != Some(&op_id) {
                    // A newer optimistic state owns this record
                    return Resolution::Superseded { follow_up: None };
                }
                self.clear_latest(&op.task_id, op_id);
                if let Some(record) = task {
                    store.upsert_task(record, false, now);
                }
                Resolution::Reconciled {
                    task_id: op.task_id,
                    follow_ups: Vec::new(),
                }
            }
            OpKind::Delete => {
                store.remove_task(&op.task_id, now);
                self.deleted.remove(&op.task_id);
                self.clear_latest(&op.task_id, op_id);
                Resolution::Reconciled {
                    task_id: op.task_id,
                    follow_ups: Vec::new(),
                }
            }
        }
    }

    /// Fold a server-confirmed create into local state: install the record
    /// under its server id, keep edits made while the create was in flight,
    /// and re-key every op still waiting on the temp id.
    ///
    /// Shared by the direct completion path and the offline-replay path.
    pub fn confirm_create(
        &mut self,
        store: &mut TaskStore,
        temp_id: &str,
        record: TaskRecord,
        now: DateTime<Utc>,
    ) -> CreateOutcome {
        let real_id = record.id.clone();
        if self.deleted.remove(temp_id) {
            // User deleted the task before the server confirmed it; drop
            // the ops still keyed by the temp id and clean up the orphan.
            self.latest_op.remove(temp_id);
            self.in_flight.retain(|_, op| op.task_id != temp_id);
            return CreateOutcome::Orphaned {
                cleanup: ApiRequest::delete(&real_id),
            };
        }

        let mut waiting: Vec<OpId> = self
            .in_flight
            .iter()
            .filter(|(_, op)| op.task_id == temp_id)
            .map(|(id, _)| *id)
            .collect();
        waiting.sort();

        // Ops issued after the create already folded their edits into the
        // pending record; that state wins over the server's copy of the
        // original draft.
        let install = match store.get_pending(temp_id) {
            Some(pending) if !waiting.is_empty() => {
                let mut carried = pending.clone();
                carried.id = real_id.clone();
                carried.created_at = record.created_at;
                carried
            }
            _ => record,
        };
        store.reconcile_temp_task(temp_id, &real_id, install, now);

        let mut follow_ups = Vec::new();
        for op_id in &waiting {
            if let Some(op) = self.in_flight.get_mut(op_id) {
                op.task_id = real_id.clone();
                op.request.retarget(&real_id);
                follow_ups.push((*op_id, op.request.clone()));
            }
        }
        self.latest_op.remove(temp_id);
        if let Some(newest) = waiting.last() {
            self.latest_op.insert(real_id.clone(), *newest);
        }

        CreateOutcome::Installed {
            task_id: real_id,
            follow_ups,
        }
    }

    /// Task id an in-flight op concerns, if still tracked.
    pub fn task_of(&self, op: OpId) -> Option<&str> {
        self.in_flight.get(&op).map(|op| op.task_id.as_str())
    }

    /// Drop an in-flight op whose lifecycle moved elsewhere (the offline
    /// queue); its completion will never be reported here.
    pub fn forget(&mut self, op: OpId) {
        if let Some(state) = self.in_flight.remove(&op) {
            self.clear_latest(&state.task_id, op);
        }
    }

    /// Restore the pre-mutation snapshot, unless a newer op owns the
    /// record (its own completion will settle the final state).
    fn roll_back(&mut self, store: &mut TaskStore, op_id: OpId, op: &InFlightOp, now: DateTime<Utc>) {
        if self.latest_op.get(&op.task_id) != Some(&op_id) {
            debug!(task = %op.task_id, "skipping rollback, a newer op owns the record");
            return;
        }
        self.clear_latest(&op.task_id, op_id);
        match &op.kind {
            OpKind::Create { temp_id } => {
                store.remove_task(temp_id, now);
            }
            OpKind::Update => {
                if let Some(snapshot) = &op.snapshot {
                    store.upsert_task(snapshot.clone(), snapshot.is_temp(), now);
                }
            }
            OpKind::Delete => {
                self.deleted.remove(&op.task_id);
                if let Some(snapshot) = &op.snapshot {
                    store.upsert_task(snapshot.clone(), snapshot.is_temp(), now);
                }
            }
        }
    }

    fn clear_latest(&mut self, task_id: &str, op_id: OpId) {
        if self.latest_op.get(task_id) == Some(&op_id) {
            self.latest_op.remove(task_id);
        }
    }
}
