use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::config::SyncConfig;
use crate::sync::api::ApiRequest;

/// One buffered mutation awaiting replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOp {
    pub id: u64,
    pub request: ApiRequest,
    /// Failed replay attempts so far
    pub attempts: u32,
    /// Earliest time the next replay may run (backoff)
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    /// Attempt cap reached; waits for an explicit user retry
    #[serde(default)]
    pub needs_manual: bool,
    /// Handed out by `due` and awaiting its completion report. Never
    /// persisted: a restart means the outcome will not arrive.
    #[serde(skip)]
    pub claimed: bool,
    pub enqueued_at: DateTime<Utc>,
}

/// Durable FIFO of failed mutations, replayed with exponential backoff.
///
/// Replay order is strict FIFO per task id: a later operation for an id is
/// never due while an earlier one is still queued, so an update can never
/// replay before the create it depends on. Operations that exhaust the
/// attempt cap are parked for manual retry rather than discarded.
#[derive(Debug)]
pub struct RetryQueue {
    ops: Vec<QueuedOp>,
    next_id: u64,
    base_delay_ms: u64,
    max_attempts: u32,
}

impl RetryQueue {
    pub fn new(config: &SyncConfig) -> Self {
        RetryQueue {
            ops: Vec::new(),
            next_id: 1,
            base_delay_ms: config.retry_base_delay_ms,
            max_attempts: config.retry_max_attempts,
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Buffer a failed mutation. The first replay waits one base delay.
    pub fn enqueue(&mut self, request: ApiRequest, now: DateTime<Utc>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        debug!(entry = id, task = %request.task_id, "queued for offline replay");
        self.ops.push(QueuedOp {
            id,
            request,
            attempts: 0,
            not_before: Some(now + Duration::milliseconds(self.base_delay_ms as i64)),
            needs_manual: false,
            claimed: false,
            enqueued_at: now,
        });
        id
    }

    /// Operations ready to replay now, preserving per-task FIFO: only the
    /// head-of-line operation for each task id is ever returned, and any
    /// blocked entry blocks everything behind it for the same id.
    ///
    /// Returned entries are claimed until `mark_failed` or `mark_succeeded`
    /// reports their outcome, so a tick arriving before the network answers
    /// cannot hand the same mutation out twice.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<(u64, ApiRequest)> {
        let mut blocked: HashSet<String> = HashSet::new();
        let mut ready = Vec::new();
        for op in &mut self.ops {
            if blocked.contains(op.request.task_id.as_str()) {
                continue;
            }
            blocked.insert(op.request.task_id.clone());
            if op.needs_manual || op.claimed {
                continue;
            }
            if let Some(not_before) = op.not_before
                && now < not_before
            {
                continue;
            }
            op.claimed = true;
            ready.push((op.id, op.request.clone()));
        }
        ready
    }

    /// A replay failed again: back off exponentially, or park for manual
    /// retry once the attempt cap is reached.
    pub fn mark_failed(&mut self, id: u64, now: DateTime<Utc>) {
        let (base_delay_ms, max_attempts) = (self.base_delay_ms, self.max_attempts);
        let Some(op) = self.ops.iter_mut().find(|op| op.id == id) else {
            return;
        };
        op.claimed = false;
        op.attempts += 1;
        if op.attempts >= max_attempts {
            warn!(entry = id, task = %op.request.task_id, "retry cap reached, parking for manual retry");
            op.needs_manual = true;
            op.not_before = None;
        } else {
            let factor = 1u64 << op.attempts.min(16);
            op.not_before = Some(now + Duration::milliseconds((base_delay_ms * factor) as i64));
        }
    }

    /// A replay succeeded: drop the entry and hand it back so the caller
    /// can reconcile the store with the server's response.
    pub fn mark_succeeded(&mut self, id: u64) -> Option<QueuedOp> {
        let index = self.ops.iter().position(|op| op.id == id)?;
        Some(self.ops.remove(index))
    }

    /// Explicit user retry: reset the attempt counter and make the entry
    /// immediately due.
    pub fn retry_manually(&mut self, id: u64) {
        if let Some(op) = self.ops.iter_mut().find(|op| op.id == id) {
            op.attempts = 0;
            op.needs_manual = false;
            op.claimed = false;
            op.not_before = None;
        }
    }

    /// Drop an entry the user chose to abandon.
    pub fn abandon(&mut self, id: u64) -> Option<QueuedOp> {
        let index = self.ops.iter().position(|op| op.id == id)?;
        Some(self.ops.remove(index))
    }

    /// Entries parked for manual retry, for the "needs attention" UI.
    pub fn manual_ops(&self) -> Vec<&QueuedOp> {
        self.ops.iter().filter(|op| op.needs_manual).collect()
    }

    // -----------------------------------------------------------------------
    // Durable persistence (via the record store's key/value area)
    // -----------------------------------------------------------------------

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "next_id": self.next_id,
            "ops": self.ops,
        })
    }

    /// Restore a persisted queue. A malformed blob is logged and treated
    /// as empty; the queue is best-effort durable.
    pub fn from_json(value: serde_json::Value, config: &SyncConfig) -> Self {
        let mut queue = RetryQueue::new(config);
        match serde_json::from_value::<PersistedQueue>(value) {
            Ok(persisted) => {
                queue.next_id = persisted.next_id.max(1);
                queue.ops = persisted.ops;
            }
            Err(e) => warn!(error = %e, "discarding malformed persisted offline queue"),
        }
        queue
    }
}

#[derive(Deserialize)]
struct PersistedQueue {
    next_id: u64,
    ops: Vec<QueuedOp>,
}
