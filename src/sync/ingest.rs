use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::model::event::{PushEvent, PushPayload, ReplayRequest, ReplayResponse};
use crate::store::task_store::TaskStore;

/// What happened to an ingested push event.
#[derive(Debug, PartialEq)]
pub enum IngestOutcome {
    Applied,
    /// At or below the watermark; expected steady-state noise
    Duplicate,
    /// Applied, but a sequence gap was detected: the caller should send
    /// the replay request to recover the missed events
    ReplayNeeded(ReplayRequest),
    /// Failed boundary validation; logged and dropped
    Invalid,
}

/// Folds server-pushed events into the store with sequence checking.
///
/// Events are applied with last-write-wins on `updated_at`, so a gapped or
/// replayed event can never regress a record past fresher local state.
#[derive(Debug, Default)]
pub struct PushIngestor {
    watermark: u64,
}

impl PushIngestor {
    pub fn new() -> Self {
        PushIngestor::default()
    }

    /// Resume from a previously persisted watermark.
    pub fn with_watermark(watermark: u64) -> Self {
        PushIngestor { watermark }
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Validate and ingest a raw channel value.
    pub fn ingest_value(
        &mut self,
        store: &mut TaskStore,
        value: serde_json::Value,
        now: DateTime<Utc>,
    ) -> IngestOutcome {
        match PushEvent::parse(value) {
            Ok(event) => self.ingest(store, event, now),
            Err(e) => {
                warn!(error = %e, "dropping malformed push event");
                IngestOutcome::Invalid
            }
        }
    }

    /// Ingest an already-validated event.
    pub fn ingest(
        &mut self,
        store: &mut TaskStore,
        event: PushEvent,
        now: DateTime<Utc>,
    ) -> IngestOutcome {
        if event.sequence_num <= self.watermark {
            debug!(seq = event.sequence_num, watermark = self.watermark, "duplicate push event");
            return IngestOutcome::Duplicate;
        }
        let gap = self.watermark > 0 && event.sequence_num > self.watermark + 1;
        let last_seen = self.watermark;
        self.watermark = event.sequence_num;
        self.apply(store, event.payload, now);

        if gap {
            IngestOutcome::ReplayNeeded(ReplayRequest {
                last_sequence_num: last_seen,
            })
        } else {
            IngestOutcome::Applied
        }
    }

    /// Fold a replay reply: missed events in order, then the server's
    /// watermark.
    pub fn apply_replay(
        &mut self,
        store: &mut TaskStore,
        response: ReplayResponse,
        now: DateTime<Utc>,
    ) {
        for event in response.events {
            if event.sequence_num <= self.watermark {
                continue;
            }
            self.watermark = event.sequence_num;
            self.apply(store, event.payload, now);
        }
        self.watermark = self.watermark.max(response.watermark);
    }

    fn apply(&mut self, store: &mut TaskStore, payload: PushPayload, now: DateTime<Utc>) {
        match payload {
            PushPayload::TaskCreated(record) | PushPayload::TaskUpdated(record) => {
                if record.workspace_id != store.workspace_id() {
                    debug!(id = %record.id, "ignoring push for foreign workspace");
                    return;
                }
                // Last write wins: never regress past fresher local state
                if let Some(existing) = store.get_task(&record.id)
                    && existing.updated_at > record.updated_at
                {
                    debug!(id = %record.id, "ignoring stale push record");
                    return;
                }
                store.upsert_task(record, false, now);
            }
            PushPayload::TaskDeleted { id } => {
                store.remove_task(&id, now);
            }
            PushPayload::TaskDelta { id, patch } => {
                let Some(existing) = store.get_task(&id) else {
                    debug!(id = %id, "delta for unknown task, ignoring");
                    return;
                };
                let mut updated = existing.clone();
                patch.apply_to(&mut updated, now);
                store.upsert_task(updated, false, now);
            }
        }
    }
}
