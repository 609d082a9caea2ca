use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::io::record_store::RecordStore;
use crate::model::config::SyncConfig;
use crate::model::counters::Counters;
use crate::model::event::{PushEvent, ReplayResponse};
use crate::model::task::{TaskPatch, TaskStatus, is_temp_id};
use crate::model::view::ViewState;
use crate::store::debounce::Debouncer;
use crate::store::task_store::{HydrateSource, StoreNotification, SubscriberId, TaskStore};
use crate::sync::api::{ApiMethod, ApiRequest, ApiResult};
use crate::sync::broadcast::{BroadcastMessage, BroadcastPayload, Coordinator, Inbound};
use crate::sync::ingest::{IngestOutcome, PushIngestor};
use crate::sync::offline::{QueuedOp, RetryQueue};
use crate::sync::optimistic::{
    CreateOutcome, MutationError, OpId, OptimisticLayer, Resolution, TaskDraft,
};

const VIEW_STATE_KEY: &str = "view_state";
const OFFLINE_QUEUE_KEY: &str = "offline_queue";
const WATERMARK_KEY: &str = "push_watermark";

/// Work produced by a [`SyncEngine::tick`]: offline replays that are due
/// and cross-tab broadcasts ready to publish.
#[derive(Debug, Default)]
pub struct TickOutput {
    pub replays: Vec<(u64, ApiRequest)>,
    pub broadcasts: Vec<BroadcastMessage>,
    /// The store just unlocked counter pushes
    pub went_live: bool,
}

/// Outcome of replaying one offline-queue entry.
#[derive(Debug, PartialEq)]
pub enum ReplayOutcome {
    /// Store reconciled with the server's response, entry removed
    Reconciled,
    /// Failed again; backed off (or parked for manual retry at the cap)
    Backoff,
    /// Server rejected the payload outright; entry dropped
    Abandoned { message: String },
}

/// One engine instance per tab: wires the task store, optimistic layer,
/// cross-tab coordinator, offline queue and push ingestor together.
///
/// The engine performs no IO beyond the record-store mirror. Network
/// requests and broadcast messages are returned as data for the page glue
/// to execute; completions come back through [`complete`](Self::complete),
/// [`on_push`](Self::on_push) and [`on_broadcast`](Self::on_broadcast).
/// Timers advance only through [`tick`](Self::tick).
pub struct SyncEngine {
    config: SyncConfig,
    store: TaskStore,
    optimistic: OptimisticLayer,
    coordinator: Coordinator,
    queue: RetryQueue,
    ingestor: PushIngestor,
    view: ViewState,
    outbox: Vec<BroadcastMessage>,
    broadcast_debounce: Debouncer,
}

impl SyncEngine {
    /// Construct the per-tab engine: attaches the durable mirror, hydrates
    /// from cache, and restores view state, offline queue and push
    /// watermark from previous sessions.
    ///
    /// The caller should publish [`announce`](Self::announce) right after,
    /// then fetch from the server and call
    /// [`hydrate_from_server`](Self::hydrate_from_server).
    pub fn init(
        workspace_id: impl Into<String>,
        tab_id: impl Into<String>,
        config: SyncConfig,
        mirror: Option<Box<dyn RecordStore>>,
        now: DateTime<Utc>,
    ) -> Self {
        let tab_id = tab_id.into();
        let mut store = TaskStore::new(workspace_id, &config, now);
        if let Some(mirror) = mirror {
            store.set_mirror(mirror);
        }

        let cached = store.load_mirrored();
        if !cached.is_empty() {
            store.hydrate(cached, HydrateSource::Cache, now);
        }

        let view = store
            .load_state(VIEW_STATE_KEY)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();
        let queue = match store.load_state(OFFLINE_QUEUE_KEY) {
            Some(value) => RetryQueue::from_json(value, &config),
            None => RetryQueue::new(&config),
        };
        let watermark = store
            .load_state(WATERMARK_KEY)
            .and_then(|value| value.as_u64())
            .unwrap_or(0);

        SyncEngine {
            store,
            optimistic: OptimisticLayer::new(tab_id.clone()),
            coordinator: Coordinator::new(tab_id, &config),
            queue,
            ingestor: PushIngestor::with_watermark(watermark),
            view,
            outbox: Vec::new(),
            broadcast_debounce: Debouncer::new(Duration::milliseconds(
                config.broadcast_debounce_ms as i64,
            )),
            config,
        }
    }

    /// The `tab_connected` hello, published immediately (not debounced) so
    /// the leader can answer with a snapshot.
    pub fn announce(&mut self) -> BroadcastMessage {
        self.coordinator.envelope(BroadcastPayload::TabConnected)
    }

    // -----------------------------------------------------------------------
    // UI-facing surface
    // -----------------------------------------------------------------------

    pub fn subscribe(
        &mut self,
        callback: impl Fn(&StoreNotification) + 'static,
    ) -> SubscriberId {
        self.store.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) {
        self.store.unsubscribe(id)
    }

    pub fn counters(&mut self) -> Counters {
        self.store.get_counters()
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn pending_count(&self) -> usize {
        self.store.pending_count()
    }

    /// Queue entries parked for manual retry ("needs attention" UI).
    pub fn manual_retries(&self) -> Vec<&QueuedOp> {
        self.queue.manual_ops()
    }

    /// Teardown: drop all in-memory and mirrored records.
    pub fn clear(&mut self) {
        self.store.clear();
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Optimistically create a task; returns the request to execute.
    /// The cross-tab broadcast happens on confirmation, once a real id
    /// exists.
    pub fn create_task(&mut self, draft: TaskDraft, now: DateTime<Utc>) -> (OpId, ApiRequest) {
        self.optimistic.create(&mut self.store, draft, now)
    }

    /// Optimistically apply a partial update; returns the request, which is
    /// `None` while the target is a still-unconfirmed temp record (the edit
    /// comes back re-keyed in the create's `follow_ups`).
    pub fn update_task(
        &mut self,
        id: &str,
        patch: TaskPatch,
        now: DateTime<Utc>,
    ) -> Result<(OpId, Option<ApiRequest>), MutationError> {
        let result = self.optimistic.update(&mut self.store, id, patch, now)?;
        self.broadcast_current(id, now);
        Ok(result)
    }

    /// Status toggle shorthand.
    pub fn set_status(
        &mut self,
        id: &str,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(OpId, Option<ApiRequest>), MutationError> {
        self.update_task(id, TaskPatch::status(status), now)
    }

    /// Optimistically delete; the request is `None` when the task was a
    /// still-unconfirmed temp record.
    pub fn delete_task(
        &mut self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<(OpId, Option<ApiRequest>), MutationError> {
        let was_temp = self.store.get_pending(id).is_some();
        let result = self.optimistic.delete(&mut self.store, id, now)?;
        if !was_temp {
            self.queue_broadcast(
                BroadcastPayload::TaskDeleted { id: id.to_string() },
                now,
            );
        }
        Ok(result)
    }

    /// Fold a network completion into the store. For a `Superseded`
    /// resolution the caller must execute any `follow_up` request; for a
    /// `Reconciled` one, any `follow_ups`.
    pub fn complete(&mut self, op: OpId, result: ApiResult, now: DateTime<Utc>) -> Resolution {
        let task_id = self.optimistic.task_of(op).map(str::to_string);
        let resolution =
            self.optimistic
                .resolve(&mut self.store, &mut self.queue, op, result, now);
        self.persist_queue();
        match &resolution {
            Resolution::Reconciled { task_id, .. } => {
                let task_id = task_id.clone();
                self.broadcast_current(&task_id, now);
            }
            Resolution::QueuedForRetry { .. } | Resolution::Rejected { .. } => {
                // A rollback must reach peer tabs that saw the optimistic
                // state
                if let Some(id) = task_id {
                    self.broadcast_current(&id, now);
                }
            }
            _ => {}
        }
        resolution
    }

    /// Broadcast the current state of one record: an upsert if it exists,
    /// a delete if it does not. Temp records never cross the tab boundary.
    fn broadcast_current(&mut self, id: &str, now: DateTime<Utc>) {
        if is_temp_id(id) {
            return;
        }
        match self.store.get_task(id).cloned() {
            Some(task) => self.queue_broadcast(BroadcastPayload::TaskUpdated { task }, now),
            None => self.queue_broadcast(
                BroadcastPayload::TaskDeleted { id: id.to_string() },
                now,
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Hydration & inbound events
    // -----------------------------------------------------------------------

    /// Bulk-load the server's task list; unlocks UI counter pushes once
    /// the settle window passes.
    pub fn hydrate_from_server(&mut self, records: Vec<crate::model::task::TaskRecord>, now: DateTime<Utc>) {
        self.store.hydrate(records, HydrateSource::Server, now);
    }

    /// Ingest one validated push event.
    pub fn on_push(&mut self, event: PushEvent, now: DateTime<Utc>) -> IngestOutcome {
        let outcome = self.ingestor.ingest(&mut self.store, event, now);
        self.persist_watermark();
        outcome
    }

    /// Ingest a raw push-channel value (boundary validation included).
    pub fn on_push_value(&mut self, value: serde_json::Value, now: DateTime<Utc>) -> IngestOutcome {
        let outcome = self.ingestor.ingest_value(&mut self.store, value, now);
        self.persist_watermark();
        outcome
    }

    /// Fold replayed events after a gap.
    pub fn on_replay(&mut self, response: ReplayResponse, now: DateTime<Utc>) {
        self.ingestor.apply_replay(&mut self.store, response, now);
        self.persist_watermark();
    }

    /// Fold one inbound cross-tab message. A `Reply` must be published by
    /// the caller; `CacheInvalidated` means the caller should refetch from
    /// the server (the engine has already dropped its cache).
    pub fn on_broadcast(&mut self, message: BroadcastMessage, now: DateTime<Utc>) -> Inbound {
        let inbound = self
            .coordinator
            .receive(&mut self.store, &mut self.view, message, now);
        match &inbound {
            Inbound::ViewApplied => self.persist_view(),
            Inbound::CacheInvalidated => {
                debug!("cache invalidated by another tab");
                self.store.clear();
            }
            _ => {}
        }
        inbound
    }

    // -----------------------------------------------------------------------
    // View state
    // -----------------------------------------------------------------------

    /// The local user changed filter/search/sort: persist, arm the action
    /// lock against stale broadcasts, and propagate to other tabs.
    pub fn set_view(&mut self, view: ViewState, now: DateTime<Utc>) {
        self.view = view.clone();
        self.coordinator.note_user_action(now);
        self.persist_view();
        self.queue_broadcast(BroadcastPayload::ViewChanged { view }, now);
    }

    /// Suppress counter pushes around a UI batch rewrite.
    pub fn begin_view_transition(&mut self) {
        self.store.begin_view_transition();
    }

    pub fn end_view_transition(&mut self) {
        self.store.end_view_transition();
    }

    // -----------------------------------------------------------------------
    // Timers & offline replay
    // -----------------------------------------------------------------------

    /// Advance all deadline-driven work: settle transitions, the broadcast
    /// debounce window, and due offline replays.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickOutput {
        let went_live = self.store.tick(now);

        let mut broadcasts = Vec::new();
        if self.store.broadcasts_enabled()
            && !self.outbox.is_empty()
            && self.broadcast_debounce.fire(now)
        {
            broadcasts.append(&mut self.outbox);
        }

        TickOutput {
            replays: self.queue.due(now),
            broadcasts,
            went_live,
        }
    }

    /// Report the outcome of replaying one queue entry.
    pub fn complete_replay(
        &mut self,
        entry: u64,
        result: ApiResult,
        now: DateTime<Utc>,
    ) -> ReplayOutcome {
        let outcome = match result {
            Ok(response) => {
                if let Some(op) = self.queue.mark_succeeded(entry) {
                    self.reconcile_replayed(&op.request, response.task, now);
                }
                ReplayOutcome::Reconciled
            }
            Err(failure) if failure.is_retryable() => {
                self.queue.mark_failed(entry, now);
                ReplayOutcome::Backoff
            }
            Err(failure) => {
                // A rejected payload will never succeed; stop replaying it
                self.queue.abandon(entry);
                ReplayOutcome::Abandoned {
                    message: failure.message,
                }
            }
        };
        self.persist_queue();
        outcome
    }

    /// Explicit user retry of a parked entry; resets its attempt counter.
    pub fn retry_manually(&mut self, entry: u64) {
        self.queue.retry_manually(entry);
        self.persist_queue();
    }

    /// Drop a parked entry the user chose to abandon.
    pub fn abandon_retry(&mut self, entry: u64) {
        self.queue.abandon(entry);
        self.persist_queue();
    }

    fn reconcile_replayed(
        &mut self,
        request: &ApiRequest,
        task: Option<crate::model::task::TaskRecord>,
        now: DateTime<Utc>,
    ) {
        match request.method {
            ApiMethod::Post => {
                if let Some(record) = task {
                    match self.optimistic.confirm_create(
                        &mut self.store,
                        &request.task_id,
                        record,
                        now,
                    ) {
                        CreateOutcome::Installed { task_id, follow_ups } => {
                            // Edits deferred behind the create join the
                            // queue under the server id; per-task FIFO
                            // keeps them in order
                            for (op, request) in follow_ups {
                                self.optimistic.forget(op);
                                self.queue.enqueue(request, now);
                            }
                            self.broadcast_current(&task_id, now);
                        }
                        CreateOutcome::Orphaned { cleanup } => {
                            self.queue.enqueue(cleanup, now);
                        }
                    }
                }
            }
            ApiMethod::Patch => {
                if let Some(record) = task {
                    let id = record.id.clone();
                    self.store.upsert_task(record, false, now);
                    self.broadcast_current(&id, now);
                }
            }
            ApiMethod::Delete => {
                self.store.remove_task(&request.task_id, now);
                self.queue_broadcast(
                    BroadcastPayload::TaskDeleted {
                        id: request.task_id.clone(),
                    },
                    now,
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn queue_broadcast(&mut self, payload: BroadcastPayload, now: DateTime<Utc>) {
        let message = self.coordinator.envelope(payload);
        self.outbox.push(message);
        self.broadcast_debounce.poke(now);
    }

    fn persist_view(&mut self) {
        if let Ok(value) = serde_json::to_value(&self.view) {
            self.store.persist_state(VIEW_STATE_KEY, value);
        }
    }

    fn persist_queue(&mut self) {
        let value = self.queue.to_json();
        self.store.persist_state(OFFLINE_QUEUE_KEY, value);
    }

    fn persist_watermark(&mut self) {
        let watermark = self.ingestor.watermark();
        self.store
            .persist_state(WATERMARK_KEY, serde_json::json!(watermark));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::record_store::MemoryStore;
    use crate::model::view::FilterTab;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn engine() -> SyncEngine {
        SyncEngine::init(
            "ws",
            "tab-a",
            SyncConfig::default(),
            Some(Box::new(MemoryStore::new())),
            at(0),
        )
    }

    #[test]
    fn init_hydrates_from_the_mirror_cache() {
        let seed = MemoryStore::seeded(vec![crate::model::task::TaskRecord::new(
            "1",
            "cached",
            "ws",
            at(0),
        )]);
        let mut engine = SyncEngine::init(
            "ws",
            "tab-a",
            SyncConfig::default(),
            Some(Box::new(seed)),
            at(0),
        );
        assert_eq!(engine.counters().all, 1);
        assert!(engine.store().get_task("1").is_some());
    }

    #[test]
    fn announce_is_a_tab_connected_message() {
        let mut engine = engine();
        let hello = engine.announce();
        assert_eq!(hello.payload, BroadcastPayload::TabConnected);
        assert_eq!(hello.origin, "tab-a");
    }

    #[test]
    fn set_view_persists_and_queues_a_broadcast() {
        let mut engine = engine();
        engine.hydrate_from_server(vec![], at(0));
        engine.tick(at(2000));

        engine.set_view(
            ViewState {
                filter: FilterTab::Archived,
                ..Default::default()
            },
            at(2100),
        );

        let output = engine.tick(at(2100 + 250));
        assert_eq!(output.broadcasts.len(), 1);
        assert!(matches!(
            output.broadcasts[0].payload,
            BroadcastPayload::ViewChanged { .. }
        ));

        // Survives a restart through the same mirror? View state is in the
        // mirror; a fresh engine over an empty mirror defaults instead.
        assert_eq!(engine.view().filter, FilterTab::Archived);
    }

    #[test]
    fn broadcasts_are_held_until_live() {
        let mut engine = engine();
        engine.hydrate_from_server(
            vec![crate::model::task::TaskRecord::new("1", "t", "ws", at(0))],
            at(0),
        );
        // Still settling: queued broadcasts must not flush
        engine
            .set_status("1", TaskStatus::Completed, at(100))
            .unwrap();
        let output = engine.tick(at(500));
        assert!(output.broadcasts.is_empty());

        // Once live, the already-elapsed debounce window flushes the outbox
        let output = engine.tick(at(1500));
        assert!(output.went_live);
        assert!(!output.broadcasts.is_empty());
    }

    #[test]
    fn cache_invalidation_clears_the_store() {
        let mut engine = engine();
        engine.hydrate_from_server(
            vec![crate::model::task::TaskRecord::new("1", "t", "ws", at(0))],
            at(0),
        );
        let mut other = Coordinator::new("tab-b", &SyncConfig::default());
        let message = other.envelope(BroadcastPayload::CacheInvalidated);

        let inbound = engine.on_broadcast(message, at(100));
        assert_eq!(inbound, Inbound::CacheInvalidated);
        assert!(engine.store().is_empty());
    }
}
