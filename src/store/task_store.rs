use std::panic::{AssertUnwindSafe, catch_unwind};

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::io::record_store::RecordStore;
use crate::model::config::SyncConfig;
use crate::model::counters::Counters;
use crate::model::task::{TaskRecord, is_temp_id};
use crate::store::settle::{SettleMachine, SettlePhase};

/// Where a bulk load came from. Only a server hydrate is authoritative
/// enough to unlock UI counter updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrateSource {
    Server,
    Cache,
    Websocket,
}

/// What a store notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAction {
    Hydrate,
    Upsert,
    Remove,
    Reconcile,
    /// Deferred recount pushed after a gated window ends
    Refresh,
    Clear,
}

/// Payload delivered to every subscriber on every mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreNotification {
    pub action: StoreAction,
    pub task_id: Option<String>,
    pub counters: Counters,
}

/// Handle returned by [`TaskStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

type SubscriberFn = Box<dyn Fn(&StoreNotification)>;

/// Single in-memory authority for the current task set and its derived
/// counters.
///
/// Owns the queryable map exclusively; the optimistic layer, cross-tab
/// coordinator and push ingestor all mutate through the public entry
/// points here. Temp (unconfirmed) records live in a separate pending map:
/// they are never queryable, never counted, and never mirrored to the
/// persistent store.
///
/// Entry points never fail: malformed input is logged and ignored so bad
/// data cannot take the UI down.
pub struct TaskStore {
    workspace_id: String,
    tasks: IndexMap<String, TaskRecord>,
    /// Temp records awaiting server confirmation, keyed by temp id
    pending: IndexMap<String, TaskRecord>,
    counters: Option<Counters>,
    settle: SettleMachine,
    subscribers: Vec<(SubscriberId, SubscriberFn)>,
    next_subscriber: u64,
    mirror: Option<Box<dyn RecordStore>>,
    /// A gated mutation happened; owe one Refresh when pushes unlock
    dirty_while_gated: bool,
}

impl TaskStore {
    pub fn new(workspace_id: impl Into<String>, config: &SyncConfig, now: DateTime<Utc>) -> Self {
        TaskStore {
            workspace_id: workspace_id.into(),
            tasks: IndexMap::new(),
            pending: IndexMap::new(),
            counters: None,
            settle: SettleMachine::new(
                Duration::milliseconds(config.hydrate_timeout_ms as i64),
                Duration::milliseconds(config.settle_window_ms as i64),
                now,
            ),
            subscribers: Vec::new(),
            next_subscriber: 0,
            mirror: None,
            dirty_while_gated: false,
        }
    }

    /// Attach the durable mirror. All mirror writes flow through the
    /// store's mutation entry points from here on.
    pub fn set_mirror(&mut self, mirror: Box<dyn RecordStore>) {
        self.mirror = Some(mirror);
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    // -----------------------------------------------------------------------
    // Mutation entry points
    // -----------------------------------------------------------------------

    /// Bulk-load records. Filters out foreign-workspace, soft-deleted and
    /// temp-prefixed records, upserts the rest and recounts. A
    /// server-sourced hydrate (even an empty one) is what unlocks UI
    /// counter updates.
    pub fn hydrate(&mut self, records: Vec<TaskRecord>, source: HydrateSource, now: DateTime<Utc>) {
        let mut accepted: Vec<TaskRecord> = Vec::new();
        for record in records {
            if record.id.is_empty() {
                warn!("hydrate: dropping record with empty id");
                continue;
            }
            if record.workspace_id != self.workspace_id {
                debug!(id = %record.id, "hydrate: dropping foreign-workspace record");
                continue;
            }
            if record.is_deleted() {
                continue;
            }
            if record.is_temp() {
                warn!(id = %record.id, "hydrate: dropping temp-prefixed record");
                continue;
            }
            accepted.push(record);
        }

        for record in &accepted {
            self.tasks.insert(record.id.clone(), record.clone());
        }
        if !accepted.is_empty() {
            self.mirror_save_many(&accepted);
        }

        self.settle
            .note_hydrated(source == HydrateSource::Server, accepted.len(), now);
        self.touch(StoreAction::Hydrate, None);
    }

    /// Insert or replace one record. Temp records (flagged or prefixed) go
    /// to the pending map and stay out of counts and queries until
    /// reconciled. Upserting a soft-deleted record removes it.
    pub fn upsert_task(&mut self, record: TaskRecord, is_temp: bool, now: DateTime<Utc>) {
        if record.id.is_empty() {
            warn!("upsert: dropping record with empty id");
            return;
        }
        let id = record.id.clone();
        if is_temp || record.is_temp() {
            self.pending.insert(id.clone(), record);
            self.touch(StoreAction::Upsert, Some(id));
            return;
        }
        if record.is_deleted() {
            debug!(id = %id, "upsert of soft-deleted record treated as removal");
            self.remove_task(&id, now);
            return;
        }
        self.mirror_save(&record);
        self.tasks.insert(id.clone(), record);
        self.touch(StoreAction::Upsert, Some(id));
    }

    /// Atomically replace a temp record with its server-confirmed form.
    ///
    /// Idempotent: reconciling an already-removed temp id is a no-op for
    /// the pending set, and the upsert under `real_id` is a plain replace.
    pub fn reconcile_temp_task(
        &mut self,
        temp_id: &str,
        real_id: &str,
        record: TaskRecord,
        now: DateTime<Utc>,
    ) {
        if real_id.is_empty() || is_temp_id(real_id) {
            warn!(real_id, "reconcile: refusing reserved or empty real id");
            return;
        }
        self.pending.shift_remove(temp_id);

        let mut record = record;
        if record.id != real_id {
            warn!(
                record_id = %record.id,
                real_id,
                "reconcile: record id disagrees with real id, using real id"
            );
            record.id = real_id.to_string();
        }
        if record.is_deleted() {
            // Server confirmed the create but the task is already tombstoned
            self.remove_task(real_id, now);
            return;
        }
        self.mirror_save(&record);
        self.tasks.insert(real_id.to_string(), record);
        self.touch(StoreAction::Reconcile, Some(real_id.to_string()));
    }

    /// Delete a record from both the pending set and the main map.
    /// Idempotent; removing an unknown id does nothing.
    pub fn remove_task(&mut self, id: &str, _now: DateTime<Utc>) {
        let was_pending = self.pending.shift_remove(id).is_some();
        let was_present = self.tasks.shift_remove(id).is_some();
        if was_present {
            self.mirror_delete(id);
        }
        if was_pending || was_present {
            self.touch(StoreAction::Remove, Some(id.to_string()));
        }
    }

    /// Drop all in-memory and mirrored records. Teardown / cache
    /// invalidation path; subscribers stay registered.
    pub fn clear(&mut self) {
        let ids: Vec<String> = self.tasks.keys().cloned().collect();
        for id in &ids {
            self.mirror_delete(id);
        }
        self.tasks.clear();
        self.pending.clear();
        self.counters = None;
        self.touch(StoreAction::Clear, None);
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Look up a confirmed record. Temp records are not queryable.
    pub fn get_task(&self, id: &str) -> Option<&TaskRecord> {
        self.tasks.get(id)
    }

    /// Look up a temp record awaiting confirmation.
    pub fn get_pending(&self, temp_id: &str) -> Option<&TaskRecord> {
        self.pending.get(temp_id)
    }

    /// Number of records awaiting server confirmation.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Confirmed records, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.values()
    }

    /// Owned copy of the confirmed set, for cross-tab snapshots.
    pub fn snapshot(&self) -> Vec<TaskRecord> {
        self.tasks.values().cloned().collect()
    }

    /// Full O(n) recount over confirmed records. Never incremental, so the
    /// counters cannot drift from the map.
    pub fn compute_counters(&mut self) -> Counters {
        let counters = Counters::compute(self.tasks.values());
        self.counters = Some(counters.clone());
        counters
    }

    /// Last computed counters, computing fresh if none are cached.
    pub fn get_counters(&mut self) -> Counters {
        match &self.counters {
            Some(counters) => counters.clone(),
            None => self.compute_counters(),
        }
    }

    // -----------------------------------------------------------------------
    // Settling / gating
    // -----------------------------------------------------------------------

    pub fn phase(&self) -> SettlePhase {
        self.settle.phase()
    }

    /// Whether outbound cross-tab broadcasts are allowed right now.
    pub fn broadcasts_enabled(&self) -> bool {
        self.settle.broadcasts_enabled()
    }

    /// Advance settle-machine deadlines. Emits the deferred `Refresh`
    /// notification when the store goes live; returns true if it did.
    pub fn tick(&mut self, now: DateTime<Utc>) -> bool {
        if self.settle.tick(now) {
            self.dirty_while_gated = false;
            self.notify(StoreAction::Refresh, None);
            return true;
        }
        if self.settle.pushes_enabled() && self.dirty_while_gated {
            self.dirty_while_gated = false;
            self.notify(StoreAction::Refresh, None);
            return true;
        }
        false
    }

    /// Suppress counter pushes for the duration of a UI batch rewrite.
    pub fn begin_view_transition(&mut self) {
        self.settle.begin_view_transition();
    }

    /// Release the view-transition flag, forcing one recount push.
    pub fn end_view_transition(&mut self) {
        if self.settle.end_view_transition() {
            self.dirty_while_gated = false;
            self.notify(StoreAction::Refresh, None);
        }
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Register a subscriber called synchronously on every mutation.
    pub fn subscribe(&mut self, callback: impl Fn(&StoreNotification) + 'static) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber);
        self.next_subscriber += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) {
        self.subscribers.retain(|(sub_id, _)| *sub_id != id);
    }

    /// Recount and either push to subscribers or mark the store dirty if
    /// pushes are gated by settling or a view transition.
    fn touch(&mut self, action: StoreAction, task_id: Option<String>) {
        self.compute_counters();
        if self.settle.pushes_enabled() {
            self.notify(action, task_id);
        } else {
            self.dirty_while_gated = true;
        }
    }

    fn notify(&mut self, action: StoreAction, task_id: Option<String>) {
        let notification = StoreNotification {
            action,
            task_id,
            counters: self.get_counters(),
        };
        // Each subscriber is isolated: one panicking callback must not
        // break the mutation or starve the rest.
        for (id, callback) in &self.subscribers {
            if catch_unwind(AssertUnwindSafe(|| callback(&notification))).is_err() {
                warn!(subscriber = id.0, "store subscriber panicked");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Mirror and key/value state (durable collaborator)
    // -----------------------------------------------------------------------

    fn mirror_save(&mut self, record: &TaskRecord) {
        if let Some(mirror) = &mut self.mirror
            && let Err(e) = mirror.save_task(record)
        {
            warn!(id = %record.id, error = %e, "mirror write failed");
        }
    }

    fn mirror_save_many(&mut self, records: &[TaskRecord]) {
        if let Some(mirror) = &mut self.mirror
            && let Err(e) = mirror.save_tasks(records)
        {
            warn!(error = %e, "mirror bulk write failed");
        }
    }

    fn mirror_delete(&mut self, id: &str) {
        if let Some(mirror) = &mut self.mirror
            && let Err(e) = mirror.delete_task(id)
        {
            warn!(id, error = %e, "mirror delete failed");
        }
    }

    /// Persist a value in the durable key/value area (view state, offline
    /// queue). Failures are logged, never surfaced.
    pub fn persist_state(&mut self, key: &str, value: serde_json::Value) {
        if let Some(mirror) = &mut self.mirror
            && let Err(e) = mirror.set_state(key, value)
        {
            warn!(key, error = %e, "state write failed");
        }
    }

    /// Load a value from the durable key/value area.
    pub fn load_state(&self, key: &str) -> Option<serde_json::Value> {
        match self.mirror.as_ref()?.get_state(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "state read failed");
                None
            }
        }
    }

    /// Records persisted by a previous session, for the cache hydrate.
    pub fn load_mirrored(&self) -> Vec<TaskRecord> {
        match self.mirror.as_ref().map(|m| m.get_all()) {
            Some(Ok(records)) => records,
            Some(Err(e)) => {
                warn!(error = %e, "cache read failed");
                Vec::new()
            }
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::record_store::MemoryStore;
    use crate::model::task::{TaskPatch, TaskStatus};
    use chrono::TimeZone;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn task(id: &str, status: TaskStatus) -> TaskRecord {
        let mut record = TaskRecord::new(id, "t", "ws", at(0));
        TaskPatch::status(status).apply_to(&mut record, at(1));
        record
    }

    /// Store in Live phase so notifications flow.
    fn live_store() -> TaskStore {
        let mut store = TaskStore::new("ws", &SyncConfig::default(), at(0));
        store.hydrate(vec![], HydrateSource::Server, at(0));
        store.tick(at(2000));
        store
    }

    #[test]
    fn counters_scenario_from_contract() {
        let mut store = live_store();
        store.hydrate(
            vec![task("1", TaskStatus::Todo), task("2", TaskStatus::Completed)],
            HydrateSource::Server,
            at(2100),
        );
        let counters = store.get_counters();
        assert_eq!(counters.all, 2);
        assert_eq!(counters.active, 1);
        assert_eq!(counters.archived, 1);

        store.remove_task("2", at(2200));
        let counters = store.get_counters();
        assert_eq!(counters.all, 1);
        assert_eq!(counters.active, 1);
        assert_eq!(counters.archived, 0);
    }

    #[test]
    fn temp_records_are_invisible_until_reconciled() {
        let mut store = live_store();
        let before = store.get_counters();

        store.upsert_task(task("tmp-a-1", TaskStatus::Todo), true, at(10));
        assert_eq!(store.get_counters().all, before.all);
        assert!(store.get_task("tmp-a-1").is_none());
        assert_eq!(store.pending_count(), 1);

        store.reconcile_temp_task("tmp-a-1", "42", task("42", TaskStatus::Todo), at(20));
        assert_eq!(store.get_counters().all, before.all + 1);
        assert!(store.get_task("tmp-a-1").is_none());
        assert!(store.get_task("42").is_some());
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn reconcile_is_idempotent() {
        let mut store = live_store();
        store.upsert_task(task("tmp-a-1", TaskStatus::Todo), true, at(10));

        store.reconcile_temp_task("tmp-a-1", "42", task("42", TaskStatus::Todo), at(20));
        let first = store.get_counters();
        store.reconcile_temp_task("tmp-a-1", "42", task("42", TaskStatus::Todo), at(30));
        let second = store.get_counters();

        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn reconcile_refuses_temp_real_id() {
        let mut store = live_store();
        store.upsert_task(task("tmp-a-1", TaskStatus::Todo), true, at(10));
        store.reconcile_temp_task("tmp-a-1", "tmp-b-9", task("tmp-b-9", TaskStatus::Todo), at(20));
        // No-op: pending untouched, nothing confirmed
        assert_eq!(store.pending_count(), 1);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut store = live_store();
        store.upsert_task(task("1", TaskStatus::Todo), false, at(10));
        store.remove_task("1", at(20));
        store.remove_task("1", at(30));
        assert_eq!(store.get_counters().all, 0);
    }

    #[test]
    fn hydrate_filters_foreign_deleted_and_temp() {
        let mut store = live_store();
        let mut foreign = task("f", TaskStatus::Todo);
        foreign.workspace_id = "other".into();
        let mut dead = task("d", TaskStatus::Todo);
        dead.deleted_at = Some(at(5));
        let records = vec![
            task("1", TaskStatus::Todo),
            foreign,
            dead,
            task("tmp-x-1", TaskStatus::Todo),
        ];
        store.hydrate(records, HydrateSource::Server, at(100));
        assert_eq!(store.get_counters().all, 1);
        assert!(store.get_task("1").is_some());
    }

    #[test]
    fn empty_id_upsert_is_ignored() {
        let mut store = live_store();
        let mut bad = task("1", TaskStatus::Todo);
        bad.id = String::new();
        store.upsert_task(bad, false, at(10));
        assert_eq!(store.get_counters().all, 0);
    }

    #[test]
    fn server_hydrate_overwrites_cache_hydrate() {
        let mut store = TaskStore::new("ws", &SyncConfig::default(), at(0));
        let mut cached = task("1", TaskStatus::Todo);
        cached.title = "stale".into();
        store.hydrate(vec![cached], HydrateSource::Cache, at(10));

        let mut fresh = task("1", TaskStatus::Todo);
        fresh.title = "fresh".into();
        store.hydrate(vec![fresh], HydrateSource::Server, at(20));

        assert_eq!(store.get_task("1").unwrap().title, "fresh");
    }

    #[test]
    fn counter_pushes_wait_for_server_hydrate() {
        let mut store = TaskStore::new("ws", &SyncConfig::default(), at(0));
        let seen: Rc<RefCell<Vec<StoreNotification>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        store.subscribe(move |n| sink.borrow_mut().push(n.clone()));

        store.hydrate(vec![task("1", TaskStatus::Todo)], HydrateSource::Cache, at(10));
        store.tick(at(100));
        assert!(seen.borrow().is_empty(), "no push before server hydrate");

        store.hydrate(vec![task("2", TaskStatus::Todo)], HydrateSource::Server, at(200));
        assert!(seen.borrow().is_empty(), "no push during settling");

        store.tick(at(1300));
        let notifications = seen.borrow();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].action, StoreAction::Refresh);
        assert_eq!(notifications[0].counters.all, 2);
    }

    #[test]
    fn gated_mutations_coalesce_into_one_refresh() {
        let mut store = live_store();
        let seen: Rc<RefCell<Vec<StoreNotification>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        store.subscribe(move |n| sink.borrow_mut().push(n.clone()));

        store.begin_view_transition();
        store.upsert_task(task("1", TaskStatus::Todo), false, at(10));
        store.upsert_task(task("2", TaskStatus::Todo), false, at(11));
        assert!(seen.borrow().is_empty());

        store.end_view_transition();
        let notifications = seen.borrow();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].action, StoreAction::Refresh);
        assert_eq!(notifications[0].counters.all, 2);
    }

    #[test]
    fn panicking_subscriber_does_not_starve_the_rest() {
        let mut store = live_store();
        let seen: Rc<RefCell<Vec<StoreAction>>> = Rc::new(RefCell::new(Vec::new()));

        store.subscribe(|_| panic!("broken widget"));
        let sink = Rc::clone(&seen);
        store.subscribe(move |n| sink.borrow_mut().push(n.action));

        store.upsert_task(task("1", TaskStatus::Todo), false, at(10));
        assert_eq!(seen.borrow().as_slice(), &[StoreAction::Upsert]);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let mut store = live_store();
        let seen: Rc<RefCell<usize>> = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&seen);
        let id = store.subscribe(move |_| *sink.borrow_mut() += 1);

        store.upsert_task(task("1", TaskStatus::Todo), false, at(10));
        store.unsubscribe(id);
        store.upsert_task(task("2", TaskStatus::Todo), false, at(11));
        assert_eq!(*seen.borrow(), 1);
    }

    #[test]
    fn mirror_tracks_the_confirmed_map_only() {
        let mut store = live_store();
        store.set_mirror(Box::new(MemoryStore::new()));

        store.upsert_task(task("tmp-a-1", TaskStatus::Todo), true, at(10));
        store.upsert_task(task("1", TaskStatus::Todo), false, at(11));
        store.reconcile_temp_task("tmp-a-1", "2", task("2", TaskStatus::Todo), at(12));
        store.remove_task("1", at(13));

        let mut mirrored: Vec<String> =
            store.load_mirrored().into_iter().map(|t| t.id).collect();
        mirrored.sort();
        assert_eq!(mirrored, vec!["2"]);
    }

    #[test]
    fn clear_empties_memory_and_mirror() {
        let mut store = live_store();
        store.set_mirror(Box::new(MemoryStore::new()));
        store.upsert_task(task("1", TaskStatus::Todo), false, at(10));

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.pending_count(), 0);
        assert!(store.load_mirrored().is_empty());
    }

    #[test]
    fn counters_invariant_holds_across_mutations() {
        let mut store = live_store();
        store.hydrate(
            vec![
                task("1", TaskStatus::Todo),
                task("2", TaskStatus::Completed),
                task("3", TaskStatus::Blocked),
            ],
            HydrateSource::Server,
            at(10),
        );
        store.upsert_task(task("4", TaskStatus::Cancelled), false, at(11));
        store.remove_task("3", at(12));

        let counters = store.get_counters();
        assert_eq!(counters.all, counters.active + counters.archived);
        assert_eq!(counters.all, store.len());
    }
}
