use chrono::{DateTime, Duration, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::config::SyncConfig;
use crate::model::task::{TaskRecord, is_temp_id};
use crate::model::view::ViewState;
use crate::store::task_store::{HydrateSource, TaskStore};

/// Message bodies exchanged between same-origin tabs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastPayload {
    TaskCreated { task: TaskRecord },
    TaskUpdated { task: TaskRecord },
    TaskDeleted { id: String },
    ViewChanged { view: ViewState },
    CacheInvalidated,
    SyncRequest,
    SyncResponse { tasks: Vec<TaskRecord> },
    TabConnected,
}

/// Envelope: originating tab plus a per-tab monotonic sequence id, which
/// together identify a message for dedup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub origin: String,
    pub seq: u64,
    pub payload: BroadcastPayload,
}

/// What an inbound message did.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// Dropped: self-echo, duplicate, locked view, or invalid payload
    Ignored,
    /// A task mutation was folded into the store
    TaskApplied,
    /// The shared view state was replaced
    ViewApplied,
    /// A full-state snapshot was hydrated
    SnapshotApplied,
    /// Caller should drop cached data and refetch from the server
    CacheInvalidated,
    /// A reply to publish (leader answering a new tab)
    Reply(Box<BroadcastMessage>),
}

/// Propagates mutations, view state and cache invalidation across tabs.
///
/// The transport is external: outbound messages are returned to the
/// caller, inbound ones are handed to [`receive`](Self::receive). If the
/// browser has no broadcast primitive nothing delivers the messages and
/// the tab degrades to single-tab operation with no further ceremony.
pub struct Coordinator {
    tab_id: String,
    next_seq: u64,
    /// Recently-seen (origin, seq) pairs, oldest first
    seen: IndexSet<(String, u64)>,
    dedup_capacity: usize,
    /// Whether this tab considers itself the state authority
    is_leader: bool,
    action_lock_until: Option<DateTime<Utc>>,
    action_lock: Duration,
}

impl Coordinator {
    /// A new tab starts as leader; receiving a snapshot from an
    /// established tab demotes it.
    pub fn new(tab_id: impl Into<String>, config: &SyncConfig) -> Self {
        Coordinator {
            tab_id: tab_id.into(),
            next_seq: 1,
            seen: IndexSet::new(),
            dedup_capacity: config.dedup_capacity,
            is_leader: true,
            action_lock_until: None,
            action_lock: Duration::milliseconds(config.action_lock_ms as i64),
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Wrap a payload in this tab's envelope.
    pub fn envelope(&mut self, payload: BroadcastPayload) -> BroadcastMessage {
        let seq = self.next_seq;
        self.next_seq += 1;
        BroadcastMessage {
            origin: self.tab_id.clone(),
            seq,
            payload,
        }
    }

    /// The local user just filtered/sorted: shield the view state from
    /// stale broadcasts for a few seconds.
    pub fn note_user_action(&mut self, now: DateTime<Utc>) {
        self.action_lock_until = Some(now + self.action_lock);
    }

    fn action_locked(&self, now: DateTime<Utc>) -> bool {
        matches!(self.action_lock_until, Some(until) if now < until)
    }

    /// Fold one inbound message into the store / view state.
    pub fn receive(
        &mut self,
        store: &mut TaskStore,
        view: &mut ViewState,
        message: BroadcastMessage,
        now: DateTime<Utc>,
    ) -> Inbound {
        if message.origin == self.tab_id {
            return Inbound::Ignored;
        }
        if !self.remember(&message) {
            debug!(origin = %message.origin, seq = message.seq, "dropping duplicate broadcast");
            return Inbound::Ignored;
        }

        match message.payload {
            BroadcastPayload::TaskCreated { task } | BroadcastPayload::TaskUpdated { task } => {
                if task.is_temp() {
                    warn!(id = %task.id, "dropping broadcast with temp-prefixed id");
                    return Inbound::Ignored;
                }
                if task.workspace_id != store.workspace_id() {
                    return Inbound::Ignored;
                }
                store.upsert_task(task, false, now);
                Inbound::TaskApplied
            }
            BroadcastPayload::TaskDeleted { id } => {
                if is_temp_id(&id) {
                    warn!(id = %id, "dropping delete broadcast with temp-prefixed id");
                    return Inbound::Ignored;
                }
                store.remove_task(&id, now);
                Inbound::TaskApplied
            }
            BroadcastPayload::ViewChanged { view: incoming } => {
                if self.action_locked(now) {
                    // The user just clicked; a slower tab must not clobber it
                    return Inbound::Ignored;
                }
                *view = incoming;
                Inbound::ViewApplied
            }
            BroadcastPayload::CacheInvalidated => Inbound::CacheInvalidated,
            BroadcastPayload::TabConnected | BroadcastPayload::SyncRequest => {
                if self.is_leader {
                    let reply = self.envelope(BroadcastPayload::SyncResponse {
                        tasks: store.snapshot(),
                    });
                    Inbound::Reply(Box::new(reply))
                } else {
                    Inbound::Ignored
                }
            }
            BroadcastPayload::SyncResponse { tasks } => {
                // Someone else is authoritative
                self.is_leader = false;
                store.hydrate(tasks, HydrateSource::Cache, now);
                Inbound::SnapshotApplied
            }
        }
    }

    /// Record a message key; returns false for duplicates. The set is
    /// bounded, evicting oldest entries past capacity.
    fn remember(&mut self, message: &BroadcastMessage) -> bool {
        let fresh = self.seen.insert((message.origin.clone(), message.seq));
        if fresh && self.seen.len() > self.dedup_capacity {
            self.seen.shift_remove_index(0);
        }
        fresh
    }
}
