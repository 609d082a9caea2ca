//! Client-side task state reconciliation.
//!
//! One [`SyncEngine`] per browser tab keeps a local task cache consistent
//! across optimistic local mutations, asynchronous server confirmations,
//! real-time push events, other tabs of the same user, and page reloads
//! that rehydrate from a persisted store.
//!
//! The crate performs no network IO: mutations return [`ApiRequest`]s and
//! broadcast messages as data for the embedding glue to execute, and
//! completions are fed back in. All timers are explicit deadlines advanced
//! through [`SyncEngine::tick`], which keeps every interleaving
//! deterministic and testable.

pub mod engine;
pub mod io;
pub mod model;
pub mod store;
pub mod sync;

pub use engine::{ReplayOutcome, SyncEngine, TickOutput};
pub use io::record_store::{JsonFileStore, MemoryStore, RecordStore, RecordStoreError};
pub use model::config::SyncConfig;
pub use model::counters::Counters;
pub use model::event::{PushEvent, PushPayload, ReplayRequest, ReplayResponse};
pub use model::task::{Priority, TaskPatch, TaskRecord, TaskStatus, TEMP_ID_PREFIX, is_temp_id};
pub use model::view::{FilterTab, SortKey, ViewState};
pub use store::settle::SettlePhase;
pub use store::task_store::{
    HydrateSource, StoreAction, StoreNotification, SubscriberId, TaskStore,
};
pub use sync::api::{ApiFailure, ApiMethod, ApiRequest, ApiResponse, ApiResult, FailureKind};
pub use sync::broadcast::{BroadcastMessage, BroadcastPayload, Coordinator, Inbound};
pub use sync::ingest::{IngestOutcome, PushIngestor};
pub use sync::offline::{QueuedOp, RetryQueue};
pub use sync::optimistic::{
    CreateOutcome, MutationError, OpId, OptimisticLayer, Resolution, TaskDraft,
};
