use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::task::{TaskRecord, TaskStatus};

/// Derived task counts.
///
/// Always recomputed in full from the record set, never incremented in
/// place, so the `all == active + archived` invariant cannot drift.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub all: usize,
    pub active: usize,
    pub archived: usize,
    /// Per-status breakdown; statuses with zero tasks are present with 0.
    #[serde(default)]
    pub by_status: BTreeMap<TaskStatus, usize>,
}

impl Counters {
    /// Compute counters over the given records.
    ///
    /// Soft-deleted records are skipped. The caller is responsible for not
    /// passing temp records (the store keeps them in a separate map).
    pub fn compute<'a>(records: impl Iterator<Item = &'a TaskRecord>) -> Self {
        let mut counters = Counters::default();
        for status in TaskStatus::all() {
            counters.by_status.insert(status, 0);
        }
        for record in records {
            if record.is_deleted() {
                continue;
            }
            counters.all += 1;
            if record.is_archived() {
                counters.archived += 1;
            } else {
                counters.active += 1;
            }
            *counters.by_status.entry(record.status).or_insert(0) += 1;
        }
        counters
    }

    /// Count for one status.
    pub fn of(&self, status: TaskStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}
