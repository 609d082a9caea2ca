use serde::{Deserialize, Serialize};

/// Tunable windows and limits for the reconciliation engine.
///
/// All durations are milliseconds. Defaults match the production values;
/// tests shrink them freely since every timer is deadline-driven.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How long to wait for a server hydrate before falling back to
    /// whatever data exists (cache); with zero data the store stays frozen.
    #[serde(default = "default_hydrate_timeout_ms")]
    pub hydrate_timeout_ms: u64,
    /// Quiet window after hydration during which concurrent hydration
    /// paths converge before any counter push reaches the UI.
    #[serde(default = "default_settle_window_ms")]
    pub settle_window_ms: u64,
    /// Coalescing window for outbound cross-tab broadcasts.
    #[serde(default = "default_broadcast_debounce_ms")]
    pub broadcast_debounce_ms: u64,
    /// How long a local filter/sort action shields the view state from
    /// stale broadcasts arriving from slower tabs.
    #[serde(default = "default_action_lock_ms")]
    pub action_lock_ms: u64,
    /// Base delay for offline-replay backoff; doubles per attempt.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Attempts before an operation is parked for manual retry.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    /// Capacity of the recently-seen broadcast dedup set.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

fn default_hydrate_timeout_ms() -> u64 {
    5000
}

fn default_settle_window_ms() -> u64 {
    1000
}

fn default_broadcast_debounce_ms() -> u64 {
    250
}

fn default_action_lock_ms() -> u64 {
    3000
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_dedup_capacity() -> usize {
    512
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            hydrate_timeout_ms: default_hydrate_timeout_ms(),
            settle_window_ms: default_settle_window_ms(),
            broadcast_debounce_ms: default_broadcast_debounce_ms(),
            action_lock_ms: default_action_lock_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: SyncConfig = serde_json::from_str(r#"{"settle_window_ms": 50}"#).unwrap();
        assert_eq!(config.settle_window_ms, 50);
        assert_eq!(config.hydrate_timeout_ms, 5000);
        assert_eq!(config.retry_max_attempts, 5);
        assert_eq!(config.dedup_capacity, 512);
    }
}
