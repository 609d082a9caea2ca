use chrono::{DateTime, Duration, Utc};

/// Lifecycle phase governing when counter updates may reach the UI.
///
/// ```text
/// AwaitingServerData → Hydrated → Settling → Live
/// ```
///
/// The page renders its initial server-side counters; until real data
/// arrives the store stays silent so the badges never flash through zero.
/// After hydration a short settle window lets concurrent hydration paths
/// (server sync, cache load, cross-tab replies) converge before the first
/// store-driven push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlePhase {
    /// Initial: no authoritative data yet, UI counters frozen
    AwaitingServerData,
    /// Data arrived (server hydrate, or timeout with cached data)
    Hydrated,
    /// Quiet window: mutations accepted, pushes and broadcasts held
    Settling,
    /// Normal operation
    Live,
}

impl std::fmt::Display for SettlePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettlePhase::AwaitingServerData => write!(f, "awaiting_server_data"),
            SettlePhase::Hydrated => write!(f, "hydrated"),
            SettlePhase::Settling => write!(f, "settling"),
            SettlePhase::Live => write!(f, "live"),
        }
    }
}

/// Deadline-driven settling machine plus the orthogonal view-transition
/// flag. All timers are explicit deadlines checked in [`tick`](Self::tick);
/// nothing runs in the background.
#[derive(Debug, Clone)]
pub struct SettleMachine {
    phase: SettlePhase,
    /// When to give up waiting for the server and settle on cached data
    hydrate_deadline: DateTime<Utc>,
    /// End of the quiet window; set on entering Hydrated
    settle_until: Option<DateTime<Utc>>,
    settle_window: Duration,
    /// Any records seen from any source (cache counts, temp does not)
    has_data: bool,
    /// Raised around UI batch rewrites; suppresses pushes only
    view_transition: bool,
}

impl SettleMachine {
    pub fn new(hydrate_timeout: Duration, settle_window: Duration, start: DateTime<Utc>) -> Self {
        SettleMachine {
            phase: SettlePhase::AwaitingServerData,
            hydrate_deadline: start + hydrate_timeout,
            settle_until: None,
            settle_window,
            has_data: false,
            view_transition: false,
        }
    }

    pub fn phase(&self) -> SettlePhase {
        self.phase
    }

    /// Record a completed hydrate. A server hydrate, even an empty one,
    /// is authoritative and starts the settle window; other sources only
    /// mark that some data exists for the timeout path.
    pub fn note_hydrated(&mut self, from_server: bool, record_count: usize, now: DateTime<Utc>) {
        if record_count > 0 {
            self.has_data = true;
        }
        if from_server && self.phase == SettlePhase::AwaitingServerData {
            self.enter_hydrated(now);
        }
    }

    fn enter_hydrated(&mut self, now: DateTime<Utc>) {
        self.phase = SettlePhase::Hydrated;
        self.settle_until = Some(now + self.settle_window);
    }

    /// Advance deadline-driven transitions. Returns true exactly when the
    /// machine just entered `Live` (the caller owes the UI one refresh).
    pub fn tick(&mut self, now: DateTime<Utc>) -> bool {
        match self.phase {
            SettlePhase::AwaitingServerData => {
                // Timeout with zero data keeps waiting; an empty dashboard
                // must come from the server, not from an absent cache.
                if now >= self.hydrate_deadline && self.has_data {
                    self.enter_hydrated(now);
                }
                false
            }
            SettlePhase::Hydrated | SettlePhase::Settling => {
                match self.settle_until {
                    Some(until) if now >= until => {
                        self.phase = SettlePhase::Live;
                        true
                    }
                    _ => {
                        self.phase = SettlePhase::Settling;
                        false
                    }
                }
            }
            SettlePhase::Live => false,
        }
    }

    /// Whether store mutations may push counters to subscribers right now.
    pub fn pushes_enabled(&self) -> bool {
        self.phase == SettlePhase::Live && !self.view_transition
    }

    /// Whether outbound cross-tab broadcasts are allowed.
    pub fn broadcasts_enabled(&self) -> bool {
        self.phase == SettlePhase::Live
    }

    /// Raise the view-transition flag for a UI batch rewrite.
    pub fn begin_view_transition(&mut self) {
        self.view_transition = true;
    }

    /// Release the flag. Returns true if the caller owes a forced refresh
    /// (pushes were otherwise enabled while the flag was up).
    pub fn end_view_transition(&mut self) -> bool {
        let was_up = self.view_transition;
        self.view_transition = false;
        was_up && self.phase == SettlePhase::Live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn machine() -> SettleMachine {
        SettleMachine::new(Duration::milliseconds(5000), Duration::milliseconds(1000), at(0))
    }

    #[test]
    fn starts_frozen() {
        let m = machine();
        assert_eq!(m.phase(), SettlePhase::AwaitingServerData);
        assert!(!m.pushes_enabled());
        assert!(!m.broadcasts_enabled());
    }

    #[test]
    fn server_hydrate_then_settle_then_live() {
        let mut m = machine();
        m.note_hydrated(true, 3, at(100));
        assert_eq!(m.phase(), SettlePhase::Hydrated);
        assert!(!m.pushes_enabled());

        assert!(!m.tick(at(500)));
        assert_eq!(m.phase(), SettlePhase::Settling);

        assert!(m.tick(at(1100)));
        assert_eq!(m.phase(), SettlePhase::Live);
        assert!(m.pushes_enabled());

        // Only the transition tick reports going live
        assert!(!m.tick(at(1200)));
    }

    #[test]
    fn empty_server_hydrate_is_authoritative() {
        let mut m = machine();
        m.note_hydrated(true, 0, at(100));
        assert_eq!(m.phase(), SettlePhase::Hydrated);
    }

    #[test]
    fn timeout_with_cache_data_settles() {
        let mut m = machine();
        m.note_hydrated(false, 2, at(100));
        assert_eq!(m.phase(), SettlePhase::AwaitingServerData);

        assert!(!m.tick(at(4000)));
        assert_eq!(m.phase(), SettlePhase::AwaitingServerData);

        assert!(!m.tick(at(5000)));
        assert_eq!(m.phase(), SettlePhase::Hydrated);
        assert!(m.tick(at(6100)));
        assert_eq!(m.phase(), SettlePhase::Live);
    }

    #[test]
    fn timeout_with_no_data_keeps_waiting() {
        let mut m = machine();
        assert!(!m.tick(at(60_000)));
        assert_eq!(m.phase(), SettlePhase::AwaitingServerData);

        // Data arriving later still unlocks via the server path
        m.note_hydrated(true, 1, at(61_000));
        assert!(m.tick(at(62_100)));
        assert_eq!(m.phase(), SettlePhase::Live);
    }

    #[test]
    fn view_transition_suppresses_pushes_but_not_broadcasts() {
        let mut m = machine();
        m.note_hydrated(true, 1, at(0));
        m.tick(at(1000));
        assert!(m.pushes_enabled());

        m.begin_view_transition();
        assert!(!m.pushes_enabled());
        assert!(m.broadcasts_enabled());

        assert!(m.end_view_transition());
        assert!(m.pushes_enabled());
    }

    #[test]
    fn view_transition_release_before_live_owes_nothing() {
        let mut m = machine();
        m.begin_view_transition();
        assert!(!m.end_view_transition());
    }
}
