use chrono::{DateTime, Duration, Utc};

/// Deadline-based coalescer.
///
/// Rapid successive pokes within the window collapse into a single firing
/// at the end of the window. Used for outbound cross-tab broadcasts (and
/// available to UI glue for counter-badge paints). Pokes during an armed
/// window do not extend the deadline, so a steady stream of changes still
/// fires once per window rather than never.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    deadline: Option<DateTime<Utc>>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Debouncer {
            window,
            deadline: None,
        }
    }

    /// Note that work is pending. Arms the deadline if idle.
    pub fn poke(&mut self, now: DateTime<Utc>) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.window);
        }
    }

    /// True while a firing is scheduled.
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Check the deadline; returns true (and disarms) when due.
    pub fn fire(&mut self, now: DateTime<Utc>) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Drop any scheduled firing.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }
}
