use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lifecycle of a tracked task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Pending,
    Running,
    Done,
    Errored,
}

impl TrackerState {
    /// Done and Errored accept no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, TrackerState::Done | TrackerState::Errored)
    }
}

/// Point-in-time copy of a tracker, used by renderers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerSnapshot {
    pub value: u8,
    pub state: TrackerState,
    pub message: String,
}

#[derive(Debug)]
struct Inner {
    value: u8,
    state: TrackerState,
    message: String,
}

/// Shared progress handle of one task.
///
/// The owning task is the only writer of value and message; the display only
/// reads snapshots. Writes after a terminal state are ignored.
#[derive(Debug, Clone)]
pub struct Tracker {
    inner: Arc<Mutex<Inner>>,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    pub fn new() -> Self {
        Tracker {
            inner: Arc::new(Mutex::new(Inner {
                value: 0,
                state: TrackerState::Pending,
                message: String::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pending -> Running. Returns false if the tracker was not pending.
    pub fn start(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != TrackerState::Pending {
            return false;
        }
        inner.state = TrackerState::Running;
        true
    }

    /// Store the latest progress value (capped at 100).
    ///
    /// The raw value is not forced to increase; the last write wins.
    pub fn set_value(&self, value: u8) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.value = value.min(100);
    }

    pub fn set_message(&self, message: impl Into<String>) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.message = message.into();
    }

    /// Terminal success at 100%
    pub fn mark_done(&self) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.value = 100;
        inner.state = TrackerState::Done;
    }

    /// Terminal failure; the value stays at its last known position
    pub fn mark_errored(&self, message: impl Into<String>) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = TrackerState::Errored;
        inner.message = message.into();
    }

    pub fn value(&self) -> u8 {
        self.lock().value
    }

    pub fn state(&self) -> TrackerState {
        self.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let inner = self.lock();
        TrackerSnapshot {
            value: inner.value,
            state: inner.state,
            message: inner.message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let tracker = Tracker::new();
        assert_eq!(tracker.state(), TrackerState::Pending);
        assert!(tracker.start());
        assert!(!tracker.start());
        tracker.set_value(42);
        assert_eq!(tracker.value(), 42);
        tracker.mark_done();
        assert_eq!(tracker.snapshot().state, TrackerState::Done);
        assert_eq!(tracker.value(), 100);
    }

    #[test]
    fn test_terminal_state_ignores_writes() {
        let tracker = Tracker::new();
        tracker.start();
        tracker.set_value(37);
        tracker.mark_errored("tool exited with 2");

        tracker.set_value(90);
        tracker.set_message("late");
        tracker.mark_done();

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.state, TrackerState::Errored);
        assert_eq!(snapshot.value, 37);
        assert_eq!(snapshot.message, "tool exited with 2");
    }

    #[test]
    fn test_values_are_capped_and_may_decrease() {
        let tracker = Tracker::new();
        tracker.start();
        tracker.set_value(250);
        assert_eq!(tracker.value(), 100);
        tracker.set_value(12);
        assert_eq!(tracker.value(), 12);
    }

    #[test]
    fn test_clones_share_state() {
        let tracker = Tracker::new();
        let reader = tracker.clone();
        tracker.start();
        tracker.set_value(5);
        assert_eq!(reader.value(), 5);
        assert_eq!(reader.state(), TrackerState::Running);
    }
}
