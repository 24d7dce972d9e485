//! Engine-level sync state machine.
//!
//! The engine is in exactly one [`EngineState`] at a time. Every change goes
//! through [`EngineState::on`], a total transition table; an event that is
//! not allowed in the current state returns `None` and leaves the state
//! untouched.
//!
//! `RetryActive` tracks whether the slow retry loop is armed. It is
//! orthogonal to whether a round is in flight, so a round started while
//! retrying lands in `RetrySyncing` and falls back to `RetryActive` when it
//! finishes.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No round in flight, retry loop disarmed.
    Idle,
    /// A round is in flight.
    Syncing,
    /// The retry loop is armed because the sweep found error/stale records.
    RetryActive,
    /// A round is in flight while the retry loop is armed.
    RetrySyncing,
    /// Shut down. Absorbing.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineEvent {
    RoundStarted,
    RoundFinished,
    /// Sweep found at least one error / stale pending record.
    RetryWorkFound,
    /// Sweep found nothing left to retry.
    RetryDrained,
    Shutdown,
}

impl EngineState {
    /// Transition table.
    pub fn on(self, event: EngineEvent) -> Option<EngineState> {
        use EngineEvent::*;
        use EngineState::*;

        match (self, event) {
            (Stopped, _) => None,
            (_, Shutdown) => Some(Stopped),

            (Idle, RoundStarted) => Some(Syncing),
            (Idle, RetryWorkFound) => Some(RetryActive),
            (Idle, RetryDrained) => Some(Idle),
            (Idle, RoundFinished) => None,

            (Syncing, RoundStarted) => None,
            (Syncing, RoundFinished) => Some(Idle),
            (Syncing, RetryWorkFound) => Some(RetrySyncing),
            (Syncing, RetryDrained) => Some(Syncing),

            (RetryActive, RoundStarted) => Some(RetrySyncing),
            (RetryActive, RoundFinished) => None,
            (RetryActive, RetryWorkFound) => Some(RetryActive),
            (RetryActive, RetryDrained) => Some(Idle),

            (RetrySyncing, RoundStarted) => None,
            (RetrySyncing, RoundFinished) => Some(RetryActive),
            (RetrySyncing, RetryWorkFound) => Some(RetrySyncing),
            (RetrySyncing, RetryDrained) => Some(Syncing),
        }
    }

    pub fn is_syncing(&self) -> bool {
        matches!(self, EngineState::Syncing | EngineState::RetrySyncing)
    }

    pub fn is_retry_active(&self) -> bool {
        matches!(self, EngineState::RetryActive | EngineState::RetrySyncing)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, EngineState::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::EngineEvent::*;
    use super::EngineState::*;
    use super::*;

    const ALL_STATES: [EngineState; 5] = [Idle, Syncing, RetryActive, RetrySyncing, Stopped];
    const ALL_EVENTS: [EngineEvent; 5] =
        [RoundStarted, RoundFinished, RetryWorkFound, RetryDrained, Shutdown];

    #[test]
    fn test_reentrant_round_is_rejected() {
        assert_eq!(Syncing.on(RoundStarted), None);
        assert_eq!(RetrySyncing.on(RoundStarted), None);
        assert_eq!(Idle.on(RoundStarted), Some(Syncing));
        assert_eq!(RetryActive.on(RoundStarted), Some(RetrySyncing));
    }

    #[test]
    fn test_retry_loop_arms_and_disarms() {
        let s = Idle.on(RetryWorkFound).unwrap();
        assert_eq!(s, RetryActive);
        let s = s.on(RoundStarted).unwrap();
        assert_eq!(s, RetrySyncing);
        // Sweep drains while the round is still in flight.
        let s = s.on(RetryDrained).unwrap();
        assert_eq!(s, Syncing);
        let s = s.on(RoundFinished).unwrap();
        assert_eq!(s, Idle);
    }

    #[test]
    fn test_round_finishing_keeps_retry_armed() {
        let s = Syncing.on(RetryWorkFound).unwrap();
        assert!(s.is_syncing() && s.is_retry_active());
        assert_eq!(s.on(RoundFinished), Some(RetryActive));
    }

    #[test]
    fn test_stopped_absorbs_everything() {
        for state in ALL_STATES {
            assert_eq!(state.on(Shutdown), if state == Stopped { None } else { Some(Stopped) });
        }
        for event in ALL_EVENTS {
            assert_eq!(Stopped.on(event), None);
        }
    }

    #[test]
    fn test_flags_agree_with_table() {
        // A state that accepts RoundFinished must be syncing; one that
        // accepts RoundStarted must not be.
        for state in ALL_STATES {
            if state.on(RoundFinished).is_some() {
                assert!(state.is_syncing(), "{state:?}");
            }
            if state.on(RoundStarted).is_some() {
                assert!(!state.is_syncing(), "{state:?}");
            }
        }
    }
}
