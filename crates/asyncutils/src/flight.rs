//! Single-flight state machine.
//!
//! ```text
//!            begin()                begin()
//!   Idle ───────────────► Running ───────────► RunningWithRerun
//!    ▲                     │   ▲                      │
//!    │   finish() == false │   │  finish() == true    │
//!    └─────────────────────┘   └──────────────────────┘
//! ```
//!
//! Dropping a [`FlightGuard`] without finishing (cancelled future, panic)
//! always returns the machine to [`FlightState::Idle`].

use tokio::sync::watch;

/// Observable state of a [`SingleFlight`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlightState {
    /// Nothing is running.
    Idle,
    /// One run is in progress and nobody asked for another.
    Running,
    /// One run is in progress and at least one request arrived meanwhile.
    RunningWithRerun,
}

/// Re-entrancy guard for an operation that must never run twice at once.
///
/// # Examples
///
/// ```
/// use kura_asyncutils::{FlightState, SingleFlight};
///
/// let flight = SingleFlight::new();
/// let mut guard = flight.begin().expect("idle");
/// // A second request while running is recorded, not started.
/// assert!(flight.begin().is_none());
/// assert_eq!(flight.state(), FlightState::RunningWithRerun);
/// // The runner consumes the rerun, then releases.
/// assert!(guard.finish());
/// assert!(!guard.finish());
/// assert_eq!(flight.state(), FlightState::Idle);
/// ```
#[derive(Debug)]
pub struct SingleFlight {
    state: watch::Sender<FlightState>,
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self { state: watch::Sender::new(FlightState::Idle) }
    }

    /// Try to start a run.
    ///
    /// Returns a guard when the machine was idle. Otherwise the request is
    /// folded into a pending rerun and `None` is returned: the current runner
    /// is now responsible for going round again.
    pub fn begin(&self) -> Option<FlightGuard<'_>> {
        let mut began = false;
        self.state.send_modify(|state| match state {
            FlightState::Idle => {
                *state = FlightState::Running;
                began = true;
            },
            FlightState::Running => *state = FlightState::RunningWithRerun,
            FlightState::RunningWithRerun => {},
        });
        if began { Some(FlightGuard { flight: self, released: false }) } else { None }
    }

    pub fn state(&self) -> FlightState {
        *self.state.borrow()
    }

    /// Wait until no run is in progress and none is pending.
    pub async fn wait_idle(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close underneath us.
        _ = rx.wait_for(|state| *state == FlightState::Idle).await;
    }
}

/// Proof that the caller owns the current run of a [`SingleFlight`].
#[derive(Debug)]
pub struct FlightGuard<'a> {
    flight: &'a SingleFlight,
    released: bool,
}

impl FlightGuard<'_> {
    /// Finish one round of work.
    ///
    /// Returns `true` if a rerun was requested while this round ran; the
    /// caller must then do the work again and call `finish()` once more.
    /// Returns `false` once the machine is back to idle. Checking for a rerun
    /// and releasing happen in one step, so a request can't slip between them.
    pub fn finish(&mut self) -> bool {
        if self.released {
            return false;
        }
        let mut rerun = false;
        self.flight.state.send_modify(|state| match state {
            FlightState::RunningWithRerun => {
                *state = FlightState::Running;
                rerun = true;
            },
            _ => *state = FlightState::Idle,
        });
        self.released = !rerun;
        rerun
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.flight.state.send_replace(FlightState::Idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_begin_from_idle() {
        let flight = SingleFlight::new();
        let mut guard = flight.begin().unwrap();
        assert_eq!(flight.state(), FlightState::Running);
        assert!(!guard.finish());
        assert_eq!(flight.state(), FlightState::Idle);
    }

    #[test]
    fn test_repeated_requests_collapse_into_one_rerun() {
        let flight = SingleFlight::new();
        let mut guard = flight.begin().unwrap();
        assert!(flight.begin().is_none());
        assert!(flight.begin().is_none());
        assert!(flight.begin().is_none());
        assert!(guard.finish());
        assert_eq!(flight.state(), FlightState::Running);
        assert!(!guard.finish());
        assert_eq!(flight.state(), FlightState::Idle);
    }

    #[test]
    fn test_rejected_begin_keeps_runner_in_charge() {
        let flight = SingleFlight::new();
        let mut guard = flight.begin().unwrap();
        assert!(flight.begin().is_none());
        assert_eq!(flight.state(), FlightState::RunningWithRerun);
        assert!(flight.begin().is_none(), "still running");
        assert_eq!(flight.state(), FlightState::RunningWithRerun);
        assert!(guard.finish());
        assert!(flight.begin().is_none(), "the rerun is still in progress");
        assert!(guard.finish());
        assert!(!guard.finish());
        assert!(flight.begin().is_some());
    }

    #[test]
    fn test_dropped_guard_releases() {
        let flight = SingleFlight::new();
        {
            let _guard = flight.begin().unwrap();
            assert!(flight.begin().is_none());
        }
        assert_eq!(flight.state(), FlightState::Idle);
        assert!(flight.begin().is_some());
    }

    #[test]
    fn test_finish_after_release_is_noop() {
        let flight = SingleFlight::new();
        let mut guard = flight.begin().unwrap();
        assert!(!guard.finish());
        // Somebody else starts a fresh run; the stale guard must not touch it.
        let _other = flight.begin().unwrap();
        assert!(!guard.finish());
        drop(guard);
        assert_eq!(flight.state(), FlightState::Running);
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let flight = Arc::new(SingleFlight::new());
        assert!(tokio::time::timeout(Duration::from_millis(10), flight.wait_idle()).await.is_ok());

        let runner = Arc::clone(&flight);
        let mut guard = flight.begin().unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(20), runner.wait_idle()).await.is_err());
        assert!(!guard.finish());
        assert!(tokio::time::timeout(Duration::from_millis(20), runner.wait_idle()).await.is_ok());
    }
}
