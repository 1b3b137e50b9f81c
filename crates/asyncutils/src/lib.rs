//! Small coordination primitives shared by the record store and the caches.
//!
//! - [`Deduplicator`]: at most one in-flight operation per key; everyone
//!   asking for the same key while it runs gets a clone of its result.
//! - [`SingleFlight`]: an `Idle → Running → RunningWithRerun` state machine
//!   for work that must never overlap with itself but must also never lose a
//!   request that arrived while it was busy.
//! - [`Debouncer`]: runs an action once a quiet period has elapsed since the
//!   most recent trigger.

mod debounce;
mod dedupe;
mod flight;

pub use crate::debounce::Debouncer;
pub use crate::dedupe::{Aborted, Deduplicator};
pub use crate::flight::{FlightGuard, FlightState, SingleFlight};
