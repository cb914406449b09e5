//! The wake engine and the application state around it.
//!
//! [`Engine`] is the surface the HTTP layer talks to. Below it,
//! [`WakeController`] owns one state machine per domain and drives it with
//! [`AvailabilityProbe`] results, [`desired_state`] decisions and outbound
//! [`crate::signals::Signals`].

pub mod access;
pub mod activity;
pub mod clock;
pub mod controller;
pub mod db;
pub mod engine;
pub mod events;
pub mod policy;
pub mod probe;
mod runtime;
mod startup;
mod state;
#[cfg(test)]
pub(crate) mod testing;

pub use access::AccessGuard;
pub use activity::ActivityTracker;
pub use clock::{Clock, Now, SystemClock};
pub use controller::{DomainStatus, MachineState, ResetOutcome, WakeController, WakeOutcome};
pub use engine::{ActivityOutcome, Engine, EngineError};
pub use events::{Event, EventLogError, EventSink, LogEntry, TracingSink};
pub use policy::{Decision, DesiredState, Reason, desired_state};
pub use probe::{AvailabilityProbe, ProbeResult};
pub(crate) use startup::start;
pub(crate) use state::AppState;
