//! Time source of the engine.

use core::fmt;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// A point in time seen through both clocks.
///
/// `mono` drives every duration comparison; `wall` is used for schedule
/// windows and for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Now {
    pub wall: DateTime<Utc>,
    pub mono: Instant,
}

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Now;
}

/// The real clocks. `mono` follows tokio's (pausable) clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Now {
        Now {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }
}
