//! Desired power state of a domain.
//!
//! [`desired_state`] is a pure function of the domain's configuration, the
//! current time and the last recorded activity, so it can run on every request
//! without coordination.

use serde::Serialize;

use super::clock::Now;
use crate::config::{DomainConfig, Policy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Awake,
    Asleep,
}

/// Why a [`Decision`] was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    AlwaysOn,
    WithinSchedule,
    OutsideSchedule,
    RecentActivity,
    IdleTimeout,
    NoActivity,
}

impl Reason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AlwaysOn => "always_on",
            Self::WithinSchedule => "within_schedule",
            Self::OutsideSchedule => "outside_schedule",
            Self::RecentActivity => "recent_activity",
            Self::IdleTimeout => "idle_timeout",
            Self::NoActivity => "no_activity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub desired: DesiredState,
    pub reason: Reason,
}

impl Decision {
    const fn new(desired: DesiredState, reason: Reason) -> Self {
        Self { desired, reason }
    }

    #[must_use]
    pub fn is_awake(self) -> bool {
        self.desired == DesiredState::Awake
    }
}

/// Evaluates the domain's policy at `now`.
///
/// Scheduled domains are evaluated in their configured timezone. On-demand
/// domains stay awake while the last activity is younger than their idle
/// shutdown duration; activity stamped after `now` counts as current.
#[must_use]
pub fn desired_state(config: &DomainConfig, now: Now, last_activity: Option<Now>) -> Decision {
    use DesiredState as D;
    use Reason as R;

    match config.policy {
        Policy::AlwaysOn => Decision::new(D::Awake, R::AlwaysOn),
        Policy::Scheduled(ref schedule) => {
            let local = now.wall.with_timezone(&schedule.timezone).naive_local();
            if schedule.contains_local(local) {
                Decision::new(D::Awake, R::WithinSchedule)
            } else {
                Decision::new(D::Asleep, R::OutsideSchedule)
            }
        }
        Policy::OnDemand => match last_activity {
            None => Decision::new(D::Asleep, R::NoActivity),
            Some(last) if now.mono.saturating_duration_since(last.mono) < config.idle_shutdown => {
                Decision::new(D::Awake, R::RecentActivity)
            }
            Some(_) => Decision::new(D::Asleep, R::IdleTimeout),
        },
    }
}
