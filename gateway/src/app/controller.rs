//! Per-domain wake state machine.
//!
//! Every configured domain owns one [`DomainState`] behind an async mutex and
//! one driver task that re-evaluates it on a fixed tick or when nudged by a
//! request. Transitions that need no probe (starting a wake, cancelling an idle
//! grace period) also run directly on the request path; probe-driven
//! transitions only run in the driver, with the probe itself executed outside
//! the lock and its result discarded if the state moved on meanwhile.

use alloc::sync::{Arc, Weak};
use core::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::{
    sync::{Mutex, Notify},
    time::{Instant, Interval, MissedTickBehavior, interval_at},
};
use tracing::{Instrument as _, debug, info, info_span};

use super::{
    activity::ActivityTracker,
    clock::{Clock, Now},
    events::{Event, EventSink},
    policy::{Decision, DesiredState, Reason, desired_state},
    probe::{AvailabilityProbe, ProbeResult},
};
use crate::{
    config::{ConfigSnapshot, ConfigStore, DomainConfig, EngineSettings, PolicyKind, UnknownDomain},
    signals::Signals,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    /// Desired asleep and host not known to be up.
    Offline,
    /// Wake signal sent, waiting for the host to become reachable.
    Waking,
    /// Host reachable, service not yet healthy.
    Booting,
    Running,
    /// Desired asleep while running; grace period before the idle signal.
    IdlePending,
    /// Wake or boot exceeded its budget; cools down back to offline.
    Error,
}

impl MachineState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Waking => "waking",
            Self::Booting => "booting",
            Self::Running => "running",
            Self::IdlePending => "idle_pending",
            Self::Error => "error",
        }
    }

    /// A wake sequence is in progress.
    #[must_use]
    pub const fn in_flight(self) -> bool {
        matches!(self, Self::Waking | Self::Booting)
    }

    /// The driver checks reachability on every tick in these states.
    const fn watched(self) -> bool {
        !matches!(self, Self::Offline | Self::Error)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the wake command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeOutcome {
    Accepted,
    AlreadyInFlight,
    AlreadyAwake,
    CoolingDown,
    WakeDisabled,
}

/// Result of the operator reset command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetOutcome {
    Reset,
    NotInError,
}

/// What callers see of a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainStatus {
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub policy: PolicyKind,
    pub state: MachineState,
    /// Wall-clock time of the last transition.
    pub since: DateTime<Utc>,
    pub last_error: Option<String>,
    pub desired: DesiredState,
    pub reason: Reason,
    pub attempts: u32,
    pub last_probe: Option<ProbeResult>,
    pub last_activity: Option<DateTime<Utc>>,
    pub wake_enabled: bool,
    /// Only present while running and the host answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    pub poll_interval_seconds: u64,
}

/// Mutable state of one domain. Only the controller touches it.
#[derive(Debug)]
struct DomainState {
    config: Arc<DomainConfig>,
    state: MachineState,
    since: Now,
    /// Wake signals sent in the current sequence.
    attempts: u32,
    /// Opening of the current attempt window.
    attempt_started: Option<Instant>,
    /// Due time of the next wake signal after an expired window.
    retry_at: Option<Instant>,
    last_error: Option<String>,
    last_probe: Option<(ProbeResult, Now)>,
    /// Bumped on every transition and config change.
    generation: u64,
    /// The driver exited; this state must not be used anymore.
    closed: bool,
}

impl DomainState {
    fn new(config: Arc<DomainConfig>, now: Now) -> Self {
        Self {
            config,
            state: MachineState::Offline,
            since: now,
            attempts: 0,
            attempt_started: None,
            retry_at: None,
            last_error: None,
            last_probe: None,
            generation: 0,
            closed: false,
        }
    }

    fn transition(&mut self, to: MachineState, now: Now, reason: impl Into<String>) -> Event {
        let from = self.state;
        self.state = to;
        self.since = now;
        self.generation = self.generation.wrapping_add(1);
        if to != MachineState::Waking {
            self.attempt_started = None;
            self.retry_at = None;
        }
        Event::Transition {
            domain: self.config.id.clone(),
            from,
            to,
            reason: reason.into(),
        }
    }

    fn in_state_for(&self, now: Now) -> Duration {
        now.mono.saturating_duration_since(self.since.mono)
    }
}

#[derive(Debug)]
struct DomainHandle {
    id: String,
    state: Mutex<DomainState>,
    nudge: Notify,
    /// Removed from the config; new requests are rejected.
    retired: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Exit,
}

/// Owns the state machines of all domains.
#[derive(Debug)]
pub struct WakeController {
    store: Arc<ConfigStore>,
    activity: Arc<ActivityTracker>,
    probe: Arc<AvailabilityProbe>,
    signals: Arc<dyn Signals>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    domains: DashMap<String, Arc<DomainHandle>>,
}

impl WakeController {
    #[must_use]
    pub fn new(
        store: Arc<ConfigStore>,
        activity: Arc<ActivityTracker>,
        probe: Arc<AvailabilityProbe>,
        signals: Arc<dyn Signals>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            activity,
            probe,
            signals,
            events,
            clock,
            domains: DashMap::new(),
        }
    }

    fn handle(&self, domain: &str) -> Result<Arc<DomainHandle>, UnknownDomain> {
        self.domains
            .get(domain)
            .map(|entry| entry.value().clone())
            .filter(|handle| !handle.retired.load(Ordering::Acquire))
            .ok_or_else(|| UnknownDomain(domain.to_string()))
    }

    fn decide(&self, st: &DomainState, now: Now) -> Decision {
        desired_state(&st.config, now, self.activity.last_activity(&st.config.id))
    }

    /// Activity arrived after the last transition.
    fn active_since_transition(&self, st: &DomainState) -> bool {
        self.activity
            .last_activity(&st.config.id)
            .is_some_and(|at| at.mono > st.since.mono)
    }

    fn emit(&self, now: Now, event: Event) {
        self.events.record(now.wall, event);
    }

    /// Request-triggered evaluation.
    ///
    /// Only applies transitions that need no probe, then nudges the driver.
    pub async fn evaluate(&self, domain: &str) -> Result<(), UnknownDomain> {
        let handle = self.handle(domain)?;
        {
            let mut st = handle.state.lock().await;
            let now = self.clock.now();
            let decision = self.decide(&st, now);
            match st.state {
                MachineState::Offline if decision.is_awake() && st.config.wake_enabled => {
                    self.start_wake(&mut st, now, decision.reason.as_str()).await;
                }
                MachineState::IdlePending
                    if decision.is_awake() || self.active_since_transition(&st) =>
                {
                    let event = st.transition(MachineState::Running, now, "activity during idle grace");
                    self.emit(now, event);
                }
                _ => {}
            }
        }
        handle.nudge.notify_one();
        Ok(())
    }

    /// Operator wake: starts a wake sequence regardless of policy.
    #[tracing::instrument(skip(self))]
    pub async fn wake(&self, domain: &str) -> Result<WakeOutcome, UnknownDomain> {
        let handle = self.handle(domain)?;
        let outcome = {
            let mut st = handle.state.lock().await;
            let now = self.clock.now();
            if !st.config.wake_enabled {
                WakeOutcome::WakeDisabled
            } else {
                match st.state {
                    MachineState::Offline => {
                        self.start_wake(&mut st, now, "wake command").await;
                        WakeOutcome::Accepted
                    }
                    MachineState::Waking | MachineState::Booting => WakeOutcome::AlreadyInFlight,
                    MachineState::Running => WakeOutcome::AlreadyAwake,
                    MachineState::IdlePending => {
                        let event = st.transition(MachineState::Running, now, "wake command");
                        self.emit(now, event);
                        WakeOutcome::AlreadyAwake
                    }
                    MachineState::Error => WakeOutcome::CoolingDown,
                }
            }
        };
        handle.nudge.notify_one();
        Ok(outcome)
    }

    /// Operator reset: leaves the error state immediately.
    #[tracing::instrument(skip(self))]
    pub async fn reset(&self, domain: &str) -> Result<ResetOutcome, UnknownDomain> {
        let handle = self.handle(domain)?;
        let mut st = handle.state.lock().await;
        if st.state != MachineState::Error {
            return Ok(ResetOutcome::NotInError);
        }
        let now = self.clock.now();
        let event = st.transition(MachineState::Offline, now, "operator reset");
        self.emit(now, event);
        drop(st);
        handle.nudge.notify_one();
        Ok(ResetOutcome::Reset)
    }

    /// Current status of `domain`.
    pub async fn status(&self, domain: &str) -> Result<DomainStatus, UnknownDomain> {
        let handle = self.handle(domain)?;
        let poll_interval_seconds = self.store.snapshot().engine.poll_interval_seconds;
        let st = handle.state.lock().await;
        let now = self.clock.now();
        let last_activity = self.activity.last_activity(domain);
        let decision = desired_state(&st.config, now, last_activity);
        Ok(DomainStatus {
            domain: st.config.id.clone(),
            description: st.config.description.clone(),
            policy: st.config.policy.kind(),
            state: st.state,
            since: st.since.wall,
            last_error: st.last_error.clone(),
            desired: decision.desired,
            reason: decision.reason,
            attempts: st.attempts,
            last_probe: st.last_probe.map(|(result, _)| result),
            last_activity: last_activity.map(|at| at.wall),
            wake_enabled: st.config.wake_enabled,
            redirect_url: (st.state == MachineState::Running
                && st.last_probe.is_none_or(|(result, _)| result.host_up()))
            .then(|| st.config.redirect_url.to_string()),
            poll_interval_seconds,
        })
    }

    /// Status of every live domain, ordered by id.
    pub async fn statuses(&self) -> Vec<DomainStatus> {
        let mut ids: Vec<String> = self
            .domains
            .iter()
            .filter(|entry| !entry.value().retired.load(Ordering::Acquire))
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(status) = self.status(&id).await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Aligns the set of domain states with `snapshot`.
    ///
    /// New domains get a state and a driver. Changed definitions take effect
    /// on the next evaluation. Removed domains are retired once no wake is in
    /// flight. Calling this twice with the same snapshot changes nothing.
    pub async fn reconcile(self: &Arc<Self>, snapshot: &ConfigSnapshot) {
        let now = self.clock.now();
        for (id, config) in &snapshot.domains {
            let existing = self.domains.get(id).map(|entry| entry.value().clone());
            let Some(handle) = existing else {
                self.spawn_domain(config.clone(), now);
                continue;
            };
            let mut st = handle.state.lock().await;
            if st.closed {
                drop(st);
                self.spawn_domain(config.clone(), now);
                continue;
            }
            if handle.retired.swap(false, Ordering::AcqRel) {
                info!(domain = %id, "Domain re-added before its retirement completed");
            }
            if st.config.as_ref() != config.as_ref() {
                info!(domain = %id, "Domain definition changed");
                st.config = config.clone();
                st.generation = st.generation.wrapping_add(1);
                self.probe.invalidate(id);
                drop(st);
                handle.nudge.notify_one();
            }
        }

        let removed: Vec<Arc<DomainHandle>> = self
            .domains
            .iter()
            .filter(|entry| !snapshot.domains.contains_key(entry.key()))
            .map(|entry| entry.value().clone())
            .collect();
        for handle in removed {
            let st = handle.state.lock().await;
            if !st.closed && !handle.retired.swap(true, Ordering::AcqRel) {
                info!(domain = %handle.id, state = %st.state, "Retiring domain");
            }
            drop(st);
            handle.nudge.notify_one();
        }
    }

    fn spawn_domain(self: &Arc<Self>, config: Arc<DomainConfig>, now: Now) {
        let id = config.id.clone();
        let handle = Arc::new(DomainHandle {
            id: id.clone(),
            state: Mutex::new(DomainState::new(config, now)),
            nudge: Notify::new(),
            retired: AtomicBool::new(false),
        });
        drop(self.domains.insert(id.clone(), handle.clone()));
        info!(domain = %id, "Managing domain");
        tokio::spawn(drive(Arc::downgrade(self), handle).instrument(info_span!("domain", id = %id)));
    }

    async fn start_wake(&self, st: &mut DomainState, now: Now, reason: &str) {
        st.attempts = 0;
        st.last_error = None;
        let event = st.transition(MachineState::Waking, now, reason);
        self.emit(now, event);
        self.send_wake(st, now).await;
    }

    /// Sends one wake signal and opens a new attempt window. A failed send still counts.
    async fn send_wake(&self, st: &mut DomainState, now: Now) {
        st.attempts = st.attempts.saturating_add(1);
        st.attempt_started = Some(now.mono);
        st.retry_at = None;
        let error = self.signals.wake(&st.config).await.err().map(|e| e.describe());
        if let Some(ref e) = error {
            st.last_error = Some(format!("wake signal failed: {e}"));
        }
        self.emit(
            now,
            Event::WakeSignal {
                domain: st.config.id.clone(),
                attempt: st.attempts,
                error,
            },
        );
    }

    async fn send_idle(&self, st: &mut DomainState, now: Now) {
        if st.config.shutdown.is_none() {
            debug!(domain = %st.config.id, "No shutdown target configured, skipping idle signal");
            return;
        }
        let error = self.signals.idle(&st.config).await.err().map(|e| e.describe());
        if let Some(ref e) = error {
            st.last_error = Some(format!("idle signal failed: {e}"));
        }
        self.emit(
            now,
            Event::IdleSignal {
                domain: st.config.id.clone(),
                error,
            },
        );
    }

    /// Timer and policy driven transitions.
    async fn advance(&self, st: &mut DomainState, now: Now, engine: &EngineSettings) {
        let decision = self.decide(st, now);
        match st.state {
            MachineState::Offline => {
                if decision.is_awake() && st.config.wake_enabled {
                    self.start_wake(st, now, decision.reason.as_str()).await;
                }
            }
            MachineState::Waking => {
                if st.retry_at.is_some_and(|at| now.mono >= at) {
                    self.send_wake(st, now).await;
                }
            }
            MachineState::Booting => {
                let limit = st.config.boot_timeout.unwrap_or_else(|| engine.boot_timeout());
                if st.in_state_for(now) >= limit {
                    st.last_error = Some(format!(
                        "service not healthy within {}s of the host becoming reachable",
                        limit.as_secs()
                    ));
                    let event = st.transition(MachineState::Error, now, "boot timeout");
                    self.emit(now, event);
                }
            }
            MachineState::Running => {
                if !decision.is_awake() {
                    let event = st.transition(MachineState::IdlePending, now, decision.reason.as_str());
                    self.emit(now, event);
                }
            }
            MachineState::IdlePending => {
                if decision.is_awake() {
                    let event = st.transition(MachineState::Running, now, decision.reason.as_str());
                    self.emit(now, event);
                } else if self.active_since_transition(st) {
                    // a window-driven grace restarts on the next tick
                    let event = st.transition(MachineState::Running, now, "activity during idle grace");
                    self.emit(now, event);
                } else if st.in_state_for(now) >= engine.idle_grace() {
                    self.send_idle(st, now).await;
                    let event = st.transition(MachineState::Offline, now, "idle grace elapsed");
                    self.emit(now, event);
                }
            }
            MachineState::Error => {
                if st.in_state_for(now) >= engine.error_cooldown() {
                    let event = st.transition(MachineState::Offline, now, "cool-down elapsed");
                    self.emit(now, event);
                }
            }
        }
    }

    /// Probe driven transitions.
    fn apply_probe(&self, st: &mut DomainState, result: ProbeResult, now: Now, engine: &EngineSettings) {
        match (st.state, result) {
            (MachineState::Waking, ProbeResult::Reachable | ProbeResult::Degraded) => {
                let event = st.transition(MachineState::Booting, now, "host reachable");
                self.emit(now, event);
                if result == ProbeResult::Reachable {
                    let event = st.transition(MachineState::Running, now, "service healthy");
                    self.emit(now, event);
                }
            }
            (MachineState::Waking, ProbeResult::Unreachable) => {
                let window_closed = st.retry_at.is_none()
                    && st
                        .attempt_started
                        .is_some_and(|at| now.mono.saturating_duration_since(at) >= st.config.wake_timeout);
                if !window_closed {
                    return;
                }
                if st.attempts >= engine.wake_max_attempts {
                    st.last_error = Some(format!(
                        "host unreachable after {} wake attempts",
                        st.attempts
                    ));
                    let event = st.transition(MachineState::Error, now, "wake failure");
                    self.emit(now, event);
                } else {
                    debug!(domain = %st.config.id, attempt = st.attempts, "Wake attempt window expired, retrying");
                    st.retry_at = Some(now.mono + engine.wake_retry_delay());
                }
            }
            (MachineState::Booting, ProbeResult::Reachable) => {
                let event = st.transition(MachineState::Running, now, "service healthy");
                self.emit(now, event);
            }
            (MachineState::Running | MachineState::IdlePending, ProbeResult::Unreachable) => {
                st.last_error = Some("host stopped responding".to_string());
                let event = st.transition(MachineState::Offline, now, "host unreachable");
                self.emit(now, event);
            }
            _ => {}
        }
    }

    async fn step(&self, handle: &Arc<DomainHandle>) -> Step {
        let engine = self.store.snapshot().engine.clone();

        let pending_probe = {
            let mut st = handle.state.lock().await;
            if st.closed {
                return Step::Exit;
            }
            let now = self.clock.now();
            if handle.retired.load(Ordering::Acquire) && !st.state.in_flight() {
                st.closed = true;
                drop(
                    self.domains
                        .remove_if(&handle.id, |_, current| Arc::ptr_eq(current, handle)),
                );
                self.probe.invalidate(&handle.id);
                self.activity.forget(&handle.id);
                info!(domain = %handle.id, "Domain retired");
                return Step::Exit;
            }
            self.advance(&mut st, now, &engine).await;
            st.state
                .watched()
                .then(|| (st.config.clone(), st.generation))
        };

        let Some((config, generation)) = pending_probe else {
            return Step::Continue;
        };
        let result = self.probe.probe(&config, &engine).await;

        let mut st = handle.state.lock().await;
        let now = self.clock.now();
        st.last_probe = Some((result, now));
        if st.closed || st.generation != generation {
            debug!(domain = %handle.id, "Discarding stale probe result");
            return Step::Continue;
        }
        self.apply_probe(&mut st, result, now, &engine);
        Step::Continue
    }
}

fn new_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Driver task of one domain. Exits when the domain is retired or the controller is gone.
async fn drive(controller: Weak<WakeController>, handle: Arc<DomainHandle>) {
    let mut period = Duration::ZERO;
    let mut tick: Option<Interval> = None;
    loop {
        let Some(this) = controller.upgrade() else {
            break;
        };
        if this.step(&handle).await == Step::Exit {
            break;
        }
        let wanted = this.store.snapshot().engine.tick_interval();
        drop(this);

        if wanted != period {
            period = wanted;
            tick = None;
        }
        let ticker = tick.get_or_insert_with(|| new_ticker(period));
        tokio::select! {
            _ = ticker.tick() => {}
            () = handle.nudge.notified() => {}
        }
    }
    debug!("Driver stopped");
}
