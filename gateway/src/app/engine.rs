//! The query and command surface consumed by the HTTP layer.

use alloc::sync::Arc;
use core::net::IpAddr;

use serde::Serialize;
use thiserror::Error as ThisError;
use tokio::sync::watch;
use tracing::{Instrument as _, debug, info, warn};

use super::{
    access::AccessGuard,
    activity::ActivityTracker,
    clock::Clock,
    controller::{DomainStatus, ResetOutcome, WakeController, WakeOutcome},
    events::{Event, EventLogError, EventSink, LogEntry},
    probe::AvailabilityProbe,
};
use crate::{
    config::{ConfigError, ConfigSnapshot, ConfigStore, ReloadOutcome, UnknownDomain},
    signals::Signals,
};

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum EngineError {
    #[error(transparent)]
    UnknownDomain(#[from] UnknownDomain),
    #[error("{caller} may not access '{domain}'")]
    AccessDenied { domain: String, caller: IpAddr },
}

/// Result of an activity signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityOutcome {
    Accepted,
    Denied,
}

/// Ties configuration, access control, activity and the wake controller together.
#[derive(Debug)]
pub struct Engine {
    store: Arc<ConfigStore>,
    activity: Arc<ActivityTracker>,
    controller: Arc<WakeController>,
    guard: AccessGuard,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    /// Latest config version the controller has reconciled with.
    applied: watch::Receiver<u64>,
}

impl Engine {
    /// Builds the engine, starts a driver per configured domain and follows config changes.
    ///
    /// Must be called within a tokio runtime.
    pub async fn start(
        store: Arc<ConfigStore>,
        activity: Arc<ActivityTracker>,
        probe: Arc<AvailabilityProbe>,
        signals: Arc<dyn Signals>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let controller = Arc::new(WakeController::new(
            store.clone(),
            activity.clone(),
            probe,
            signals,
            events.clone(),
            clock.clone(),
        ));
        let mut rx = store.subscribe();
        let initial = rx.borrow_and_update().clone();
        controller.reconcile(&initial).await;
        let (applied_tx, applied) = watch::channel(initial.version);

        let engine = Arc::new(Self {
            guard: AccessGuard::new(store.clone(), events.clone()),
            store,
            activity,
            controller,
            events,
            clock,
            applied,
        });

        // The only place snapshots reach the controller, so reconciliations never overlap.
        let controller = Arc::downgrade(&engine.controller);
        tokio::spawn(
            async move {
                while rx.changed().await.is_ok() {
                    let snapshot = rx.borrow_and_update().clone();
                    let Some(controller) = controller.upgrade() else {
                        break;
                    };
                    debug!(version = snapshot.version, "Applying config snapshot");
                    controller.reconcile(&snapshot).await;
                    applied_tx.send_modify(|applied| *applied = snapshot.version);
                }
            }
            .in_current_span(),
        );

        engine
    }

    #[must_use]
    pub const fn controller(&self) -> &Arc<WakeController> {
        &self.controller
    }

    /// The active configuration snapshot.
    #[must_use]
    pub fn config(&self) -> Arc<ConfigSnapshot> {
        self.store.snapshot()
    }

    fn guarded(&self, domain: &str, caller: IpAddr) -> Result<(), EngineError> {
        let config = self.store.get(domain)?;
        if self.guard.check(&config, caller, self.clock.now().wall) {
            Ok(())
        } else {
            Err(EngineError::AccessDenied {
                domain: domain.to_string(),
                caller,
            })
        }
    }

    fn record_activity(&self, domain: &str, caller: Option<IpAddr>) {
        let now = self.clock.now();
        if self.activity.record(domain, now) {
            self.events.record(
                now.wall,
                Event::Activity {
                    domain: domain.to_string(),
                    client_ip: caller,
                },
            );
        }
    }

    /// Read-only status query; records no activity.
    ///
    /// # Errors
    ///
    /// Fails for unknown domains and callers outside the allow-list.
    pub async fn status(&self, domain: &str, caller: IpAddr) -> Result<DomainStatus, EngineError> {
        self.guarded(domain, caller)?;
        Ok(self.controller.status(domain).await?)
    }

    /// Operator wake. Counts as activity.
    ///
    /// # Errors
    ///
    /// Fails for unknown domains and callers outside the allow-list.
    #[tracing::instrument(skip(self))]
    pub async fn wake(&self, domain: &str, caller: IpAddr) -> Result<WakeOutcome, EngineError> {
        self.guarded(domain, caller)?;
        self.record_activity(domain, Some(caller));
        let outcome = self.controller.wake(domain).await?;
        info!(?outcome, "Wake command");
        Ok(outcome)
    }

    /// Records activity of `caller` on `domain` and re-evaluates it.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownDomain`] if `domain` is not configured.
    pub async fn activity(&self, domain: &str, caller: IpAddr) -> Result<ActivityOutcome, UnknownDomain> {
        match self.guarded(domain, caller) {
            Ok(()) => {}
            Err(EngineError::AccessDenied { .. }) => return Ok(ActivityOutcome::Denied),
            Err(EngineError::UnknownDomain(e)) => return Err(e),
        }
        self.record_activity(domain, Some(caller));
        self.controller.evaluate(domain).await?;
        Ok(ActivityOutcome::Accepted)
    }

    /// Entry point of a browser visiting a domain: activity, then status.
    ///
    /// # Errors
    ///
    /// Fails for unknown domains and callers outside the allow-list.
    pub async fn entry(&self, domain: &str, caller: IpAddr) -> Result<DomainStatus, EngineError> {
        match self.activity(domain, caller).await? {
            ActivityOutcome::Accepted => Ok(self.controller.status(domain).await?),
            ActivityOutcome::Denied => Err(EngineError::AccessDenied {
                domain: domain.to_string(),
                caller,
            }),
        }
    }

    /// Operator reset of a domain in the error state.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownDomain`] if `domain` is not configured.
    pub async fn reset(&self, domain: &str) -> Result<ResetOutcome, UnknownDomain> {
        self.controller.reset(domain).await
    }

    /// Re-reads the config file and applies it.
    ///
    /// An applied snapshot has reached the controller by the time this returns.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] of an invalid file; the active snapshot is kept.
    #[tracing::instrument(skip(self))]
    pub async fn reload(&self) -> Result<ReloadOutcome, ConfigError> {
        let now = self.clock.now().wall;
        match self.store.reload().await {
            Ok(outcome) => {
                if let ReloadOutcome::Applied {
                    version,
                    ref added,
                    ref removed,
                    ref changed,
                } = outcome
                {
                    let mut applied = self.applied.clone();
                    let followed = applied.wait_for(|&current| current >= version).await.is_ok();
                    if !followed {
                        warn!(version, "Config follower stopped before applying the snapshot");
                    }
                    self.events.record(
                        now,
                        Event::ConfigReload {
                            status: "applied",
                            details: format!(
                                "version {version}: added {added:?}, removed {removed:?}, changed {changed:?}"
                            ),
                        },
                    );
                } else {
                    self.events.record(
                        now,
                        Event::ConfigReload {
                            status: "unchanged",
                            details: "configuration unchanged".to_string(),
                        },
                    );
                }
                Ok(outcome)
            }
            Err(e) => {
                self.events.record(
                    now,
                    Event::ConfigReload {
                        status: "rejected",
                        details: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    /// Status of every configured domain.
    pub async fn statuses(&self) -> Vec<DomainStatus> {
        self.controller.statuses().await
    }

    /// The most recent log entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistence backend cannot be read.
    pub async fn recent_events(&self, limit: usize) -> Result<Vec<LogEntry>, EventLogError> {
        self.events.recent(limit).await
    }

    /// Whether `caller` may use the admin endpoints.
    #[must_use]
    pub fn admin_allowed(&self, caller: IpAddr) -> bool {
        let allowed = self.store.snapshot().server.admin_allowlist.permits(caller);
        if !allowed {
            warn!(%caller, "Admin access denied");
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use core::{sync::atomic::Ordering::SeqCst, time::Duration};
    use std::fs;

    use tokio::time::sleep;

    use super::*;
    use crate::app::{controller::MachineState, testing::{Harness, domain_toml}};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn guarded_nas() -> String {
        domain_toml(
            "nas",
            r#"
            policy = "on_demand"
            allowlist = ["10.0.0.0/8"]
            "#,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn denied_activity_does_not_wake() {
        let h = Harness::start(&guarded_nas(), "").await;
        assert_eq!(
            h.engine.activity("nas", ip("192.168.1.2")).await,
            Ok(ActivityOutcome::Denied)
        );
        sleep(Duration::from_secs(3)).await;
        assert_eq!(h.signals.wakes.load(SeqCst), 0);
        assert!(h.engine.controller().status("nas").await.unwrap().last_activity.is_none());

        let denied = h.events_with_action("access");
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].client_ip.as_deref(), Some("192.168.1.2"));
    }

    #[tokio::test(start_paused = true)]
    async fn guarded_queries() {
        let h = Harness::start(&guarded_nas(), "").await;
        assert_eq!(
            h.engine.status("nas", ip("192.168.1.2")).await,
            Err(EngineError::AccessDenied {
                domain: "nas".to_string(),
                caller: ip("192.168.1.2")
            })
        );
        assert!(matches!(
            h.engine.wake("nas", ip("192.168.1.2")).await,
            Err(EngineError::AccessDenied { .. })
        ));
        assert_eq!(
            h.engine.status("ghost", ip("10.0.0.1")).await,
            Err(EngineError::UnknownDomain(UnknownDomain("ghost".to_string())))
        );
        assert_eq!(
            h.engine.activity("ghost", ip("10.0.0.1")).await,
            Err(UnknownDomain("ghost".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn status_query_is_read_only() {
        let h = Harness::start(&guarded_nas(), "").await;
        let status = h.engine.status("nas", ip("10.0.0.1")).await.unwrap();
        assert_eq!(status.state, MachineState::Offline);
        assert!(status.last_activity.is_none());
        assert!(status.redirect_url.is_none());
        sleep(Duration::from_secs(3)).await;
        assert_eq!(h.signals.wakes.load(SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_wakes_and_reports() {
        let h = Harness::start(&guarded_nas(), "").await;
        let status = h.engine.entry("nas", ip("10.0.0.1")).await.unwrap();
        assert_eq!(status.state, MachineState::Waking);
        assert_eq!(status.poll_interval_seconds, 3);

        sleep(Duration::from_secs(2)).await;
        let status = h.engine.entry("nas", ip("10.0.0.1")).await.unwrap();
        assert_eq!(status.state, MachineState::Running);
        assert_eq!(status.redirect_url.as_deref(), Some("https://nas.example.org/"));
    }

    #[tokio::test(start_paused = true)]
    async fn wake_command_keeps_on_demand_domain_awake() {
        let h = Harness::start(&guarded_nas(), "").await;
        assert_eq!(
            h.engine.wake("nas", ip("10.0.0.1")).await,
            Ok(WakeOutcome::Accepted)
        );
        sleep(Duration::from_secs(10)).await;
        assert_eq!(
            h.engine.controller().status("nas").await.unwrap().state,
            MachineState::Running
        );
    }

    #[tokio::test(start_paused = true)]
    async fn admin_allowlist() {
        let h = Harness::start(
            &guarded_nas(),
            "[server]\nadmin_allowlist = [\"127.0.0.1\"]",
        )
        .await;
        assert!(h.engine.admin_allowed(ip("127.0.0.1")));
        assert!(!h.engine.admin_allowed(ip("10.0.0.1")));
    }

    #[tokio::test(start_paused = true)]
    async fn reload_without_file_is_unchanged() {
        let h = Harness::start(&guarded_nas(), "").await;
        assert!(matches!(
            h.engine.reload().await,
            Ok(ReloadOutcome::Unchanged { version: 0 })
        ));
        let reloads = h.events_with_action("reload");
        assert_eq!(reloads.len(), 1);
        assert_eq!(reloads[0].status, "unchanged");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_file_reloads_start_one_driver() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hall.toml");
        fs::write(&path, guarded_nas()).unwrap();
        let h = Harness::open(&path).await;

        let added = format!("{}{}", guarded_nas(), domain_toml("media", r#"policy = "always_on""#));
        fs::write(&path, added).unwrap();
        let (first, second) = tokio::join!(h.engine.reload(), h.engine.reload());
        let outcomes = [first.unwrap(), second.unwrap()];
        assert_eq!(
            outcomes
                .iter()
                .filter(|outcome| matches!(outcome, ReloadOutcome::Applied { .. }))
                .count(),
            1
        );
        // visible to the controller as soon as the applying reload returns
        assert!(h.engine.controller().status("media").await.is_ok());

        sleep(Duration::from_secs(2)).await;
        assert_eq!(
            h.engine.controller().status("media").await.unwrap().state,
            MachineState::Running
        );
        assert_eq!(h.signals.wakes.load(SeqCst), 1);
        assert_eq!(h.transitions("media").len(), 3);
        assert_eq!(h.events_with_action("reload").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn installed_snapshot_reaches_controller() {
        let h = Harness::start(&guarded_nas(), "").await;
        let added = format!("{}{}", guarded_nas(), domain_toml("media", r#"policy = "always_on""#));
        assert!(matches!(
            h.store.install(crate::config::from_toml_str(&added).unwrap()).await,
            ReloadOutcome::Applied { .. }
        ));
        sleep(Duration::from_secs(2)).await;
        assert_eq!(
            h.engine.controller().status("media").await.unwrap().state,
            MachineState::Running
        );
        assert_eq!(h.engine.statuses().await.len(), 2);
    }
}
