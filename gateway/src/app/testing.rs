//! Fakes and a harness for engine tests.

use alloc::sync::Arc;
use core::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
    time::Duration,
};
use std::{io, path::Path, sync::Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::{self, BoxFuture};
use tokio::time::Instant;

use super::{
    activity::ActivityTracker,
    clock::{Clock, Now},
    controller::MachineState,
    engine::Engine,
    events::{Event, EventLogError, EventSink, LogEntry},
    probe::{AvailabilityProbe, HealthClient, Reachability},
};
use crate::{
    config::{ConfigStore, DomainConfig, HealthCheck, from_toml_str},
    signals::{SignalError, Signals},
};

/// A `[[domains]]` table. `extra` must set the policy and goes last, so it may open sub-tables.
pub(crate) fn domain_toml(id: &str, extra: &str) -> String {
    format!(
        r#"
[[domains]]
id = "{id}"
host_address = "192.0.2.10"
hardware_address = "aa:bb:cc:dd:ee:ff"
redirect_url = "https://{id}.example.org/"
{extra}
"#
    )
}

pub(crate) fn domain(id: &str, extra: &str) -> Arc<DomainConfig> {
    let snapshot = from_toml_str(&domain_toml(id, extra)).unwrap();
    snapshot.domains[id].clone()
}

#[derive(Debug)]
pub(crate) struct FakeNetwork {
    reachable: AtomicBool,
    pub hang: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeNetwork {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            hang: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, SeqCst);
    }
}

impl Reachability for FakeNetwork {
    fn reachable<'a>(&'a self, _domain: &'a DomainConfig, _timeout: Duration) -> BoxFuture<'a, bool> {
        self.calls.fetch_add(1, SeqCst);
        if self.hang.load(SeqCst) {
            return Box::pin(future::pending());
        }
        Box::pin(future::ready(self.reachable.load(SeqCst)))
    }
}

#[derive(Debug)]
pub(crate) struct FakeHealth {
    healthy: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeHealth {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, SeqCst);
    }
}

impl HealthClient for FakeHealth {
    fn healthy<'a>(&'a self, _check: &'a HealthCheck, _timeout: Duration) -> BoxFuture<'a, bool> {
        self.calls.fetch_add(1, SeqCst);
        Box::pin(future::ready(self.healthy.load(SeqCst)))
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeSignals {
    pub wakes: AtomicUsize,
    pub idles: AtomicUsize,
    pub fail_wakes: AtomicBool,
}

impl Signals for FakeSignals {
    fn wake<'a>(&'a self, _domain: &'a DomainConfig) -> BoxFuture<'a, Result<(), SignalError>> {
        self.wakes.fetch_add(1, SeqCst);
        let result = if self.fail_wakes.load(SeqCst) {
            Err(SignalError::Send {
                target: ([192, 0, 2, 255], 9).into(),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            })
        } else {
            Ok(())
        };
        Box::pin(future::ready(result))
    }

    fn idle<'a>(&'a self, _domain: &'a DomainConfig) -> BoxFuture<'a, Result<(), SignalError>> {
        self.idles.fetch_add(1, SeqCst);
        Box::pin(future::ready(Ok(())))
    }
}

/// Keeps every event for inspection.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<(DateTime<Utc>, Event)>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<(DateTime<Utc>, Event)> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, at: DateTime<Utc>, event: Event) {
        self.events.lock().unwrap().push((at, event));
    }

    fn recent(&self, limit: usize) -> BoxFuture<'_, Result<Vec<LogEntry>, EventLogError>> {
        let entries = self
            .events()
            .iter()
            .rev()
            .take(limit)
            .map(|&(at, ref event)| LogEntry::from_event(at, event))
            .collect();
        Box::pin(future::ready(Ok(entries)))
    }
}

/// Wall clock that starts at a fixed time and moves with tokio's clock.
#[derive(Debug)]
pub(crate) struct TestClock {
    anchor: Mutex<(DateTime<Utc>, Instant)>,
}

impl TestClock {
    pub fn new(wall: &str) -> Self {
        Self {
            anchor: Mutex::new((parse_wall(wall), Instant::now())),
        }
    }

    pub fn set_wall(&self, wall: &str) {
        *self.anchor.lock().unwrap() = (parse_wall(wall), Instant::now());
    }
}

fn parse_wall(wall: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(wall).unwrap().with_timezone(&Utc)
}

impl Clock for TestClock {
    fn now(&self) -> Now {
        let (wall, at) = *self.anchor.lock().unwrap();
        let mono = Instant::now();
        Now {
            wall: wall + TimeDelta::from_std(mono.duration_since(at)).unwrap(),
            mono,
        }
    }
}

/// A started engine wired to fakes. The host is reachable and healthy by default.
pub(crate) struct Harness {
    pub engine: Arc<Engine>,
    pub store: Arc<ConfigStore>,
    pub network: Arc<FakeNetwork>,
    pub health: Arc<FakeHealth>,
    pub signals: Arc<FakeSignals>,
    pub sink: Arc<RecordingSink>,
    pub clock: Arc<TestClock>,
}

impl Harness {
    /// `domains` is a list of [`domain_toml`] tables; `prelude` holds `[server]`/`[engine]` sections.
    pub async fn start(domains: &str, prelude: &str) -> Self {
        let snapshot = from_toml_str(&format!("{prelude}\n{domains}")).unwrap();
        Self::with_store(ConfigStore::new(snapshot, None)).await
    }

    /// Like [`Self::start`], with the configuration read from (and reloadable at) `path`.
    pub async fn open(path: &Path) -> Self {
        Self::with_store(ConfigStore::open(path).await.unwrap()).await
    }

    async fn with_store(store: ConfigStore) -> Self {
        let store = Arc::new(store);
        let network = Arc::new(FakeNetwork::new(true));
        let health = Arc::new(FakeHealth::new(true));
        let signals = Arc::new(FakeSignals::default());
        let sink = Arc::new(RecordingSink::default());
        let clock = Arc::new(TestClock::new("2024-01-03T00:00:00Z"));
        let probe = Arc::new(AvailabilityProbe::new(network.clone(), health.clone()));
        let engine = Engine::start(
            store.clone(),
            Arc::new(ActivityTracker::new()),
            probe,
            signals.clone(),
            sink.clone(),
            clock.clone(),
        )
        .await;
        Self {
            engine,
            store,
            network,
            health,
            signals,
            sink,
            clock,
        }
    }

    /// `(from, to)` of every transition of `domain`, in order.
    pub fn transitions(&self, domain: &str) -> Vec<(MachineState, MachineState)> {
        self.sink
            .events()
            .into_iter()
            .filter_map(|(_, event)| match event {
                Event::Transition {
                    domain: d, from, to, ..
                } if d == domain => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    pub fn events_with_action(&self, action: &str) -> Vec<LogEntry> {
        self.sink
            .events()
            .iter()
            .map(|&(at, ref event)| LogEntry::from_event(at, event))
            .filter(|entry| entry.action == action)
            .collect()
    }
}
