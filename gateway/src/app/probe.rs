//! Availability probing of managed hosts.
//!
//! A probe is a network reachability check followed, when the domain has one,
//! by an HTTP health check with a fixed number of attempts. The whole probe is
//! bounded by [`EngineSettings::probe_deadline`] and results are reused for
//! [`EngineSettings::probe_cache_ttl`].

use alloc::sync::Arc;
use core::{fmt, time::Duration};
use std::process::Stdio;

use dashmap::DashMap;
use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde::Serialize;
use tokio::{
    net::TcpStream,
    process::Command,
    sync::Mutex,
    time::{Instant, sleep, timeout},
};
use tracing::{debug, warn};

use crate::config::{DomainConfig, EngineSettings, HealthCheck, ProbeMethod};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeResult {
    /// Host reachable and healthy (or no health check configured).
    Reachable,
    Unreachable,
    /// Host reachable, health check failing.
    Degraded,
}

impl ProbeResult {
    #[must_use]
    pub const fn host_up(self) -> bool {
        matches!(self, Self::Reachable | Self::Degraded)
    }
}

/// Network level reachability of a host.
pub trait Reachability: Send + Sync + fmt::Debug {
    fn reachable<'a>(&'a self, domain: &'a DomainConfig, timeout: Duration) -> BoxFuture<'a, bool>;
}

/// Application level health of a domain.
pub trait HealthClient: Send + Sync + fmt::Debug {
    fn healthy<'a>(&'a self, check: &'a HealthCheck, timeout: Duration) -> BoxFuture<'a, bool>;
}

/// Reachability through the system `ping` binary or a TCP connect, depending on [`ProbeMethod`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemReachability;

impl Reachability for SystemReachability {
    fn reachable<'a>(&'a self, domain: &'a DomainConfig, timeout: Duration) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            match domain.probe {
                ProbeMethod::Icmp => ping(&domain.host_address, timeout).await,
                ProbeMethod::Tcp(port) => tcp_connect(&domain.host_address, port, timeout).await,
            }
        })
    }
}

async fn ping(host: &str, limit: Duration) -> bool {
    // `-W` takes whole seconds
    let wait_secs = limit.as_secs().max(1).to_string();
    let mut cmd = Command::new("ping");
    cmd.args(["-c", "1", "-W", &wait_secs, host])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    match timeout(limit, cmd.status()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(e)) => {
            warn!(host, error = %e, "Failed to run ping");
            false
        }
        Err(_) => false,
    }
}

async fn tcp_connect(host: &str, port: u16, limit: Duration) -> bool {
    match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "TCP probe failed");
            false
        }
        Err(_) => false,
    }
}

/// Health checks over HTTP(S); healthy iff the response status is `200`.
#[derive(Debug, Clone)]
pub struct ReqwestHealthClient {
    strict: reqwest::Client,
    lenient: reqwest::Client,
}

impl ReqwestHealthClient {
    /// Builds the HTTP clients. A rustls crypto provider must already be installed.
    ///
    /// # Errors
    ///
    /// Returns an error if a client cannot be built.
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            strict: reqwest::Client::builder().build()?,
            lenient: reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .build()?,
        })
    }
}

impl HealthClient for ReqwestHealthClient {
    fn healthy<'a>(&'a self, check: &'a HealthCheck, timeout: Duration) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let client = if check.accept_invalid_certs {
                &self.lenient
            } else {
                &self.strict
            };
            match client.get(check.url.clone()).timeout(timeout).send().await {
                Ok(response) => response.status() == StatusCode::OK,
                Err(e) => {
                    debug!(url = %check.url, error = %e, "Health check request failed");
                    false
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedResult {
    at: Instant,
    result: ProbeResult,
}

type CacheSlot = Arc<Mutex<Option<CachedResult>>>;

/// Composes reachability and health checks into a bounded, cached probe.
#[derive(Debug)]
pub struct AvailabilityProbe {
    network: Arc<dyn Reachability>,
    health: Arc<dyn HealthClient>,
    cache: DashMap<String, CacheSlot>,
}

impl AvailabilityProbe {
    #[must_use]
    pub fn new(network: Arc<dyn Reachability>, health: Arc<dyn HealthClient>) -> Self {
        Self {
            network,
            health,
            cache: DashMap::new(),
        }
    }

    /// Probes `domain`, reusing a result younger than the cache window.
    ///
    /// Concurrent probes of the same domain wait for the one in progress and
    /// share its result. Never takes longer than the probe deadline; a probe
    /// that runs out of time reports [`ProbeResult::Unreachable`].
    #[tracing::instrument(skip_all, fields(domain = %domain.id))]
    pub async fn probe(&self, domain: &DomainConfig, settings: &EngineSettings) -> ProbeResult {
        let slot = self.cache.entry(domain.id.clone()).or_default().clone();
        let mut cached = slot.lock().await;

        if let Some(hit) = *cached
            && hit.at.elapsed() < settings.probe_cache_ttl()
        {
            return hit.result;
        }

        let result = match timeout(settings.probe_deadline(), self.probe_uncached(domain, settings))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("Probe exceeded its deadline");
                ProbeResult::Unreachable
            }
        };
        debug!(?result, "Probed");

        *cached = Some(CachedResult {
            at: Instant::now(),
            result,
        });
        result
    }

    /// Drops the cached result of `domain`.
    pub fn invalidate(&self, domain: &str) {
        drop(self.cache.remove(domain));
    }

    async fn probe_uncached(&self, domain: &DomainConfig, settings: &EngineSettings) -> ProbeResult {
        let ping_timeout = settings.ping_timeout();
        let reachable = timeout(ping_timeout, self.network.reachable(domain, ping_timeout))
            .await
            .unwrap_or(false);
        if !reachable {
            return ProbeResult::Unreachable;
        }

        let Some(ref check) = domain.health_check else {
            return ProbeResult::Reachable;
        };

        let health_timeout = settings.health_timeout();
        for attempt in 1..=settings.health_attempts {
            let healthy = timeout(health_timeout, self.health.healthy(check, health_timeout))
                .await
                .unwrap_or(false);
            if healthy {
                return ProbeResult::Reachable;
            }
            debug!(attempt, "Health check failed");
            if attempt < settings.health_attempts {
                sleep(settings.health_backoff()).await;
            }
        }
        ProbeResult::Degraded
    }
}
