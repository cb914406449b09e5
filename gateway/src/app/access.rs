//! Per-domain caller allow-lists.

use alloc::sync::Arc;
use core::net::IpAddr;

use chrono::{DateTime, Utc};

use super::events::{Event, EventSink};
use crate::config::{ConfigStore, DomainConfig, UnknownDomain};

/// Checks callers against the allow-list of a domain and reports denials.
///
/// Never touches domain state.
#[derive(Debug, Clone)]
pub struct AccessGuard {
    store: Arc<ConfigStore>,
    events: Arc<dyn EventSink>,
}

impl AccessGuard {
    #[must_use]
    pub fn new(store: Arc<ConfigStore>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    /// Whether `caller` may use `domain`, as of the active snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownDomain`] if `domain` is not configured.
    pub fn is_allowed(&self, domain: &str, caller: IpAddr, at: DateTime<Utc>) -> Result<bool, UnknownDomain> {
        let config = self.store.get(domain)?;
        Ok(self.check(&config, caller, at))
    }

    /// Like [`Self::is_allowed`] for an already resolved domain.
    #[must_use]
    pub fn check(&self, config: &DomainConfig, caller: IpAddr, at: DateTime<Utc>) -> bool {
        if config.allowlist.permits(caller) {
            return true;
        }
        self.events.record(
            at,
            Event::AccessDenied {
                domain: config.id.clone(),
                client_ip: caller.to_canonical(),
            },
        );
        false
    }
}
