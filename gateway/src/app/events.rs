//! Event log of the engine.
//!
//! Every transition, signal, denial and reload is handed to an [`EventSink`].
//! Recording never blocks the caller.

use alloc::collections::VecDeque;
use core::{fmt, net::IpAddr};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture};
use serde::Serialize;
use thiserror::Error as ThisError;
use tracing::{debug, info, warn};

use super::controller::MachineState;

/// Something worth remembering that happened to a domain or the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    AccessDenied {
        domain: String,
        client_ip: IpAddr,
    },
    Activity {
        domain: String,
        client_ip: Option<IpAddr>,
    },
    WakeSignal {
        domain: String,
        attempt: u32,
        error: Option<String>,
    },
    IdleSignal {
        domain: String,
        error: Option<String>,
    },
    Transition {
        domain: String,
        from: MachineState,
        to: MachineState,
        reason: String,
    },
    ConfigReload {
        status: &'static str,
        details: String,
    },
}

impl Event {
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        match *self {
            Self::AccessDenied { ref domain, .. }
            | Self::Activity { ref domain, .. }
            | Self::WakeSignal { ref domain, .. }
            | Self::IdleSignal { ref domain, .. }
            | Self::Transition { ref domain, .. } => Some(domain),
            Self::ConfigReload { .. } => None,
        }
    }
}

/// One row of the event log as listed by the admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub domain: Option<String>,
    pub action: String,
    pub status: String,
    pub details: Option<String>,
    pub client_ip: Option<String>,
}

impl LogEntry {
    /// Flattens an event into the `(action, status, details)` log columns.
    #[must_use]
    pub fn from_event(timestamp: DateTime<Utc>, event: &Event) -> Self {
        let domain = event.domain().map(ToString::to_string);
        let (action, status, details, client_ip) = match *event {
            Event::AccessDenied { client_ip, .. } => {
                ("access", "denied".to_string(), None, Some(client_ip))
            }
            Event::Activity { client_ip, .. } => ("activity", "recorded".to_string(), None, client_ip),
            Event::WakeSignal {
                attempt, ref error, ..
            } => (
                "wake",
                if error.is_some() { "failed" } else { "sent" }.to_string(),
                Some(match *error {
                    Some(ref e) => format!("attempt {attempt}: {e}"),
                    None => format!("attempt {attempt}"),
                }),
                None,
            ),
            Event::IdleSignal { ref error, .. } => (
                "idle",
                if error.is_some() { "failed" } else { "sent" }.to_string(),
                error.clone(),
                None,
            ),
            Event::Transition {
                from,
                to,
                ref reason,
                ..
            } => (
                "transition",
                to.as_str().to_string(),
                Some(format!("{from} -> {to}: {reason}")),
                None,
            ),
            Event::ConfigReload {
                status,
                ref details,
            } => ("reload", status.to_string(), Some(details.clone()), None),
        };
        Self {
            timestamp,
            domain,
            action: action.to_string(),
            status,
            details,
            client_ip: client_ip.map(|ip| ip.to_string()),
        }
    }
}

#[derive(Debug, ThisError)]
pub enum EventLogError {
    #[error("event log database error")]
    Database(#[from] sqlx::Error),
}

/// Persistence interface of the event log.
pub trait EventSink: Send + Sync + fmt::Debug {
    /// Records an event. Must not block.
    fn record(&self, at: DateTime<Utc>, event: Event);

    /// The most recent `limit` log entries, newest first.
    fn recent(&self, limit: usize) -> BoxFuture<'_, Result<Vec<LogEntry>, EventLogError>>;
}

/// Writes an event as a structured tracing record.
pub(crate) fn trace_event(event: &Event) {
    match *event {
        Event::AccessDenied {
            ref domain,
            client_ip,
        } => warn!(%domain, %client_ip, "Access denied"),
        Event::Activity {
            ref domain,
            client_ip,
        } => debug!(%domain, ?client_ip, "Activity recorded"),
        Event::WakeSignal {
            ref domain,
            attempt,
            error: None,
        } => info!(%domain, attempt, "Wake signal sent"),
        Event::WakeSignal {
            ref domain,
            attempt,
            error: Some(ref error),
        } => warn!(%domain, attempt, %error, "Wake signal failed"),
        Event::IdleSignal {
            ref domain,
            error: None,
        } => info!(%domain, "Idle signal sent"),
        Event::IdleSignal {
            ref domain,
            error: Some(ref error),
        } => warn!(%domain, %error, "Idle signal failed"),
        Event::Transition {
            ref domain,
            from,
            to,
            ref reason,
        } => info!(%domain, %from, %to, %reason, "State transition"),
        Event::ConfigReload {
            status,
            ref details,
        } => info!(status, %details, "Config reload"),
    }
}

/// Entries kept in memory by [`TracingSink`].
const RECENT_CAPACITY: usize = 512;

/// Event sink that only logs, keeping the latest entries in memory for the admin listing.
///
/// Activity events are traced but not kept.
#[derive(Debug, Default)]
pub struct TracingSink {
    recent: Mutex<VecDeque<LogEntry>>,
}

impl TracingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the kept entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl EventSink for TracingSink {
    fn record(&self, at: DateTime<Utc>, event: Event) {
        trace_event(&event);
        if matches!(event, Event::Activity { .. }) {
            return;
        }
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() >= RECENT_CAPACITY {
            drop(recent.pop_front());
        }
        recent.push_back(LogEntry::from_event(at, &event));
    }

    fn recent(&self, limit: usize) -> BoxFuture<'_, Result<Vec<LogEntry>, EventLogError>> {
        let entries = self
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect();
        Box::pin(future::ready(Ok(entries)))
    }
}
