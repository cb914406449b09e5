//! Holder of the active configuration snapshot and the reload logic.

use alloc::sync::Arc;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error as ThisError;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use super::{
    domain::DomainConfig,
    loader::{self, ConfigError, ConfigSnapshot},
};

pub type ConfigRx = watch::Receiver<Arc<ConfigSnapshot>>;

/// A domain id that is not part of the active snapshot.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("unknown domain '{0}'")]
pub struct UnknownDomain(pub String);

/// Result of a successful reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReloadOutcome {
    /// A new snapshot was installed.
    Applied {
        version: u64,
        added: Vec<String>,
        removed: Vec<String>,
        changed: Vec<String>,
    },
    /// The candidate matched the active snapshot; nothing was installed.
    Unchanged { version: u64 },
}

/// Owns the active [`ConfigSnapshot`].
///
/// Readers clone an `Arc` out of a watch channel and never wait for a reload.
/// Reloads are serialized among themselves.
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    tx: watch::Sender<Arc<ConfigSnapshot>>,
    reload_lock: Mutex<()>,
}

impl ConfigStore {
    /// Creates a store around an already validated snapshot.
    ///
    /// Without a `path`, [`Self::reload`] has nothing to read and reports
    /// [`ReloadOutcome::Unchanged`]; use [`Self::install`] instead.
    #[must_use]
    pub fn new(initial: ConfigSnapshot, path: Option<PathBuf>) -> Self {
        let (tx, _) = watch::channel(Arc::new(initial));
        Self {
            path,
            tx,
            reload_lock: Mutex::new(()),
        }
    }

    /// Loads the config file and creates a store watching nothing yet.
    pub async fn open(path: &Path) -> Result<Self, ConfigError> {
        let initial = loader::load(path).await?;
        Ok(Self::new(initial, Some(path.to_path_buf())))
    }

    /// The active snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.tx.borrow().clone()
    }

    /// A receiver notified on every installed snapshot.
    #[must_use]
    pub fn subscribe(&self) -> ConfigRx {
        self.tx.subscribe()
    }

    /// The active definition of `domain`.
    pub fn get(&self, domain: &str) -> Result<Arc<DomainConfig>, UnknownDomain> {
        self.tx
            .borrow()
            .domains
            .get(domain)
            .cloned()
            .ok_or_else(|| UnknownDomain(domain.to_string()))
    }

    /// Re-reads the config file and installs it if it differs.
    ///
    /// On error the active snapshot stays in place.
    #[tracing::instrument(skip(self))]
    pub async fn reload(&self) -> Result<ReloadOutcome, ConfigError> {
        let Some(ref path) = self.path else {
            return Ok(ReloadOutcome::Unchanged {
                version: self.snapshot().version,
            });
        };
        let candidate = loader::load(path).await?;
        Ok(self.install(candidate).await)
    }

    /// Installs `candidate` unless its runtime sections equal the active ones.
    ///
    /// `[server]` and `[db]` are bound at startup; differences there are logged
    /// and the active values are kept.
    pub async fn install(&self, candidate: ConfigSnapshot) -> ReloadOutcome {
        let _guard = self.reload_lock.lock().await;
        let prev = self.snapshot();

        if candidate.server != prev.server || candidate.db != prev.db {
            warn!(
                "Detected change to [server] or [db] during runtime. Changes outside [engine] and [domains] are unsupported and will be ignored."
            );
        }

        if prev.same_runtime_sections(&candidate) {
            info!(version = prev.version, "No applicable config changes detected");
            return ReloadOutcome::Unchanged {
                version: prev.version,
            };
        }

        let added: Vec<String> = candidate
            .domains
            .keys()
            .filter(|id| !prev.domains.contains_key(*id))
            .cloned()
            .collect();
        let removed: Vec<String> = prev
            .domains
            .keys()
            .filter(|id| !candidate.domains.contains_key(*id))
            .cloned()
            .collect();
        let changed: Vec<String> = candidate
            .domains
            .iter()
            .filter(|&(id, cfg)| prev.domains.get(id).is_some_and(|old| old != cfg))
            .map(|(id, _)| id.clone())
            .collect();

        let version = prev.version.saturating_add(1);
        let next = ConfigSnapshot {
            version,
            server: prev.server.clone(),
            db: prev.db.clone(),
            engine: candidate.engine,
            domains: candidate.domains,
        };
        drop(self.tx.send_replace(Arc::new(next)));
        info!(
            version,
            ?added,
            ?removed,
            ?changed,
            "Installed new config snapshot"
        );

        ReloadOutcome::Applied {
            version,
            added,
            removed,
            changed,
        }
    }
}
