use alloc::sync::Arc;
use std::path::{Path, PathBuf};

use eyre::WrapErr as _;
use tracing::{info, warn};

use super::{
    activity::ActivityTracker,
    clock::{Clock, SystemClock},
    db::{self, DbPool, SqliteSink},
    engine::Engine,
    events::{EventSink, TracingSink},
    probe::{AvailabilityProbe, ReqwestHealthClient, SystemReachability},
    runtime::start_background_tasks,
};
use crate::{
    config::{ConfigSnapshot, ConfigStore, DbConfig, resolve_config_relative_paths},
    signals::NetworkSignals,
};

/// Application state shared across request handlers.
#[derive(Debug, Clone)]
pub(crate) struct AppState {
    pub engine: Arc<Engine>,
    /// Path of the config file, for reloads and startup checks.
    pub config_path: PathBuf,
}

/// Opens the database if one is configured and enabled.
///
/// Relative paths are resolved against the config file's directory.
#[tracing::instrument(skip_all)]
async fn initialize_database(config: &ConfigSnapshot, config_path: &Path) -> eyre::Result<Option<DbPool>> {
    Ok(match config.db {
        Some(DbConfig {
            enable: true,
            ref path,
        }) => {
            let db_path = resolve_config_relative_paths(config_path, path);
            let pool = db::init(&db_path).await.wrap_err(format!(
                "Failed to initialize database at: {}",
                db_path.display()
            ))?;
            info!(
                "Database initialized at: {} (note: WAL mode creates .db-wal and .db-shm files alongside)",
                db_path.display()
            );
            Some(pool)
        }
        _ => {
            info!("DB persistence disabled");
            None
        }
    })
}

/// Seeds the activity tracker from the database so idle timers survive restarts.
async fn restore_activity(
    pool: &DbPool,
    config: &ConfigSnapshot,
    tracker: &ActivityTracker,
    clock: &dyn Clock,
) -> eyre::Result<()> {
    let now = clock.now();
    let mut restored = 0_usize;
    for (domain, seen) in db::load_activity(pool)
        .await
        .wrap_err("Failed to load activity from database")?
    {
        if config.domains.contains_key(&domain) && tracker.restore(&domain, seen, now) {
            restored += 1;
        }
    }
    info!(restored, "Restored last activity from database");
    Ok(())
}

fn emit_startup_warnings(config: &ConfigSnapshot, config_path: &Path) {
    #[cfg(unix)]
    {
        use std::fs;
        use std::os::unix::fs::PermissionsExt as _;
        let has_secrets = config
            .domains
            .values()
            .any(|domain| domain.shutdown_secret().is_some());
        if has_secrets && let Ok(metadata) = fs::metadata(config_path) {
            let mode = metadata.permissions().mode();
            if mode & 0o077 != 0 {
                warn!(
                    "Config file contains shared secrets but its permissions are too permissive (current: {mode:#o}). Run 'chmod 600 {}' to restrict access to owner only.",
                    config_path.display()
                );
            }
        }
    }

    if config.server.trust_forwarded_for {
        warn!(
            "X-Forwarded-For is trusted. Make sure the gateway is only reachable through a reverse proxy that overwrites this header, otherwise callers can bypass allow-lists."
        );
    }
    if config.domains.is_empty() {
        warn!("No domains configured");
    }
}

/// Loads the configuration, opens persistence and starts the engine and background tasks.
#[tracing::instrument(skip_all)]
pub(crate) async fn initialize_state(config_path: &Path) -> eyre::Result<AppState> {
    let store = Arc::new(ConfigStore::open(config_path).await.wrap_err(format!(
        "Failed to load config from {}",
        config_path.display()
    ))?);
    let initial = store.snapshot();

    let db_pool = initialize_database(&initial, config_path).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let activity = Arc::new(ActivityTracker::new());
    let events: Arc<dyn EventSink> = match db_pool {
        Some(ref pool) => {
            restore_activity(pool, &initial, &activity, clock.as_ref()).await?;
            Arc::new(SqliteSink::spawn(pool.clone()))
        }
        None => {
            info!("Skipping activity restore: DB persistence disabled");
            Arc::new(TracingSink::new())
        }
    };

    let health = ReqwestHealthClient::new().wrap_err("Failed to build health check client")?;
    let probe = Arc::new(AvailabilityProbe::new(
        Arc::new(SystemReachability),
        Arc::new(health),
    ));

    let engine = Engine::start(
        store,
        activity,
        probe,
        Arc::new(NetworkSignals),
        events,
        clock,
    )
    .await;

    start_background_tasks(&engine, config_path);
    emit_startup_warnings(&initial, config_path);

    info!(domains = initial.domains.len(), "Engine started");

    Ok(AppState {
        engine,
        config_path: config_path.to_path_buf(),
    })
}
