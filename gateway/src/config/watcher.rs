//! Configuration file watching.
//!
//! Modifications of the config file trigger a reload, usually
//! [`super::ConfigStore::reload`] wrapped by the caller. Failed reloads are
//! logged and leave the active snapshot untouched.

use core::time::Duration;
use std::{
    fs,
    path::{Path, PathBuf},
};

use eyre::{Result, WrapErr as _, eyre};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc::unbounded_channel;
use tracing::{error, info};

use super::{loader::ConfigError, store::ReloadOutcome};

/// Editors often write a file in several steps; events closer together than this are merged.
const DEBOUNCE: Duration = Duration::from_millis(200);

fn is_config_event(event: &Event, path: &Path) -> bool {
    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
        return false;
    }
    let config_filename = path.file_name();
    event.paths.iter().any(|event_path| {
        if event_path == path {
            return true;
        }
        if let (Ok(canonical_event), Ok(canonical_config)) =
            (fs::canonicalize(event_path), fs::canonicalize(path))
            && canonical_event == canonical_config
        {
            return true;
        }
        // Atomic writes rename a temp file over the config
        event_path.file_name().is_some() && event_path.file_name() == config_filename
    })
}

/// Watches the config file at `path` and calls `reload` when it is modified.
///
/// Runs until the watcher's event channel closes.
///
/// # Errors
///
/// Returns an error if the watcher cannot be set up.
pub async fn watch_config_file<F, Fut>(path: PathBuf, mut reload: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ReloadOutcome, ConfigError>>,
{
    let dir = path
        .parent()
        .ok_or_else(|| eyre!("Config file {} has no parent directory", path.display()))?
        .to_path_buf();

    let (raw_tx, mut raw_rx) = unbounded_channel::<Event>();

    let mut watcher = RecommendedWatcher::new(
        move |res| {
            if let Ok(event) = res
                && raw_tx.send(event).is_err()
            {
                error!("Failed to send event to config watcher channel");
            }
        },
        notify::Config::default(),
    )
    .wrap_err("Failed to create file watcher")?;

    // The directory is watched so renames over the file are seen
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .wrap_err(format!("Failed to watch config directory {}", dir.display()))?;

    while let Some(event) = raw_rx.recv().await {
        if !is_config_event(&event, &path) {
            continue;
        }
        tokio::time::sleep(DEBOUNCE).await;
        while raw_rx.try_recv().is_ok() {}

        info!("Config file modified. Reloading...");
        match reload().await {
            Ok(ReloadOutcome::Applied { version, .. }) => {
                info!(version, "Applied config changes from file");
            }
            Ok(ReloadOutcome::Unchanged { .. }) => {}
            Err(e) => {
                error!(error = %e, "Failed to reload config, keeping previous snapshot");
            }
        }
    }

    drop(watcher);
    Ok(())
}
