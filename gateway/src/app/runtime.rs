//! Background tasks of the gateway.

use alloc::sync::Arc;
use std::path::Path;

use tracing::{Instrument as _, error, info_span};

use super::engine::Engine;
use crate::config::watch_config_file;

/// Starts the config file watcher. Domain drivers are owned by the [`Engine`].
pub(crate) fn start_background_tasks(engine: &Arc<Engine>, config_path: &Path) {
    let engine = engine.clone();
    let path = config_path.to_path_buf();
    tokio::spawn(
        async move {
            let reload = move || {
                let engine = engine.clone();
                async move { engine.reload().await }
            };
            if let Err(e) = watch_config_file(path, reload).await {
                error!(error = ?e, "Config watcher stopped");
            }
        }
        .instrument(info_span!("config_watcher")),
    );
}
