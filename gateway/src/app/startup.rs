use core::net::{IpAddr, SocketAddr};
use std::path::Path;

use eyre::WrapErr as _;
use tokio::{net, signal};
use tracing::{error, info};

use super::state::{AppState, initialize_state};
use crate::http::router;

/// Resolves when SIGTERM (unix) or Ctrl-C is received.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    res = signal::ctrl_c() => drop(res),
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler, only Ctrl-C stops the gateway");
                drop(signal::ctrl_c().await);
            }
        }
    }
    #[cfg(not(unix))]
    {
        drop(signal::ctrl_c().await);
    }
}

/// Serves the gateway API until a shutdown signal arrives.
async fn start_server(app_state: AppState, listen_ip: IpAddr, listen_port: u16) -> eyre::Result<()> {
    let app = router::create_app(app_state);
    let addr = SocketAddr::from((listen_ip, listen_port));

    let listener = net::TcpListener::bind(addr)
        .await
        .wrap_err(format!("Failed to bind {addr}"))?;
    info!("Listening on http://{}", addr);
    let server = axum::serve(listener, app);
    tokio::select! {
        res = server => res?,
        () = shutdown_signal() => {
            info!("Received shutdown, shutting down");
        }
    }
    Ok(())
}

/// Loads the config, starts the engine and serves until shutdown.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded, the database cannot
/// be opened or the server cannot bind.
pub(crate) async fn start(
    config_path: &Path,
    port_override: Option<u16>,
    bind_override: Option<IpAddr>,
) -> eyre::Result<()> {
    info!("Starting HTTP server...");

    let app_state = initialize_state(config_path).await?;

    let server = app_state.engine.config().server.clone();
    let listen_port = port_override.unwrap_or(server.port);
    let listen_ip = bind_override.unwrap_or(server.bind);

    start_server(app_state, listen_ip, listen_port).await
}
