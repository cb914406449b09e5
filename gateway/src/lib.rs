//! Library entry of the `hall` gateway.
//!
//! Exposes `inner_main` so the workspace-level shim binary, and the
//! integration tests, can run the gateway in-process.
#![cfg_attr(
    test,
    expect(clippy::indexing_slicing, reason = "This is not problematic in tests",)
)]

extern crate alloc;
extern crate core;

pub mod app;
pub mod cli;
pub mod config;
pub mod http;
pub mod signals;

use std::{env, fs, sync::Once};

use eyre::{Result, WrapErr as _};
use tracing::{Instrument as _, info};
use tracing_subscriber::{EnvFilter, fmt::time::ChronoLocal};

use cli::{Cli, Command, LogFormat};
use config::{Policy, load};

static INIT_TRACING: Once = Once::new();
static INIT_RUSTLS: Once = Once::new();

fn init_tracing(log_format: LogFormat) {
    INIT_TRACING.call_once(move || {
        let default_level = if env::var("HALL_INTEGRATION_TEST").is_ok() {
            "error"
        } else {
            "info"
        };

        let builder = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
            )
            .with_timer(ChronoLocal::rfc_3339());

        match log_format {
            LogFormat::Compact => builder.compact().init(),
            LogFormat::Json => builder.json().init(),
            LogFormat::Pretty => builder.pretty().init(),
        }
    });
}

/// The gateway's main function; can be called from a shim binary.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the server fails to start.
///
/// # Panics
///
/// Panics if the OpenSSL crypto provider cannot be installed.
pub async fn inner_main(invocation: Cli) -> Result<()> {
    match invocation.command {
        Command::Serve(args) => {
            let config_path = fs::canonicalize(&args.config).wrap_err(format!(
                "Config file not found at: {}",
                args.config.display()
            ))?;

            init_tracing(args.log_format);

            // Holds the resolved config path for the lifetime of the gateway.
            let startup_span = tracing::info_span!(
                "hall.startup",
                ?config_path,
                pid = ?std::process::id(),
                version = env!("CARGO_PKG_VERSION")
            );

            INIT_RUSTLS.call_once(|| {
                rustls_openssl::default_provider()
                    .install_default()
                    .expect("failed to install default rustls provider");
            });

            async {
                info!("Starting gateway");
                app::start(&config_path, args.port, args.bind).await
            }
            .instrument(startup_span)
            .await
        }
        Command::Check { config } => {
            let snapshot = load(&config)
                .await
                .wrap_err(format!("Invalid configuration in {}", config.display()))?;
            println!(
                "{}: {} domain(s), listening on {}:{}",
                config.display(),
                snapshot.domains.len(),
                snapshot.server.bind,
                snapshot.server.port
            );
            for domain in snapshot.domains.values() {
                let schedule = match domain.policy {
                    Policy::Scheduled(ref schedule) => {
                        format!(" ({} window(s), {})", schedule.windows.len(), schedule.timezone)
                    }
                    Policy::AlwaysOn | Policy::OnDemand => String::new(),
                };
                println!(
                    "  {} -> {} [{:?}{schedule}]",
                    domain.id,
                    domain.host_address,
                    domain.policy.kind()
                );
            }
            Ok(())
        }
    }
}
