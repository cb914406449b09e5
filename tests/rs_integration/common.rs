//! Common utilities for integration tests: spawning the gateway, managing ports and waiting for it.

use core::{
    sync::atomic::{AtomicU16, Ordering},
    time::Duration,
};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Instant,
};

use clap::Parser as _;
use tempfile::TempDir;
use tokio::{
    net::{TcpListener, TcpStream},
    task,
    time,
};

use hall_gateway::cli::Cli;

static NEXT_PORT: AtomicU16 = AtomicU16::new(20000);

pub(crate) fn get_free_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

/// A gateway running in-process. Stops when dropped.
pub(crate) struct Gateway {
    handle: task::JoinHandle<()>,
    pub port: u16,
    pub dir: TempDir,
}

impl Gateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("hall.toml")
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Writes `domains` below a `[server]` section for `port` and starts the gateway on it.
///
/// `server_extra` is appended to the `[server]` section.
pub(crate) async fn spawn_gateway(server_extra: &str, domains: &str) -> Gateway {
    let port = get_free_port();
    let dir = tempfile::tempdir().unwrap();
    write_config(&dir.path().join("hall.toml"), port, server_extra, domains);

    let cli = Cli::parse_from([
        "hall",
        "serve",
        "--config",
        dir.path().join("hall.toml").to_str().unwrap(),
    ]);
    let handle = tokio::spawn(async move {
        // SAFETY: Only used in integration tests. It just tells the gateway to log less verbose output.
        unsafe {
            env::set_var("HALL_INTEGRATION_TEST", "1");
        }
        hall_gateway::inner_main(cli)
            .await
            .expect("inner_main failed");
    });
    wait_for_listening(port, 5).await;
    Gateway { handle, port, dir }
}

pub(crate) fn write_config(path: &Path, port: u16, server_extra: &str, domains: &str) {
    fs::write(
        path,
        format!(
            r#"
[server]
port = {port}
bind = "127.0.0.1"
{server_extra}

[engine]
tick_interval_ms = 100
ping_timeout_ms = 500

{domains}
"#
        ),
    )
    .expect("failed to write config");
}

/// A `[[domains]]` table for a host on localhost that is "up" while a listener accepts on `probe_port`.
pub(crate) fn local_domain(id: &str, probe_port: u16, extra: &str) -> String {
    format!(
        r#"
[[domains]]
id = "{id}"
host_address = "127.0.0.1"
hardware_address = "00:11:22:33:44:55"
broadcast_address = "127.0.0.1"
wake_port = {wake_port}
probe_port = {probe_port}
redirect_url = "https://{id}.example.org/"
{extra}
"#,
        wake_port = get_free_port(),
    )
}

/// Stands in for a booted host by accepting connections on `port`.
pub(crate) async fn fake_host(port: u16) -> task::JoinHandle<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    })
}

/// Block until a TCP listener is accepting on `127.0.0.1:port` or timeout.
pub(crate) async fn wait_for_listening(port: u16, timeout_secs: u64) {
    let start = Instant::now();
    while TcpStream::connect(("127.0.0.1", port)).await.is_err() {
        assert!(
            start.elapsed() <= Duration::from_secs(timeout_secs),
            "server did not start within timeout"
        );
        time::sleep(Duration::from_millis(100)).await;
    }
}
