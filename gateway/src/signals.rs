//! Outbound signals to managed hosts: the Wake-on-LAN magic packet and the idle (shutdown) datagram.

use core::{fmt, net::SocketAddr, time::Duration};
use std::io;

use futures::future::BoxFuture;
use hall_common::encode_idle_signal;
use secrecy::SecretString;
use thiserror::Error as ThisError;
use tokio::{
    net::{UdpSocket, lookup_host},
    time::timeout,
};
use tracing::debug;

use crate::config::DomainConfig;

/// Upper bound for resolving and sending one signal.
const SIGNAL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, ThisError)]
pub enum SignalError {
    #[error("failed to resolve {target}")]
    Resolve {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("{target} did not resolve to any address")]
    NoAddress { target: String },
    #[error("failed to send datagram to {target}")]
    Send {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("no shutdown target configured")]
    NoShutdownTarget,
    #[error("sending to {target} timed out")]
    Timeout { target: String },
}

impl SignalError {
    /// The error and its sources on one line.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut out = self.to_string();
        let mut source = core::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str(": ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

/// Transport of the wake and idle signals.
pub trait Signals: Send + Sync + fmt::Debug {
    /// Sends one magic packet for `domain`.
    fn wake<'a>(&'a self, domain: &'a DomainConfig) -> BoxFuture<'a, Result<(), SignalError>>;
    /// Tells the host of `domain` that it went idle.
    fn idle<'a>(&'a self, domain: &'a DomainConfig) -> BoxFuture<'a, Result<(), SignalError>>;
}

/// Sends both signals as UDP datagrams.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkSignals;

impl Signals for NetworkSignals {
    fn wake<'a>(&'a self, domain: &'a DomainConfig) -> BoxFuture<'a, Result<(), SignalError>> {
        Box::pin(async move {
            let target = domain.wake_target;
            let packet = domain.hardware_address.magic_packet();
            timeout(SIGNAL_TIMEOUT, send_datagram(target, &packet, true))
                .await
                .map_err(|_| SignalError::Timeout {
                    target: target.to_string(),
                })??;
            debug!(mac = %domain.hardware_address, %target, "Sent magic packet");
            Ok(())
        })
    }

    fn idle<'a>(&'a self, domain: &'a DomainConfig) -> BoxFuture<'a, Result<(), SignalError>> {
        Box::pin(async move {
            let shutdown = domain
                .shutdown
                .as_ref()
                .ok_or(SignalError::NoShutdownTarget)?;
            let host = format!("{}:{}", domain.host_address, shutdown.port);
            let secret: Option<&SecretString> = domain.shutdown_secret().map(|s| &**s);
            let payload = encode_idle_signal(secret);

            timeout(SIGNAL_TIMEOUT, async {
                let target = resolve(&host).await?;
                send_datagram(target, payload.as_bytes(), false).await
            })
            .await
            .map_err(|_| SignalError::Timeout {
                target: host.clone(),
            })??;
            debug!(%host, signed = secret.is_some(), "Sent idle signal");
            Ok(())
        })
    }
}

async fn resolve(host: &str) -> Result<SocketAddr, SignalError> {
    lookup_host(host)
        .await
        .map_err(|source| SignalError::Resolve {
            target: host.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| SignalError::NoAddress {
            target: host.to_string(),
        })
}

async fn send_datagram(target: SocketAddr, payload: &[u8], broadcast: bool) -> Result<(), SignalError> {
    let send_err = |source| SignalError::Send { target, source };
    let local: SocketAddr = if target.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0_u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(local).await.map_err(send_err)?;
    if broadcast {
        socket.set_broadcast(true).map_err(send_err)?;
    }
    socket.send_to(payload, target).await.map_err(send_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use hall_common::{HostMessage, LEGACY_SHUTDOWN_PAYLOAD, MAGIC_PACKET_LEN, decode_idle_signal};

    use super::*;
    use crate::config::from_toml_str;

    async fn listener() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    fn domain_for(extra: &str) -> DomainConfig {
        let toml = format!(
            r#"
            [[domains]]
            id = "nas"
            host_address = "127.0.0.1"
            hardware_address = "aa:bb:cc:dd:ee:ff"
            policy = "on_demand"
            redirect_url = "http://nas/"
            broadcast_address = "127.0.0.1"
            {extra}
            "#
        );
        let snapshot = from_toml_str(&toml).unwrap();
        snapshot.domains["nas"].as_ref().clone()
    }

    #[tokio::test]
    async fn magic_packet_reaches_wake_target() {
        let (socket, port) = listener().await;
        let cfg = domain_for(&format!("wake_port = {port}"));
        NetworkSignals.wake(&cfg).await.unwrap();

        let mut buf = [0_u8; 256];
        let (n, _) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, MAGIC_PACKET_LEN);
        assert_eq!(&buf[..6], &[0xFF; 6]);
        assert_eq!(&buf[6..12], &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    }

    #[tokio::test]
    async fn signed_idle_signal() {
        let (socket, port) = listener().await;
        let cfg = domain_for(&format!(
            "[domains.shutdown]\nport = {port}\nshared_secret = \"s3cret\""
        ));
        NetworkSignals.idle(&cfg).await.unwrap();

        let mut buf = [0_u8; 512];
        let (n, _) = socket.recv_from(&mut buf).await.unwrap();
        let raw = core::str::from_utf8(&buf[..n]).unwrap();
        let secret = SecretString::from("s3cret");
        assert_eq!(decode_idle_signal(raw, Some(&secret)), Ok(HostMessage::Shutdown));
    }

    #[tokio::test]
    async fn legacy_idle_signal_without_secret() {
        let (socket, port) = listener().await;
        let cfg = domain_for(&format!("[domains.shutdown]\nport = {port}"));
        NetworkSignals.idle(&cfg).await.unwrap();

        let mut buf = [0_u8; 64];
        let (n, _) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], LEGACY_SHUTDOWN_PAYLOAD.as_bytes());
    }

    #[tokio::test]
    async fn idle_without_target_fails() {
        let cfg = domain_for("");
        assert!(matches!(
            NetworkSignals.idle(&cfg).await,
            Err(SignalError::NoShutdownTarget)
        ));
    }
}
