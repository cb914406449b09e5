//! Validated, immutable per-domain configuration.

use alloc::sync::Arc;
use core::{net::IpAddr, net::SocketAddr, time::Duration};

use chrono_tz::Tz;
use hall_common::MacAddress;
use ipnet::IpNet;
use secrecy::SecretString;
use url::Url;

use super::{
    schedule::{Schedule, ScheduleWindow, TimeOfDay, Weekdays},
    types::{PolicyKind, RawDomain, ShutdownTarget},
};

/// Wake policy of a domain together with the parameters it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    AlwaysOn,
    Scheduled(Schedule),
    OnDemand,
}

impl Policy {
    #[must_use]
    pub const fn kind(&self) -> PolicyKind {
        match *self {
            Self::AlwaysOn => PolicyKind::AlwaysOn,
            Self::Scheduled(_) => PolicyKind::Scheduled,
            Self::OnDemand => PolicyKind::OnDemand,
        }
    }
}

/// How host reachability is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    /// One ICMP echo through the system `ping` binary.
    Icmp,
    /// A TCP connect to the given port.
    Tcp(u16),
}

/// Application level health check of a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub url: Url,
    pub accept_invalid_certs: bool,
}

/// Addresses and address blocks allowed to use a domain.
///
/// An empty list allows every caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList(Vec<IpNet>);

impl AllowList {
    /// Parses entries that are either CIDR blocks (`10.0.0.0/8`) or single addresses.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, String> {
        entries
            .iter()
            .map(|entry| {
                let entry = entry.as_ref().trim();
                if entry.contains('/') {
                    entry
                        .parse::<IpNet>()
                        .map_err(|e| format!("invalid address block '{entry}': {e}"))
                } else {
                    entry
                        .parse::<IpAddr>()
                        .map(IpNet::from)
                        .map_err(|e| format!("invalid address '{entry}': {e}"))
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `ip` is covered. IPv4-mapped IPv6 addresses match their IPv4 form.
    #[must_use]
    pub fn permits(&self, ip: IpAddr) -> bool {
        if self.0.is_empty() {
            return true;
        }
        let ip = ip.to_canonical();
        self.0.iter().any(|net| net.contains(&ip))
    }

    #[must_use]
    pub fn entries(&self) -> &[IpNet] {
        &self.0
    }
}

/// Configuration of one managed domain. Never mutated after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainConfig {
    pub id: String,
    pub description: Option<String>,
    /// IP address or hostname of the managed host.
    pub host_address: String,
    pub hardware_address: MacAddress,
    pub policy: Policy,
    pub wake_timeout: Duration,
    pub idle_shutdown: Duration,
    /// Falls back to the engine default when `None`.
    pub boot_timeout: Option<Duration>,
    pub health_check: Option<HealthCheck>,
    pub redirect_url: Url,
    pub allowlist: AllowList,
    pub wake_enabled: bool,
    /// Destination of the magic packet.
    pub wake_target: SocketAddr,
    pub probe: ProbeMethod,
    pub shutdown: Option<ShutdownTarget>,
}

impl DomainConfig {
    /// Validates a raw `[[domains]]` entry.
    ///
    /// The error is a human readable reason; the caller adds the domain id.
    pub fn from_raw(raw: RawDomain) -> Result<Self, String> {
        if raw.id.trim().is_empty() {
            return Err("id must not be empty".to_string());
        }
        if raw.id.contains('/') {
            return Err("id must not contain '/'".to_string());
        }
        if raw.host_address.trim().is_empty() {
            return Err("host_address must not be empty".to_string());
        }

        let hardware_address: MacAddress = raw
            .hardware_address
            .parse()
            .map_err(|e| format!("invalid hardware_address '{}': {e}", raw.hardware_address))?;

        let policy = match raw.policy {
            PolicyKind::AlwaysOn => Policy::AlwaysOn,
            PolicyKind::OnDemand => Policy::OnDemand,
            PolicyKind::Scheduled => {
                if raw.schedule.is_empty() {
                    return Err("a scheduled domain needs at least one schedule window".to_string());
                }
                let timezone: Tz = raw
                    .timezone
                    .parse()
                    .map_err(|_| format!("unknown timezone '{}'", raw.timezone))?;
                let windows = raw
                    .schedule
                    .iter()
                    .map(|w| {
                        let days = Weekdays::parse(&w.days)?;
                        let start: TimeOfDay = w.start.parse()?;
                        let end: TimeOfDay = w.end.parse()?;
                        ScheduleWindow::new(days, start, end)
                    })
                    .collect::<Result<Vec<_>, String>>()?;
                Policy::Scheduled(Schedule { windows, timezone })
            }
        };

        if raw.wake_timeout_seconds == 0 {
            return Err("wake_timeout_seconds must be positive".to_string());
        }
        if raw.idle_shutdown_minutes == 0 {
            return Err("idle_shutdown_minutes must be positive".to_string());
        }
        if raw.boot_timeout_seconds == Some(0) {
            return Err("boot_timeout_seconds must be positive".to_string());
        }

        let health_check = raw
            .health_check_url
            .as_deref()
            .map(|url| {
                Url::parse(url)
                    .map(|url| HealthCheck {
                        url,
                        accept_invalid_certs: raw.health_check_accept_invalid_certs,
                    })
                    .map_err(|e| format!("invalid health_check_url '{url}': {e}"))
            })
            .transpose()?;

        let redirect_url = Url::parse(&raw.redirect_url)
            .map_err(|e| format!("invalid redirect_url '{}': {e}", raw.redirect_url))?;

        let allowlist = AllowList::parse(&raw.allowlist)?;

        let broadcast: IpAddr = raw
            .broadcast_address
            .parse()
            .map_err(|e| format!("invalid broadcast_address '{}': {e}", raw.broadcast_address))?;

        Ok(Self {
            id: raw.id,
            description: raw.description,
            host_address: raw.host_address.trim().to_string(),
            hardware_address,
            policy,
            wake_timeout: Duration::from_secs(raw.wake_timeout_seconds),
            idle_shutdown: Duration::from_secs(raw.idle_shutdown_minutes.saturating_mul(60)),
            boot_timeout: raw.boot_timeout_seconds.map(Duration::from_secs),
            health_check,
            redirect_url,
            allowlist,
            wake_enabled: raw.wake_enabled,
            wake_target: SocketAddr::new(broadcast, raw.wake_port),
            probe: raw.probe_port.map_or(ProbeMethod::Icmp, ProbeMethod::Tcp),
            shutdown: raw.shutdown,
        })
    }

    /// The secret the idle signal is signed with, if any.
    #[must_use]
    pub fn shutdown_secret(&self) -> Option<&Arc<SecretString>> {
        self.shutdown.as_ref().and_then(|s| s.shared_secret.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::RawWindow;

    fn raw_domain(id: &str, policy: PolicyKind) -> RawDomain {
        RawDomain {
            id: id.to_string(),
            description: None,
            host_address: "192.168.1.20".to_string(),
            hardware_address: "aa:bb:cc:dd:ee:ff".to_string(),
            policy,
            schedule: Vec::new(),
            timezone: "UTC".to_string(),
            wake_timeout_seconds: 120,
            idle_shutdown_minutes: 20,
            boot_timeout_seconds: None,
            health_check_url: None,
            health_check_accept_invalid_certs: false,
            redirect_url: "https://app.example.org/".to_string(),
            allowlist: Vec::new(),
            wake_enabled: true,
            broadcast_address: "255.255.255.255".to_string(),
            wake_port: 9,
            probe_port: None,
            shutdown: None,
        }
    }

    #[test]
    fn allowlist_matches_blocks_and_addresses() {
        let list = AllowList::parse(&["192.168.1.0/24", "10.0.0.7", "fd00::/8"]).unwrap();
        assert!(list.permits("192.168.1.42".parse().unwrap()));
        assert!(list.permits("10.0.0.7".parse().unwrap()));
        assert!(list.permits("fd12::1".parse().unwrap()));
        assert!(!list.permits("10.0.0.8".parse().unwrap()));
        assert!(!list.permits("192.168.2.1".parse().unwrap()));
    }

    #[test]
    fn allowlist_canonicalises_mapped_addresses() {
        let list = AllowList::parse(&["192.168.1.0/24"]).unwrap();
        assert!(list.permits("::ffff:192.168.1.9".parse().unwrap()));
    }

    #[test]
    fn empty_allowlist_permits_everyone() {
        assert!(AllowList::default().permits("203.0.113.1".parse().unwrap()));
    }

    #[test]
    fn allowlist_rejects_garbage() {
        assert!(AllowList::parse(&["10.0.0.0/33"]).is_err());
        assert!(AllowList::parse(&["localhost"]).is_err());
    }

    #[test]
    fn scheduled_domain_requires_windows_and_timezone() {
        let raw = raw_domain("nas", PolicyKind::Scheduled);
        assert!(DomainConfig::from_raw(raw).is_err());

        let mut raw = raw_domain("nas", PolicyKind::Scheduled);
        raw.schedule = vec![RawWindow {
            days: vec!["mon".to_string()],
            start: "08:00".to_string(),
            end: "18:00".to_string(),
        }];
        raw.timezone = "Mars/Olympus_Mons".to_string();
        assert!(DomainConfig::from_raw(raw.clone()).is_err());

        raw.timezone = "Europe/Paris".to_string();
        let cfg = DomainConfig::from_raw(raw).unwrap();
        assert!(matches!(cfg.policy, Policy::Scheduled(ref s) if s.timezone == chrono_tz::Europe::Paris));
    }

    #[test]
    fn derived_fields() {
        let mut raw = raw_domain("nas", PolicyKind::OnDemand);
        raw.probe_port = Some(22);
        raw.broadcast_address = "192.168.1.255".to_string();
        let cfg = DomainConfig::from_raw(raw).unwrap();
        assert_eq!(cfg.idle_shutdown, Duration::from_secs(20 * 60));
        assert_eq!(cfg.probe, ProbeMethod::Tcp(22));
        assert_eq!(cfg.wake_target, "192.168.1.255:9".parse().unwrap());
        assert!(cfg.health_check.is_none());
    }

    #[test]
    fn rejects_bad_fields() {
        let mut raw = raw_domain("nas", PolicyKind::OnDemand);
        raw.hardware_address = "not-a-mac".to_string();
        assert!(DomainConfig::from_raw(raw).is_err());

        let mut raw = raw_domain("nas", PolicyKind::OnDemand);
        raw.wake_timeout_seconds = 0;
        assert!(DomainConfig::from_raw(raw).is_err());

        let mut raw = raw_domain("nas", PolicyKind::OnDemand);
        raw.redirect_url = "not a url".to_string();
        assert!(DomainConfig::from_raw(raw).is_err());

        let raw = raw_domain(" ", PolicyKind::OnDemand);
        assert!(DomainConfig::from_raw(raw).is_err());
    }
}
