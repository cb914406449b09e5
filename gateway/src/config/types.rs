//! Configuration data types as they appear in the config file.
//!
//! These structures mirror the file layout one to one. They are turned into
//! the validated types of [`super::domain`] by [`super::loader`], which is also
//! where all schema checks happen.

use alloc::sync::Arc;
use core::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Root structure of the config file.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    /// HTTP listener configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Timing knobs of the engine. Every field has a default.
    #[serde(default)]
    pub engine: EngineSettings,
    /// Optional `SQLite` persistence. When omitted events are only logged.
    #[serde(default)]
    pub db: Option<DbConfig>,
    /// The managed domains.
    #[serde(default)]
    pub domains: Vec<RawDomain>,
}

/// HTTP server binding configuration section.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// TCP port of the gateway API.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address for the HTTP listener.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Use the first `X-Forwarded-For` entry as caller address.
    /// Only enable this behind a reverse proxy that overwrites the header.
    #[serde(default)]
    pub trust_forwarded_for: bool,
    /// Callers allowed on the admin endpoints (reload, reset, config, logs).
    /// Empty means everyone.
    #[serde(default)]
    pub admin_allowlist: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            trust_forwarded_for: false,
            admin_allowlist: Vec::new(),
        }
    }
}

const fn default_port() -> u16 {
    8080
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

/// Engine-wide timing settings.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    /// Period of the per-domain re-evaluation tick.
    pub tick_interval_ms: u64,
    /// Poll interval suggested to callers waiting for a domain.
    pub poll_interval_seconds: u64,
    /// Timeout of the network reachability check.
    pub ping_timeout_ms: u64,
    /// Timeout of a single health check request.
    pub health_timeout_ms: u64,
    /// Health check attempts per probe.
    pub health_attempts: u32,
    /// Pause between health check attempts.
    pub health_backoff_ms: u64,
    /// How long a probe result is reused.
    pub probe_cache_ms: u64,
    /// Wake signals sent before a wake is declared failed.
    pub wake_max_attempts: u32,
    /// Pause between an expired attempt window and the next wake signal.
    pub wake_retry_delay_seconds: u64,
    /// Default time a domain may spend booting before it is declared failed.
    pub boot_timeout_seconds: u64,
    /// Grace period between going idle and the shutdown signal.
    pub idle_grace_seconds: u64,
    /// Time spent in the error state before a new wake may be attempted.
    pub error_cooldown_seconds: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            poll_interval_seconds: 3,
            ping_timeout_ms: 2_000,
            health_timeout_ms: 5_000,
            health_attempts: 3,
            health_backoff_ms: 500,
            probe_cache_ms: 1_000,
            wake_max_attempts: 3,
            wake_retry_delay_seconds: 5,
            boot_timeout_seconds: 180,
            idle_grace_seconds: 60,
            error_cooldown_seconds: 30,
        }
    }
}

impl EngineSettings {
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    #[must_use]
    pub const fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    #[must_use]
    pub const fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    #[must_use]
    pub const fn health_backoff(&self) -> Duration {
        Duration::from_millis(self.health_backoff_ms)
    }

    #[must_use]
    pub const fn probe_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.probe_cache_ms)
    }

    #[must_use]
    pub const fn wake_retry_delay(&self) -> Duration {
        Duration::from_secs(self.wake_retry_delay_seconds)
    }

    #[must_use]
    pub const fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_seconds)
    }

    #[must_use]
    pub const fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_seconds)
    }

    #[must_use]
    pub const fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.error_cooldown_seconds)
    }

    /// Upper bound of a full probe: `T1 + R * (T2 + backoff)`.
    #[must_use]
    pub fn probe_deadline(&self) -> Duration {
        self.health_timeout()
            .saturating_add(self.health_backoff())
            .saturating_mul(self.health_attempts)
            .saturating_add(self.ping_timeout())
    }
}

/// Configuration for an optional local `SQLite` database.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DbConfig {
    /// Path to the `SQLite` database file. Relative paths are resolved relative to the config file.
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Whether the local DB is enabled. When false the gateway will act as if
    /// no DB is configured even if this table exists in the config file.
    #[serde(default = "do_db_enable")]
    pub enable: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            enable: do_db_enable(),
        }
    }
}

fn default_db_path() -> String {
    "./hall.db".to_string()
}

const fn do_db_enable() -> bool {
    true
}

/// Wake policy families.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    AlwaysOn,
    Scheduled,
    OnDemand,
}

/// One `[[domains]]` entry.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawDomain {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    /// IP address or hostname of the managed host.
    pub host_address: String,
    /// MAC address the magic packet targets.
    pub hardware_address: String,
    pub policy: PolicyKind,
    #[serde(default)]
    pub schedule: Vec<RawWindow>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_wake_timeout_seconds")]
    pub wake_timeout_seconds: u64,
    #[serde(default = "default_idle_shutdown_minutes")]
    pub idle_shutdown_minutes: u64,
    /// Overrides `[engine] boot_timeout_seconds`.
    #[serde(default)]
    pub boot_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default)]
    pub health_check_accept_invalid_certs: bool,
    pub redirect_url: String,
    #[serde(default)]
    pub allowlist: Vec<String>,
    /// When false the gateway never sends a wake signal for this domain.
    #[serde(default = "do_wake_enable")]
    pub wake_enabled: bool,
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,
    #[serde(default = "default_wake_port")]
    pub wake_port: u16,
    /// Probe reachability with a TCP connect to this port instead of an ICMP ping.
    #[serde(default)]
    pub probe_port: Option<u16>,
    #[serde(default)]
    pub shutdown: Option<ShutdownTarget>,
}

/// One schedule window, e.g. `{ days = ["mon", "fri"], start = "22:00", end = "06:00" }`.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawWindow {
    /// Weekdays the window starts on. Empty means every day.
    #[serde(default)]
    pub days: Vec<String>,
    pub start: String,
    pub end: String,
}

/// Where the idle signal of a domain is delivered.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ShutdownTarget {
    /// UDP port of the shutdown listener on the managed host.
    #[serde(default = "default_shutdown_port")]
    pub port: u16,
    /// When set, the idle signal is HMAC-signed with this secret.
    #[serde(default)]
    pub shared_secret: Option<Arc<SecretString>>,
}

impl PartialEq for ShutdownTarget {
    fn eq(&self, other: &Self) -> bool {
        use secrecy::ExposeSecret as _;
        self.port == other.port
            && match (&self.shared_secret, &other.shared_secret) {
                (&Some(ref s1), &Some(ref s2)) => s1.expose_secret() == s2.expose_secret(),
                (&None, &None) => true,
                _ => false,
            }
    }
}

impl Eq for ShutdownTarget {}

fn default_timezone() -> String {
    "UTC".to_string()
}

const fn default_wake_timeout_seconds() -> u64 {
    120
}

const fn default_idle_shutdown_minutes() -> u64 {
    20
}

const fn do_wake_enable() -> bool {
    true
}

fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}

const fn default_wake_port() -> u16 {
    hall_common::DEFAULT_WAKE_PORT
}

const fn default_shutdown_port() -> u16 {
    5005
}
