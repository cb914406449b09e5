//! Configuration loading utilities for the gateway.
//!
//! This module reads the config file from disk, parses it as TOML or JSON and
//! validates it into an immutable [`ConfigSnapshot`].

use alloc::{collections::BTreeMap, sync::Arc};
use core::net::IpAddr;
use std::{
    io,
    path::{Component, Path, PathBuf},
};

use thiserror::Error as ThisError;
use tokio::fs;

use super::{
    domain::{AllowList, DomainConfig},
    types::{DbConfig, EngineSettings, RawConfig, ServerConfig},
};

/// Reasons a configuration could not be installed.
///
/// None of these are fatal once the gateway runs: the previous snapshot stays active.
#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("failed to read config file at {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid domain '{id}': {reason}")]
    InvalidDomain { id: String, reason: String },
    #[error("duplicate domain id '{0}'")]
    DuplicateDomain(String),
    #[error("invalid [server] section: {0}")]
    InvalidServer(String),
    #[error("invalid [engine] section: {0}")]
    InvalidEngine(String),
}

/// Supported config file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// JSON for `.json` files, TOML for everything else.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Toml,
        }
    }
}

/// Validated `[server]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub port: u16,
    pub bind: IpAddr,
    pub trust_forwarded_for: bool,
    pub admin_allowlist: AllowList,
}

impl ServerSettings {
    fn from_raw(raw: &ServerConfig) -> Result<Self, ConfigError> {
        let bind = raw
            .bind
            .parse()
            .map_err(|e| ConfigError::InvalidServer(format!("bind '{}': {e}", raw.bind)))?;
        let admin_allowlist =
            AllowList::parse(&raw.admin_allowlist).map_err(ConfigError::InvalidServer)?;
        Ok(Self {
            port: raw.port,
            bind,
            trust_forwarded_for: raw.trust_forwarded_for,
            admin_allowlist,
        })
    }
}

/// An immutable, validated configuration.
///
/// Snapshots are only ever replaced as a whole, see [`super::ConfigStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    /// Increases with every installed reload. Freshly loaded snapshots carry 0.
    pub version: u64,
    pub server: ServerSettings,
    pub engine: EngineSettings,
    pub db: Option<DbConfig>,
    pub domains: BTreeMap<String, Arc<DomainConfig>>,
}

impl ConfigSnapshot {
    /// Whether the sections that may change at runtime are equal.
    #[must_use]
    pub fn same_runtime_sections(&self, other: &Self) -> bool {
        self.engine == other.engine && self.domains == other.domains
    }
}

/// Parses config file content without validating it.
pub fn parse(content: &str, format: ConfigFormat) -> Result<RawConfig, ConfigError> {
    match format {
        ConfigFormat::Toml => toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string())),
        ConfigFormat::Json => {
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
        }
    }
}

/// Validates a parsed config into a snapshot with version 0.
pub fn validate(raw: RawConfig) -> Result<ConfigSnapshot, ConfigError> {
    let server = ServerSettings::from_raw(&raw.server)?;

    if raw.engine.wake_max_attempts == 0 {
        return Err(ConfigError::InvalidEngine(
            "wake_max_attempts must be at least 1".to_string(),
        ));
    }
    if raw.engine.health_attempts == 0 {
        return Err(ConfigError::InvalidEngine(
            "health_attempts must be at least 1".to_string(),
        ));
    }
    if raw.engine.tick_interval_ms == 0 {
        return Err(ConfigError::InvalidEngine(
            "tick_interval_ms must be positive".to_string(),
        ));
    }

    let mut domains = BTreeMap::new();
    for raw_domain in raw.domains {
        let id = raw_domain.id.clone();
        let domain = DomainConfig::from_raw(raw_domain).map_err(|reason| {
            ConfigError::InvalidDomain {
                id: id.clone(),
                reason,
            }
        })?;
        if domains.insert(id.clone(), Arc::new(domain)).is_some() {
            return Err(ConfigError::DuplicateDomain(id));
        }
    }

    Ok(ConfigSnapshot {
        version: 0,
        server,
        engine: raw.engine,
        db: raw.db,
        domains,
    })
}

/// Parses and validates TOML config content.
pub fn from_toml_str(content: &str) -> Result<ConfigSnapshot, ConfigError> {
    validate(parse(content, ConfigFormat::Toml)?)
}

/// Reads, parses and validates the config file at `path`.
///
/// # Errors
///
/// Returns an error if the config file cannot be read, parsed or validated.
pub async fn load<P: AsRef<Path>>(path: P) -> Result<ConfigSnapshot, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    validate(parse(&content, ConfigFormat::from_path(path))?)
}

/// Resolves a path to an absolute one.
///
/// If the path is absolute, returns it as-is. If relative, joins it with the
/// config file's parent directory and normalizes the result to remove redundant
/// components like `./`.
pub fn resolve_config_relative_paths(config_path: &Path, relative_path: &str) -> PathBuf {
    let path = Path::new(relative_path);
    let resolved = if path.is_absolute() || relative_path == ":memory:" {
        path.to_path_buf()
    } else {
        config_path
            .parent()
            .map_or_else(|| path.to_path_buf(), |d| d.join(path))
    };

    normalize_path(&resolved)
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        use Component as C;
        match component {
            C::Normal(c) => {
                result.push(c);
            }
            C::ParentDir => {
                result.pop();
            }
            C::CurDir => {}
            C::RootDir | C::Prefix(_) => {
                result.push(component);
            }
        }
    }
    result
}
