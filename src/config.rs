use crate::target::{BackendTarget, TargetError};
use hyper::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "MIRRORGATE_";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Primary backend: responses from here are returned to clients
    #[serde(default)]
    pub primary: PrimaryConfig,

    /// Mirror backend: receives a copy of each request, response discarded
    #[serde(default)]
    pub mirror: MirrorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port the proxy listens on (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Log level: trace, debug, info, warn or error (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Write logs to this file instead of stderr
    pub log_file: Option<String>,

    /// Maximum idle connections to the primary backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            log_level: default_log_level(),
            log_file: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// A statically configured header, applied to every request on one leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: String,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Parse a `Key=Value` pair. Returns `None` when there is no `=`.
    pub fn parse_pair(pair: &str) -> Option<Self> {
        let (key, value) = pair.split_once('=')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        Some(Self::new(key, value))
    }

    /// Parse a comma-separated list of `Key=Value` pairs
    pub fn parse_list(list: &str) -> Vec<Self> {
        list.split(',').filter_map(Self::parse_pair).collect()
    }

    fn validate(&self) -> Result<(), String> {
        if HeaderName::from_bytes(self.key.as_bytes()).is_err() {
            return Err(format!("invalid header name '{}'", self.key));
        }
        if HeaderValue::from_str(&self.value).is_err() {
            return Err(format!("invalid value for header '{}'", self.key));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawHeader {
    Table { key: String, value: String },
    Pair(String),
}

/// Headers may be written as `{ key = "X", value = "y" }` or as `"X=y"`
fn deserialize_headers<'de, D>(deserializer: D) -> Result<Vec<Header>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<RawHeader>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|h| match h {
            RawHeader::Table { key, value } => Some(Header::new(key, value)),
            RawHeader::Pair(pair) => Header::parse_pair(&pair),
        })
        .collect())
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PrimaryConfig {
    /// Base URL of the primary backend (required)
    #[serde(default)]
    pub url: String,

    /// Headers set on every primary request
    #[serde(default, deserialize_with = "deserialize_headers")]
    pub headers: Vec<Header>,

    /// Copy the client's headers onto the mirrored request
    #[serde(default, alias = "do-mirror-headers")]
    pub do_mirror_headers: bool,

    /// Copy the client's body onto the mirrored request
    #[serde(default, alias = "do-mirror-body")]
    pub do_mirror_body: bool,

    /// Resolve the primary host through container metadata
    #[serde(default, alias = "docker-lookup-config")]
    pub docker_lookup: DockerLookupConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MirrorConfig {
    /// Base URL of the mirror backend; mirroring is disabled when unset
    pub url: Option<String>,

    /// Headers set on every mirrored request
    #[serde(default, deserialize_with = "deserialize_headers")]
    pub headers: Vec<Header>,
}

impl MirrorConfig {
    pub fn enabled(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

/// What happens to hosts that no running container claims after a rescan
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StaleEntries {
    /// Keep the last known address until a container claims the host again
    #[default]
    Keep,
    /// Drop the host after a complete rescan that did not see it
    Evict,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerLookupConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Environment variable whose value names the host a container serves
    #[serde(default = "default_host_identifier", alias = "host-identifier")]
    pub host_identifier: String,

    /// Docker endpoint (unix:// or tcp://); auto-detected when unset
    pub docker_host: Option<String>,

    /// Delay before the bootstrap rescan in milliseconds (default: 500)
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Quiet period after the last container event before rescanning (default: 500)
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    #[serde(default)]
    pub stale_entries: StaleEntries,
}

impl DockerLookupConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for DockerLookupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host_identifier: default_host_identifier(),
            docker_host: None,
            settle_delay_ms: default_settle_delay(),
            debounce_ms: default_debounce(),
            stale_entries: StaleEntries::default(),
        }
    }
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_host_identifier() -> String {
    "VIRTUAL_HOST".to_string()
}

fn default_settle_delay() -> u64 {
    500
}

fn default_debounce() -> u64 {
    500
}

impl Config {
    /// Load from `path` (if it exists), apply environment overrides, validate
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Like [`Config::load`] with a custom environment lookup
    pub fn load_with<P, F>(path: P, env: F) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };
        config.apply_overrides(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MIRRORGATE_*` overrides on top of file values
    pub fn apply_overrides<F>(&mut self, env: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| env(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.is_empty());

        if let Some(port) = var("PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid {}PORT '{}': {}", ENV_PREFIX, port, e))?;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.server.log_level = level;
        }
        if let Some(url) = var("PRIMARY_URL") {
            self.primary.url = url;
        }
        if let Some(url) = var("MIRROR_URL") {
            self.mirror.url = Some(url);
        }
        if let Some(headers) = var("PRIMARY_HEADERS") {
            self.primary.headers.extend(Header::parse_list(&headers));
        }
        if let Some(headers) = var("MIRROR_HEADERS") {
            self.mirror.headers.extend(Header::parse_list(&headers));
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.primary.url.trim().is_empty() {
            errors.push("primary.url is required".to_string());
        } else {
            match BackendTarget::parse(&self.primary.url) {
                Ok(target) if target.scheme() != "http" => errors.push(format!(
                    "primary.url '{}' must use http:// (TLS to the primary is not supported)",
                    self.primary.url
                )),
                Ok(_) => {}
                Err(e) => errors.push(format!("primary.url: {}", e)),
            }
        }

        if self.mirror.enabled() {
            if let Some(url) = &self.mirror.url {
                if let Err(e) = BackendTarget::parse(url) {
                    errors.push(format!("mirror.url: {}", e));
                }
            }
        } else if self.primary.do_mirror_body || self.primary.do_mirror_headers {
            errors.push(
                "mirror.url is required when do_mirror_body or do_mirror_headers is set".to_string(),
            );
        }

        for header in self.primary.headers.iter().chain(self.mirror.headers.iter()) {
            if let Err(e) = header.validate() {
                errors.push(e);
            }
        }

        let lookup = &self.primary.docker_lookup;
        if lookup.enabled && lookup.host_identifier.trim().is_empty() {
            errors.push("docker_lookup.host_identifier must not be empty".to_string());
        }

        if !LOG_LEVELS.contains(&self.server.log_level.to_lowercase().as_str()) {
            errors.push(format!(
                "server.log_level '{}' is not one of {}",
                self.server.log_level,
                LOG_LEVELS.join(", ")
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Parsed primary target. Only valid after [`Config::validate`].
    pub fn primary_target(&self) -> Result<BackendTarget, TargetError> {
        BackendTarget::parse(&self.primary.url)
    }

    /// Parsed mirror target, `None` when mirroring is disabled
    pub fn mirror_target(&self) -> Result<Option<BackendTarget>, TargetError> {
        match &self.mirror.url {
            Some(url) if self.mirror.enabled() => BackendTarget::parse(url).map(Some),
            _ => Ok(None),
        }
    }
}
