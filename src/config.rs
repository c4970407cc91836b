//! Proxy configuration loading and validation.
//!
//! Reads the YAML config file and resolves `${VAR}` references against the
//! process environment. Config is the single source of truth for the static
//! upstream set, per-upstream launch recipes, and environment inheritance
//! defaults.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default per-request timeout when a server spec omits `timeout`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors raised while loading or validating configuration. All of these are
/// fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

impl ConfigError {
    fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}

// ─── Inheritance ─────────────────────────────────────────────────────────────

/// How environment variables are inherited by a spawned upstream.
///
/// `none` and `tier1` are aliases, as are `all` and `tier1+tier2` — both
/// pairs are accepted for config compatibility. `all` never means "inherit
/// the entire parent environment".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum InheritMode {
    #[serde(rename = "none")]
    None,
    #[default]
    #[serde(rename = "tier1")]
    Tier1,
    #[serde(rename = "tier1+tier2")]
    Tier1Tier2,
    #[serde(rename = "all")]
    All,
}

impl InheritMode {
    /// Whether this mode also seeds the Tier 2 (TLS/CA bundle) variables.
    pub fn includes_tier2(self) -> bool {
        matches!(self, Self::Tier1Tier2 | Self::All)
    }
}

/// Controls which parent environment variables a spawned upstream receives.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InheritConfig {
    #[serde(default)]
    pub mode: InheritMode,
    /// Additional variable names to inherit by exact name.
    #[serde(default)]
    pub extra: Vec<String>,
    /// Name prefixes; every parent variable matching one is inherited.
    #[serde(default)]
    pub prefix: Vec<String>,
    /// Variable names that must not be inherited.
    #[serde(default)]
    pub deny: Vec<String>,
    /// When true, names listed in `extra` are admitted even if denied.
    #[serde(default)]
    pub allow_denied_if_explicit: bool,
}

// ─── Server and proxy config ─────────────────────────────────────────────────

/// Launch recipe and identity for one upstream MCP server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub transport: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub inherit: Option<InheritConfig>,
    /// Go-style duration string, e.g. `"30s"` or `"500ms"`.
    #[serde(default)]
    pub timeout: Option<String>,
}

impl ServerConfig {
    /// The per-request timeout for this server, defaulting to 30 s. An
    /// unparseable string also falls back to the default; validation rejects
    /// it at load time, but specs built at runtime never carry one.
    pub fn timeout(&self) -> Duration {
        self.timeout
            .as_deref()
            .and_then(|s| parse_duration(s).ok())
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    /// The effective inheritance config for this server: server-level wins,
    /// then the proxy default, then the hardcoded `tier1` baseline.
    pub fn resolve_inherit(&self, proxy_default: Option<&InheritConfig>) -> InheritConfig {
        if let Some(inherit) = &self.inherit {
            return inherit.clone();
        }
        if let Some(inherit) = proxy_default {
            return inherit.clone();
        }
        InheritConfig::default()
    }
}

/// Proxy-level settings. Surfaced to the aggregator but advisory: only the
/// per-server `timeout` is enforced.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    #[serde(default)]
    pub health_check_interval: String,
    #[serde(default)]
    pub connection_timeout: String,
    #[serde(default)]
    pub max_retries: u32,
}

impl ProxySettings {
    /// Settings with defaults applied (30s / 10s / 3).
    pub fn effective(&self) -> ProxySettings {
        let mut settings = self.clone();
        if settings.health_check_interval.is_empty() {
            settings.health_check_interval = "30s".to_string();
        }
        if settings.connection_timeout.is_empty() {
            settings.connection_timeout = "10s".to_string();
        }
        if settings.max_retries == 0 {
            settings.max_retries = 3;
        }
        settings
    }
}

/// Top-level proxy configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub proxy: ProxySettings,
    /// Proxy-level inheritance defaults, applied to servers without their own.
    #[serde(default)]
    pub inherit: Option<InheritConfig>,
}

impl ProxyConfig {
    /// Load, expand, and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&data)
    }

    /// Parse a configuration from a YAML string.
    pub fn from_str(data: &str) -> Result<Self, ConfigError> {
        let mut cfg: ProxyConfig = serde_yaml::from_str(data)?;
        cfg.expand_env_vars();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Expand `${VAR}` references in command, args, env values, and the
    /// inherit lists. Unset variables expand to the empty string.
    fn expand_env_vars(&mut self) {
        expand_inherit(&mut self.inherit);

        for server in &mut self.servers {
            server.command = expand_env_var(&server.command);
            for arg in &mut server.args {
                *arg = expand_env_var(arg);
            }
            for value in server.env.values_mut() {
                *value = expand_env_var(value);
            }
            expand_inherit(&mut server.inherit);
        }
    }

    /// Validate the configuration. An empty server list is valid: a purely
    /// dynamic proxy starts with no upstreams and grows via `server_add`.
    fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashMap::new();
        let mut prefixes = HashMap::new();

        for (i, server) in self.servers.iter().enumerate() {
            if server.name.is_empty() {
                return Err(ConfigError::invalid(format!("server {i}: name is required")));
            }
            if names.insert(server.name.clone(), ()).is_some() {
                return Err(ConfigError::invalid(format!(
                    "duplicate server name: {}",
                    server.name
                )));
            }

            if server.prefix.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "server {}: prefix is required",
                    server.name
                )));
            }
            if prefixes.insert(server.prefix.clone(), ()).is_some() {
                return Err(ConfigError::invalid(format!(
                    "duplicate server prefix: {}",
                    server.prefix
                )));
            }

            if server.transport != "stdio" {
                return Err(ConfigError::invalid(format!(
                    "server {}: transport must be 'stdio'",
                    server.name
                )));
            }
            if server.command.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "server {}: command is required for stdio transport",
                    server.name
                )));
            }

            if let Some(timeout) = &server.timeout {
                if parse_duration(timeout).is_err() {
                    return Err(ConfigError::invalid(format!(
                        "server {}: invalid timeout format: '{timeout}'",
                        server.name
                    )));
                }
            }
        }

        for field in [
            &self.proxy.health_check_interval,
            &self.proxy.connection_timeout,
        ] {
            if !field.is_empty() && parse_duration(field).is_err() {
                return Err(ConfigError::invalid(format!(
                    "invalid duration format: '{field}'"
                )));
            }
        }

        Ok(())
    }
}

fn expand_inherit(inherit: &mut Option<InheritConfig>) {
    let Some(inherit) = inherit else { return };
    for list in [&mut inherit.extra, &mut inherit.prefix, &mut inherit.deny] {
        for entry in list.iter_mut() {
            *entry = expand_env_var(entry);
        }
    }
}

/// Expand `${VAR}` references in a single value. Values without `${` pass
/// through untouched.
fn expand_env_var(value: &str) -> String {
    if !value.contains("${") {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                // Unterminated reference, keep the literal text
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

// ─── Duration Parsing ────────────────────────────────────────────────────────

/// Parse a Go-style duration string: one or more `<number><unit>` segments,
/// where unit is one of `ns`, `us`, `ms`, `s`, `m`, `h` and the number may
/// carry a fraction (`"1.5s"`, `"1m30s"`, `"100ms"`).
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::invalid(format!("invalid duration: '{s}'"));

    if s.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let (unit_len, nanos_per_unit) = if rest.starts_with("ns") {
            (2, 1.0)
        } else if rest.starts_with("us") || rest.starts_with("µs") {
            (if rest.starts_with("µs") { "µs".len() } else { 2 }, 1e3)
        } else if rest.starts_with("ms") {
            (2, 1e6)
        } else if rest.starts_with('s') {
            (1, 1e9)
        } else if rest.starts_with('m') {
            (1, 60.0 * 1e9)
        } else if rest.starts_with('h') {
            (1, 3600.0 * 1e9)
        } else {
            return Err(invalid());
        };
        rest = &rest[unit_len..];

        total += Duration::from_nanos((value * nanos_per_unit) as u64);
    }

    Ok(total)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
