// ABOUTME: Configuration for the coven-tools supervisor.
// ABOUTME: Loaded from TOML with env expansion, sensible defaults, and MCP_* overrides.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub ports: PortsConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub restart: RestartConfig,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Rest,
    File,
}

/// Where desired tool state comes from.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    /// Base URL of the REST store (e.g. "https://project.supabase.co")
    #[serde(default)]
    pub url: String,

    /// Service key sent as `apikey` and bearer token.
    #[serde(default)]
    pub key: String,

    #[serde(default = "default_read_table")]
    pub read_table: String,

    #[serde(default = "default_write_table")]
    pub write_table: String,

    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,

    /// JSON file holding tool records (file store only)
    #[serde(default)]
    pub path: Option<String>,
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("kind", &self.kind)
            .field("url", &self.url)
            .field("key", &if self.key.is_empty() { "" } else { "[REDACTED]" })
            .field("read_table", &self.read_table)
            .field("write_table", &self.write_table)
            .field("timeout_secs", &self.timeout_secs)
            .field("path", &self.path)
            .finish()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            url: String::new(),
            key: String::new(),
            read_table: default_read_table(),
            write_table: default_write_table(),
            timeout_secs: default_store_timeout(),
            path: None,
        }
    }
}

fn default_read_table() -> String {
    "tools_with_decrypted_keys".to_string()
}

fn default_write_table() -> String {
    "tools".to_string()
}

fn default_store_timeout() -> u64 {
    30
}

/// Inclusive port range handed out to tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_start_port")]
    pub start: u16,

    #[serde(default = "default_end_port")]
    pub end: u16,

    #[serde(default = "default_used_ports_ttl")]
    pub used_cache_ttl_secs: u64,

    /// Candidates probed before falling back to a sequential scan
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            start: default_start_port(),
            end: default_end_port(),
            used_cache_ttl_secs: default_used_ports_ttl(),
            sample_size: default_sample_size(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_start_port() -> u16 {
    10_000
}

fn default_end_port() -> u16 {
    11_999
}

fn default_used_ports_ttl() -> u64 {
    30
}

fn default_sample_size() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Proxy binary every tool is launched through
    #[serde(default = "default_proxy_binary")]
    pub proxy_binary: String,

    /// Directory for per-tool logs, state file and control socket
    #[serde(default = "default_runner_dir")]
    pub runner_dir: String,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// How long after start a tool's output is written to its log
    #[serde(default = "default_log_capture")]
    pub log_capture_secs: u64,

    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Literal a worker prints once it is ready to serve
    #[serde(default = "default_readiness_marker")]
    pub readiness_marker: String,

    #[serde(default = "default_probe_timeout")]
    pub health_probe_timeout_secs: u64,

    #[serde(default)]
    pub reap_orphans_on_start: bool,

    #[serde(default)]
    pub socket_path: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            proxy_binary: default_proxy_binary(),
            runner_dir: default_runner_dir(),
            check_interval_secs: default_check_interval(),
            cache_ttl_secs: default_cache_ttl(),
            log_capture_secs: default_log_capture(),
            stop_timeout_secs: default_stop_timeout(),
            readiness_marker: default_readiness_marker(),
            health_probe_timeout_secs: default_probe_timeout(),
            reap_orphans_on_start: false,
            socket_path: None,
        }
    }
}

fn default_proxy_binary() -> String {
    "mcp-proxy".to_string()
}

fn default_runner_dir() -> String {
    "~/.local/share/coven/tools".to_string()
}

fn default_check_interval() -> u64 {
    600
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_log_capture() -> u64 {
    60
}

fn default_stop_timeout() -> u64 {
    5
}

fn default_readiness_marker() -> String {
    "Uvicorn running on".to_string()
}

fn default_probe_timeout() -> u64 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Minimum time between two restart attempts of one tool
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Period of the listener-based status check
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,

    /// Company whose env-carrying tools are reported as Predefined
    #[serde(default)]
    pub predefined_company_id: Option<String>,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown(),
            status_interval_secs: default_status_interval(),
            predefined_company_id: None,
        }
    }
}

fn default_cooldown() -> u64 {
    15 * 60
}

fn default_status_interval() -> u64 {
    60
}

impl Config {
    /// Load config from a TOML file, expanding `${VAR}` references first.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config from {}: {}", path.display(), e))
        })?;
        let mut config = Self::parse(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, else the default location, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default = Self::default_path()?;
                if default.exists() {
                    Self::load(&default)
                } else {
                    let mut config = Config::default();
                    config.apply_env_overrides(|key| std::env::var(key).ok());
                    config.validate()?;
                    Ok(config)
                }
            }
        }
    }

    fn parse(content: &str) -> Result<Self> {
        let expanded = shellexpand::env_with_context_no_errors(content, |var: &str| {
            match std::env::var(var) {
                Ok(val) => Some(val),
                Err(_) => {
                    warn!(variable = %var, "Environment variable not defined, using empty string");
                    Some(String::new())
                }
            }
        });
        Ok(toml::from_str(&expanded)?)
    }

    /// Save config to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config file path (~/.config/coven/tools.toml)
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("coven");
        Ok(config_dir.join("tools.toml"))
    }

    /// Apply the environment overrides used by existing deployments.
    ///
    /// Takes a lookup function so tests do not have to touch the process env.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MCP_HOST").filter(|h| !h.is_empty()) {
            self.ports.host = host;
        }
        if let Some(raw) = lookup("MCP_START_PORT") {
            match raw.trim().parse() {
                Ok(port) => self.ports.start = port,
                Err(_) => warn!(value = %raw, "Invalid MCP_START_PORT, keeping {}", self.ports.start),
            }
        }
        if let Some(raw) = lookup("MCP_END_PORT") {
            match raw.trim().parse() {
                Ok(port) => self.ports.end = port,
                Err(_) => warn!(value = %raw, "Invalid MCP_END_PORT, keeping {}", self.ports.end),
            }
        }
        if let Some(raw) = lookup("MCP_CHECK_INTERVAL_MINUTES") {
            match raw.trim().parse::<u64>() {
                Ok(minutes) => self.supervisor.check_interval_secs = minutes * 60,
                Err(_) => warn!(value = %raw, "Invalid MCP_CHECK_INTERVAL_MINUTES, ignoring"),
            }
        }
        if let Some(dir) = lookup("MCP_RUNNER_DIR").filter(|d| !d.is_empty()) {
            self.supervisor.runner_dir = dir;
        }
        if self.store.url.is_empty() {
            if let Some(url) = lookup("SUPABASE_URL") {
                self.store.url = url;
            }
        }
        if self.store.key.is_empty() {
            if let Some(key) = lookup("SUPABASE_KEY") {
                self.store.key = key;
            }
        }
    }

    /// Reject configurations the supervisor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ports.start == 0 {
            return Err(Error::Config("ports.start must be greater than 0".into()));
        }
        if self.ports.start > self.ports.end {
            return Err(Error::Config(format!(
                "ports.start ({}) is greater than ports.end ({})",
                self.ports.start, self.ports.end
            )));
        }
        if self.supervisor.proxy_binary.trim().is_empty() {
            return Err(Error::Config("supervisor.proxy_binary must not be empty".into()));
        }
        if self.supervisor.check_interval_secs == 0 || self.restart.status_interval_secs == 0 {
            return Err(Error::Config("check intervals must be greater than 0".into()));
        }
        if self.store.kind == StoreKind::File && self.store.path.is_none() {
            return Err(Error::Config("store.path is required for the file store".into()));
        }
        Ok(())
    }

    /// Expand ~ in the runner directory path
    pub fn runner_dir(&self) -> PathBuf {
        shellexpand::tilde(&self.supervisor.runner_dir)
            .into_owned()
            .into()
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.runner_dir().join("logs")
    }

    pub fn state_file(&self) -> PathBuf {
        self.runner_dir().join("manager_state.json")
    }

    pub fn socket_path(&self) -> PathBuf {
        match &self.supervisor.socket_path {
            Some(p) => shellexpand::tilde(p).into_owned().into(),
            None => self.runner_dir().join("supervisor.sock"),
        }
    }

    pub fn store_path(&self) -> Option<PathBuf> {
        self.store
            .path
            .as_ref()
            .map(|p| shellexpand::tilde(p).into_owned().into())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor.check_interval_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.restart.status_interval_secs)
    }
}
