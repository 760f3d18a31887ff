//! Agent Configuration: TOML file load plus the environment variable
//! overrides spec.md §6 recognises. Field defaults follow the teacher's
//! free-function-default idiom (`config/config.rs`), extended with an
//! explicit `apply_env_overrides` pass since here the env vars are
//! first-class configuration, not merely a CLI convenience.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Shared handle to the live configuration: `GET/PUT /config` mutate it
/// at runtime, so every component that reads `check_interval`,
/// `label_filter`, etc. reads through this instead of a value snapshotted
/// at startup.
pub type SharedConfig = Arc<RwLock<AgentConfiguration>>;

fn default_check_interval_secs() -> u64 {
    30
}
fn default_update_interval_secs() -> u64 {
    300
}
fn default_cleanup() -> bool {
    true
}
fn default_event_buffer_size() -> usize {
    1024
}
fn default_max_parallel_updates() -> usize {
    1
}
fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".into()
}

fn default_runtime_endpoint() -> String {
    #[cfg(target_os = "windows")]
    {
        "npipe:////./pipe/docker_engine".into()
    }
    #[cfg(not(target_os = "windows"))]
    {
        "unix:///var/run/docker.sock".into()
    }
}

/// The recognised options from spec §3, plus the §6 HTTP bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfiguration {
    /// How often the monitor loop reconciles.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// How often the update engine scans for new image digests.
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,

    /// Whether available updates apply without explicit command.
    #[serde(default)]
    pub auto_update: bool,

    /// Whether replaced images are deleted after a successful update.
    #[serde(default = "default_cleanup")]
    pub cleanup: bool,

    /// If present, only containers whose labels satisfy this predicate are
    /// monitored. Format: `key=value_regex`; the container must carry a
    /// label `key` whose value matches `value_regex`.
    #[serde(default)]
    pub label_filter: Option<String>,

    /// Ring capacity for the in-memory event history.
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    /// Bound on concurrent in-flight update apply procedures.
    #[serde(default = "default_max_parallel_updates")]
    pub max_parallel_updates: usize,

    /// Local endpoint of the container daemon.
    #[serde(default = "default_runtime_endpoint")]
    pub runtime_endpoint: String,

    /// HTTP bind host for the Control Surface.
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP bind port for the Control Surface.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Default tracing filter level when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Shared bearer token the Control Surface compares incoming
    /// `Authorization` headers against. Absent means the auth boundary
    /// collaborator hasn't been wired and every mutation is rejected.
    #[serde(default)]
    pub agent_token: Option<String>,
}

impl Default for AgentConfiguration {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            update_interval_secs: default_update_interval_secs(),
            auto_update: false,
            cleanup: default_cleanup(),
            label_filter: None,
            event_buffer_size: default_event_buffer_size(),
            max_parallel_updates: default_max_parallel_updates(),
            runtime_endpoint: default_runtime_endpoint(),
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            agent_token: None,
        }
    }
}

impl AgentConfiguration {
    /// Load configuration from a TOML file, then layer environment
    /// variable overrides on top. A missing file falls back to defaults
    /// plus env overrides so the agent can run from env vars alone.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {path}"))?;
            toml::from_str(&content).with_context(|| "failed to parse configuration")?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate().map_err(|e| anyhow::anyhow!(e.to_string()))?;
        Ok(config)
    }

    /// Apply the env vars spec §6 recognises. An invalid value is a
    /// startup error (surfaces as exit code 1 via `cmd::root`).
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("CHECK_INTERVAL") {
            self.check_interval_secs = v
                .parse()
                .with_context(|| "CHECK_INTERVAL must be an integer number of seconds")?;
        }
        if let Ok(v) = std::env::var("UPDATE_INTERVAL") {
            self.update_interval_secs = v
                .parse()
                .with_context(|| "UPDATE_INTERVAL must be an integer number of seconds")?;
        }
        if let Ok(v) = std::env::var("AUTO_UPDATE") {
            self.auto_update = parse_bool(&v).with_context(|| "AUTO_UPDATE must be true/false")?;
        }
        if let Ok(v) = std::env::var("CLEANUP") {
            self.cleanup = parse_bool(&v).with_context(|| "CLEANUP must be true/false")?;
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("PORT") {
            self.port = v.parse().with_context(|| "PORT must be a valid u16")?;
        }
        if let Ok(v) = std::env::var("RUNTIME_ENDPOINT") {
            self.runtime_endpoint = v;
        }
        if let Ok(v) = std::env::var("MAX_PARALLEL_UPDATES") {
            self.max_parallel_updates = v
                .parse()
                .with_context(|| "MAX_PARALLEL_UPDATES must be a positive integer")?;
        }
        if let Ok(v) = std::env::var("EVENT_BUFFER_SIZE") {
            self.event_buffer_size = v
                .parse()
                .with_context(|| "EVENT_BUFFER_SIZE must be a positive integer")?;
        }
        if let Ok(v) = std::env::var("AGENT_TOKEN") {
            self.agent_token = Some(v);
        }
        Ok(())
    }

    /// Validation applied on `PUT /config` (and at startup): bounds per
    /// field, surfacing `InvalidConfig` with the offending field named.
    pub fn validate(&self) -> std::result::Result<(), AgentError> {
        if self.check_interval_secs == 0 {
            return Err(AgentError::InvalidConfig("check_interval must be > 0".into()));
        }
        if self.update_interval_secs == 0 {
            return Err(AgentError::InvalidConfig("update_interval must be > 0".into()));
        }
        if self.event_buffer_size == 0 {
            return Err(AgentError::InvalidConfig("event_buffer_size must be > 0".into()));
        }
        if self.max_parallel_updates == 0 {
            return Err(AgentError::InvalidConfig("max_parallel_updates must be > 0".into()));
        }
        if self.port == 0 {
            return Err(AgentError::InvalidConfig("port must be > 0".into()));
        }
        if let Some(filter) = &self.label_filter {
            self.parse_label_filter(filter)
                .map_err(|e| AgentError::InvalidConfig(format!("label_filter: {e}")))?;
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    fn parse_label_filter(&self, filter: &str) -> std::result::Result<(String, Regex), String> {
        let (key, pattern) = filter
            .split_once('=')
            .ok_or_else(|| "expected key=value_regex".to_string())?;
        let re = Regex::new(pattern).map_err(|e| e.to_string())?;
        Ok((key.to_string(), re))
    }

    /// Whether `labels` satisfies the configured `label_filter`. Absent
    /// filter means every container is monitored.
    pub fn matches_label_filter(&self, labels: &std::collections::HashMap<String, String>) -> bool {
        let Some(filter) = &self.label_filter else {
            return true;
        };
        let Ok((key, re)) = self.parse_label_filter(filter) else {
            return true;
        };
        labels.get(&key).map(|v| re.is_match(v)).unwrap_or(false)
    }
}

fn parse_bool(v: &str) -> Result<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow::anyhow!("not a boolean: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AgentConfiguration::default();
        assert_eq!(config.check_interval_secs, 30);
        assert_eq!(config.update_interval_secs, 300);
        assert!(!config.auto_update);
        assert!(config.cleanup);
        assert_eq!(config.event_buffer_size, 1024);
        assert_eq!(config.max_parallel_updates, 1);
    }

    #[test]
    fn env_overrides_apply_and_validate() {
        std::env::set_var("CHECK_INTERVAL", "5");
        std::env::set_var("AUTO_UPDATE", "true");
        let mut config = AgentConfiguration::default();
        config.apply_env_overrides().unwrap();
        assert_eq!(config.check_interval_secs, 5);
        assert!(config.auto_update);
        std::env::remove_var("CHECK_INTERVAL");
        std::env::remove_var("AUTO_UPDATE");
    }

    #[test]
    fn rejects_zero_intervals() {
        let mut config = AgentConfiguration::default();
        config.check_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn label_filter_matches() {
        let mut config = AgentConfiguration::default();
        config.label_filter = Some("app=^web.*".to_string());
        let mut labels = std::collections::HashMap::new();
        labels.insert("app".to_string(), "webserver".to_string());
        assert!(config.matches_label_filter(&labels));
        labels.insert("app".to_string(), "worker".to_string());
        assert!(!config.matches_label_filter(&labels));
    }
}
