use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::discovery::DiscoverySettings;
use crate::error::{Result, WardenError};
use crate::forker::ForkerTimings;
use crate::lifecycle::FailurePolicy;
use crate::types::{IsolateDescription, LocalIsolate, MONITOR_PREFIX};

fn default_uid() -> String {
    format!("{}-{}", MONITOR_PREFIX, Uuid::new_v4())
}

fn default_node() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_signal_port() -> u16 {
    8080
}

fn default_transport_timeout_ms() -> u64 {
    5000
}

fn default_ready_ttl_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForkerSettings {
    #[serde(default = "ForkerSettings::default_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "ForkerSettings::default_scan_period_ms")]
    pub scan_period_ms: u64,
    #[serde(default = "ForkerSettings::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl ForkerSettings {
    fn default_ttl_ms() -> u64 {
        5000
    }

    fn default_scan_period_ms() -> u64 {
        1000
    }

    fn default_request_timeout_ms() -> u64 {
        1000
    }
}

impl Default for ForkerSettings {
    fn default() -> Self {
        Self {
            ttl_ms: Self::default_ttl_ms(),
            scan_period_ms: Self::default_scan_period_ms(),
            request_timeout_ms: Self::default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailureSettings {
    #[serde(default = "FailureSettings::default_max_tries")]
    pub max_tries_per_streak: u32,
    #[serde(default = "FailureSettings::default_wait_in_streak_ms")]
    pub wait_in_streak_ms: u64,
    #[serde(default = "FailureSettings::default_wait_between_streaks_ms")]
    pub wait_between_streaks_ms: u64,
}

impl FailureSettings {
    fn default_max_tries() -> u32 {
        3
    }

    fn default_wait_in_streak_ms() -> u64 {
        1000
    }

    fn default_wait_between_streaks_ms() -> u64 {
        5000
    }
}

impl Default for FailureSettings {
    fn default() -> Self {
        Self {
            max_tries_per_streak: Self::default_max_tries(),
            wait_in_streak_ms: Self::default_wait_in_streak_ms(),
            wait_between_streaks_ms: Self::default_wait_between_streaks_ms(),
        }
    }
}

/// Settings of a monitor process, read from TOML and the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_uid")]
    pub uid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_node")]
    pub node: String,
    #[serde(default = "default_signal_port")]
    pub signal_port: u16,
    /// Port of the isolate to pull the initial directory from.
    #[serde(default)]
    pub dumper_port: Option<u16>,
    #[serde(default = "default_transport_timeout_ms")]
    pub transport_timeout_ms: u64,
    /// How long deferred sends wait for the transport to be ready.
    #[serde(default = "default_ready_ttl_ms")]
    pub ready_ttl_ms: u64,
    #[serde(default)]
    pub forkers: ForkerSettings,
    #[serde(default)]
    pub failure: FailureSettings,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub isolates: Vec<IsolateDescription>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uid: default_uid(),
            name: None,
            node: default_node(),
            signal_port: default_signal_port(),
            dumper_port: None,
            transport_timeout_ms: default_transport_timeout_ms(),
            ready_ttl_ms: default_ready_ttl_ms(),
            forkers: ForkerSettings::default(),
            failure: FailureSettings::default(),
            discovery: DiscoverySettings::default(),
            isolates: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| WardenError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| WardenError::Config(format!("{}: {}", path.display(), e)))?;
        config.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `WARDEN_*` overrides looked up through `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(uid) = lookup("WARDEN_ISOLATE_UID") {
            self.uid = uid;
        }
        if let Some(name) = lookup("WARDEN_ISOLATE_NAME") {
            self.name = Some(name);
        }
        if let Some(node) = lookup("WARDEN_NODE") {
            self.node = node;
        }
        if let Some(port) = lookup("WARDEN_SIGNAL_PORT") {
            self.signal_port = parse("WARDEN_SIGNAL_PORT", &port)?;
        }
        if let Some(port) = lookup("WARDEN_DUMPER_PORT") {
            self.dumper_port = Some(parse("WARDEN_DUMPER_PORT", &port)?);
        }
        if let Some(timeout) = lookup("WARDEN_TRANSPORT_TIMEOUT_MS") {
            self.transport_timeout_ms = parse("WARDEN_TRANSPORT_TIMEOUT_MS", &timeout)?;
        }
        if let Some(enabled) = lookup("WARDEN_MULTICAST_ENABLED") {
            self.discovery.enabled = parse("WARDEN_MULTICAST_ENABLED", &enabled)?;
        }
        if let Some(emit) = lookup("WARDEN_MULTICAST_EMIT") {
            self.discovery.emit = parse("WARDEN_MULTICAST_EMIT", &emit)?;
        }
        if let Some(group) = lookup("WARDEN_MULTICAST_GROUP") {
            self.discovery.group = parse("WARDEN_MULTICAST_GROUP", &group)?;
        }
        if let Some(port) = lookup("WARDEN_MULTICAST_PORT") {
            self.discovery.port = parse("WARDEN_MULTICAST_PORT", &port)?;
        }
        if let Some(app_id) = lookup("WARDEN_APP_ID") {
            self.discovery.app_id = app_id;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.uid.is_empty() {
            return Err(WardenError::Config("isolate uid is empty".to_string()));
        }
        if self.node.is_empty() {
            return Err(WardenError::Config("node name is empty".to_string()));
        }
        Ok(())
    }

    pub fn local_isolate(&self) -> LocalIsolate {
        let local = LocalIsolate::new(self.uid.as_str(), self.node.as_str(), self.signal_port);
        match &self.name {
            Some(name) => local.with_name(name.as_str()),
            None => local,
        }
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }

    pub fn ready_ttl(&self) -> Duration {
        Duration::from_millis(self.ready_ttl_ms)
    }

    pub fn forker_timings(&self) -> ForkerTimings {
        ForkerTimings {
            ttl: Duration::from_millis(self.forkers.ttl_ms),
            scan_period: Duration::from_millis(self.forkers.scan_period_ms),
            request_timeout: Duration::from_millis(self.forkers.request_timeout_ms),
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy {
            max_tries_per_streak: self.failure.max_tries_per_streak,
            wait_in_streak: Duration::from_millis(self.failure.wait_in_streak_ms),
            wait_between_streaks: Duration::from_millis(self.failure.wait_between_streaks_ms),
        }
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| WardenError::Config(format!("{}={}: {}", key, value, e)))
}
