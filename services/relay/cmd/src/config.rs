//! Configuration handling for the relay listener.
//!
//! Values come from the shared YAML config file (`services.relay.config`),
//! then `RELAY_*` environment variables, then command line flags.

use anyhow::{bail, Result};
use relay_session::{check_period, SessionConfig, SocketConfig};
use relay_storage::BackendMode;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Which lock and pub/sub backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process backends
    Memory,
    /// Redis server
    Redis,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(BackendKind::Memory),
            "redis" => Ok(BackendKind::Redis),
            other => bail!("unknown backend '{}', expected memory or redis", other),
        }
    }
}

/// Relay listener configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// HTTP listen address
    pub listen: SocketAddr,
    /// Backend selection
    pub backend: BackendKind,
    /// Redis address, `host:port` or a `redis://` URL
    pub redis_addr: String,
    /// Take a lock per session key
    pub locking: bool,
    /// Lock TTL
    pub lock_ttl: Duration,
    /// Socket idle timeout
    pub idle_timeout: Duration,
    /// Bound on the shutdown drain wait
    pub drain_timeout: Duration,
    /// Largest accepted websocket message
    pub max_message_size: usize,
    /// Publish client frames to `key + suffix`
    pub reply_suffix: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            backend: BackendKind::Memory,
            redis_addr: "127.0.0.1:6379".to_string(),
            locking: true,
            lock_ttl: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
            max_message_size: 512,
            reply_suffix: None,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    relay: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    config: Option<HashMap<String, String>>,
}

impl RelayConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)?;
                if let Some(values) = root.services.and_then(|s| s.relay).and_then(|r| r.config) {
                    for (key, value) in values {
                        config.apply_value(&key, &value)?;
                    }
                }
                info!("Loaded configuration from {:?}", config_path.as_ref());
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", config_path.as_ref());
            }
        }

        config.apply_environment_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that only fail once sessions start
    pub fn validate(&self) -> Result<()> {
        if self.max_message_size == 0 {
            bail!("max_message_size must be at least 1");
        }
        self.session_config().validate()?;
        Ok(())
    }

    /// Set one `services.relay.*` value
    fn apply_value(&mut self, key: &str, value: &str) -> Result<()> {
        let Some(name) = key.strip_prefix("services.relay.") else {
            return Ok(());
        };

        match name {
            "listen" => self.listen = value.parse()?,
            "backend" => self.backend = value.parse()?,
            "redis_addr" => self.redis_addr = value.to_string(),
            "locking" => self.locking = parse_bool(value)?,
            "lock_ttl" => self.lock_ttl = parse_period("lock_ttl", value)?,
            "idle_timeout" => self.idle_timeout = parse_period("idle_timeout", value)?,
            "drain_timeout" => self.drain_timeout = humantime::parse_duration(value)?,
            "max_message_size" => self.max_message_size = value.parse()?,
            "reply_suffix" => self.reply_suffix = Some(value.to_string()).filter(|s| !s.is_empty()),
            _ => warn!("Ignoring unknown configuration key {}", key),
        }
        Ok(())
    }

    /// Apply `RELAY_<NAME>` overrides, e.g. `RELAY_LOCK_TTL=30s`
    fn apply_environment_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        const NAMES: &[&str] = &[
            "listen",
            "backend",
            "redis_addr",
            "locking",
            "lock_ttl",
            "idle_timeout",
            "drain_timeout",
            "max_message_size",
            "reply_suffix",
        ];

        for name in NAMES {
            let var = format!("RELAY_{}", name.to_ascii_uppercase());
            if let Some(value) = lookup(&var) {
                self.apply_value(&format!("services.relay.{}", name), &value)?;
                info!("{} overridden by environment: {}", name, value);
            }
        }
        Ok(())
    }

    /// Backend selection for [`Backends::from_mode`](relay_storage::Backends::from_mode)
    pub fn backend_mode(&self) -> BackendMode {
        match self.backend {
            BackendKind::Memory => BackendMode::InMemory,
            BackendKind::Redis => {
                let url = if self.redis_addr.starts_with("redis://") {
                    self.redis_addr.clone()
                } else {
                    format!("redis://{}", self.redis_addr)
                };
                BackendMode::Redis { url }
            }
        }
    }

    /// Per-session settings
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            lock_ttl: self.lock_ttl,
            reply_suffix: self.reply_suffix.clone(),
            socket: SocketConfig::with_idle_timeout(self.idle_timeout),
            ..SessionConfig::default()
        }
    }
}

fn parse_period(name: &'static str, value: &str) -> Result<Duration> {
    Ok(check_period(name, humantime::parse_duration(value)?)?)
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => bail!("invalid boolean '{}'", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.listen, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.backend, BackendKind::Memory);
        assert!(config.locking);
        assert_eq!(config.lock_ttl, Duration::from_secs(10));
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
        assert_eq!(config.max_message_size, 512);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
services:
  relay:
    enabled: true
    executable: ./redb-relay
    config:
      services.relay.listen: "127.0.0.1:9090"
      services.relay.backend: "redis"
      services.relay.redis_addr: "redis.internal:6380"
      services.relay.lock_ttl: "30s"
      services.relay.locking: "false"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = RelayConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.listen, "127.0.0.1:9090".parse().unwrap());
        assert_eq!(config.backend, BackendKind::Redis);
        assert_eq!(config.lock_ttl, Duration::from_secs(30));
        assert!(!config.locking);
        match config.backend_mode() {
            BackendMode::Redis { url } => assert_eq!(url, "redis://redis.internal:6380"),
            other => panic!("expected redis, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.backend, RelayConfig::default().backend);
    }

    #[test]
    fn test_environment_overrides() {
        let mut config = RelayConfig::default();
        let env: HashMap<&str, &str> = [("RELAY_IDLE_TIMEOUT", "20s"), ("RELAY_REPLY_SUFFIX", ":reply")]
            .into_iter()
            .collect();

        config
            .apply_environment_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.idle_timeout, Duration::from_secs(20));
        let session = config.session_config();
        assert_eq!(session.socket.ping_period, Duration::from_secs(18));
        assert_eq!(session.publish_topic("room-42"), "room-42:reply");
    }

    #[test]
    fn test_bad_value_is_an_error() {
        let mut config = RelayConfig::default();
        assert!(config.apply_value("services.relay.backend", "etcd").is_err());
        assert!(config.apply_value("services.relay.lock_ttl", "soon").is_err());
    }

    #[test]
    fn test_zero_durations_are_rejected() {
        let mut config = RelayConfig::default();
        assert!(config.apply_value("services.relay.lock_ttl", "0s").is_err());
        assert!(config.apply_value("services.relay.idle_timeout", "0s").is_err());
        assert!(config.apply_value("services.relay.lock_ttl", "100years").is_err());
        assert_eq!(config.lock_ttl, Duration::from_secs(10));

        let yaml_content = r#"
services:
  relay:
    config:
      services.relay.lock_ttl: "0s"
"#;
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();
        assert!(RelayConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(RelayConfig::default().validate().is_ok());

        let config = RelayConfig {
            idle_timeout: Duration::ZERO,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            max_message_size: 0,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
