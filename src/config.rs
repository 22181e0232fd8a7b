//! Configuration for the apply engine.
//!
//! Configuration is an immutable struct constructed once at startup and
//! passed into the components that need it — there is no process-global
//! state. It can be built programmatically, deserialized from TOML, or
//! loaded from a file with [`ApplyConfig::from_toml_file`].
//!
//! # TOML Example
//!
//! ```toml
//! [base]
//! zone_id = 1
//! node = "node1"
//! server_id = 9001
//!
//! [base.meta_service]
//! wait_timeout = 30
//!
//! [[base.meta_service.servers]]
//! host = "meta-1.internal"
//! port = 7380
//!
//! [base.bus]
//! bootstrap_servers = ["broker-1:9092", "broker-2:9092"]
//! topic = "zone-changes"
//! group_id = "apply-zone-1"
//! ```
//!
//! # Zone id precedence
//!
//! The effective zone id is resolved as: explicit override (CLI) >
//! config file > `ZONE_APPLY_ZONE_ID` environment variable.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ApplyError, Result};

/// Environment variable consulted when neither the override nor the config
/// file carries a zone id.
pub const ZONE_ID_ENV: &str = "ZONE_APPLY_ZONE_ID";

/// Top-level configuration passed to `ApplyEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// The zone this process applies into.
    #[serde(default)]
    pub zone_id: u32,

    /// Name of the database node this process writes to.
    pub node: String,

    /// Server id used by the capture side when connecting as a replica.
    pub server_id: u32,

    /// Central configuration service endpoints.
    #[serde(default)]
    pub meta_service: MetaServiceConfig,

    /// Message bus connection parameters.
    #[serde(default)]
    pub bus: BusConfig,
}

impl ApplyConfig {
    /// Minimal config for tests.
    pub fn for_testing(zone_id: u32, node: &str) -> Self {
        Self {
            zone_id,
            node: node.to_string(),
            server_id: 9001,
            meta_service: MetaServiceConfig::default(),
            bus: BusConfig::default(),
        }
    }

    /// Load from a TOML file.
    ///
    /// `zone_id_override` is the explicit (CLI) zone id; pass 0 for none.
    pub fn from_toml_file(path: impl AsRef<Path>, zone_id_override: u32) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ApplyError::Config(format!(
                "cannot read config file [{}]: {e}",
                path.as_ref().display()
            ))
        })?;
        let file: ConfigFile = toml::from_str(&text)
            .map_err(|e| ApplyError::Config(format!("config file is invalid: {e}")))?;
        let mut config = file.base;
        config.zone_id = resolve_zone_id(zone_id_override, config.zone_id);
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.node.is_empty() {
            return Err(ApplyError::Config("node name is empty".to_string()));
        }
        if self.zone_id == 0 {
            return Err(ApplyError::Config(
                "zone id is unset (flag, config file or environment)".to_string(),
            ));
        }
        Ok(())
    }
}

/// The file form wraps everything under a `[base]` table.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    base: ApplyConfig,
}

fn resolve_zone_id(explicit: u32, from_file: u32) -> u32 {
    if explicit != 0 {
        return explicit;
    }
    if from_file != 0 {
        return from_file;
    }
    std::env::var(ZONE_ID_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Endpoints of the central configuration service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaServiceConfig {
    #[serde(default)]
    pub servers: Vec<MetaServerConfig>,

    /// Seconds to wait for the service before giving up.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout: u64,
}

impl Default for MetaServiceConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            wait_timeout: 30,
        }
    }
}

/// One configuration service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaServerConfig {
    pub host: String,
    pub port: u16,
}

fn default_wait_timeout() -> u64 {
    30
}

/// Message bus connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub bootstrap_servers: Vec<String>,

    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default)]
    pub group_id: String,

    #[serde(default)]
    pub client_id: String,

    /// Consumer offset auto-commit interval (milliseconds).
    #[serde(default = "default_auto_commit_interval_ms")]
    pub auto_commit_interval_ms: u64,

    /// Producer send timeout as a duration string (e.g. "5s").
    #[serde(default = "default_send_timeout")]
    pub send_timeout: String,
}

fn default_topic() -> String {
    "zone-changes".to_string()
}

fn default_auto_commit_interval_ms() -> u64 {
    5000
}

fn default_send_timeout() -> String {
    "5s".to_string()
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: Vec::new(),
            topic: "zone-changes".to_string(),
            group_id: String::new(),
            client_id: String::new(),
            auto_commit_interval_ms: 5000,
            send_timeout: "5s".to_string(),
        }
    }
}

impl BusConfig {
    /// Parse `send_timeout` to a Duration.
    pub fn send_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.send_timeout).unwrap_or(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_for_testing_config() {
        let config = ApplyConfig::for_testing(1, "node1");
        assert_eq!(config.zone_id, 1);
        assert_eq!(config.node, "node1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_node() {
        let config = ApplyConfig::for_testing(1, "");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_zone() {
        let config = ApplyConfig::for_testing(0, "node1");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bus_config_defaults() {
        let bus = BusConfig::default();
        assert_eq!(bus.topic, "zone-changes");
        assert_eq!(bus.auto_commit_interval_ms, 5000);
        assert_eq!(bus.send_timeout_duration(), Duration::from_secs(5));
    }

    #[test]
    fn test_bus_send_timeout_parsing() {
        let bus = BusConfig {
            send_timeout: "250ms".to_string(),
            ..Default::default()
        };
        assert_eq!(bus.send_timeout_duration(), Duration::from_millis(250));

        let bus = BusConfig {
            send_timeout: "garbage".to_string(),
            ..Default::default()
        };
        assert_eq!(bus.send_timeout_duration(), Duration::from_secs(5));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = ApplyConfig::for_testing(3, "node7");
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ApplyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.zone_id, 3);
        assert_eq!(parsed.node, "node7");
        assert_eq!(parsed.server_id, 9001);
    }

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_from_toml_file() {
        let file = write_config(
            r#"
            [base]
            zone_id = 2
            node = "node1"
            server_id = 9001

            [base.meta_service]
            wait_timeout = 10

            [[base.meta_service.servers]]
            host = "meta-1"
            port = 7380

            [base.bus]
            bootstrap_servers = ["broker-1:9092"]
            topic = "changes"
            group_id = "apply-2"
            "#,
        );
        let config = ApplyConfig::from_toml_file(file.path(), 0).unwrap();
        assert_eq!(config.zone_id, 2);
        assert_eq!(config.node, "node1");
        assert_eq!(config.meta_service.wait_timeout, 10);
        assert_eq!(config.meta_service.servers.len(), 1);
        assert_eq!(config.meta_service.servers[0].port, 7380);
        assert_eq!(config.bus.topic, "changes");
    }

    #[test]
    fn test_from_toml_file_explicit_zone_wins() {
        let file = write_config(
            r#"
            [base]
            zone_id = 2
            node = "node1"
            server_id = 9001
            "#,
        );
        let config = ApplyConfig::from_toml_file(file.path(), 7).unwrap();
        assert_eq!(config.zone_id, 7);
    }

    #[test]
    fn test_from_toml_file_missing_required_field() {
        let file = write_config(
            r#"
            [base]
            zone_id = 2
            node = "node1"
            "#,
        );
        // server_id is required.
        assert!(ApplyConfig::from_toml_file(file.path(), 0).is_err());
    }

    #[test]
    fn test_from_toml_file_not_found() {
        assert!(ApplyConfig::from_toml_file("/definitely/not/here.toml", 0).is_err());
    }

    #[test]
    fn test_from_toml_file_invalid_toml() {
        let file = write_config("base = not toml at all [");
        assert!(ApplyConfig::from_toml_file(file.path(), 0).is_err());
    }
}
