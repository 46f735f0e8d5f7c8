//! YAML configuration (§6.1). Every struct denies unknown fields so a typo in the config file
//! fails fast at startup rather than silently no-opping, the way the reference stack's job-spec
//! structs do.

use anyhow::Context;
use bridge_core::MappingEntry;
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const SUPPORTED_SCHEMA_VERSIONS: std::ops::RangeInclusive<u32> = 1..=1;

#[derive(Parser, Debug, Clone)]
#[command(name = "bridge")]
#[command(about = "MQTT <-> OPC-UA telemetry bridge", long_about = None)]
pub struct Cli {
    /// Path to the bridge's YAML configuration file.
    #[arg(long, env = "BRIDGE_CONFIG", default_value = "bridge.yaml")]
    pub config: PathBuf,

    /// Overrides `buffer.db_path` from the config file.
    #[arg(long, env = "BRIDGE_DB_PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub mqtt: MqttConfig,
    pub opcua: OpcuaConfig,
    pub buffer: BufferConfig,
    #[serde(default)]
    pub mappings: Vec<MappingEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default)]
    pub tls_enabled: bool,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

fn default_qos() -> u8 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpcuaConfig {
    pub endpoint: String,
    pub server_name: String,
    pub namespace: u16,
    pub security_policy: String,
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    #[serde(default)]
    pub allow_anonymous: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_max_size")]
    pub max_size: i64,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_lease_duration_s")]
    pub lease_duration_s: u64,
    #[serde(default = "default_per_message_timeout_s")]
    pub per_message_timeout_s: u64,
    #[serde(default = "default_cleanup_interval_s")]
    pub cleanup_interval_s: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_message_ttl_minutes")]
    pub message_ttl_minutes: f64,
    #[serde(default = "default_base_backoff_s")]
    pub base_backoff_s: u64,
    #[serde(default = "default_max_backoff_s")]
    pub max_backoff_s: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("buffer.db")
}
fn default_max_size() -> i64 {
    100_000
}
fn default_worker_threads() -> usize {
    2
}
fn default_lease_duration_s() -> u64 {
    60
}
fn default_per_message_timeout_s() -> u64 {
    10
}
fn default_cleanup_interval_s() -> u64 {
    60
}
fn default_retention_days() -> i64 {
    7
}
fn default_message_ttl_minutes() -> f64 {
    60.0
}
fn default_base_backoff_s() -> u64 {
    1
}
fn default_max_backoff_s() -> u64 {
    300
}
fn default_max_retries() -> i32 {
    5
}

impl BridgeConfig {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read config file {}", path.display()))?;
        let cfg: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("parse config file {}", path.display()))?;

        if let Some(version) = cfg.schema_version {
            if !SUPPORTED_SCHEMA_VERSIONS.contains(&version) {
                anyhow::bail!(
                    "unsupported schema_version {version}, expected {}-{}",
                    SUPPORTED_SCHEMA_VERSIONS.start(),
                    SUPPORTED_SCHEMA_VERSIONS.end()
                );
            }
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
schema_version: 1
mqtt:
  broker_host: localhost
  broker_port: 1883
  client_id: bridge
opcua:
  endpoint: "opc.tcp://localhost:4840"
  server_name: bridge-server
  namespace: 2
  security_policy: None
buffer:
  db_path: buffer.db
mappings:
  - mqtt_topic: line1/temp
    opcua_node_id: "ns=2;s=Line1Temp"
    data_type: Float
    direction: bidirectional
"#;

    #[test]
    fn parses_minimal_config() {
        let cfg: BridgeConfig = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.mqtt.broker_port, 1883);
        assert_eq!(cfg.buffer.max_size, 100_000);
        assert_eq!(cfg.mappings.len(), 1);
    }

    #[test]
    fn rejects_unknown_top_level_key() {
        let bad = format!("{SAMPLE}\nbogus_key: true\n");
        assert!(serde_yaml::from_str::<BridgeConfig>(&bad).is_err());
    }
}
