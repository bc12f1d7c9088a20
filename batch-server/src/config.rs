//! Server configuration

use anyhow::{bail, Context};
use batch_store::StoreConfig;
use message_bus::NatsConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable naming the TOML config file
pub const CONFIG_ENV: &str = "BATCH_SERVER_CONFIG";

/// Top-level server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Engine policy
    pub engine: batch_engine::Config,

    /// Transaction store
    pub store: StoreConfig,

    /// Event publishing
    pub nats: NatsSection,

    /// Simulated ledger
    pub ledger: SimulatedLedgerConfig,
}

/// NATS publishing, off unless enabled
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsSection {
    /// Publish lifecycle events
    pub enabled: bool,

    /// Connection and subject settings
    #[serde(flatten)]
    pub client: NatsConfig,
}

/// Simulated ledger behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedLedgerConfig {
    /// Latency per ledger call (ms)
    pub latency_ms: u64,

    /// Probability a submission is accepted
    pub success_rate: f64,

    /// Polls before a submission validates
    pub confirm_after_polls: u32,
}

impl Default for SimulatedLedgerConfig {
    fn default() -> Self {
        Self {
            latency_ms: 50,
            success_rate: 0.98,
            confirm_after_polls: 1,
        }
    }
}

impl ServerConfig {
    /// Load from `BATCH_SERVER_CONFIG`, falling back to defaults
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(&path),
            Err(_) => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> anyhow::Result<()> {
        self.engine.validate()?;
        if self.nats.enabled {
            self.nats.client.validate()?;
        }
        if !(0.0..=1.0).contains(&self.ledger.success_rate) {
            bail!("ledger.success_rate must be within [0, 1]");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert!(!config.nats.enabled);
    }

    #[test]
    fn test_from_file_with_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[engine.batch]
max_batch_size = 25
min_batch_size = 5

[store]
data_dir = "/var/lib/batch-server"

[nats]
enabled = true
url = "nats://nats:4222"
partitions = 8

[ledger]
success_rate = 1.0
"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.engine.batch.max_batch_size, 25);
        assert_eq!(config.engine.batch.max_wait_time_ms, 5_000);
        assert_eq!(config.store.data_dir, Path::new("/var/lib/batch-server"));
        assert!(config.nats.enabled);
        assert_eq!(config.nats.client.url, "nats://nats:4222");
        assert_eq!(config.nats.client.partitions, 8);
        assert_eq!(config.nats.client.subject_prefix, "treasury.tx");
        assert_eq!(config.ledger.success_rate, 1.0);
        assert_eq!(config.ledger.latency_ms, 50);
    }

    #[test]
    fn test_invalid_sections_rejected() {
        let mut config = ServerConfig::default();
        config.ledger.success_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.engine.batch.min_batch_size = 50;
        assert!(config.validate().is_err());

        // NATS settings only checked when enabled
        let mut config = ServerConfig::default();
        config.nats.client.partitions = 0;
        assert!(config.validate().is_ok());
        config.nats.enabled = true;
        assert!(config.validate().is_err());
    }
}
