//! Node Configuration
//!
//! One YAML document configures every component. Each section falls back
//! to its defaults, so an empty file is a valid single-node setup.
//!
//! ```yaml
//! cache:
//!   shard_count: 256
//!   budgets:
//!     hot: { max_items: 1024, max_bytes: 16777216 }
//! quota:
//!   default_limits: { max_bytes: 10737418240 }
//! workers:
//!   min_workers: 4
//!   max_workers: 64
//! replication:
//!   node_id: eu-1
//!   peers:
//!     - { id: eu-2, endpoint: "http://10.0.0.2:9100" }
//! service:
//!   listen_addr: "0.0.0.0:9100"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::CacheConfig;
use crate::error::{Error, Result};
use crate::replication::ReplicationConfig;
use crate::service::ServiceConfig;
use crate::tenant::QuotaConfig;
use crate::workers::WorkerPoolConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub cache: CacheConfig,
    pub quota: QuotaConfig,
    pub workers: WorkerPoolConfig,
    pub replication: ReplicationConfig,
    pub service: ServiceConfig,
}

impl CoreConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.quota.validate()?;
        self.workers.validate()?;
        self.replication.validate()?;
        self.service.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(CoreConfig::from_yaml_str("").unwrap(), CoreConfig::default());
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_document() {
        let config = CoreConfig::from_yaml_str(
            r#"
cache:
  shard_count: 16
workers:
  min_workers: 2
  max_workers: 8
replication:
  node_id: eu-1
  peers:
    - id: eu-2
      endpoint: "http://10.0.0.2:9100"
service:
  persist_timeout_ms: 250
"#,
        )
        .unwrap();
        assert_eq!(config.cache.shard_count, 16);
        assert_eq!(config.workers.max_workers, 8);
        assert_eq!(config.replication.peers.len(), 1);
        assert_eq!(config.replication.peers[0].connections, 4);
        assert_eq!(config.service.persist_timeout_ms, 250);
        assert_eq!(config.service.read_timeout_ms, 5_000);
    }

    #[test]
    fn test_invalid_section_rejected() {
        let err = CoreConfig::from_yaml_str("cache:\n  shard_count: 0\n").unwrap_err();
        assert_matches!(err, Error::Config(_));

        let err = CoreConfig::from_yaml_str("service:\n  listen_addr: nowhere\n").unwrap_err();
        assert_matches!(err, Error::Config(_));

        let err = CoreConfig::from_yaml_str("cache: [1, 2]").unwrap_err();
        assert_matches!(err, Error::Serialization(_));
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = CoreConfig::default().to_yaml().unwrap();
        assert_eq!(CoreConfig::from_yaml_str(&yaml).unwrap(), CoreConfig::default());
    }

    #[test]
    fn test_missing_file() {
        assert_matches!(CoreConfig::load("/nonexistent/edge.yaml"), Err(Error::Io(_)));
    }
}
