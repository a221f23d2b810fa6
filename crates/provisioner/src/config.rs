//! Provisioner configuration file.
//!
//! The file names a stage and overrides any part of that stage's default
//! topology:
//!
//! ```yaml
//! stage: dev
//! production: false
//! worker:
//!   count: 3
//! server:
//!   server_type: cx33
//! storage:
//!   s3_host: example.r2.cloudflarestorage.com
//!   backup_bucket: dev-etcd-backups
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::bootstrap::StorageSettings;
use crate::error::ConfigError;
use crate::topology::Topology;

/// Default bootstrap template location.
pub const DEFAULT_TEMPLATE_PATH: &str = "templates/cloud-config.yaml";

/// Where secrets are read from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsSettings {
    /// Prefix of the environment variables holding secrets.
    #[serde(default)]
    pub env_prefix: String,
}

/// Complete provisioner configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// Desired cluster layout.
    #[serde(flatten)]
    pub topology: Topology,
    /// Bootstrap template file.
    #[serde(default = "default_template_path")]
    pub template_path: PathBuf,
    /// Backup storage handed to every node.
    #[serde(default)]
    pub storage: StorageSettings,
    /// Secret lookup.
    #[serde(default)]
    pub secrets: SecretsSettings,
}

fn default_template_path() -> PathBuf {
    PathBuf::from(DEFAULT_TEMPLATE_PATH)
}

/// Fields needed to pick the defaults.
#[derive(Deserialize)]
struct StageHeader {
    stage: String,
    #[serde(default)]
    production: bool,
}

impl ProvisionerConfig {
    /// Defaults of a stage.
    #[must_use]
    pub fn for_stage(stage: impl Into<String>, production: bool) -> Self {
        Self {
            topology: Topology::for_stage(stage, production),
            template_path: default_template_path(),
            storage: StorageSettings::default(),
            secrets: SecretsSettings::default(),
        }
    }

    /// Load a config file.
    ///
    /// # Errors
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse YAML, filling unset fields with the stage defaults.
    ///
    /// # Errors
    /// Returns the YAML error if the document is malformed or lacks `stage`.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        let overrides: Value = serde_yaml::from_str(text)?;
        let header: StageHeader = serde_yaml::from_value(overrides.clone())?;

        let mut merged = serde_yaml::to_value(Self::for_stage(header.stage, header.production))?;
        merge(&mut merged, overrides);
        serde_yaml::from_value(merged)
    }

    /// Validate the topology.
    ///
    /// # Errors
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.topology.validate()
    }
}

/// Overlay `overrides` onto `base`; mappings merge, everything else replaces.
fn merge(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Mapping(base), Value::Mapping(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overrides) => *base = overrides,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::topology::LoadBalancerAlgorithm;

    fn write(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_file_uses_stage_defaults() {
        let file = write("stage: dev\n");
        let config = ProvisionerConfig::load(file.path()).unwrap();
        assert_eq!(config, ProvisionerConfig::for_stage("dev", false));
        assert_eq!(config.topology.server.server_type, "cx23");
        assert_eq!(config.topology.load_balancer.count, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_production_defaults() {
        let config = ProvisionerConfig::from_yaml("stage: prod\nproduction: true\n").unwrap();
        assert_eq!(config.topology.server.server_type, "ccx13");
        assert_eq!(config.topology.server.location, "hil");
        assert_eq!(config.topology.network.zone, "us-west");
        assert_eq!(config.topology.load_balancer.count, 1);
        assert_eq!(
            config.topology.load_balancer.algorithm,
            LoadBalancerAlgorithm::LeastConnections
        );
    }

    #[test]
    fn test_partial_overrides() {
        let file = write(
            r"
stage: dev
worker:
  count: 3
server:
  server_type: cx33
storage:
  s3_host: s3.example.com
  backup_bucket: dev-backups
secrets:
  env_prefix: DEV_
template_path: /etc/provisioner/cloud-config.yaml
",
        );
        let config = ProvisionerConfig::load(file.path()).unwrap();
        assert_eq!(config.topology.worker.count, 3);
        assert_eq!(config.topology.worker.start_offset, 20);
        assert_eq!(config.topology.server.server_type, "cx33");
        assert_eq!(config.topology.server.image, "ubuntu-24.04");
        assert_eq!(config.storage.backup_bucket, "dev-backups");
        assert_eq!(config.secrets.env_prefix, "DEV_");
        assert_eq!(
            config.template_path,
            PathBuf::from("/etc/provisioner/cloud-config.yaml")
        );
        assert_eq!(config.topology.firewall_rules.len(), 1);
    }

    #[test]
    fn test_missing_stage() {
        assert!(ProvisionerConfig::from_yaml("production: true\n").is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProvisionerConfig::load(dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_malformed_file() {
        let file = write("stage: [dev\n");
        let err = ProvisionerConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
