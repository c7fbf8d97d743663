//! Configuration types for the gateway and agent binaries
//!
//! Config files are YAML documents with a single `spec` object. Field names
//! are camelCase on disk. Defaults are applied after deserialization via
//! `set_defaults`, so a minimal file only needs the fields that differ from
//! the shipped defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which storage backend to use; frozen at startup
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    /// Key-value storage backed by etcd. The recommended default.
    #[default]
    #[serde(rename = "etcd")]
    Etcd,
    /// Store each object as a Kubernetes custom resource.
    #[serde(rename = "customResources")]
    CustomResources,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSpec {
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    pub etcd: Option<EtcdStorageSpec>,
    pub custom_resources: Option<CustomResourcesStorageSpec>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EtcdStorageSpec {
    /// etcd endpoints to connect to
    pub endpoints: Vec<String>,
    /// Key prefix under which all Pylon keys are stored
    pub prefix: String,
    /// Client-cert auth for the etcd connection
    pub certs: Option<MtlsSpec>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomResourcesStorageSpec {
    /// Kubernetes namespace where objects are stored
    pub namespace: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MtlsSpec {
    /// Path to the server CA certificate
    pub server_ca: Option<String>,
    /// Path to the client CA certificate (not needed in all cases)
    pub client_ca: Option<String>,
    /// Path to the certificate used for client-cert auth
    pub client_cert: Option<String>,
    /// Path to the private key used for client-cert auth
    pub client_key: Option<String>,
}

/// Serving certificate configuration
///
/// Each item can be given as a file path or as inline PEM data; the two
/// forms are mutually exclusive per item.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CertsSpec {
    pub ca_cert: Option<String>,
    pub ca_cert_data: Option<String>,
    pub serving_cert: Option<String>,
    pub serving_cert_data: Option<String>,
    pub serving_key: Option<String>,
    pub serving_key_data: Option<String>,
}

impl CertsSpec {
    /// Resolve the serving certificate PEM, reading from disk if configured
    /// by path
    pub fn serving_cert_pem(&self) -> Result<String, ConfigError> {
        resolve_pem(
            "servingCert",
            self.serving_cert.as_deref(),
            self.serving_cert_data.as_deref(),
        )
    }

    /// Resolve the serving key PEM, reading from disk if configured by path
    pub fn serving_key_pem(&self) -> Result<String, ConfigError> {
        resolve_pem(
            "servingKey",
            self.serving_key.as_deref(),
            self.serving_key_data.as_deref(),
        )
    }
}

fn resolve_pem(
    field: &str,
    path: Option<&str>,
    data: Option<&str>,
) -> Result<String, ConfigError> {
    match (path, data) {
        (Some(_), Some(_)) => Err(ConfigError::Invalid(format!(
            "{field} and {field}Data are mutually exclusive"
        ))),
        (Some(p), None) => std::fs::read_to_string(p).map_err(|source| ConfigError::Read {
            path: p.to_string(),
            source,
        }),
        (None, Some(d)) => Ok(d.to_string()),
        (None, None) => Err(ConfigError::Invalid(format!("{field} is not configured"))),
    }
}

/// Gateway configuration document
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub spec: GatewayConfigSpec,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfigSpec {
    pub listen_address: String,
    pub hostname: String,
    pub certs: CertsSpec,
    pub storage: StorageSpec,
}

impl GatewayConfigSpec {
    pub fn set_defaults(&mut self) {
        if self.listen_address.is_empty() {
            self.listen_address = ":8080".to_string();
        }
        if self.hostname.is_empty() {
            self.hostname = "localhost".to_string();
        }
    }
}

/// Agent configuration document
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub spec: AgentConfigSpec,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfigSpec {
    pub listen_address: String,
    pub gateway_address: String,
    /// Name of the identity provider used to derive this agent's stable id
    pub identity_provider: String,
    pub storage: StorageSpec,
    pub rules: Option<RulesSpec>,
}

impl AgentConfigSpec {
    pub fn set_defaults(&mut self) {
        if self.listen_address.is_empty() {
            self.listen_address = ":8080".to_string();
        }
        if self.identity_provider.is_empty() {
            self.identity_provider = "hostname".to_string();
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RulesSpec {
    pub discovery: DiscoverySpec,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoverySpec {
    pub prometheus_rules: Option<PrometheusRulesSpec>,
    /// How often rule discovery runs; defaults to 15 minutes
    #[serde(with = "humantime_serde")]
    pub interval: Option<Duration>,
}

impl DiscoverySpec {
    pub fn interval_or_default(&self) -> Duration {
        self.interval.unwrap_or(Duration::from_secs(15 * 60))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrometheusRulesSpec {
    /// Path to a kubeconfig; in-cluster config is used when unset
    pub kubeconfig: Option<String>,
    /// Namespaces searched for PrometheusRule objects; all when empty
    pub search_namespaces: Vec<String>,
}

/// Load a gateway config document from a YAML file and apply defaults
pub fn load_gateway_config(path: impl AsRef<Path>) -> Result<GatewayConfig, ConfigError> {
    let mut config: GatewayConfig = load_yaml(path.as_ref())?;
    config.spec.set_defaults();
    Ok(config)
}

/// Load an agent config document from a YAML file and apply defaults
pub fn load_agent_config(path: impl AsRef<Path>) -> Result<AgentConfig, ConfigError> {
    let mut config: AgentConfig = load_yaml(path.as_ref())?;
    config.spec.set_defaults();
    Ok(config)
}

fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_yaml::from_str(&raw)?)
}
