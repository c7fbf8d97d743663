//! Custom resource definitions for the `monitoring.pylon.io` API group
//!
//! Each spec wraps the corresponding core model type so the stored form and
//! the wire form stay identical.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use pylon_common::core as model;

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "monitoring.pylon.io",
    version = "v1beta1",
    kind = "BootstrapToken",
    plural = "bootstraptokens",
    namespaced
)]
pub struct BootstrapTokenSpec {
    #[serde(flatten)]
    pub token: model::BootstrapToken,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "monitoring.pylon.io",
    version = "v1beta1",
    kind = "Cluster",
    plural = "clusters",
    namespaced
)]
pub struct ClusterSpec {
    #[serde(flatten)]
    pub cluster: model::Cluster,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "monitoring.pylon.io",
    version = "v1beta1",
    kind = "Keyring",
    plural = "keyrings",
    namespaced
)]
pub struct KeyringSpec {
    /// The marshaled keyring blob, base64-encoded
    pub data: String,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "monitoring.pylon.io",
    version = "v1beta1",
    kind = "LoggingCluster",
    plural = "loggingclusters",
    namespaced
)]
pub struct LoggingClusterSpec {
    #[serde(flatten)]
    pub cluster: model::LoggingCluster,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "monitoring.pylon.io",
    version = "v1beta1",
    kind = "Role",
    plural = "roles",
    namespaced
)]
pub struct RoleSpec {
    #[serde(flatten)]
    pub role: model::Role,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "monitoring.pylon.io",
    version = "v1beta1",
    kind = "RoleBinding",
    plural = "rolebindings",
    namespaced
)]
pub struct RoleBindingSpec {
    #[serde(flatten)]
    pub binding: model::RoleBinding,
}
