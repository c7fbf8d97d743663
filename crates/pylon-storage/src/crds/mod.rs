//! Custom-resource storage backend
//!
//! Every entity becomes a namespaced Kubernetes object in the configured
//! system namespace. The API server's optimistic concurrency (resource
//! versions) provides the compare-and-swap discipline; conflicts surface as
//! HTTP 409 and are retried through
//! [`retry_on_conflict`](crate::retry_on_conflict).
//!
//! Tokens have no native TTL here: the remaining TTL is recomputed from the
//! object's creation timestamp on every read, and an expired token reads as
//! `NotFound` while a background task garbage-collects the object
//! best-effort.

pub mod objects;

mod cluster_store;
mod keyring_store;
mod kv_store;
mod logging_store;
mod rbac_store;
mod token_store;

use kube::api::Api;
use kube::Client;

use crate::{Result, StorageError};

/// Storage backend persisting entities as Kubernetes custom resources
#[derive(Clone)]
pub struct CrdStore {
    client: Client,
    namespace: String,
}

impl CrdStore {
    /// Connect using the ambient kubeconfig or in-cluster configuration
    pub async fn new(namespace: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(Self::with_client(client, namespace))
    }

    /// Build a store around an existing client (used by tests)
    pub fn with_client(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub(crate) fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Map a kube error onto the storage taxonomy
pub(crate) fn map_kube_error(e: kube::Error) -> StorageError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StorageError::NotFound,
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            StorageError::AlreadyExists
        }
        kube::Error::Api(ae) if ae.code == 409 => StorageError::Conflict,
        other => StorageError::Unavailable(other.to_string()),
    }
}

pub(crate) fn ok_or_kube_error<T>(result: kube::Result<T>) -> Result<T> {
    result.map_err(map_kube_error)
}
