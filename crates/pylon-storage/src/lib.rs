//! Storage backends for the Pylon gateway and agent
//!
//! Every backend implements the same capability traits: token, cluster,
//! logging-cluster, and RBAC stores plus brokers for keyring and key-value
//! stores. Three implementations exist:
//!
//! - [`etcd::EtcdBackend`]: the recommended production backend; TTLs are
//!   enforced with native leases and read-modify-write updates use
//!   mod-revision transactions
//! - [`crds::CrdStore`]: stores each entity as a Kubernetes custom resource;
//!   token TTLs are recomputed from the object's creation timestamp
//! - [`memory::InMemoryBackend`]: a mock backend for tests, with a lease
//!   manager driving token expiration
//!
//! The backend is chosen once at startup and shared as `Arc<dyn Backend>`;
//! there is no runtime switching.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use pylon_common::core::{
    BootstrapToken, Cluster, ClusterList, LabelSelector, LoggingCluster, LoggingClusterList,
    MatchOptions, OpensearchUser, Reference, Role, RoleBinding, RoleBindingList, RoleList,
};
use pylon_keyring::Keyring;

pub mod crds;
pub mod etcd;
pub mod lease;
pub mod memory;
pub mod rbac;
mod retry;

pub use retry::retry_on_conflict;

/// Errors surfaced by storage operations
///
/// `NotFound` is a first-class value at the business layer, not a fault:
/// callers are expected to branch on it.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found")]
    NotFound,

    #[error("object already exists")]
    AlreadyExists,

    #[error("conflict: object was modified concurrently")]
    Conflict,

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("malformed stored data: {0}")]
    Corrupt(String),

    #[error("internal storage error: {0}")]
    Internal(String),

    #[error("operation canceled")]
    Canceled,
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict)
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Options accepted by [`TokenStore::create_token`]
#[derive(Clone, Debug, Default)]
pub struct TokenCreateOptions {
    pub labels: BTreeMap<String, String>,
    pub capabilities: Vec<String>,
}

impl TokenCreateOptions {
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// A read-modify-write mutation applied under compare-and-swap
///
/// The mutator may be invoked more than once when the write conflicts and is
/// retried, so it must be a pure function of its argument.
pub type TokenMutator = Arc<dyn Fn(&mut BootstrapToken) + Send + Sync>;
pub type ClusterMutator = Arc<dyn Fn(&mut Cluster) + Send + Sync>;

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Generate and persist a new random token with the given TTL
    async fn create_token(
        &self,
        ttl: Duration,
        opts: TokenCreateOptions,
    ) -> Result<BootstrapToken>;

    async fn delete_token(&self, reference: &Reference) -> Result<()>;

    /// Read a token; expired tokens read as `NotFound`
    async fn get_token(&self, reference: &Reference) -> Result<BootstrapToken>;

    /// Atomic read-modify-write with bounded conflict retry
    async fn update_token(
        &self,
        reference: &Reference,
        mutator: TokenMutator,
    ) -> Result<BootstrapToken>;

    /// List active tokens; expired entries are filtered out
    async fn list_tokens(&self) -> Result<Vec<BootstrapToken>>;

    /// Record one successful use of the token
    async fn increment_usage_count(&self, reference: &Reference) -> Result<()> {
        self.update_token(
            reference,
            Arc::new(|t: &mut BootstrapToken| t.metadata.usage_count += 1),
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Create a cluster; exactly one concurrent create for a given id wins
    async fn create_cluster(&self, cluster: &Cluster) -> Result<()>;

    async fn delete_cluster(&self, reference: &Reference) -> Result<()>;

    async fn get_cluster(&self, reference: &Reference) -> Result<Cluster>;

    async fn update_cluster(
        &self,
        reference: &Reference,
        mutator: ClusterMutator,
    ) -> Result<Cluster>;

    async fn list_clusters(
        &self,
        selector: Option<&LabelSelector>,
        opts: MatchOptions,
    ) -> Result<ClusterList>;
}

/// Store for the log-store index user records created during logging
/// bootstrap
#[async_trait]
pub trait OpensearchUserStore: Send + Sync {
    async fn put(&self, user: &OpensearchUser) -> Result<()>;
    async fn get(&self, reference: &Reference) -> Result<OpensearchUser>;
}

#[async_trait]
pub trait LoggingClusterStore: Send + Sync {
    async fn create_logging_cluster(&self, cluster: &LoggingCluster) -> Result<()>;
    async fn delete_logging_cluster(&self, reference: &Reference) -> Result<()>;
    async fn get_logging_cluster(&self, reference: &Reference) -> Result<LoggingCluster>;
    async fn list_logging_clusters(&self) -> Result<LoggingClusterList>;
    async fn opensearch_user_store(&self) -> Result<Arc<dyn OpensearchUserStore>>;
}

#[async_trait]
pub trait RbacStore: Send + Sync {
    async fn create_role(&self, role: &Role) -> Result<()>;
    async fn delete_role(&self, reference: &Reference) -> Result<()>;
    async fn get_role(&self, reference: &Reference) -> Result<Role>;
    async fn list_roles(&self) -> Result<RoleList>;

    /// Bindings are accepted regardless of referential integrity; broken
    /// references surface as taints at read time
    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<()>;
    async fn delete_role_binding(&self, reference: &Reference) -> Result<()>;
    async fn get_role_binding(&self, reference: &Reference) -> Result<RoleBinding>;
    async fn list_role_bindings(&self) -> Result<RoleBindingList>;
}

/// A single-object store holding one keyring
#[async_trait]
pub trait KeyringStore: Send + Sync {
    /// Persist the keyring, atomically overwriting any existing value
    async fn put(&self, keyring: &Keyring) -> Result<()>;
    async fn get(&self) -> Result<Keyring>;
}

#[async_trait]
pub trait KeyringStoreBroker: Send + Sync {
    /// A keyring store scoped by `(prefix, reference.id)`
    async fn keyring_store(
        &self,
        prefix: &str,
        reference: &Reference,
    ) -> Result<Arc<dyn KeyringStore>>;
}

/// A namespaced key-value store for small opaque values
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait KeyValueStoreBroker: Send + Sync {
    async fn key_value_store(&self, namespace: &str) -> Result<Arc<dyn KeyValueStore>>;
}

/// The full capability set a storage backend provides
pub trait Backend:
    TokenStore
    + ClusterStore
    + LoggingClusterStore
    + RbacStore
    + KeyringStoreBroker
    + KeyValueStoreBroker
{
}

impl<T> Backend for T where
    T: TokenStore
        + ClusterStore
        + LoggingClusterStore
        + RbacStore
        + KeyringStoreBroker
        + KeyValueStoreBroker
{
}
