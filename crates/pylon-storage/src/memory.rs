//! In-memory mock backend
//!
//! Owns its data outright; everything is lost when the process exits. Used
//! by tests and local development. Unlike the real backends, token TTLs are
//! driven by the [`LeaseManager`](crate::lease::LeaseManager): expirations
//! are published to a channel and consumed here to delete the expired
//! record. Reads additionally treat a past-deadline token as absent so
//! expiry is exact even before the deletion lands.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use pylon_common::core::{
    selector_matches, BootstrapToken, Cluster, ClusterList, LabelSelector, LoggingCluster,
    LoggingClusterList, MatchOptions, OpensearchUser, Reference, Role, RoleBinding,
    RoleBindingList, RoleList, TokenMetadata,
};
use pylon_keyring::{Keyring, RawToken};

use crate::lease::LeaseManager;
use crate::rbac::populate_taints;
use crate::{
    Backend, ClusterMutator, ClusterStore, KeyValueStore, KeyValueStoreBroker, KeyringStore,
    KeyringStoreBroker, LoggingClusterStore, OpensearchUserStore, RbacStore, Result, StorageError,
    TokenCreateOptions, TokenMutator, TokenStore,
};

struct StoredToken {
    token: BootstrapToken,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    tokens: RwLock<BTreeMap<String, StoredToken>>,
    clusters: RwLock<BTreeMap<String, Cluster>>,
    logging_clusters: RwLock<BTreeMap<String, LoggingCluster>>,
    opensearch_users: RwLock<BTreeMap<String, OpensearchUser>>,
    roles: RwLock<BTreeMap<String, Role>>,
    role_bindings: RwLock<BTreeMap<String, RoleBinding>>,
    /// (namespace, id) -> marshaled keyring
    keyrings: RwLock<BTreeMap<(String, String), Vec<u8>>>,
    /// (namespace, key) -> value
    kv: RwLock<BTreeMap<(String, String), Vec<u8>>>,
}

/// In-memory implementation of every storage capability
#[derive(Clone)]
pub struct InMemoryBackend {
    state: Arc<State>,
    leases: LeaseManager,
}

impl InMemoryBackend {
    /// Create a backend and start its expiration consumer
    pub fn new() -> Self {
        let (leases, mut expired) = LeaseManager::new();
        let backend = Self {
            state: Arc::new(State::default()),
            leases,
        };

        let state = backend.state.clone();
        tokio::spawn(async move {
            while let Some(token_id) = expired.recv().await {
                if state.tokens.write().remove(&token_id).is_some() {
                    debug!(token = %token_id, "garbage-collected expired token");
                }
            }
        });

        backend
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn remaining_ttl(expires_at: Instant) -> i64 {
    let now = Instant::now();
    if expires_at <= now {
        0
    } else {
        (expires_at - now).as_secs() as i64
    }
}

#[async_trait]
impl TokenStore for InMemoryBackend {
    async fn create_token(
        &self,
        ttl: Duration,
        opts: TokenCreateOptions,
    ) -> Result<BootstrapToken> {
        let raw = RawToken::generate();
        let lease_id = self.leases.schedule(raw.hex_id(), ttl);
        let token = BootstrapToken {
            token_id: raw.hex_id(),
            secret: raw.hex_secret(),
            metadata: TokenMetadata {
                lease_id,
                ttl: ttl.as_secs() as i64,
                usage_count: 0,
                labels: opts.labels,
                capabilities: opts.capabilities,
            },
        };
        self.state.tokens.write().insert(
            token.token_id.clone(),
            StoredToken {
                token: token.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(token)
    }

    async fn delete_token(&self, reference: &Reference) -> Result<()> {
        self.state
            .tokens
            .write()
            .remove(&reference.id)
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    async fn get_token(&self, reference: &Reference) -> Result<BootstrapToken> {
        let tokens = self.state.tokens.read();
        let stored = tokens.get(&reference.id).ok_or(StorageError::NotFound)?;
        let ttl = remaining_ttl(stored.expires_at);
        if ttl <= 0 {
            return Err(StorageError::NotFound);
        }
        let mut token = stored.token.clone();
        token.metadata.ttl = ttl;
        Ok(token)
    }

    async fn update_token(
        &self,
        reference: &Reference,
        mutator: TokenMutator,
    ) -> Result<BootstrapToken> {
        let mut tokens = self.state.tokens.write();
        let stored = tokens.get_mut(&reference.id).ok_or(StorageError::NotFound)?;
        if remaining_ttl(stored.expires_at) <= 0 {
            return Err(StorageError::NotFound);
        }
        let mut updated = stored.token.clone();
        mutator(&mut updated);
        stored.token = updated.clone();
        Ok(updated)
    }

    async fn list_tokens(&self) -> Result<Vec<BootstrapToken>> {
        let tokens = self.state.tokens.read();
        Ok(tokens
            .values()
            .filter_map(|stored| {
                let ttl = remaining_ttl(stored.expires_at);
                if ttl <= 0 {
                    return None;
                }
                let mut token = stored.token.clone();
                token.metadata.ttl = ttl;
                Some(token)
            })
            .collect())
    }
}

#[async_trait]
impl ClusterStore for InMemoryBackend {
    async fn create_cluster(&self, cluster: &Cluster) -> Result<()> {
        let mut clusters = self.state.clusters.write();
        if clusters.contains_key(&cluster.id) {
            return Err(StorageError::AlreadyExists);
        }
        clusters.insert(cluster.id.clone(), cluster.clone());
        Ok(())
    }

    async fn delete_cluster(&self, reference: &Reference) -> Result<()> {
        self.state
            .clusters
            .write()
            .remove(&reference.id)
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    async fn get_cluster(&self, reference: &Reference) -> Result<Cluster> {
        self.state
            .clusters
            .read()
            .get(&reference.id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn update_cluster(
        &self,
        reference: &Reference,
        mutator: ClusterMutator,
    ) -> Result<Cluster> {
        let mut clusters = self.state.clusters.write();
        let existing = clusters
            .get_mut(&reference.id)
            .ok_or(StorageError::NotFound)?;
        let mut updated = existing.clone();
        mutator(&mut updated);
        *existing = updated.clone();
        Ok(updated)
    }

    async fn list_clusters(
        &self,
        selector: Option<&LabelSelector>,
        opts: MatchOptions,
    ) -> Result<ClusterList> {
        let clusters = self.state.clusters.read();
        Ok(ClusterList {
            items: clusters
                .values()
                .filter(|c| selector_matches(selector, opts, &c.labels))
                .cloned()
                .collect(),
        })
    }
}

#[async_trait]
impl LoggingClusterStore for InMemoryBackend {
    async fn create_logging_cluster(&self, cluster: &LoggingCluster) -> Result<()> {
        let mut clusters = self.state.logging_clusters.write();
        if clusters.contains_key(&cluster.id) {
            return Err(StorageError::AlreadyExists);
        }
        clusters.insert(cluster.id.clone(), cluster.clone());
        Ok(())
    }

    async fn delete_logging_cluster(&self, reference: &Reference) -> Result<()> {
        self.state
            .logging_clusters
            .write()
            .remove(&reference.id)
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    async fn get_logging_cluster(&self, reference: &Reference) -> Result<LoggingCluster> {
        self.state
            .logging_clusters
            .read()
            .get(&reference.id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn list_logging_clusters(&self) -> Result<LoggingClusterList> {
        Ok(LoggingClusterList {
            items: self
                .state
                .logging_clusters
                .read()
                .values()
                .cloned()
                .collect(),
        })
    }

    async fn opensearch_user_store(&self) -> Result<Arc<dyn OpensearchUserStore>> {
        Ok(Arc::new(MemoryOpensearchUserStore {
            state: self.state.clone(),
        }))
    }
}

struct MemoryOpensearchUserStore {
    state: Arc<State>,
}

#[async_trait]
impl OpensearchUserStore for MemoryOpensearchUserStore {
    async fn put(&self, user: &OpensearchUser) -> Result<()> {
        self.state
            .opensearch_users
            .write()
            .insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn get(&self, reference: &Reference) -> Result<OpensearchUser> {
        self.state
            .opensearch_users
            .read()
            .get(&reference.id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }
}

#[async_trait]
impl RbacStore for InMemoryBackend {
    async fn create_role(&self, role: &Role) -> Result<()> {
        let mut roles = self.state.roles.write();
        if roles.contains_key(&role.id) {
            return Err(StorageError::AlreadyExists);
        }
        roles.insert(role.id.clone(), role.clone());
        Ok(())
    }

    async fn delete_role(&self, reference: &Reference) -> Result<()> {
        self.state
            .roles
            .write()
            .remove(&reference.id)
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    async fn get_role(&self, reference: &Reference) -> Result<Role> {
        self.state
            .roles
            .read()
            .get(&reference.id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn list_roles(&self) -> Result<RoleList> {
        Ok(RoleList {
            items: self.state.roles.read().values().cloned().collect(),
        })
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<()> {
        let mut bindings = self.state.role_bindings.write();
        if bindings.contains_key(&binding.id) {
            return Err(StorageError::AlreadyExists);
        }
        let mut stored = binding.clone();
        // derived field, never persisted
        stored.taints.clear();
        bindings.insert(binding.id.clone(), stored);
        Ok(())
    }

    async fn delete_role_binding(&self, reference: &Reference) -> Result<()> {
        self.state
            .role_bindings
            .write()
            .remove(&reference.id)
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    async fn get_role_binding(&self, reference: &Reference) -> Result<RoleBinding> {
        let mut binding = self
            .state
            .role_bindings
            .read()
            .get(&reference.id)
            .cloned()
            .ok_or(StorageError::NotFound)?;
        populate_taints(self as &dyn Backend, &mut binding).await?;
        Ok(binding)
    }

    async fn list_role_bindings(&self) -> Result<RoleBindingList> {
        let items: Vec<RoleBinding> = self
            .state
            .role_bindings
            .read()
            .values()
            .cloned()
            .collect();
        let mut out = Vec::with_capacity(items.len());
        for mut binding in items {
            populate_taints(self as &dyn Backend, &mut binding).await?;
            out.push(binding);
        }
        Ok(RoleBindingList { items: out })
    }
}

struct MemoryKeyringStore {
    state: Arc<State>,
    namespace: String,
    id: String,
}

#[async_trait]
impl KeyringStore for MemoryKeyringStore {
    async fn put(&self, keyring: &Keyring) -> Result<()> {
        self.state.keyrings.write().insert(
            (self.namespace.clone(), self.id.clone()),
            keyring.marshal(),
        );
        Ok(())
    }

    async fn get(&self) -> Result<Keyring> {
        let keyrings = self.state.keyrings.read();
        let blob = keyrings
            .get(&(self.namespace.clone(), self.id.clone()))
            .ok_or(StorageError::NotFound)?;
        Keyring::unmarshal(blob).map_err(|e| StorageError::Corrupt(e.to_string()))
    }
}

#[async_trait]
impl KeyringStoreBroker for InMemoryBackend {
    async fn keyring_store(
        &self,
        prefix: &str,
        reference: &Reference,
    ) -> Result<Arc<dyn KeyringStore>> {
        Ok(Arc::new(MemoryKeyringStore {
            state: self.state.clone(),
            namespace: prefix.to_string(),
            id: reference.id.clone(),
        }))
    }
}

struct MemoryKeyValueStore {
    state: Arc<State>,
    namespace: String,
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.state
            .kv
            .write()
            .insert((self.namespace.clone(), key.to_string()), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.state
            .kv
            .read()
            .get(&(self.namespace.clone(), key.to_string()))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.state
            .kv
            .write()
            .remove(&(self.namespace.clone(), key.to_string()))
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .kv
            .read()
            .keys()
            .filter(|(ns, key)| ns == &self.namespace && key.starts_with(prefix))
            .map(|(_, key)| key.clone())
            .collect())
    }
}

#[async_trait]
impl KeyValueStoreBroker for InMemoryBackend {
    async fn key_value_store(&self, namespace: &str) -> Result<Arc<dyn KeyValueStore>> {
        Ok(Arc::new(MemoryKeyValueStore {
            state: self.state.clone(),
            namespace: namespace.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[tokio::test]
    async fn created_tokens_are_listed_until_expiry() {
        let backend = InMemoryBackend::new();
        let token = backend
            .create_token(Duration::from_secs(60), TokenCreateOptions::default())
            .await
            .unwrap();

        let listed = backend.list_tokens().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].token_id, token.token_id);
        assert!(listed[0].metadata.ttl > 0);
        assert!(listed[0].metadata.lease_id > 0);
    }

    #[tokio::test]
    async fn expired_token_reads_as_not_found_and_is_collected() {
        let backend = InMemoryBackend::new();
        let token = backend
            .create_token(Duration::from_millis(50), TokenCreateOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        let result = backend.get_token(&token.reference()).await;
        assert!(matches!(result, Err(StorageError::NotFound)));
        assert!(backend.list_tokens().await.unwrap().is_empty());

        // the lease manager deletes the record shortly after expiry
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(backend.state.tokens.read().is_empty());
    }

    #[tokio::test]
    async fn usage_count_increments_are_serialized() {
        let backend = Arc::new(InMemoryBackend::new());
        let token = backend
            .create_token(Duration::from_secs(60), TokenCreateOptions::default())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let backend = backend.clone();
            let reference = token.reference();
            handles.push(tokio::spawn(async move {
                backend.increment_usage_count(&reference).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let updated = backend.get_token(&token.reference()).await.unwrap();
        assert_eq!(updated.metadata.usage_count, 10);
    }

    #[tokio::test]
    async fn concurrent_cluster_creates_have_exactly_one_winner() {
        let backend = Arc::new(InMemoryBackend::new());
        let cluster = Cluster {
            id: "agent-1".into(),
            labels: BTreeMap::new(),
        };

        let mut handles = Vec::new();
        for _ in 0..8 {
            let backend = backend.clone();
            let cluster = cluster.clone();
            handles.push(tokio::spawn(
                async move { backend.create_cluster(&cluster).await },
            ));
        }

        let mut winners = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => winners += 1,
                Err(StorageError::AlreadyExists) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(conflicts, 7);
        assert_eq!(
            backend
                .list_clusters(None, MatchOptions::Default)
                .await
                .unwrap()
                .items
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn cluster_listing_respects_label_selectors() {
        let backend = InMemoryBackend::new();
        for (id, env) in [("a", "prod"), ("b", "dev")] {
            backend
                .create_cluster(&Cluster {
                    id: id.into(),
                    labels: [("env".to_string(), env.to_string())].into(),
                })
                .await
                .unwrap();
        }

        let selector = LabelSelector {
            match_labels: [("env".to_string(), "prod".to_string())].into(),
            match_expressions: vec![],
        };
        let list = backend
            .list_clusters(Some(&selector), MatchOptions::Default)
            .await
            .unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.items[0].id, "a");

        // empty selector under EmptySelectorMatchesNone yields nothing
        let list = backend
            .list_clusters(None, MatchOptions::EmptySelectorMatchesNone)
            .await
            .unwrap();
        assert!(list.items.is_empty());
    }

    #[tokio::test]
    async fn keyring_store_puts_are_scoped_and_overwrite() {
        let backend = InMemoryBackend::new();
        let gateway_store = backend
            .keyring_store("gateway-internal", &Reference::new("agent-1"))
            .await
            .unwrap();
        let agent_store = backend
            .keyring_store("agent", &Reference::new("agent-1"))
            .await
            .unwrap();

        assert!(matches!(
            gateway_store.get().await,
            Err(StorageError::NotFound)
        ));

        let kr = Keyring::new([pylon_keyring::keyring::Key::CaCert(vec![1, 2, 3])]);
        gateway_store.put(&kr).await.unwrap();
        assert_eq!(gateway_store.get().await.unwrap(), kr);
        // same ref under a different prefix is a different object
        assert!(matches!(agent_store.get().await, Err(StorageError::NotFound)));

        let kr2 = Keyring::new([pylon_keyring::keyring::Key::CaCert(vec![9])]);
        gateway_store.put(&kr2).await.unwrap();
        assert_eq!(gateway_store.get().await.unwrap(), kr2);
    }

    #[tokio::test]
    async fn key_value_store_round_trip_and_prefix_listing() {
        let backend = InMemoryBackend::new();
        let store = backend.key_value_store("ns").await.unwrap();

        store.put("alpha/1", b"one").await.unwrap();
        store.put("alpha/2", b"two").await.unwrap();
        store.put("beta/1", b"three").await.unwrap();

        assert_eq!(store.get("alpha/1").await.unwrap(), b"one");
        let mut keys = store.list_keys("alpha/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["alpha/1", "alpha/2"]);

        store.delete("alpha/1").await.unwrap();
        assert!(matches!(store.get("alpha/1").await, Err(StorageError::NotFound)));
    }
}
