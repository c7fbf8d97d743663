//! etcd storage backend
//!
//! The system-of-record backend. Typed records are stored as JSON values
//! under a configurable prefix; keyring blobs are stored raw. Token TTLs are
//! enforced by leases attached to the token keys, so expired tokens vanish
//! without any reader-side bookkeeping. Read-modify-write updates are
//! serialized with mod-revision transactions and retried through
//! [`retry_on_conflict`].
//!
//! Key layout:
//!
//! ```text
//! {prefix}/tokens/{hexid}
//! {prefix}/clusters/{id}
//! {prefix}/keyrings/{namespace}/{id}
//! {prefix}/logging/clusters/{id}
//! {prefix}/logging/users/{id}
//! {prefix}/roles/{id}
//! {prefix}/rolebindings/{id}
//! {prefix}/kv/{namespace}/{key}
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, Compare, CompareOp, ConnectOptions, GetOptions, Identity, PutOptions,
    TlsOptions, Txn, TxnOp,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use pylon_common::config::EtcdStorageSpec;
use pylon_common::core::{
    selector_matches, BootstrapToken, Cluster, ClusterList, LabelSelector, LoggingCluster,
    LoggingClusterList, MatchOptions, OpensearchUser, Reference, Role, RoleBinding,
    RoleBindingList, RoleList, TokenMetadata,
};
use pylon_keyring::{Keyring, RawToken};

use crate::rbac::populate_taints;
use crate::{
    retry_on_conflict, Backend, ClusterMutator, ClusterStore, KeyValueStore, KeyValueStoreBroker,
    KeyringStore, KeyringStoreBroker, LoggingClusterStore, OpensearchUserStore, RbacStore, Result,
    StorageError, TokenCreateOptions, TokenMutator, TokenStore,
};

const DEFAULT_PREFIX: &str = "pylon";

fn unavailable(e: etcd_client::Error) -> StorageError {
    StorageError::Unavailable(e.to_string())
}

fn token_key(prefix: &str, id: &str) -> String {
    format!("{prefix}/tokens/{id}")
}

fn cluster_key(prefix: &str, id: &str) -> String {
    format!("{prefix}/clusters/{id}")
}

fn keyring_key(prefix: &str, namespace: &str, id: &str) -> String {
    format!("{prefix}/keyrings/{namespace}/{id}")
}

fn logging_cluster_key(prefix: &str, id: &str) -> String {
    format!("{prefix}/logging/clusters/{id}")
}

fn decode<T: DeserializeOwned>(value: &[u8]) -> Result<T> {
    serde_json::from_slice(value).map_err(|e| StorageError::Corrupt(e.to_string()))
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("record serialization cannot fail")
}

/// Storage backend backed by an etcd cluster
#[derive(Clone)]
pub struct EtcdBackend {
    client: Client,
    prefix: String,
}

impl EtcdBackend {
    /// Connect to etcd using the given spec
    pub async fn connect(spec: &EtcdStorageSpec) -> Result<Self> {
        if spec.endpoints.is_empty() {
            return Err(StorageError::InvalidArgument(
                "no etcd endpoints configured".into(),
            ));
        }

        let mut options = ConnectOptions::new();
        if let Some(certs) = &spec.certs {
            let mut tls = TlsOptions::new();
            if let Some(ca_path) = &certs.server_ca {
                let ca = std::fs::read(ca_path)
                    .map_err(|e| StorageError::InvalidArgument(format!("cannot read CA: {e}")))?;
                tls = tls.ca_certificate(Certificate::from_pem(ca));
            }
            if let (Some(cert_path), Some(key_path)) = (&certs.client_cert, &certs.client_key) {
                let cert = std::fs::read(cert_path).map_err(|e| {
                    StorageError::InvalidArgument(format!("cannot read client cert: {e}"))
                })?;
                let key = std::fs::read(key_path).map_err(|e| {
                    StorageError::InvalidArgument(format!("cannot read client key: {e}"))
                })?;
                tls = tls.identity(Identity::from_pem(cert, key));
            }
            options = options.with_tls(tls);
        }

        let client = Client::connect(&spec.endpoints, Some(options))
            .await
            .map_err(unavailable)?;
        let prefix = if spec.prefix.is_empty() {
            DEFAULT_PREFIX.to_string()
        } else {
            spec.prefix.clone()
        };
        Ok(Self { client, prefix })
    }

    fn token_key(&self, id: &str) -> String {
        token_key(&self.prefix, id)
    }

    fn cluster_key(&self, id: &str) -> String {
        cluster_key(&self.prefix, id)
    }

    fn keyring_key(&self, namespace: &str, id: &str) -> String {
        keyring_key(&self.prefix, namespace, id)
    }

    fn logging_cluster_key(&self, id: &str) -> String {
        logging_cluster_key(&self.prefix, id)
    }

    fn logging_user_key(&self, id: &str) -> String {
        format!("{}/logging/users/{id}", self.prefix)
    }

    fn role_key(&self, id: &str) -> String {
        format!("{}/roles/{id}", self.prefix)
    }

    fn role_binding_key(&self, id: &str) -> String {
        format!("{}/rolebindings/{id}", self.prefix)
    }

    /// Fetch a JSON record together with its mod revision
    async fn get_record<T: DeserializeOwned>(&self, key: &str) -> Result<(T, i64)> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await.map_err(unavailable)?;
        let kv = resp.kvs().first().ok_or(StorageError::NotFound)?;
        Ok((decode(kv.value())?, kv.mod_revision()))
    }

    /// Insert a JSON record, failing if the key already exists
    async fn create_record<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when([Compare::version(key, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(key, encode(value), None)]);
        let resp = client.txn(txn).await.map_err(unavailable)?;
        if resp.succeeded() {
            Ok(())
        } else {
            Err(StorageError::AlreadyExists)
        }
    }

    /// Replace a JSON record only if it is still at the observed revision
    async fn cas_put<T: Serialize>(
        &self,
        key: &str,
        revision: i64,
        value: &T,
        options: Option<PutOptions>,
    ) -> Result<()> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when([Compare::mod_revision(key, CompareOp::Equal, revision)])
            .and_then([TxnOp::put(key, encode(value), options)]);
        let resp = client.txn(txn).await.map_err(unavailable)?;
        if resp.succeeded() {
            Ok(())
        } else {
            Err(StorageError::Conflict)
        }
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        let resp = client.delete(key, None).await.map_err(unavailable)?;
        if resp.deleted() == 0 {
            Err(StorageError::NotFound)
        } else {
            Ok(())
        }
    }

    async fn list_records<T: DeserializeOwned>(&self, key_prefix: &str) -> Result<Vec<T>> {
        let mut client = self.client.clone();
        let resp = client
            .get(key_prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;
        resp.kvs().iter().map(|kv| decode(kv.value())).collect()
    }
}

#[async_trait]
impl TokenStore for EtcdBackend {
    async fn create_token(
        &self,
        ttl: Duration,
        opts: TokenCreateOptions,
    ) -> Result<BootstrapToken> {
        let mut client = self.client.clone();
        let lease = client
            .lease_grant(ttl.as_secs() as i64, None)
            .await
            .map_err(unavailable)?;

        let raw = RawToken::generate();
        let token = BootstrapToken {
            token_id: raw.hex_id(),
            secret: raw.hex_secret(),
            metadata: TokenMetadata {
                lease_id: lease.id(),
                ttl: ttl.as_secs() as i64,
                usage_count: 0,
                labels: opts.labels,
                capabilities: opts.capabilities,
            },
        };
        client
            .put(
                self.token_key(&token.token_id),
                encode(&token),
                Some(PutOptions::new().with_lease(lease.id())),
            )
            .await
            .map_err(unavailable)?;
        Ok(token)
    }

    async fn delete_token(&self, reference: &Reference) -> Result<()> {
        self.delete_key(&self.token_key(&reference.id)).await
    }

    async fn get_token(&self, reference: &Reference) -> Result<BootstrapToken> {
        // the attached lease deletes expired tokens; absence is expiry
        let (token, _) = self.get_record(&self.token_key(&reference.id)).await?;
        Ok(token)
    }

    async fn update_token(
        &self,
        reference: &Reference,
        mutator: TokenMutator,
    ) -> Result<BootstrapToken> {
        let key = self.token_key(&reference.id);
        retry_on_conflict("update_token", || {
            let mutator = mutator.clone();
            let key = key.clone();
            async move {
                let (mut token, revision): (BootstrapToken, i64) = self.get_record(&key).await?;
                mutator(&mut token);
                let options = (token.metadata.lease_id > 0)
                    .then(|| PutOptions::new().with_lease(token.metadata.lease_id));
                self.cas_put(&key, revision, &token, options).await?;
                Ok(token)
            }
        })
        .await
    }

    async fn list_tokens(&self) -> Result<Vec<BootstrapToken>> {
        self.list_records(&format!("{}/tokens/", self.prefix)).await
    }
}

#[async_trait]
impl ClusterStore for EtcdBackend {
    async fn create_cluster(&self, cluster: &Cluster) -> Result<()> {
        self.create_record(&self.cluster_key(&cluster.id), cluster)
            .await
    }

    async fn delete_cluster(&self, reference: &Reference) -> Result<()> {
        self.delete_key(&self.cluster_key(&reference.id)).await
    }

    async fn get_cluster(&self, reference: &Reference) -> Result<Cluster> {
        let (cluster, _) = self.get_record(&self.cluster_key(&reference.id)).await?;
        Ok(cluster)
    }

    async fn update_cluster(
        &self,
        reference: &Reference,
        mutator: ClusterMutator,
    ) -> Result<Cluster> {
        let key = self.cluster_key(&reference.id);
        retry_on_conflict("update_cluster", || {
            let mutator = mutator.clone();
            let key = key.clone();
            async move {
                let (mut cluster, revision): (Cluster, i64) = self.get_record(&key).await?;
                mutator(&mut cluster);
                self.cas_put(&key, revision, &cluster, None).await?;
                Ok(cluster)
            }
        })
        .await
    }

    async fn list_clusters(
        &self,
        selector: Option<&LabelSelector>,
        opts: MatchOptions,
    ) -> Result<ClusterList> {
        // etcd cannot filter by labels server-side
        let clusters: Vec<Cluster> = self
            .list_records(&format!("{}/clusters/", self.prefix))
            .await?;
        Ok(ClusterList {
            items: clusters
                .into_iter()
                .filter(|c| selector_matches(selector, opts, &c.labels))
                .collect(),
        })
    }
}

#[async_trait]
impl LoggingClusterStore for EtcdBackend {
    async fn create_logging_cluster(&self, cluster: &LoggingCluster) -> Result<()> {
        self.create_record(&self.logging_cluster_key(&cluster.id), cluster)
            .await
    }

    async fn delete_logging_cluster(&self, reference: &Reference) -> Result<()> {
        self.delete_key(&self.logging_cluster_key(&reference.id))
            .await
    }

    async fn get_logging_cluster(&self, reference: &Reference) -> Result<LoggingCluster> {
        let (cluster, _) = self
            .get_record(&self.logging_cluster_key(&reference.id))
            .await?;
        Ok(cluster)
    }

    async fn list_logging_clusters(&self) -> Result<LoggingClusterList> {
        let items = self
            .list_records(&format!("{}/logging/clusters/", self.prefix))
            .await?;
        Ok(LoggingClusterList { items })
    }

    async fn opensearch_user_store(&self) -> Result<Arc<dyn OpensearchUserStore>> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl OpensearchUserStore for EtcdBackend {
    async fn put(&self, user: &OpensearchUser) -> Result<()> {
        let mut client = self.client.clone();
        client
            .put(self.logging_user_key(&user.id), encode(user), None)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get(&self, reference: &Reference) -> Result<OpensearchUser> {
        let (user, _) = self.get_record(&self.logging_user_key(&reference.id)).await?;
        Ok(user)
    }
}

#[async_trait]
impl RbacStore for EtcdBackend {
    async fn create_role(&self, role: &Role) -> Result<()> {
        self.create_record(&self.role_key(&role.id), role).await
    }

    async fn delete_role(&self, reference: &Reference) -> Result<()> {
        self.delete_key(&self.role_key(&reference.id)).await
    }

    async fn get_role(&self, reference: &Reference) -> Result<Role> {
        let (role, _) = self.get_record(&self.role_key(&reference.id)).await?;
        Ok(role)
    }

    async fn list_roles(&self) -> Result<RoleList> {
        let items = self.list_records(&format!("{}/roles/", self.prefix)).await?;
        Ok(RoleList { items })
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<()> {
        let mut stored = binding.clone();
        stored.taints.clear();
        self.create_record(&self.role_binding_key(&binding.id), &stored)
            .await
    }

    async fn delete_role_binding(&self, reference: &Reference) -> Result<()> {
        self.delete_key(&self.role_binding_key(&reference.id)).await
    }

    async fn get_role_binding(&self, reference: &Reference) -> Result<RoleBinding> {
        let (mut binding, _): (RoleBinding, i64) = self
            .get_record(&self.role_binding_key(&reference.id))
            .await?;
        populate_taints(self as &dyn Backend, &mut binding).await?;
        Ok(binding)
    }

    async fn list_role_bindings(&self) -> Result<RoleBindingList> {
        let items: Vec<RoleBinding> = self
            .list_records(&format!("{}/rolebindings/", self.prefix))
            .await?;
        let mut out = Vec::with_capacity(items.len());
        for mut binding in items {
            populate_taints(self as &dyn Backend, &mut binding).await?;
            out.push(binding);
        }
        Ok(RoleBindingList { items: out })
    }
}

struct EtcdKeyringStore {
    client: Client,
    key: String,
}

#[async_trait]
impl KeyringStore for EtcdKeyringStore {
    async fn put(&self, keyring: &Keyring) -> Result<()> {
        let mut client = self.client.clone();
        client
            .put(self.key.clone(), keyring.marshal(), None)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get(&self) -> Result<Keyring> {
        let mut client = self.client.clone();
        let resp = client.get(self.key.clone(), None).await.map_err(unavailable)?;
        let kv = resp.kvs().first().ok_or(StorageError::NotFound)?;
        Keyring::unmarshal(kv.value()).map_err(|e| StorageError::Corrupt(e.to_string()))
    }
}

#[async_trait]
impl KeyringStoreBroker for EtcdBackend {
    async fn keyring_store(
        &self,
        prefix: &str,
        reference: &Reference,
    ) -> Result<Arc<dyn KeyringStore>> {
        Ok(Arc::new(EtcdKeyringStore {
            client: self.client.clone(),
            key: self.keyring_key(prefix, &reference.id),
        }))
    }
}

struct EtcdKeyValueStore {
    client: Client,
    prefix: String,
}

#[async_trait]
impl KeyValueStore for EtcdKeyValueStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut client = self.client.clone();
        client
            .put(format!("{}{key}", self.prefix), value, None)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let mut client = self.client.clone();
        let resp = client
            .get(format!("{}{key}", self.prefix), None)
            .await
            .map_err(unavailable)?;
        resp.kvs()
            .first()
            .map(|kv| kv.value().to_vec())
            .ok_or(StorageError::NotFound)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        let resp = client
            .delete(format!("{}{key}", self.prefix), None)
            .await
            .map_err(unavailable)?;
        if resp.deleted() == 0 {
            Err(StorageError::NotFound)
        } else {
            Ok(())
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut client = self.client.clone();
        let full = format!("{}{prefix}", self.prefix);
        let resp = client
            .get(full, Some(GetOptions::new().with_prefix().with_keys_only()))
            .await
            .map_err(unavailable)?;
        Ok(resp
            .kvs()
            .iter()
            .filter_map(|kv| {
                kv.key_str()
                    .ok()
                    .and_then(|k| k.strip_prefix(&self.prefix))
                    .map(|k| k.to_string())
            })
            .collect())
    }
}

#[async_trait]
impl KeyValueStoreBroker for EtcdBackend {
    async fn key_value_store(&self, namespace: &str) -> Result<Arc<dyn KeyValueStore>> {
        Ok(Arc::new(EtcdKeyValueStore {
            client: self.client.clone(),
            prefix: format!("{}/kv/{namespace}/", self.prefix),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_is_stable() {
        assert_eq!(token_key("pylon", "ab12"), "pylon/tokens/ab12");
        assert_eq!(cluster_key("pylon", "agent-1"), "pylon/clusters/agent-1");
        assert_eq!(
            keyring_key("pylon", "gateway-internal", "agent-1"),
            "pylon/keyrings/gateway-internal/agent-1"
        );
        assert_eq!(
            logging_cluster_key("pylon", "lc"),
            "pylon/logging/clusters/lc"
        );
    }

    #[test]
    fn record_encoding_round_trips() {
        let token = BootstrapToken {
            token_id: "ab12".into(),
            secret: "cd34".into(),
            metadata: TokenMetadata {
                lease_id: 99,
                ttl: 60,
                usage_count: 2,
                labels: Default::default(),
                capabilities: vec![],
            },
        };
        let decoded: BootstrapToken = decode(&encode(&token)).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn corrupt_records_are_distinguished() {
        let result: Result<BootstrapToken> = decode(b"not json");
        assert!(matches!(result, Err(StorageError::Corrupt(_))));
    }
}
