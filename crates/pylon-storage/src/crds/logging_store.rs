//! Logging-cluster store on custom resources
//!
//! Index user credentials are stored as Kubernetes Secrets (one per user,
//! `password` key) in the system namespace; the LoggingCluster object links
//! to the user by id.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};

use pylon_common::core::{LoggingCluster, LoggingClusterList, OpensearchUser, Reference};

use super::objects::{self, LoggingClusterSpec};
use super::{map_kube_error, ok_or_kube_error, CrdStore};
use crate::{LoggingClusterStore, OpensearchUserStore, Result, StorageError};

#[async_trait]
impl LoggingClusterStore for CrdStore {
    async fn create_logging_cluster(&self, cluster: &LoggingCluster) -> Result<()> {
        let api: Api<objects::LoggingCluster> = self.api();
        let obj = objects::LoggingCluster {
            metadata: ObjectMeta {
                name: Some(cluster.id.clone()),
                labels: (!cluster.labels.is_empty()).then(|| cluster.labels.clone()),
                ..Default::default()
            },
            spec: LoggingClusterSpec {
                cluster: cluster.clone(),
            },
        };
        ok_or_kube_error(api.create(&PostParams::default(), &obj).await)?;
        Ok(())
    }

    async fn delete_logging_cluster(&self, reference: &Reference) -> Result<()> {
        let api: Api<objects::LoggingCluster> = self.api();
        ok_or_kube_error(api.delete(&reference.id, &DeleteParams::default()).await)?;
        Ok(())
    }

    async fn get_logging_cluster(&self, reference: &Reference) -> Result<LoggingCluster> {
        let api: Api<objects::LoggingCluster> = self.api();
        let obj = api.get(&reference.id).await.map_err(map_kube_error)?;
        Ok(obj.spec.cluster)
    }

    async fn list_logging_clusters(&self) -> Result<LoggingClusterList> {
        let api: Api<objects::LoggingCluster> = self.api();
        let list = ok_or_kube_error(api.list(&Default::default()).await)?;
        Ok(LoggingClusterList {
            items: list.items.into_iter().map(|obj| obj.spec.cluster).collect(),
        })
    }

    async fn opensearch_user_store(&self) -> Result<Arc<dyn OpensearchUserStore>> {
        Ok(Arc::new(SecretUserStore { api: self.api() }))
    }
}

struct SecretUserStore {
    api: Api<Secret>,
}

#[async_trait]
impl OpensearchUserStore for SecretUserStore {
    async fn put(&self, user: &OpensearchUser) -> Result<()> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(user.id.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "password".to_string(),
                ByteString(user.secret.clone().into_bytes()),
            )])),
            ..Default::default()
        };

        match self.api.create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                // overwrite the existing credential
                let mut existing = self.api.get(&user.id).await.map_err(map_kube_error)?;
                existing.data = secret.data.clone();
                self.api
                    .replace(&user.id, &PostParams::default(), &existing)
                    .await
                    .map_err(map_kube_error)?;
                Ok(())
            }
            Err(e) => Err(map_kube_error(e)),
        }
    }

    async fn get(&self, reference: &Reference) -> Result<OpensearchUser> {
        let secret = self.api.get(&reference.id).await.map_err(map_kube_error)?;
        let password = secret
            .data
            .as_ref()
            .and_then(|d| d.get("password"))
            .ok_or_else(|| StorageError::Corrupt("user secret missing password".into()))?;
        let secret_str = String::from_utf8(password.0.clone())
            .map_err(|_| StorageError::Corrupt("user password is not UTF-8".into()))?;
        Ok(OpensearchUser {
            id: reference.id.clone(),
            secret: secret_str,
        })
    }
}
