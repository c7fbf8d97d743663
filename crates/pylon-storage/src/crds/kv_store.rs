//! Key-value store on custom resources
//!
//! Each broker namespace maps to a single ConfigMap holding every key.
//! Arbitrary key strings are hex-encoded to satisfy ConfigMap key syntax;
//! values are stored in `binaryData`. Writes go through a get-replace cycle
//! retried on conflict.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, PostParams};

use super::{map_kube_error, CrdStore};
use crate::{retry_on_conflict, KeyValueStore, KeyValueStoreBroker, Result, StorageError};

struct CrdKeyValueStore {
    api: Api<ConfigMap>,
    name: String,
}

impl CrdKeyValueStore {
    async fn load(&self) -> Result<Option<ConfigMap>> {
        match self.api.get(&self.name).await {
            Ok(cm) => Ok(Some(cm)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(map_kube_error(e)),
        }
    }

    async fn modify<F>(&self, apply: F) -> Result<()>
    where
        F: Fn(&mut BTreeMap<String, ByteString>) -> Result<()> + Send + Sync,
    {
        retry_on_conflict("kv_modify", || {
            let apply = &apply;
            async move {
                match self.load().await? {
                    Some(mut cm) => {
                        let mut data = cm.binary_data.take().unwrap_or_default();
                        apply(&mut data)?;
                        cm.binary_data = Some(data);
                        self.api
                            .replace(&self.name, &PostParams::default(), &cm)
                            .await
                            .map_err(map_kube_error)?;
                        Ok(())
                    }
                    None => {
                        let mut data = BTreeMap::new();
                        apply(&mut data)?;
                        let cm = ConfigMap {
                            metadata: ObjectMeta {
                                name: Some(self.name.clone()),
                                ..Default::default()
                            },
                            binary_data: Some(data),
                            ..Default::default()
                        };
                        match self.api.create(&PostParams::default(), &cm).await {
                            Ok(_) => Ok(()),
                            // lost the create race; retry as an update
                            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                                Err(StorageError::Conflict)
                            }
                            Err(e) => Err(map_kube_error(e)),
                        }
                    }
                }
            }
        })
        .await
    }
}

#[async_trait]
impl KeyValueStore for CrdKeyValueStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let encoded = hex::encode(key);
        let value = value.to_vec();
        self.modify(move |data| {
            data.insert(encoded.clone(), ByteString(value.clone()));
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let encoded = hex::encode(key);
        let cm = self.load().await?.ok_or(StorageError::NotFound)?;
        cm.binary_data
            .as_ref()
            .and_then(|d| d.get(&encoded))
            .map(|v| v.0.clone())
            .ok_or(StorageError::NotFound)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let encoded = hex::encode(key);
        self.modify(move |data| {
            data.remove(&encoded)
                .map(|_| ())
                .ok_or(StorageError::NotFound)
        })
        .await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let Some(cm) = self.load().await? else {
            return Ok(Vec::new());
        };
        let mut keys = Vec::new();
        for encoded in cm.binary_data.unwrap_or_default().keys() {
            let raw = hex::decode(encoded)
                .map_err(|e| StorageError::Corrupt(format!("kv key hex: {e}")))?;
            let key = String::from_utf8(raw)
                .map_err(|_| StorageError::Corrupt("kv key is not UTF-8".into()))?;
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl KeyValueStoreBroker for CrdStore {
    async fn key_value_store(&self, namespace: &str) -> Result<Arc<dyn KeyValueStore>> {
        Ok(Arc::new(CrdKeyValueStore {
            api: self.api(),
            name: format!("pylon-kv-{namespace}"),
        }))
    }
}
