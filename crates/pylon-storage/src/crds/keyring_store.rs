//! Keyring store on custom resources
//!
//! One Keyring object per `(prefix, ref)` pair, named `{prefix}-{id}`. The
//! blob is stored base64-encoded. Puts over an existing object go through a
//! get-replace cycle retried on conflict, so the last writer wins atomically.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::api::{Api, ObjectMeta, PostParams};

use pylon_common::core::Reference;
use pylon_keyring::Keyring;

use super::objects::{self, KeyringSpec};
use super::{map_kube_error, CrdStore};
use crate::{retry_on_conflict, KeyringStore, KeyringStoreBroker, Result, StorageError};

struct CrdKeyringStore {
    api: Api<objects::Keyring>,
    name: String,
}

#[async_trait]
impl KeyringStore for CrdKeyringStore {
    async fn put(&self, keyring: &Keyring) -> Result<()> {
        let data = STANDARD.encode(keyring.marshal());

        match self.api.get(&self.name).await {
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let obj = objects::Keyring {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        ..Default::default()
                    },
                    spec: KeyringSpec { data },
                };
                self.api
                    .create(&PostParams::default(), &obj)
                    .await
                    .map_err(map_kube_error)?;
                Ok(())
            }
            Err(e) => Err(map_kube_error(e)),
            Ok(_) => {
                retry_on_conflict("keyring_put", || {
                    let api = self.api.clone();
                    let name = self.name.clone();
                    let data = data.clone();
                    async move {
                        let mut obj = api.get(&name).await.map_err(map_kube_error)?;
                        obj.spec.data = data;
                        api.replace(&name, &PostParams::default(), &obj)
                            .await
                            .map_err(map_kube_error)?;
                        Ok(())
                    }
                })
                .await
            }
        }
    }

    async fn get(&self) -> Result<Keyring> {
        let obj = self.api.get(&self.name).await.map_err(map_kube_error)?;
        let blob = STANDARD
            .decode(&obj.spec.data)
            .map_err(|e| StorageError::Corrupt(format!("keyring base64: {e}")))?;
        Keyring::unmarshal(&blob).map_err(|e| StorageError::Corrupt(e.to_string()))
    }
}

#[async_trait]
impl KeyringStoreBroker for CrdStore {
    async fn keyring_store(
        &self,
        prefix: &str,
        reference: &Reference,
    ) -> Result<Arc<dyn KeyringStore>> {
        Ok(Arc::new(CrdKeyringStore {
            api: self.api(),
            name: format!("{prefix}-{}", reference.id),
        }))
    }
}
