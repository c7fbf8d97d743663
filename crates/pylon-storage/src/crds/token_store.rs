//! Token store on custom resources
//!
//! There is no native lease mechanism here, so the remaining TTL is derived
//! on every read from `creation_timestamp + ttl - now`. A token whose
//! derived TTL is not positive reads as `NotFound`, and a background task
//! deletes the object best-effort.

use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use tracing::debug;

use pylon_common::core::{BootstrapToken, Reference, TokenMetadata};
use pylon_keyring::RawToken;

use super::objects::{self, BootstrapTokenSpec};
use super::{map_kube_error, ok_or_kube_error, CrdStore};
use crate::{retry_on_conflict, Result, StorageError, TokenCreateOptions, TokenMutator, TokenStore};

/// Remaining TTL in seconds derived from the object's creation timestamp
fn remaining_ttl(obj: &objects::BootstrapToken) -> i64 {
    let created = obj
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0.timestamp())
        .unwrap_or(0);
    let now = chrono_now();
    let elapsed = now - created;
    (obj.spec.token.metadata.ttl - elapsed).max(0)
}

fn chrono_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is after 1970")
        .as_secs() as i64
}

/// Convert to the model form with the derived TTL patched in
fn to_model(obj: &objects::BootstrapToken) -> BootstrapToken {
    let mut token = obj.spec.token.clone();
    token.metadata.ttl = remaining_ttl(obj);
    token
}

impl CrdStore {
    /// Best-effort deletion of an expired token
    fn garbage_collect_token(&self, name: String) {
        let api: Api<objects::BootstrapToken> = self.api();
        tokio::spawn(async move {
            debug!(token = %name, "garbage-collecting expired token");
            for _ in 0..3 {
                match api.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => return,
                    Err(kube::Error::Api(ae)) if ae.code == 404 => return,
                    Err(_) => tokio::time::sleep(Duration::from_secs(1)).await,
                }
            }
        });
    }
}

#[async_trait]
impl TokenStore for CrdStore {
    async fn create_token(
        &self,
        ttl: Duration,
        opts: TokenCreateOptions,
    ) -> Result<BootstrapToken> {
        let raw = RawToken::generate();
        let token = BootstrapToken {
            token_id: raw.hex_id(),
            secret: raw.hex_secret(),
            metadata: TokenMetadata {
                lease_id: -1,
                ttl: ttl.as_secs() as i64,
                usage_count: 0,
                labels: opts.labels.clone(),
                capabilities: opts.capabilities,
            },
        };
        let obj = objects::BootstrapToken {
            metadata: ObjectMeta {
                name: Some(token.token_id.clone()),
                labels: (!opts.labels.is_empty()).then_some(opts.labels),
                ..Default::default()
            },
            spec: BootstrapTokenSpec {
                token: token.clone(),
            },
        };
        let api: Api<objects::BootstrapToken> = self.api();
        ok_or_kube_error(api.create(&PostParams::default(), &obj).await)?;
        Ok(token)
    }

    async fn delete_token(&self, reference: &Reference) -> Result<()> {
        let api: Api<objects::BootstrapToken> = self.api();
        ok_or_kube_error(api.delete(&reference.id, &DeleteParams::default()).await)?;
        Ok(())
    }

    async fn get_token(&self, reference: &Reference) -> Result<BootstrapToken> {
        let api: Api<objects::BootstrapToken> = self.api();
        let obj = api.get(&reference.id).await.map_err(map_kube_error)?;
        if remaining_ttl(&obj) <= 0 {
            self.garbage_collect_token(reference.id.clone());
            return Err(StorageError::NotFound);
        }
        Ok(to_model(&obj))
    }

    async fn update_token(
        &self,
        reference: &Reference,
        mutator: TokenMutator,
    ) -> Result<BootstrapToken> {
        let api: Api<objects::BootstrapToken> = self.api();
        retry_on_conflict("update_token", || {
            let api = api.clone();
            let mutator = mutator.clone();
            let name = reference.id.clone();
            async move {
                let mut obj = api.get(&name).await.map_err(map_kube_error)?;
                if remaining_ttl(&obj) <= 0 {
                    return Err(StorageError::NotFound);
                }
                mutator(&mut obj.spec.token);
                let updated = api
                    .replace(&name, &PostParams::default(), &obj)
                    .await
                    .map_err(map_kube_error)?;
                Ok(to_model(&updated))
            }
        })
        .await
    }

    async fn list_tokens(&self) -> Result<Vec<BootstrapToken>> {
        let api: Api<objects::BootstrapToken> = self.api();
        let list = ok_or_kube_error(api.list(&Default::default()).await)?;
        let mut tokens = Vec::with_capacity(list.items.len());
        for obj in &list.items {
            if remaining_ttl(obj) <= 0 {
                if let Some(name) = obj.metadata.name.clone() {
                    self.garbage_collect_token(name);
                }
                continue;
            }
            tokens.push(to_model(obj));
        }
        Ok(tokens)
    }
}
