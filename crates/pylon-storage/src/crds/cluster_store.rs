//! Cluster store on custom resources
//!
//! Cluster labels are mirrored into the object's metadata labels so that
//! equality selectors can be pushed down to the API server; expression
//! selectors are evaluated client-side after listing.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};

use pylon_common::core::{
    selector_matches, Cluster, ClusterList, LabelSelector, MatchOptions, Reference,
};

use super::objects::{self, ClusterSpec};
use super::{map_kube_error, ok_or_kube_error, CrdStore};
use crate::{retry_on_conflict, ClusterMutator, ClusterStore, Result};

fn to_object(cluster: &Cluster) -> objects::Cluster {
    objects::Cluster {
        metadata: ObjectMeta {
            name: Some(cluster.id.clone()),
            labels: (!cluster.labels.is_empty()).then(|| cluster.labels.clone()),
            ..Default::default()
        },
        spec: ClusterSpec {
            cluster: cluster.clone(),
        },
    }
}

/// The server-side selector string for the equality part of a selector
fn push_down_selector(selector: Option<&LabelSelector>) -> Option<String> {
    let selector = selector?;
    if selector.match_labels.is_empty() {
        return None;
    }
    Some(
        selector
            .match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}

#[async_trait]
impl ClusterStore for CrdStore {
    async fn create_cluster(&self, cluster: &Cluster) -> Result<()> {
        let api: Api<objects::Cluster> = self.api();
        ok_or_kube_error(
            api.create(&PostParams::default(), &to_object(cluster))
                .await,
        )?;
        Ok(())
    }

    async fn delete_cluster(&self, reference: &Reference) -> Result<()> {
        let api: Api<objects::Cluster> = self.api();
        ok_or_kube_error(api.delete(&reference.id, &DeleteParams::default()).await)?;
        Ok(())
    }

    async fn get_cluster(&self, reference: &Reference) -> Result<Cluster> {
        let api: Api<objects::Cluster> = self.api();
        let obj = api.get(&reference.id).await.map_err(map_kube_error)?;
        Ok(obj.spec.cluster)
    }

    async fn update_cluster(
        &self,
        reference: &Reference,
        mutator: ClusterMutator,
    ) -> Result<Cluster> {
        let api: Api<objects::Cluster> = self.api();
        retry_on_conflict("update_cluster", || {
            let api = api.clone();
            let mutator = mutator.clone();
            let name = reference.id.clone();
            async move {
                let mut obj = api.get(&name).await.map_err(map_kube_error)?;
                mutator(&mut obj.spec.cluster);
                // keep the metadata mirror in sync for server-side filtering
                obj.metadata.labels =
                    (!obj.spec.cluster.labels.is_empty()).then(|| obj.spec.cluster.labels.clone());
                let updated = api
                    .replace(&name, &PostParams::default(), &obj)
                    .await
                    .map_err(map_kube_error)?;
                Ok(updated.spec.cluster)
            }
        })
        .await
    }

    async fn list_clusters(
        &self,
        selector: Option<&LabelSelector>,
        opts: MatchOptions,
    ) -> Result<ClusterList> {
        let api: Api<objects::Cluster> = self.api();
        let mut params = ListParams::default();
        if let Some(labels) = push_down_selector(selector) {
            params = params.labels(&labels);
        }
        let list = ok_or_kube_error(api.list(&params).await)?;
        Ok(ClusterList {
            items: list
                .items
                .into_iter()
                .map(|obj| obj.spec.cluster)
                .filter(|c| selector_matches(selector, opts, &c.labels))
                .collect(),
        })
    }
}
