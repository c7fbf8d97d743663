//! Subject-access evaluation and taint population
//!
//! Role bindings are never rejected for referential integrity at write
//! time. Instead, reads derive a `taints` list describing anything the
//! binding points at that no longer exists; taints annotate but never
//! exclude a binding from evaluation.

use std::collections::BTreeSet;

use pylon_common::core::{ClusterList, MatchOptions, Reference, RoleBinding};

use crate::{Backend, Result, StorageError};

/// Recompute the derived `taints` field of a binding
pub async fn populate_taints(store: &dyn Backend, binding: &mut RoleBinding) -> Result<()> {
    binding.taints.clear();
    match store.get_role(&Reference::new(&binding.role_id)).await {
        Ok(role) => {
            for cluster_id in &role.cluster_ids {
                match store.get_cluster(&Reference::new(cluster_id)).await {
                    Ok(_) => {}
                    Err(StorageError::NotFound) => binding
                        .taints
                        .push(format!("cluster {cluster_id} not found")),
                    Err(e) => return Err(e),
                }
            }
        }
        Err(StorageError::NotFound) => binding
            .taints
            .push(format!("role {} not found", binding.role_id)),
        Err(e) => return Err(e),
    }
    Ok(())
}

/// Compute the set of clusters a subject can access
///
/// A cluster is included when some role binding lists the subject and its
/// role either names the cluster id directly or carries a label selector
/// matching the cluster's labels. An empty selector matches nothing here; a
/// role must select clusters explicitly to grant access. The result is
/// deduplicated.
pub async fn subject_access(store: &dyn Backend, subject: &str) -> Result<ClusterList> {
    let bindings = store.list_role_bindings().await?;
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut items = Vec::new();

    for binding in bindings.items {
        if !binding.subjects.iter().any(|s| s == subject) {
            continue;
        }
        let role = match store.get_role(&Reference::new(&binding.role_id)).await {
            Ok(role) => role,
            // tainted binding: role is gone, grants nothing
            Err(StorageError::NotFound) => continue,
            Err(e) => return Err(e),
        };

        for cluster_id in &role.cluster_ids {
            match store.get_cluster(&Reference::new(cluster_id)).await {
                Ok(cluster) => {
                    if seen.insert(cluster.id.clone()) {
                        items.push(cluster);
                    }
                }
                Err(StorageError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(selector) = &role.match_labels {
            let matched = store
                .list_clusters(Some(selector), MatchOptions::EmptySelectorMatchesNone)
                .await?;
            for cluster in matched.items {
                if seen.insert(cluster.id.clone()) {
                    items.push(cluster);
                }
            }
        }
    }

    Ok(ClusterList { items })
}
