//! Rule-group discovery and streaming
//!
//! Discovery runs on its own task: every interval it asks the configured
//! [`RuleFinder`] for the current rule groups, marshals them to YAML
//! documents, and publishes the snapshot into a latest-wins slot. The
//! sender loop drains the slot and uploads each document to the gateway,
//! retrying failures until either the upload succeeds, a newer snapshot
//! preempts it, or the agent shuts down.
//!
//! Delivery properties: at most one in-flight sync, snapshots are never
//! mixed across generations (preemption restarts the whole batch), and a
//! successful upload logs exactly one line with the document count.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, ListParams};
use kube::CustomResource;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::GatewayHttpClient;

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("rule discovery is not configured")]
    NotConfigured,

    #[error("failed to list rules: {0}")]
    Discovery(String),
}

/// One alerting or recording rule in Prometheus format
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    pub expr: String,
    #[serde(rename = "for", default, skip_serializing_if = "Option::is_none")]
    pub for_: Option<String>,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub labels: std::collections::BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub annotations: std::collections::BTreeMap<String, String>,
}

/// A named group of rules
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RuleGroup {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Source of rule-group snapshots
#[async_trait]
pub trait RuleFinder: Send + Sync {
    async fn find_groups(&self) -> Result<Vec<RuleGroup>, RulesError>;
}

/// Spec of the upstream PrometheusRule custom resource, reduced to the
/// fields the agent forwards
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "PrometheusRule",
    plural = "prometheusrules",
    namespaced
)]
pub struct PrometheusRuleSpec {
    #[serde(default)]
    pub groups: Vec<RuleGroup>,
}

/// Finds rule groups in PrometheusRule objects across namespaces
pub struct PrometheusRuleFinder {
    client: kube::Client,
    namespaces: Vec<String>,
}

impl PrometheusRuleFinder {
    /// `namespaces` limits the search; empty searches the whole cluster
    pub fn new(client: kube::Client, namespaces: Vec<String>) -> Self {
        Self { client, namespaces }
    }
}

#[async_trait]
impl RuleFinder for PrometheusRuleFinder {
    async fn find_groups(&self) -> Result<Vec<RuleGroup>, RulesError> {
        let apis: Vec<Api<PrometheusRule>> = if self.namespaces.is_empty() {
            vec![Api::all(self.client.clone())]
        } else {
            self.namespaces
                .iter()
                .map(|ns| Api::namespaced(self.client.clone(), ns))
                .collect()
        };

        let mut groups = Vec::new();
        for api in apis {
            let list = api
                .list(&ListParams::default())
                .await
                .map_err(|e| RulesError::Discovery(e.to_string()))?;
            for rule in list.items {
                groups.extend(rule.spec.groups);
            }
        }
        debug!(count = groups.len(), "discovered rule groups");
        Ok(groups)
    }
}

/// One marshaled snapshot: a list of YAML documents, one per group
pub type Snapshot = Arc<Vec<Vec<u8>>>;

/// Marshal groups to YAML documents, skipping any that fail to serialize
pub fn marshal_rule_groups(groups: &[RuleGroup]) -> Vec<Vec<u8>> {
    let mut docs = Vec::with_capacity(groups.len());
    for group in groups {
        match serde_yaml::to_string(group) {
            Ok(doc) => docs.push(doc.into_bytes()),
            Err(e) => {
                error!(group = %group.name, error = %e, "failed to marshal rule group");
            }
        }
    }
    docs
}

/// Timing knobs for the sender loop
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Per-document upload timeout
    pub request_timeout: Duration,
    /// Delay before retrying a failed batch
    pub retry_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_secs(5),
        }
    }
}

/// Spawn the periodic discovery task, returning the latest-wins snapshot
/// receiver
///
/// A fresh snapshot is published immediately and then on every tick. The
/// task stops when the token is cancelled.
pub fn stream_rule_group_updates(
    cancel: CancellationToken,
    finder: Arc<dyn RuleFinder>,
    interval: Duration,
) -> watch::Receiver<Option<Snapshot>> {
    let (tx, rx) = watch::channel(None);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => {
                    debug!("rule discovery stopped");
                    return;
                }
            }
            match finder.find_groups().await {
                Ok(groups) => {
                    debug!("received updated rule groups from discovery");
                    let snapshot: Snapshot = Arc::new(marshal_rule_groups(&groups));
                    if tx.send(Some(snapshot)).is_err() {
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "rule discovery failed"),
            }
        }
    });
    rx
}

/// Upload snapshots to the gateway until cancelled
///
/// A failed upload backs off and retries the same batch unless a newer
/// snapshot arrives first, in which case the newer batch replaces it
/// immediately. Cancellation returns promptly even during backoff.
pub async fn stream_rules_to_gateway(
    cancel: CancellationToken,
    client: Arc<GatewayHttpClient>,
    mut updates: watch::Receiver<Option<Snapshot>>,
    config: SyncConfig,
) {
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    debug!("rule discovery stream closed");
                    return;
                }
            }
            _ = cancel.cancelled() => return,
        }
        let Some(mut docs) = updates.borrow_and_update().clone() else {
            continue;
        };

        'retry: loop {
            debug!("sending alert rules to gateway");
            for doc in docs.iter() {
                let result = client
                    .post("/api/agent/sync_rules")
                    .header(CONTENT_TYPE, HeaderValue::from_static("application/yaml"))
                    .body(doc.clone())
                    .timeout(config.request_timeout)
                    .send()
                    .await;

                let failure = match result {
                    Ok((StatusCode::ACCEPTED, _)) => None,
                    Ok((code, _)) => Some(format!("unexpected status {code}")),
                    Err(e) => Some(e.to_string()),
                };
                if let Some(reason) = failure {
                    error!(
                        error = %reason,
                        backoff = ?config.retry_backoff,
                        "failed to send alert rules to gateway, will retry"
                    );
                    tokio::select! {
                        changed = updates.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            if let Some(newer) = updates.borrow_and_update().clone() {
                                debug!("updated rules were received during backoff, retrying immediately");
                                docs = newer;
                            }
                            continue 'retry;
                        }
                        _ = tokio::time::sleep(config.retry_backoff) => continue 'retry,
                        _ = cancel.cancelled() => return,
                    }
                }
            }
            info!(count = docs.len(), "successfully sent rule groups to gateway");
            break;
        }
    }
}
