//! Core data model shared between the gateway and agents
//!
//! These types are persisted by the storage backends and exchanged over the
//! management surface, so they are serde- and schemars-derived throughout.
//! Label selector matching mirrors the Kubernetes semantics
//! (`matchLabels` equals-all plus `matchExpressions` with
//! `In`/`NotIn`/`Exists`/`DoesNotExist`).

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A reference to a stored object by id
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Reference {
    pub id: String,
}

impl Reference {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl From<&str> for Reference {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Metadata attached to a persisted bootstrap token
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TokenMetadata {
    /// Backend lease id when the backend tracks TTL natively, -1 otherwise
    #[serde(default = "no_lease")]
    pub lease_id: i64,
    /// Remaining time to live in seconds; a value <= 0 reads as absent
    pub ttl: i64,
    /// Number of successful auth operations performed with this token
    #[serde(default)]
    pub usage_count: u64,
    /// Labels inherited by clusters created with this token
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Capability strings granted to the holder
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn no_lease() -> i64 {
    -1
}

/// A bootstrap token as persisted by the token store
///
/// Both fields are hex-encoded; `token_id` is the lookup key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapToken {
    pub token_id: String,
    pub secret: String,
    pub metadata: TokenMetadata,
}

impl BootstrapToken {
    pub fn reference(&self) -> Reference {
        Reference::new(&self.token_id)
    }
}

/// A downstream metrics cluster registered with the gateway
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Cluster {
    pub id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Cluster {
    pub fn reference(&self) -> Reference {
        Reference::new(&self.id)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ClusterList {
    pub items: Vec<Cluster>,
}

/// A downstream logging cluster, linked to a log-store user record
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoggingCluster {
    pub id: String,
    pub name: String,
    pub opensearch_user_id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl LoggingCluster {
    pub fn reference(&self) -> Reference {
        Reference::new(&self.id)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LoggingClusterList {
    pub items: Vec<LoggingCluster>,
}

/// Credentials for an index user in the log store
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OpensearchUser {
    pub id: String,
    pub secret: String,
}

/// A role granting access to a set of clusters, by id or by label selection
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: String,
    #[serde(default)]
    pub cluster_ids: Vec<String>,
    #[serde(default)]
    pub match_labels: Option<LabelSelector>,
}

impl Role {
    pub fn reference(&self) -> Reference {
        Reference::new(&self.id)
    }
}

/// Binds subjects to a role
///
/// `taints` is never persisted; it is populated at read time when the
/// referenced role or one of the listed clusters no longer exists.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoleBinding {
    pub id: String,
    pub role_id: String,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub taints: Vec<String>,
}

impl RoleBinding {
    pub fn reference(&self) -> Reference {
        Reference::new(&self.id)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RoleList {
    pub items: Vec<Role>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RoleBindingList {
    pub items: Vec<RoleBinding>,
}

/// Selector operators, mirroring Kubernetes label selector requirements
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum LabelSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A single selector requirement
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: LabelSelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

/// A label selector combining equality matches and expression requirements
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// Whether the given label set satisfies every requirement of this selector
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        for (k, v) in &self.match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
        for req in &self.match_expressions {
            let value = labels.get(&req.key);
            let ok = match req.operator {
                LabelSelectorOperator::In => {
                    value.is_some_and(|v| req.values.iter().any(|c| c == v))
                }
                LabelSelectorOperator::NotIn => {
                    !value.is_some_and(|v| req.values.iter().any(|c| c == v))
                }
                LabelSelectorOperator::Exists => value.is_some(),
                LabelSelectorOperator::DoesNotExist => value.is_none(),
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

/// Options controlling how an absent or empty selector is interpreted by
/// list operations
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MatchOptions {
    /// An empty selector matches everything
    #[default]
    Default,
    /// An empty selector matches nothing
    EmptySelectorMatchesNone,
}

/// Evaluate a selector against a label set under the given options
pub fn selector_matches(
    selector: Option<&LabelSelector>,
    opts: MatchOptions,
    labels: &BTreeMap<String, String>,
) -> bool {
    match selector {
        Some(s) if !s.is_empty() => s.matches(labels),
        _ => opts == MatchOptions::Default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn match_labels_requires_all_pairs() {
        let selector = LabelSelector {
            match_labels: labels(&[("env", "prod"), ("team", "obs")]),
            match_expressions: vec![],
        };

        assert!(selector.matches(&labels(&[("env", "prod"), ("team", "obs"), ("extra", "x")])));
        assert!(!selector.matches(&labels(&[("env", "prod")])));
        assert!(!selector.matches(&labels(&[("env", "staging"), ("team", "obs")])));
    }

    #[test]
    fn match_expressions_cover_all_operators() {
        let selector = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![
                LabelSelectorRequirement {
                    key: "env".into(),
                    operator: LabelSelectorOperator::In,
                    values: vec!["prod".into(), "staging".into()],
                },
                LabelSelectorRequirement {
                    key: "region".into(),
                    operator: LabelSelectorOperator::NotIn,
                    values: vec!["us-east-1".into()],
                },
                LabelSelectorRequirement {
                    key: "team".into(),
                    operator: LabelSelectorOperator::Exists,
                    values: vec![],
                },
                LabelSelectorRequirement {
                    key: "deprecated".into(),
                    operator: LabelSelectorOperator::DoesNotExist,
                    values: vec![],
                },
            ],
        };

        assert!(selector.matches(&labels(&[
            ("env", "prod"),
            ("region", "eu-west-1"),
            ("team", "obs"),
        ])));
        // wrong In value
        assert!(!selector.matches(&labels(&[
            ("env", "dev"),
            ("region", "eu-west-1"),
            ("team", "obs"),
        ])));
        // NotIn hit
        assert!(!selector.matches(&labels(&[
            ("env", "prod"),
            ("region", "us-east-1"),
            ("team", "obs"),
        ])));
        // Exists missing
        assert!(!selector.matches(&labels(&[("env", "prod"), ("region", "eu-west-1")])));
        // DoesNotExist present
        assert!(!selector.matches(&labels(&[
            ("env", "prod"),
            ("region", "eu-west-1"),
            ("team", "obs"),
            ("deprecated", "yes"),
        ])));
    }

    #[test]
    fn not_in_accepts_absent_key() {
        let selector = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![LabelSelectorRequirement {
                key: "region".into(),
                operator: LabelSelectorOperator::NotIn,
                values: vec!["us-east-1".into()],
            }],
        };
        assert!(selector.matches(&BTreeMap::new()));
    }

    #[test]
    fn empty_selector_behavior_depends_on_match_options() {
        let empty = LabelSelector::default();
        let l = labels(&[("any", "thing")]);

        assert!(selector_matches(Some(&empty), MatchOptions::Default, &l));
        assert!(selector_matches(None, MatchOptions::Default, &l));
        assert!(!selector_matches(
            Some(&empty),
            MatchOptions::EmptySelectorMatchesNone,
            &l
        ));
        assert!(!selector_matches(
            None,
            MatchOptions::EmptySelectorMatchesNone,
            &l
        ));
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let token = BootstrapToken {
            token_id: "abc".into(),
            secret: "def".into(),
            metadata: TokenMetadata {
                lease_id: 7,
                ttl: 300,
                usage_count: 1,
                labels: BTreeMap::new(),
                capabilities: vec!["join".into()],
            },
        };
        let json = serde_json::to_value(&token).unwrap();
        assert!(json.get("tokenID").is_none());
        assert_eq!(json["tokenId"], "abc");
        assert_eq!(json["metadata"]["usageCount"], 1);
        assert_eq!(json["metadata"]["leaseId"], 7);
    }
}
