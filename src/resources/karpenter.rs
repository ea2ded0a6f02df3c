//! Karpenter node pools used to provision builder capacity on demand.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ObjectMeta, impl_resource};

/// Cluster-scoped pool of autoscaled nodes.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodePool {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Pool specification.
    #[serde(default)]
    pub spec: NodePoolSpec,
}

impl_resource!(NodePool, "karpenter.sh/v1beta1", "NodePool", "nodepools", false);

/// Pool specification.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodePoolSpec {
    /// Consolidation and expiry.
    pub disruption: Disruption,
    /// Template for launched nodes.
    pub template: NodeClaimTemplate,
}

/// Consolidation and expiry policy.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Disruption {
    /// `WhenUnderutilized` or `WhenEmpty`.
    pub consolidation_policy: String,
    /// Node lifetime, for example `720h`.
    pub expire_after: String,
}

/// Template for launched nodes.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodeClaimTemplate {
    /// Node labels.
    pub metadata: NodeClaimMeta,
    /// Node requirements.
    pub spec: NodeClaimSpec,
}

/// Labels applied to launched nodes.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodeClaimMeta {
    /// Node labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Node requirements.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimSpec {
    /// Provider node class.
    pub node_class_ref: NodeClassRef,
    /// Taints applied to launched nodes.
    #[serde(default)]
    pub taints: Vec<Taint>,
    /// Instance selection constraints.
    #[serde(default)]
    pub requirements: Vec<NodeRequirement>,
}

/// Provider node class reference.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeClassRef {
    /// Node class API version.
    pub api_version: String,
    /// Node class kind.
    pub kind: String,
    /// Node class name.
    pub name: String,
}

/// Node taint.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Taint {
    /// Taint key.
    pub key: String,
    /// Taint value.
    pub value: String,
    /// Scheduling effect.
    pub effect: String,
}

/// Instance selection constraint.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodeRequirement {
    /// Well-known label key.
    pub key: String,
    /// `In`, `NotIn`, `Gt`, ...
    pub operator: String,
    /// Operand values.
    pub values: Vec<String>,
}
