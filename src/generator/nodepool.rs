//! Karpenter node pool reserved for image builds.

use std::collections::BTreeMap;

use crate::resources::ObjectMeta;
use crate::resources::karpenter::{
    Disruption, NodeClaimMeta, NodeClaimSpec, NodeClaimTemplate, NodeClassRef, NodePool,
    NodePoolSpec, NodeRequirement, Taint,
};

use super::{BUILDER_NODE_LABEL, BUILDER_NODE_VALUE};

/// Name of the shared builder node pool.
pub const NODE_POOL_NAME: &str = "vm-image-builder";

fn requirement(key: &str, operator: &str, values: &[&str]) -> NodeRequirement {
    NodeRequirement {
        key: key.to_owned(),
        operator: operator.to_owned(),
        values: values.iter().map(|value| (*value).to_owned()).collect(),
    }
}

/// Pool of spot bare-metal instances able to run nested virtualisation,
/// tainted so only builder workloads land on it.
#[must_use]
pub fn builder_node_pool() -> NodePool {
    NodePool {
        metadata: ObjectMeta::cluster_scoped(NODE_POOL_NAME),
        spec: NodePoolSpec {
            disruption: Disruption {
                consolidation_policy: String::from("WhenUnderutilized"),
                expire_after: String::from("720h"),
            },
            template: NodeClaimTemplate {
                metadata: NodeClaimMeta {
                    labels: BTreeMap::from([
                        (BUILDER_NODE_LABEL.to_owned(), BUILDER_NODE_VALUE.to_owned()),
                        (String::from("kubevirt.io/schedulable"), String::from("true")),
                    ]),
                },
                spec: NodeClaimSpec {
                    node_class_ref: NodeClassRef {
                        api_version: String::from("karpenter.k8s.aws/v1beta1"),
                        kind: String::from("EC2NodeClass"),
                        name: String::from("default"),
                    },
                    taints: vec![Taint {
                        key: BUILDER_NODE_LABEL.to_owned(),
                        value: BUILDER_NODE_VALUE.to_owned(),
                        effect: String::from("NoSchedule"),
                    }],
                    requirements: vec![
                        requirement("kubernetes.io/arch", "In", &["amd64"]),
                        requirement("kubernetes.io/os", "In", &["linux"]),
                        requirement("karpenter.sh/capacity-type", "In", &["spot"]),
                        requirement("karpenter.k8s.aws/instance-category", "In", &["c", "m", "r"]),
                        requirement("karpenter.k8s.aws/instance-generation", "Gt", &["4"]),
                        requirement("karpenter.k8s.aws/instance-size", "In", &["metal"]),
                    ],
                },
            },
        },
    }
}
