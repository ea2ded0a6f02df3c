//! Typed descriptions of the cluster objects the builder creates and watches.
//!
//! Only the fields the builder reads or writes are modelled. Every struct
//! tolerates unknown fields on the way in, so full server responses decode
//! into these shapes without loss of the parts we care about.

pub mod batch;
pub mod core;
pub mod karpenter;
pub mod kubevirt;

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A cluster object addressable by API group/version, kind, and plural name.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// `apiVersion` written on the wire (for example `kubevirt.io/v1`).
    const API_VERSION: &'static str;
    /// `kind` written on the wire.
    const KIND: &'static str;
    /// Plural resource name used in REST paths.
    const PLURAL: &'static str;
    /// Whether the resource lives inside a namespace.
    const NAMESPACED: bool;

    /// Returns the object metadata.
    fn metadata(&self) -> &ObjectMeta;
}

macro_rules! impl_resource {
    ($ty:ty, $api_version:literal, $kind:literal, $plural:literal, $namespaced:literal) => {
        impl $crate::resources::Resource for $ty {
            const API_VERSION: &'static str = $api_version;
            const KIND: &'static str = $kind;
            const PLURAL: &'static str = $plural;
            const NAMESPACED: bool = $namespaced;

            fn metadata(&self) -> &$crate::resources::ObjectMeta {
                &self.metadata
            }
        }
    };
}

pub(crate) use impl_resource;

/// Serialises a resource and stamps `apiVersion`/`kind` onto the payload.
///
/// # Errors
///
/// Returns the underlying [`serde_json::Error`] when serialisation fails.
pub fn to_wire<R: Resource>(resource: &R) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(resource)?;
    if let Value::Object(map) = &mut value {
        map.insert(
            String::from("apiVersion"),
            Value::String(R::API_VERSION.to_owned()),
        );
        map.insert(String::from("kind"), Value::String(R::KIND.to_owned()));
    }
    Ok(value)
}

/// Standard object metadata.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name, unique per namespace and kind.
    #[serde(default)]
    pub name: String,
    /// Namespace for namespaced kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Server-assigned identifier, required for owner references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Labels attached to the object.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Controllers whose deletion cascades to this object.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    /// Metadata for a namespaced object.
    #[must_use]
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_owned(),
            namespace: Some(namespace.to_owned()),
            ..Self::default()
        }
    }

    /// Metadata for a cluster-scoped object.
    #[must_use]
    pub fn cluster_scoped(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }

    /// Appends a controller owner reference.
    #[must_use]
    pub fn owned_by(mut self, owner: OwnerReference) -> Self {
        self.owner_references.push(owner);
        self
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_owned(), value.to_owned());
        self
    }
}

/// Back-reference from a dependent object to its controller.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    /// Owner `apiVersion`.
    pub api_version: String,
    /// Owner `kind`.
    pub kind: String,
    /// Owner name.
    pub name: String,
    /// Owner UID.
    #[serde(default)]
    pub uid: String,
    /// Marks the owner as the managing controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    /// Blocks owner deletion until this dependent is gone under foreground
    /// propagation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

impl OwnerReference {
    /// Builds a controller reference pointing at `owner`.
    #[must_use]
    pub fn controller_of<R: Resource>(owner: &R) -> Self {
        let metadata = owner.metadata();
        Self {
            api_version: R::API_VERSION.to_owned(),
            kind: R::KIND.to_owned(),
            name: metadata.name.clone(),
            uid: metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

/// Named reference to an object in the same namespace.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct LocalObjectReference {
    /// Referenced object name.
    pub name: String,
}

impl LocalObjectReference {
    /// Creates a reference to `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Compute resource requests and limits.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ResourceRequirements {
    /// Minimum resources requested.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    /// Hard resource limits.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

/// Taint toleration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Toleration {
    /// Taint key.
    pub key: String,
    /// Match operator, `Equal` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    /// Taint value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Taint effect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
}

/// Boolean-valued status condition shared by VMs and jobs.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Condition {
    /// Condition type (for example `Ready` or `Complete`).
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False`, or `Unknown`.
    pub status: String,
    /// Human readable explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Machine readable reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Condition {
    /// Returns true when this is a `kind=True` condition.
    #[must_use]
    pub fn is_true(&self, kind: &str) -> bool {
        self.type_ == kind && self.status == "True"
    }
}

/// List envelope returned by collection GETs.
#[derive(Clone, Debug, Deserialize)]
pub struct ObjectList<R> {
    /// Items in the collection.
    #[serde(default = "Vec::new")]
    pub items: Vec<R>,
}
