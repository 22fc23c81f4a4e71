//! Minimal resource model shared by watch sources and reconcilers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identity and bookkeeping metadata carried by every managed resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name, unique within its namespace and kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Namespace; `None` or empty for cluster-scoped resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Server-assigned unique ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// Opaque version string, bumped on every write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Metadata for a namespaced resource.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    /// Metadata for a cluster-scoped resource.
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

/// Anything the controller can watch and reconcile.
pub trait Resource {
    /// Resource kind, e.g. `Pod`.
    fn kind(&self) -> &str;

    /// Object metadata.
    fn meta(&self) -> &ObjectMeta;
}

/// A resource of any kind with an untyped spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicObject {
    pub kind: String,

    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: serde_json::Value,
}

impl DynamicObject {
    /// Create an object with an empty spec.
    pub fn new(kind: impl Into<String>, metadata: ObjectMeta) -> Self {
        Self {
            kind: kind.into(),
            metadata,
            spec: serde_json::Value::Null,
        }
    }

    /// Replace the spec.
    pub fn with_spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = spec;
        self
    }

    /// Set the resource version.
    pub fn with_resource_version(mut self, version: impl Into<String>) -> Self {
        self.metadata.resource_version = Some(version.into());
        self
    }
}

impl Resource for DynamicObject {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
}
