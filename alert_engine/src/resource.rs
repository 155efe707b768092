// Resource kinds the engine reads and writes
//
// These are plain value types mirroring the Kubernetes objects involved:
// rule-defining resources, label-override resources, key/value containers
// and the secret holding the relabel configuration. Fetching and watching
// them is the bridge's concern.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::alert_rule::AlertRule;
use crate::relabel::RelabelConfig;

// ============================================================================
// Metadata
// ============================================================================

/// Namespace/name pair addressing a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub controller: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    /// Opaque version used for optimistic concurrency; `None` before creation.
    #[serde(default)]
    pub resource_version: Option<String>,
    /// Set once deletion has been requested.
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// Common accessors over every resource kind.
pub trait Resource: Clone + Send + Sync + 'static {
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }
}

macro_rules! impl_resource {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Resource for $ty {
                fn meta(&self) -> &ObjectMeta {
                    &self.metadata
                }

                fn meta_mut(&mut self) -> &mut ObjectMeta {
                    &mut self.metadata
                }
            }
        )*
    };
}

// ============================================================================
// Resource kinds
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleGroup {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default)]
    pub rules: Vec<AlertRule>,
}

/// A rule-defining resource: named groups of rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrometheusRule {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub groups: Vec<RuleGroup>,
}

/// Scoped label overrides for a rule this system does not own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideResource {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub configs: Vec<RelabelConfig>,
}

/// Generic string key/value container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// Secret holding binary payloads by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretResource {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, Vec<u8>>,
}

impl_resource!(PrometheusRule, OverrideResource, Container, SecretResource);

// ============================================================================
// Provenance
// ============================================================================

/// Who keeps a resource in its current shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagedBy {
    GitOps,
    Operator,
}

impl ManagedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagedBy::GitOps => "gitops",
            ManagedBy::Operator => "operator",
        }
    }
}

const GITOPS_KEY_PREFIXES: &[&str] = &[
    "argocd.argoproj.io/",
    "kustomize.toolkit.fluxcd.io/",
    "helm.toolkit.fluxcd.io/",
];

const GITOPS_MANAGERS: &[&str] = &["argocd", "argo-cd", "flux", "fluxcd"];

/// Derives provenance from ownership metadata.
///
/// GitOps tracking labels or annotations win over controller owner
/// references, since a GitOps tool may deploy an operator-owned object.
pub fn managed_by(meta: &ObjectMeta) -> Option<ManagedBy> {
    let tracked = meta
        .labels
        .keys()
        .chain(meta.annotations.keys())
        .any(|k| GITOPS_KEY_PREFIXES.iter().any(|p| k.starts_with(p)));
    let managed_label = meta
        .labels
        .get("app.kubernetes.io/managed-by")
        .map(|v| v.to_ascii_lowercase());

    if tracked
        || managed_label
            .as_deref()
            .map_or(false, |v| GITOPS_MANAGERS.contains(&v))
    {
        return Some(ManagedBy::GitOps);
    }

    if meta.owner_references.iter().any(|r| r.controller) {
        return Some(ManagedBy::Operator);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provenance_defaults_to_unset() {
        assert_eq!(managed_by(&ObjectMeta::new("ns", "r")), None);
    }

    #[test]
    fn argocd_annotation_marks_gitops() {
        let mut meta = ObjectMeta::new("ns", "r");
        meta.annotations
            .insert("argocd.argoproj.io/tracking-id".into(), "app:x".into());
        meta.owner_references.push(OwnerReference {
            kind: "Deployment".into(),
            controller: true,
            ..Default::default()
        });
        assert_eq!(managed_by(&meta), Some(ManagedBy::GitOps));
    }

    #[test]
    fn managed_by_label_marks_gitops() {
        let mut meta = ObjectMeta::new("ns", "r");
        meta.labels
            .insert("app.kubernetes.io/managed-by".into(), "Flux".into());
        assert_eq!(managed_by(&meta), Some(ManagedBy::GitOps));
    }

    #[test]
    fn controller_owner_marks_operator() {
        let mut meta = ObjectMeta::new("ns", "r");
        meta.owner_references.push(OwnerReference {
            api_version: "v1".into(),
            kind: "ClusterOperator".into(),
            name: "monitoring".into(),
            controller: true,
        });
        assert_eq!(managed_by(&meta), Some(ManagedBy::Operator));

        meta.owner_references[0].controller = false;
        assert_eq!(managed_by(&meta), None);
    }
}
