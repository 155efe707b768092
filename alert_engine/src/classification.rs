// Classification overrides
//
// User-assigned component/layer metadata for a rule, stored apart from the
// rule definition. Requests are patches with three states per field:
//
//   absent  -> Unset  (leave stored value alone)
//   null    -> Clear  (remove stored value)
//   "value" -> Set    (store value; an empty string clears)
//
// Entries whose fields are all empty are never kept.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::alert_rule::is_valid_label_name;
use crate::error::ValidationError;
use crate::identity::RuleIdentity;

const MAX_COMPONENT_LEN: usize = 63;

// ============================================================================
// Layer
// ============================================================================

/// Scope an alert's impact is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Cluster,
    Namespace,
}

impl Layer {
    pub const ALL: [Layer; 2] = [Layer::Cluster, Layer::Namespace];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Cluster => "cluster",
            Layer::Namespace => "namespace",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Layer::ALL
            .into_iter()
            .find(|layer| layer.as_str() == s)
            .ok_or_else(|| ValidationError::InvalidLayer {
                given: s.to_string(),
                expected: Layer::ALL
                    .iter()
                    .map(Layer::as_str)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

// ============================================================================
// Stored entry
// ============================================================================

/// Stored classification of one rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    /// Label whose runtime value supplies the component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_from: Option<String>,
    /// Label whose runtime value supplies the layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_from: Option<String>,
}

impl ClassificationOverride {
    pub fn is_empty(&self) -> bool {
        self.component.is_none()
            && self.layer.is_none()
            && self.component_from.is_none()
            && self.layer_from.is_none()
    }
}

// ============================================================================
// Patches
// ============================================================================

/// One field of a classification patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FieldPatch<T> {
    #[default]
    Unset,
    Clear,
    Set(T),
}

impl<T> FieldPatch<T> {
    pub fn is_unset(&self) -> bool {
        matches!(self, FieldPatch::Unset)
    }
}

impl<T> From<Option<T>> for FieldPatch<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => FieldPatch::Set(v),
            None => FieldPatch::Clear,
        }
    }
}

// Missing fields never reach this impl: `#[serde(default)]` yields Unset.
impl<'de, T: Deserialize<'de>> Deserialize<'de> for FieldPatch<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<T>::deserialize(deserializer).map(FieldPatch::from)
    }
}

impl<T: Serialize> Serialize for FieldPatch<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldPatch::Set(v) => serializer.serialize_some(v),
            FieldPatch::Unset | FieldPatch::Clear => serializer.serialize_none(),
        }
    }
}

/// Requested change to a rule's classification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationPatch {
    #[serde(default, skip_serializing_if = "FieldPatch::is_unset")]
    pub component: FieldPatch<String>,
    #[serde(default, skip_serializing_if = "FieldPatch::is_unset")]
    pub layer: FieldPatch<String>,
    #[serde(default, skip_serializing_if = "FieldPatch::is_unset")]
    pub component_from: FieldPatch<String>,
    #[serde(default, skip_serializing_if = "FieldPatch::is_unset")]
    pub layer_from: FieldPatch<String>,
}

impl ClassificationPatch {
    /// True when every field is unset.
    pub fn is_noop(&self) -> bool {
        self.component.is_unset()
            && self.layer.is_unset()
            && self.component_from.is_unset()
            && self.layer_from.is_unset()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(layer) = set_value(&self.layer) {
            layer.parse::<Layer>()?;
        }
        if let Some(component) = set_value(&self.component) {
            if !is_valid_label_value(component) {
                return Err(ValidationError::InvalidComponent(component.to_string()));
            }
        }
        for from in [&self.component_from, &self.layer_from] {
            if let Some(label) = set_value(from) {
                if !is_valid_label_name(label) {
                    return Err(ValidationError::InvalidLabelName(label.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Applies the patch to a stored entry. Returns None when nothing is left.
    pub fn apply(&self, current: Option<ClassificationOverride>) -> Option<ClassificationOverride> {
        let mut entry = current.unwrap_or_default();
        apply_field(&mut entry.component, &self.component);
        apply_field(&mut entry.layer, &self.layer);
        apply_field(&mut entry.component_from, &self.component_from);
        apply_field(&mut entry.layer_from, &self.layer_from);
        (!entry.is_empty()).then_some(entry)
    }
}

fn set_value(field: &FieldPatch<String>) -> Option<&str> {
    match field {
        FieldPatch::Set(v) if !v.is_empty() => Some(v.as_str()),
        _ => None,
    }
}

fn apply_field(slot: &mut Option<String>, patch: &FieldPatch<String>) {
    match patch {
        FieldPatch::Unset => {}
        FieldPatch::Clear => *slot = None,
        FieldPatch::Set(v) if v.is_empty() => *slot = None,
        FieldPatch::Set(v) => *slot = Some(v.clone()),
    }
}

/// Kubernetes label value grammar, non-empty.
fn is_valid_label_value(value: &str) -> bool {
    if value.is_empty() || value.len() > MAX_COMPONENT_LEN {
        return false;
    }
    let bytes = value.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_alphanumeric();
    edge_ok(bytes[0])
        && edge_ok(bytes[bytes.len() - 1])
        && bytes
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
}

// ============================================================================
// Keys
// ============================================================================

/// Container key for a rule identity: URL-safe base64 without padding.
pub fn encode_key(identity: &RuleIdentity) -> String {
    base64::encode_config(identity.as_str(), base64::URL_SAFE_NO_PAD)
}

pub fn decode_key(key: &str) -> Result<RuleIdentity, ValidationError> {
    let bytes = base64::decode_config(key, base64::URL_SAFE_NO_PAD)
        .map_err(|e| ValidationError::InvalidKey(e.to_string()))?;
    String::from_utf8(bytes)
        .map(RuleIdentity::from)
        .map_err(|e| ValidationError::InvalidKey(e.to_string()))
}
