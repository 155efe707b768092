// Alert rule data model
//
// An AlertRule is the semantic content of one alerting or recording rule as
// it appears inside its owning resource. Values are immutable once read:
// any edit builds a new AlertRule rather than mutating a shared one.
//
// Labels prefixed with SYSTEM_LABEL_PREFIX are stamped by this system
// (identity, provenance, source) and are never part of a rule's business
// content.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::ValidationError;

/// Rule label and annotation maps. Iteration order carries no meaning.
pub type Labels = HashMap<String, String>;

// ============================================================================
// Reserved label names
// ============================================================================

/// Label carrying the alert name on every alerting rule instance.
pub const ALERT_NAME_LABEL: &str = "alertname";

/// Label Prometheus injects for namespaced rules.
pub const NAMESPACE_LABEL: &str = "namespace";

/// Prefix of every label this system owns.
pub const SYSTEM_LABEL_PREFIX: &str = "openshift_io_";

/// Label holding the rule's content-addressed identity.
pub const RULE_ID_LABEL: &str = "openshift_io_alert_rule_id";

/// Namespace of the resource that defines the rule.
pub const SOURCE_NAMESPACE_LABEL: &str = "openshift_io_prometheus_rule_namespace";

/// Name of the resource that defines the rule.
pub const SOURCE_NAME_LABEL: &str = "openshift_io_prometheus_rule_name";

/// Provenance of the defining resource (`gitops` / `operator`).
pub const RULE_MANAGED_BY_LABEL: &str = "openshift_io_rule_managed_by";

/// Provenance of the override resource attached to the rule, if any.
pub const OVERRIDE_MANAGED_BY_LABEL: &str = "openshift_io_relabel_config_managed_by";

/// Returns true for labels excluded from a rule's business content.
pub fn is_system_label(name: &str) -> bool {
    name == ALERT_NAME_LABEL || name.starts_with(SYSTEM_LABEL_PREFIX)
}

/// Business labels of a label set, sorted by key.
pub fn business_labels(labels: &Labels) -> BTreeMap<&str, &str> {
    labels
        .iter()
        .filter(|(k, _)| !is_system_label(k))
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

/// Prometheus label name grammar: `[a-zA-Z_][a-zA-Z0-9_]*`.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ============================================================================
// AlertRule
// ============================================================================

/// Whether a rule raises alerts or records a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Alert,
    Record,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Alert => "alert",
            RuleKind::Record => "record",
        }
    }
}

/// One alerting or recording rule definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    pub expr: String,
    #[serde(rename = "for", default, skip_serializing_if = "Option::is_none")]
    pub for_duration: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: Labels,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: Labels,
}

impl AlertRule {
    /// Creates an alerting rule with the given name and expression.
    pub fn alert(name: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            alert: Some(name.into()),
            expr: expr.into(),
            ..Default::default()
        }
    }

    /// Creates a recording rule with the given series name and expression.
    pub fn record(name: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            record: Some(name.into()),
            expr: expr.into(),
            ..Default::default()
        }
    }

    pub fn with_for(mut self, duration: impl Into<String>) -> Self {
        self.for_duration = Some(duration.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Alert name if set, otherwise the recording name.
    pub fn name(&self) -> Option<&str> {
        self.alert
            .as_deref()
            .filter(|n| !n.is_empty())
            .or_else(|| self.record.as_deref().filter(|n| !n.is_empty()))
    }

    pub fn kind(&self) -> RuleKind {
        if self.alert.as_deref().map_or(false, |n| !n.is_empty()) {
            RuleKind::Alert
        } else {
            RuleKind::Record
        }
    }

    /// Rejects rules that cannot be tracked or evaluated.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name().is_none() {
            return Err(ValidationError::MissingName);
        }
        if self.expr.trim().is_empty() {
            return Err(ValidationError::EmptyExpression);
        }
        for key in self.labels.keys() {
            if !is_valid_label_name(key) {
                return Err(ValidationError::InvalidLabelName(key.clone()));
            }
        }
        Ok(())
    }
}

impl AsRef<AlertRule> for AlertRule {
    fn as_ref(&self) -> &AlertRule {
        self
    }
}

// ============================================================================
// Source and trust class
// ============================================================================

/// Coarse trust boundary derived from the owning namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustClass {
    /// Namespace under platform policy: labels change only via scoped overrides.
    PlatformManaged,
    /// Namespace owned by users: rules are edited in place.
    UserDefined,
}

/// Owning resource of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleSource {
    pub namespace: String,
    pub name: String,
}

impl RuleSource {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_labels_include_alertname_and_prefix() {
        assert!(is_system_label("alertname"));
        assert!(is_system_label(RULE_ID_LABEL));
        assert!(!is_system_label("severity"));
        assert!(!is_system_label("namespace"));
    }

    #[test]
    fn business_labels_are_sorted_and_filtered() {
        let rule = AlertRule::alert("X", "up == 0")
            .with_label("team", "a")
            .with_label("severity", "warning")
            .with_label(RULE_ID_LABEL, "X;abc")
            .with_label("alertname", "X");
        let labels: Vec<_> = business_labels(&rule.labels).into_iter().collect();
        assert_eq!(labels, vec![("severity", "warning"), ("team", "a")]);
    }

    #[test]
    fn label_name_grammar() {
        assert!(is_valid_label_name("severity"));
        assert!(is_valid_label_name("_private9"));
        assert!(!is_valid_label_name("9lives"));
        assert!(!is_valid_label_name("team-name"));
        assert!(!is_valid_label_name(""));
    }

    #[test]
    fn name_prefers_alert_over_record() {
        let rule = AlertRule {
            alert: Some("A".into()),
            record: Some("job:up:sum".into()),
            expr: "up".into(),
            ..Default::default()
        };
        assert_eq!(rule.name(), Some("A"));
        assert_eq!(rule.kind(), RuleKind::Alert);

        let record = AlertRule::record("job:up:sum", "sum(up)");
        assert_eq!(record.name(), Some("job:up:sum"));
        assert_eq!(record.kind(), RuleKind::Record);
    }

    #[test]
    fn validate_rejects_missing_name_and_bad_labels() {
        assert_eq!(
            AlertRule::alert("", "up").validate(),
            Err(ValidationError::MissingName)
        );
        assert_eq!(
            AlertRule::alert("X", "  ").validate(),
            Err(ValidationError::EmptyExpression)
        );
        assert!(matches!(
            AlertRule::alert("X", "up").with_label("bad-key", "v").validate(),
            Err(ValidationError::InvalidLabelName(_))
        ));
    }

    #[test]
    fn for_field_uses_prometheus_name() {
        let rule = AlertRule::alert("X", "up == 0").with_for("5m");
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["for"], "5m");
        assert!(json.get("record").is_none());
    }
}
