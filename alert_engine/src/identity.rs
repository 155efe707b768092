// Content-addressed rule identity
//
// identity = "<name>;<hex(sha256(canonical content))>"
//
// The canonical content is newline separated:
//   kind, name, canonical expression, duration,
//   sorted business labels as k=v joined by commas,
//   sorted annotations as k=v joined by commas.
// System labels and the alert name label never contribute, so stamping a
// rule with its own identity or provenance does not change the identity.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::alert_rule::{business_labels, AlertRule};
use crate::promql::canonicalize;

/// Stable identifier of a rule's business content.
///
/// An empty identity means the rule has no name and cannot be tracked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleIdentity(String);

impl RuleIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        RuleIdentity(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Rule name portion of the identity.
    pub fn rule_name(&self) -> &str {
        self.0.rsplit_once(';').map_or(self.0.as_str(), |(name, _)| name)
    }

    /// Hex digest portion of the identity.
    pub fn digest(&self) -> &str {
        self.0.rsplit_once(';').map_or("", |(_, digest)| digest)
    }
}

impl std::fmt::Display for RuleIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RuleIdentity {
    fn from(s: String) -> Self {
        RuleIdentity(s)
    }
}

impl From<&str> for RuleIdentity {
    fn from(s: &str) -> Self {
        RuleIdentity(s.to_string())
    }
}

/// Computes the identity of a rule. Returns an empty identity for unnamed rules.
pub fn compute_identity(rule: &AlertRule) -> RuleIdentity {
    let Some(name) = rule.name() else {
        return RuleIdentity::default();
    };

    let mut hasher = Sha256::new();
    hasher.update(canonical_content(rule, name).as_bytes());
    RuleIdentity(format!("{};{}", name, hex::encode(hasher.finalize())))
}

fn canonical_content(rule: &AlertRule, name: &str) -> String {
    let labels = join_pairs(business_labels(&rule.labels));
    let annotations = join_pairs(
        rule.annotations
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect(),
    );

    format!(
        "kind={}\nname={}\nexpr={}\nfor={}\nlabels={}\nannotations={}",
        rule.kind().as_str(),
        name,
        canonicalize(&rule.expr),
        rule.for_duration.as_deref().unwrap_or("").trim(),
        labels,
        annotations,
    )
}

fn join_pairs(pairs: BTreeMap<&str, &str>) -> String {
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert_rule::{ALERT_NAME_LABEL, RULE_ID_LABEL, SOURCE_NAMESPACE_LABEL};

    fn base() -> AlertRule {
        AlertRule::alert("HighErrorRate", "rate(errors_total[5m]) > 0.1")
            .with_for("10m")
            .with_label("severity", "warning")
            .with_label("team", "payments")
            .with_annotation("summary", "errors are high")
            .with_annotation("runbook", "https://runbooks/errors")
    }

    #[test]
    fn identity_has_name_prefix_and_sha256_digest() {
        let id = compute_identity(&base());
        assert_eq!(id.rule_name(), "HighErrorRate");
        assert_eq!(id.digest().len(), 64);
        assert!(id.digest().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let reordered = AlertRule::alert("HighErrorRate", "rate(errors_total[5m]) > 0.1")
            .with_for("10m")
            .with_annotation("runbook", "https://runbooks/errors")
            .with_label("team", "payments")
            .with_annotation("summary", "errors are high")
            .with_label("severity", "warning");
        assert_eq!(compute_identity(&base()), compute_identity(&reordered));
    }

    #[test]
    fn system_labels_are_ignored() {
        let stamped = base()
            .with_label(RULE_ID_LABEL, "HighErrorRate;deadbeef")
            .with_label(SOURCE_NAMESPACE_LABEL, "openshift-monitoring")
            .with_label(ALERT_NAME_LABEL, "HighErrorRate");
        assert_eq!(compute_identity(&base()), compute_identity(&stamped));
    }

    #[test]
    fn every_business_field_changes_the_identity() {
        let original = compute_identity(&base());
        let mut variants = vec![
            AlertRule {
                alert: Some("LowErrorRate".into()),
                ..base()
            },
            AlertRule {
                expr: "rate(errors_total[5m]) > 0.2".into(),
                ..base()
            },
            base().with_for("15m"),
            base().with_label("severity", "critical"),
            base().with_label("extra", "x"),
            base().with_annotation("summary", "changed"),
        ];
        let mut recording = base();
        recording.record = recording.alert.take();
        variants.push(recording);

        let mut seen = std::collections::HashSet::new();
        seen.insert(original.clone());
        for variant in &variants {
            let id = compute_identity(variant);
            assert_ne!(id, original, "variant {:?} collided", variant);
            assert!(seen.insert(id), "two variants collided");
        }
    }

    #[test]
    fn expression_formatting_does_not_matter() {
        let a = AlertRule::alert("X", "up == 0").with_label("severity", "warning");
        let b = AlertRule::alert("X", "up==0").with_label("severity", "warning");
        assert_eq!(compute_identity(&a), compute_identity(&b));
    }

    #[test]
    fn unnamed_rule_has_empty_identity() {
        let rule = AlertRule {
            expr: "up".into(),
            ..Default::default()
        };
        assert!(compute_identity(&rule).is_empty());
    }

    #[test]
    fn identity_parts_split_on_last_separator() {
        let id = RuleIdentity::new("a;b;cafe");
        assert_eq!(id.rule_name(), "a;b");
        assert_eq!(id.digest(), "cafe");
    }
}
