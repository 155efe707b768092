// Scoped label override synthesis
//
// Platform rules belong to other controllers and are never edited in
// place. Label changes are expressed as relabel entries in a per-rule
// override resource instead:
//
//   [anchor]    replace: RULE_ID_LABEL must be unset and alertname + sorted
//               business labels must match the rule's original values
//               exactly; writes the rule identity into RULE_ID_LABEL
//   [override]* replace: RULE_ID_LABEL == identity -> target = value
//   [drop]?     drop:    RULE_ID_LABEL == identity
//
// Every override and drop entry is keyed on the identity label rather than
// on business labels, so it can only ever touch the instance the anchor
// stamped. An instance is stamped at most once: after another rule's
// overrides make it look like a sibling, the sibling's anchor no longer
// matches it. Entries of this identity are recognised structurally, which
// makes re-synthesis idempotent and lets silence (drop) entries survive
// label edits untouched.

use regex::escape;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::alert_rule::{
    is_system_label, is_valid_label_name, Labels, ALERT_NAME_LABEL, NAMESPACE_LABEL,
    RULE_ID_LABEL,
};
use crate::error::ValidationError;
use crate::identity::RuleIdentity;
use crate::relabel::{RelabelAction, RelabelConfig, DEFAULT_SEPARATOR};

/// What to do with the override resource of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Synthesis {
    /// Current entries already express the request.
    Unchanged,
    /// Replace the resource's entries with these (creating it if missing).
    Write(Vec<RelabelConfig>),
    /// The resource no longer carries anything useful.
    Delete,
}

// ============================================================================
// Entry construction
// ============================================================================

fn escape_replacement(value: &str) -> String {
    value.replace('$', "$$")
}

fn unescape_replacement(value: &str) -> String {
    value.replace("$$", "$")
}

/// Entry stamping `identity` onto instances matching the original labels.
pub fn anchor_entry(identity: &RuleIdentity, alert_name: &str, original: &Labels) -> RelabelConfig {
    let business: BTreeMap<&str, &str> = original
        .iter()
        .filter(|(k, _)| !is_system_label(k) && k.as_str() != NAMESPACE_LABEL)
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    // Leading empty component: only unstamped instances match.
    let mut source_labels = vec![RULE_ID_LABEL.to_string(), ALERT_NAME_LABEL.to_string()];
    let mut parts = vec![String::new(), escape(alert_name)];
    for (key, value) in business {
        source_labels.push(key.to_string());
        parts.push(escape(value));
    }

    RelabelConfig::replace(
        source_labels,
        parts.join(DEFAULT_SEPARATOR),
        RULE_ID_LABEL,
        escape_replacement(identity.as_str()),
    )
}

fn override_entry(identity: &RuleIdentity, label: &str, value: &str) -> RelabelConfig {
    RelabelConfig::replace(
        vec![RULE_ID_LABEL.to_string()],
        escape(identity.as_str()),
        label,
        escape_replacement(value),
    )
}

fn drop_entry(identity: &RuleIdentity) -> RelabelConfig {
    RelabelConfig::drop(vec![RULE_ID_LABEL.to_string()], escape(identity.as_str()))
}

// ============================================================================
// Entry classification
// ============================================================================

fn is_anchor_for(config: &RelabelConfig, identity: &RuleIdentity) -> bool {
    config.action == RelabelAction::Replace
        && config.target_label == RULE_ID_LABEL
        && config.replacement == escape_replacement(identity.as_str())
}

fn is_scoped_to(config: &RelabelConfig, identity: &RuleIdentity) -> bool {
    config.source_labels.len() == 1
        && config.source_labels[0] == RULE_ID_LABEL
        && config.regex == escape(identity.as_str())
}

fn is_drop_for(config: &RelabelConfig, identity: &RuleIdentity) -> bool {
    config.action == RelabelAction::Drop && is_scoped_to(config, identity)
}

fn override_of<'a>(config: &'a RelabelConfig, identity: &RuleIdentity) -> Option<(&'a str, String)> {
    let is_override = config.action == RelabelAction::Replace
        && is_scoped_to(config, identity)
        && !config.target_label.is_empty()
        && config.target_label != RULE_ID_LABEL;
    is_override.then(|| (config.target_label.as_str(), unescape_replacement(&config.replacement)))
}

fn belongs_to(config: &RelabelConfig, identity: &RuleIdentity) -> bool {
    is_anchor_for(config, identity) || is_scoped_to(config, identity)
}

/// Label overrides currently applied to `identity`, later entries winning.
pub fn current_overrides(identity: &RuleIdentity, configs: &[RelabelConfig]) -> BTreeMap<String, String> {
    configs
        .iter()
        .filter_map(|c| override_of(c, identity))
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Whether a drop (silence) entry for `identity` is present.
pub fn is_dropped(identity: &RuleIdentity, configs: &[RelabelConfig]) -> bool {
    configs.iter().any(|c| is_drop_for(c, identity))
}

/// Original labels layered with the overrides recorded for `identity`.
pub fn effective_labels(
    identity: &RuleIdentity,
    original: &Labels,
    configs: &[RelabelConfig],
) -> Labels {
    let mut labels = original.clone();
    for (key, value) in current_overrides(identity, configs) {
        if value.is_empty() {
            labels.remove(&key);
        } else {
            labels.insert(key, value);
        }
    }
    labels
}

fn validate_delta(delta: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    for key in delta.keys() {
        if !is_valid_label_name(key) {
            return Err(ValidationError::InvalidLabelName(key.clone()));
        }
        if is_system_label(key) || key == NAMESPACE_LABEL {
            return Err(ValidationError::ProtectedLabel(key.clone()));
        }
    }
    Ok(())
}

// ============================================================================
// Operations
// ============================================================================

/// Computes the override entries expressing `delta` on top of `existing`.
///
/// `delta` maps label names to desired values; an empty value withdraws a
/// previous override for that label. Overrides equal to the original value
/// are omitted. Drop entries and entries of other identities are carried
/// over verbatim.
pub fn synthesize_override(
    identity: &RuleIdentity,
    alert_name: &str,
    original: &Labels,
    existing: &[RelabelConfig],
    delta: &BTreeMap<String, String>,
) -> Result<Synthesis, ValidationError> {
    validate_delta(delta)?;

    let current = current_overrides(identity, existing);
    let mut desired = current.clone();
    for (key, value) in delta {
        if value.is_empty() {
            desired.remove(key);
        } else {
            desired.insert(key.clone(), value.clone());
        }
    }
    desired.retain(|key, value| original.get(key) != Some(value));

    if desired == current {
        return Ok(Synthesis::Unchanged);
    }

    let mut configs: Vec<RelabelConfig> = existing
        .iter()
        .filter(|c| !belongs_to(c, identity))
        .cloned()
        .collect();
    let drops: Vec<RelabelConfig> = existing
        .iter()
        .filter(|c| is_drop_for(c, identity))
        .cloned()
        .collect();

    if !desired.is_empty() || !drops.is_empty() {
        let anchor = existing
            .iter()
            .find(|c| is_anchor_for(c, identity))
            .cloned()
            .unwrap_or_else(|| anchor_entry(identity, alert_name, original));
        configs.push(anchor);
        configs.extend(desired.iter().map(|(k, v)| override_entry(identity, k, v)));
        configs.extend(drops);
    }

    Ok(finish(existing, configs))
}

/// Ensures `identity` is stamped and dropped. Inserts only what is missing.
pub fn drop_rule(
    identity: &RuleIdentity,
    alert_name: &str,
    original: &Labels,
    existing: &[RelabelConfig],
) -> Synthesis {
    let has_anchor = existing.iter().any(|c| is_anchor_for(c, identity));
    let has_drop = is_dropped(identity, existing);
    if has_anchor && has_drop {
        return Synthesis::Unchanged;
    }

    let mut configs = existing.to_vec();
    if !has_anchor {
        // The stamp must run before anything keyed on the identity label.
        let position = configs
            .iter()
            .position(|c| is_scoped_to(c, identity))
            .unwrap_or(configs.len());
        configs.insert(position, anchor_entry(identity, alert_name, original));
    }
    if !has_drop {
        configs.push(drop_entry(identity));
    }
    Synthesis::Write(configs)
}

/// Removes the drop entries of `identity`.
///
/// When no overrides of the identity remain, its anchor goes too; an empty
/// result deletes the resource.
pub fn restore_rule(identity: &RuleIdentity, existing: &[RelabelConfig]) -> Synthesis {
    if !is_dropped(identity, existing) {
        return Synthesis::Unchanged;
    }

    let keep_anchor = !current_overrides(identity, existing).is_empty();
    let configs: Vec<RelabelConfig> = existing
        .iter()
        .filter(|c| !is_drop_for(c, identity))
        .filter(|c| keep_anchor || !is_anchor_for(c, identity))
        .cloned()
        .collect();

    finish(existing, configs)
}

fn finish(existing: &[RelabelConfig], configs: Vec<RelabelConfig>) -> Synthesis {
    if configs.is_empty() {
        if existing.is_empty() {
            Synthesis::Unchanged
        } else {
            Synthesis::Delete
        }
    } else if configs == existing {
        Synthesis::Unchanged
    } else {
        Synthesis::Write(configs)
    }
}

/// Name of the override resource carrying entries for `identity`.
///
/// DNS-1123 compliant: `arc-<alert name slug>-<12 hex chars>`.
pub fn override_resource_name(identity: &RuleIdentity) -> String {
    let mut slug = String::new();
    for c in identity.rule_name().chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.truncate(40);
    let slug = slug.trim_end_matches('-');

    let digest = hex::encode(Sha256::digest(identity.as_str().as_bytes()));
    if slug.is_empty() {
        format!("arc-{}", &digest[..12])
    } else {
        format!("arc-{}-{}", slug, &digest[..12])
    }
}
