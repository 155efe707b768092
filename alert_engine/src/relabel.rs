// Relabel engine
//
// A fold over an ordered list of relabel entries. Each entry first matches:
// the values of its source labels are joined with its separator and tested
// against its fully anchored regex. Matching entries then apply:
//
//   replace  - set target_label to the expanded replacement; an empty
//              expansion removes the label
//   drop     - stop and exclude the label set
//   keep     - no-op when matched, exclude the label set otherwise
//
// hashmod, labelmap, labeldrop and labelkeep parse but are not applied.
// Rules never carry those actions in practice, so they are accepted and
// skipped rather than rejected.

use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::alert_rule::Labels;

pub const DEFAULT_SEPARATOR: &str = ";";
pub const DEFAULT_REGEX: &str = "(.*)";
pub const DEFAULT_REPLACEMENT: &str = "$1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelabelAction {
    #[default]
    Replace,
    Keep,
    Drop,
    HashMod,
    LabelMap,
    LabelDrop,
    LabelKeep,
}

/// One relabel entry, using Prometheus field names and defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelabelConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_labels: Vec<String>,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_regex")]
    pub regex: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_label: String,
    #[serde(default = "default_replacement")]
    pub replacement: String,
    #[serde(default)]
    pub action: RelabelAction,
}

fn default_separator() -> String {
    DEFAULT_SEPARATOR.to_string()
}

fn default_regex() -> String {
    DEFAULT_REGEX.to_string()
}

fn default_replacement() -> String {
    DEFAULT_REPLACEMENT.to_string()
}

impl Default for RelabelConfig {
    fn default() -> Self {
        Self {
            source_labels: Vec::new(),
            separator: default_separator(),
            regex: default_regex(),
            target_label: String::new(),
            replacement: default_replacement(),
            action: RelabelAction::Replace,
        }
    }
}

impl RelabelConfig {
    /// `replace` entry writing `replacement` into `target_label` when matched.
    pub fn replace(
        source_labels: Vec<String>,
        regex: impl Into<String>,
        target_label: impl Into<String>,
        replacement: impl Into<String>,
    ) -> Self {
        Self {
            source_labels,
            regex: regex.into(),
            target_label: target_label.into(),
            replacement: replacement.into(),
            action: RelabelAction::Replace,
            ..Default::default()
        }
    }

    /// `drop` entry excluding label sets that match.
    pub fn drop(source_labels: Vec<String>, regex: impl Into<String>) -> Self {
        Self {
            source_labels,
            regex: regex.into(),
            action: RelabelAction::Drop,
            ..Default::default()
        }
    }
}

/// Result of running the engine over a label set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelabelOutcome {
    Keep(Labels),
    Drop,
}

struct CompiledEntry {
    config: RelabelConfig,
    // None when the regex failed to compile; such entries never match.
    regex: Option<Regex>,
}

/// Relabel entries with their regexes compiled once.
pub struct RelabelEngine {
    entries: Vec<CompiledEntry>,
}

impl RelabelEngine {
    pub fn new(configs: &[RelabelConfig]) -> Self {
        let entries = configs
            .iter()
            .map(|config| {
                let regex = match Regex::new(&format!("^(?:{})$", config.regex)) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!("Ignoring relabel entry with invalid regex {:?}: {}", config.regex, e);
                        None
                    }
                };
                CompiledEntry {
                    config: config.clone(),
                    regex,
                }
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies every entry in order.
    pub fn process(&self, mut labels: Labels) -> RelabelOutcome {
        for entry in &self.entries {
            let config = &entry.config;
            let value = config
                .source_labels
                .iter()
                .map(|name| labels.get(name).map(String::as_str).unwrap_or(""))
                .collect::<Vec<_>>()
                .join(&config.separator);

            let captures = entry.regex.as_ref().and_then(|re| re.captures(&value));

            match config.action {
                RelabelAction::Replace => {
                    let Some(captures) = captures else { continue };
                    if config.target_label.is_empty() {
                        continue;
                    }
                    let mut expanded = String::new();
                    captures.expand(&config.replacement, &mut expanded);
                    if expanded.is_empty() {
                        labels.remove(&config.target_label);
                    } else {
                        labels.insert(config.target_label.clone(), expanded);
                    }
                }
                RelabelAction::Drop => {
                    if captures.is_some() {
                        debug!("Relabel drop matched {:?}", value);
                        return RelabelOutcome::Drop;
                    }
                }
                RelabelAction::Keep => {
                    if captures.is_none() {
                        debug!("Relabel keep did not match {:?}", value);
                        return RelabelOutcome::Drop;
                    }
                }
                RelabelAction::HashMod
                | RelabelAction::LabelMap
                | RelabelAction::LabelDrop
                | RelabelAction::LabelKeep => {}
            }
        }
        RelabelOutcome::Keep(labels)
    }
}

/// Applies `configs` to `labels` without keeping the compiled engine.
pub fn process(configs: &[RelabelConfig], labels: Labels) -> RelabelOutcome {
    RelabelEngine::new(configs).process(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn keep(outcome: RelabelOutcome) -> Labels {
        match outcome {
            RelabelOutcome::Keep(l) => l,
            RelabelOutcome::Drop => panic!("unexpected drop"),
        }
    }

    #[test]
    fn replace_sets_target_when_matched() {
        let configs = vec![RelabelConfig::replace(
            vec!["alertname".into(), "severity".into()],
            "Watchdog;none",
            "severity",
            "info",
        )];
        let out = keep(process(
            &configs,
            labels(&[("alertname", "Watchdog"), ("severity", "none")]),
        ));
        assert_eq!(out["severity"], "info");

        let untouched = keep(process(
            &configs,
            labels(&[("alertname", "Other"), ("severity", "none")]),
        ));
        assert_eq!(untouched["severity"], "none");
    }

    #[test]
    fn regex_is_fully_anchored() {
        let configs = vec![RelabelConfig::replace(
            vec!["alertname".into()],
            "Watch",
            "team",
            "x",
        )];
        let out = keep(process(&configs, labels(&[("alertname", "Watchdog")])));
        assert!(!out.contains_key("team"));
    }

    #[test]
    fn replace_expands_captures_and_empty_removes() {
        let configs = vec![
            RelabelConfig::replace(vec!["team".into()], "team-(.*)", "owner", "$1"),
            RelabelConfig::replace(vec!["owner".into()], "a", "team", ""),
        ];
        let out = keep(process(&configs, labels(&[("team", "team-a")])));
        assert_eq!(out.get("owner").map(String::as_str), Some("a"));
        assert!(!out.contains_key("team"));
    }

    #[test]
    fn drop_aborts_processing() {
        let configs = vec![
            RelabelConfig::drop(vec!["severity".into()], "none"),
            RelabelConfig::replace(vec![], "", "never", "set"),
        ];
        assert_eq!(
            process(&configs, labels(&[("severity", "none")])),
            RelabelOutcome::Drop
        );
    }

    #[test]
    fn keep_drops_non_matching_sets() {
        let configs = vec![RelabelConfig {
            source_labels: vec!["severity".into()],
            regex: "critical|warning".into(),
            action: RelabelAction::Keep,
            ..Default::default()
        }];
        assert!(matches!(
            process(&configs, labels(&[("severity", "warning")])),
            RelabelOutcome::Keep(_)
        ));
        assert_eq!(
            process(&configs, labels(&[("severity", "info")])),
            RelabelOutcome::Drop
        );
    }

    #[test]
    fn unimplemented_actions_are_skipped() {
        let configs = vec![
            RelabelConfig {
                regex: "(.*)".into(),
                action: RelabelAction::LabelDrop,
                ..Default::default()
            },
            RelabelConfig {
                action: RelabelAction::HashMod,
                target_label: "shard".into(),
                ..Default::default()
            },
        ];
        let input = labels(&[("severity", "warning")]);
        assert_eq!(keep(process(&configs, input.clone())), input);
    }

    #[test]
    fn invalid_regex_never_matches() {
        let configs = vec![RelabelConfig::drop(vec!["severity".into()], "(unclosed")];
        assert!(matches!(
            process(&configs, labels(&[("severity", "(unclosed")])),
            RelabelOutcome::Keep(_)
        ));
    }

    #[test]
    fn missing_source_labels_join_as_empty() {
        let configs = vec![RelabelConfig::replace(
            vec!["a".into(), "b".into()],
            ";x",
            "hit",
            "yes",
        )];
        let out = keep(process(&configs, labels(&[("b", "x")])));
        assert_eq!(out["hit"], "yes");
    }

    #[test]
    fn defaults_follow_prometheus() {
        let parsed: RelabelConfig =
            serde_json::from_str(r#"{"target_label": "team", "replacement": "a"}"#).unwrap();
        assert_eq!(parsed.separator, ";");
        assert_eq!(parsed.regex, "(.*)");
        assert_eq!(parsed.action, RelabelAction::Replace);

        let drop: RelabelConfig =
            serde_json::from_str(r#"{"source_labels": ["x"], "action": "drop"}"#).unwrap();
        assert_eq!(drop.action, RelabelAction::Drop);
        assert_eq!(drop.replacement, "$1");
    }
}
