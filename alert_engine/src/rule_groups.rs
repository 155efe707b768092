// Copy-on-write editing of rule groups
//
// Every edit returns a new PrometheusRule; the input is never mutated, so a
// value shared with readers of a cached snapshot stays intact. Rules are
// located by identity, recomputed from their content.

use crate::alert_rule::AlertRule;
use crate::identity::{compute_identity, RuleIdentity};
use crate::resource::{PrometheusRule, RuleGroup};

impl PrometheusRule {
    /// Iterates `(group name, rule)` over every rule of the resource.
    pub fn rules(&self) -> impl Iterator<Item = (&str, &AlertRule)> + '_ {
        self.groups
            .iter()
            .flat_map(|g| g.rules.iter().map(move |r| (g.name.as_str(), r)))
    }

    /// Whether any rule of the resource has the given identity.
    pub fn contains_rule(&self, identity: &RuleIdentity) -> bool {
        self.rules().any(|(_, r)| &compute_identity(r) == identity)
    }

    /// Copy with the first rule matching `identity` replaced by `rule`.
    pub fn with_rule_replaced(&self, identity: &RuleIdentity, rule: AlertRule) -> Option<Self> {
        let mut replacement = Some(rule);
        let groups = self
            .groups
            .iter()
            .map(|group| RuleGroup {
                name: group.name.clone(),
                interval: group.interval.clone(),
                rules: group
                    .rules
                    .iter()
                    .map(|r| {
                        if replacement.is_some() && &compute_identity(r) == identity {
                            if let Some(new) = replacement.take() {
                                return new;
                            }
                        }
                        r.clone()
                    })
                    .collect(),
            })
            .collect();

        if replacement.is_some() {
            return None;
        }
        Some(Self {
            metadata: self.metadata.clone(),
            groups,
        })
    }

    /// Copy without the first rule matching `identity`. Groups left empty go too.
    pub fn without_rule(&self, identity: &RuleIdentity) -> Option<Self> {
        let mut removed = false;
        let mut groups = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            let mut rules = Vec::with_capacity(group.rules.len());
            for rule in &group.rules {
                if !removed && &compute_identity(rule) == identity {
                    removed = true;
                    continue;
                }
                rules.push(rule.clone());
            }
            if !rules.is_empty() {
                groups.push(RuleGroup {
                    name: group.name.clone(),
                    interval: group.interval.clone(),
                    rules,
                });
            }
        }

        removed.then(|| Self {
            metadata: self.metadata.clone(),
            groups,
        })
    }

    /// Copy with `rule` appended to group `group`, created when missing.
    pub fn with_rule_added(&self, group: &str, rule: AlertRule) -> Self {
        let mut groups = self.groups.clone();
        match groups.iter_mut().find(|g| g.name == group) {
            Some(existing) => existing.rules.push(rule),
            None => groups.push(RuleGroup {
                name: group.to_string(),
                interval: None,
                rules: vec![rule],
            }),
        }
        Self {
            metadata: self.metadata.clone(),
            groups,
        }
    }
}
