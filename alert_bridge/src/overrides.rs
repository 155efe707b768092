//! Label overrides, drop and restore for platform-managed rules.
//!
//! Platform rules are never edited in their owning resource. Each one gets
//! at most one override resource in the override namespace, whose relabel
//! entries are synthesized by `alert_engine::label_diff` and written with
//! version-checked read-modify-write.

use log::info;
use std::collections::BTreeMap;
use std::sync::Arc;

use alert_engine::label_diff::{self, current_overrides, Synthesis};
use alert_engine::{
    managed_by, override_resource_name, synthesize_override, ManagedBy, ObjectMeta,
    OverrideResource, RuleIdentity, TrustClass,
};

use crate::clients::ResourceClient;
use crate::config::BridgeConfig;
use crate::error::{ManagementError, StoreError};
use crate::retry::{retry_on_conflict, with_deadline};
use crate::rule_view::{CanonicalRule, RuleView};

/// Annotation recording which rule an override resource belongs to.
pub const OVERRIDE_RULE_ANNOTATION: &str = "monitoring.openshift.io/alert-rule-id";

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGER_NAME: &str = "alert-management";

/// What a write did to the override resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideOutcome {
    Unchanged,
    Created,
    Updated,
    Deleted,
}

pub struct LabelOverrideService {
    config: BridgeConfig,
    view: Arc<RuleView>,
    client: Arc<dyn ResourceClient<OverrideResource>>,
}

impl LabelOverrideService {
    pub fn new(
        config: BridgeConfig,
        view: Arc<RuleView>,
        client: Arc<dyn ResourceClient<OverrideResource>>,
    ) -> Self {
        Self {
            config,
            view,
            client,
        }
    }

    /// Sets (or, with an empty value, withdraws) label overrides on a rule.
    pub async fn update_labels(
        &self,
        identity: &RuleIdentity,
        delta: BTreeMap<String, String>,
    ) -> Result<OverrideOutcome, ManagementError> {
        with_deadline(self.config.request_timeout, async {
            let rule = self.platform_rule(identity, "label overrides")?;
            let delta = &delta;
            let rule = &rule;
            let outcome = retry_on_conflict(self.config.max_write_attempts, "update labels", || async move {
                let existing = self.fetch(identity).await?;
                let configs = existing.as_ref().map_or(&[][..], |r| r.configs.as_slice());
                let synthesis = synthesize_override(
                    identity,
                    alert_name(rule),
                    &rule.original.labels,
                    configs,
                    delta,
                )?;
                self.apply(identity, existing, synthesis).await
            })
            .await?;
            info!("Label override for {}: {:?}", identity, outcome);
            Ok(outcome)
        })
        .await
    }

    /// Silences a rule by dropping it through relabeling.
    pub async fn drop_rule(&self, identity: &RuleIdentity) -> Result<OverrideOutcome, ManagementError> {
        with_deadline(self.config.request_timeout, async {
            let rule = self.platform_rule(identity, "drop")?;
            let rule = &rule;
            retry_on_conflict(self.config.max_write_attempts, "drop rule", || async move {
                let existing = self.fetch(identity).await?;
                let configs = existing.as_ref().map_or(&[][..], |r| r.configs.as_slice());
                let synthesis =
                    label_diff::drop_rule(identity, alert_name(rule), &rule.original.labels, configs);
                self.apply(identity, existing, synthesis).await
            })
            .await
        })
        .await
    }

    /// Undoes [`drop_rule`](Self::drop_rule).
    pub async fn restore_rule(&self, identity: &RuleIdentity) -> Result<OverrideOutcome, ManagementError> {
        with_deadline(self.config.request_timeout, async {
            self.platform_rule(identity, "restore")?;
            retry_on_conflict(self.config.max_write_attempts, "restore rule", || async move {
                let existing = self.fetch(identity).await?;
                let configs = existing.as_ref().map_or(&[][..], |r| r.configs.as_slice());
                let synthesis = label_diff::restore_rule(identity, configs);
                self.apply(identity, existing, synthesis).await
            })
            .await
        })
        .await
    }

    /// Label overrides currently recorded for a rule.
    pub async fn overrides(
        &self,
        identity: &RuleIdentity,
    ) -> Result<BTreeMap<String, String>, ManagementError> {
        with_deadline(self.config.request_timeout, async {
            let existing = self
                .client
                .get(&self.config.override_namespace, &override_resource_name(identity))
                .await?;
            Ok(existing
                .map(|r| current_overrides(identity, &r.configs))
                .unwrap_or_default())
        })
        .await
    }

    fn platform_rule(
        &self,
        identity: &RuleIdentity,
        action: &str,
    ) -> Result<Arc<CanonicalRule>, ManagementError> {
        let rule = self
            .view
            .lookup(identity)
            .ok_or_else(|| ManagementError::NotFound(format!("alert rule {}", identity)))?;
        if rule.trust == TrustClass::UserDefined {
            return Err(ManagementError::NotAllowed(format!(
                "{} is not available for user-defined rule {}; edit its PrometheusRule instead",
                action, identity
            )));
        }
        Ok(rule)
    }

    /// Current override resource, refusing GitOps-managed ones.
    async fn fetch(&self, identity: &RuleIdentity) -> Result<Option<OverrideResource>, ManagementError> {
        let name = override_resource_name(identity);
        let existing = self.client.get(&self.config.override_namespace, &name).await?;
        if let Some(resource) = &existing {
            if managed_by(&resource.metadata) == Some(ManagedBy::GitOps) {
                return Err(ManagementError::NotAllowed(format!(
                    "override resource {} is managed by GitOps",
                    resource.metadata.key()
                )));
            }
        }
        Ok(existing)
    }

    async fn apply(
        &self,
        identity: &RuleIdentity,
        existing: Option<OverrideResource>,
        synthesis: Synthesis,
    ) -> Result<OverrideOutcome, ManagementError> {
        match (synthesis, existing) {
            (Synthesis::Unchanged, _) | (Synthesis::Delete, None) => Ok(OverrideOutcome::Unchanged),
            (Synthesis::Write(configs), Some(mut resource)) => {
                resource.configs = configs;
                self.client.update(resource).await?;
                Ok(OverrideOutcome::Updated)
            }
            (Synthesis::Write(configs), None) => {
                let mut metadata =
                    ObjectMeta::new(&self.config.override_namespace, override_resource_name(identity));
                metadata
                    .labels
                    .insert(MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string());
                metadata
                    .annotations
                    .insert(OVERRIDE_RULE_ANNOTATION.to_string(), identity.to_string());
                self.client.create(OverrideResource { metadata, configs }).await?;
                Ok(OverrideOutcome::Created)
            }
            (Synthesis::Delete, Some(resource)) => {
                let meta = &resource.metadata;
                match self.client.delete(&meta.namespace, &meta.name).await {
                    Ok(()) | Err(StoreError::NotFound(_)) => Ok(OverrideOutcome::Deleted),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

fn alert_name(rule: &CanonicalRule) -> &str {
    rule.original
        .name()
        .unwrap_or_else(|| rule.identity.rule_name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::PrefixNamespacePolicy;
    use crate::memory::MemoryStore;
    use alert_engine::{
        compute_identity, AlertRule, ObjectKey, PrometheusRule, RuleGroup, SecretResource,
    };
    use std::time::Duration;

    struct Fixture {
        overrides: Arc<MemoryStore<OverrideResource>>,
        service: LabelOverrideService,
        platform: RuleIdentity,
        user: RuleIdentity,
    }

    async fn fixture() -> Fixture {
        let config = BridgeConfig {
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let platform_rule = AlertRule::alert("Down", "up == 0").with_label("severity", "warning");
        let user_rule = AlertRule::alert("Mine", "up == 1");
        let rules: Arc<MemoryStore<PrometheusRule>> = Arc::new(MemoryStore::with_objects(vec![
            PrometheusRule {
                metadata: ObjectMeta::new("openshift-monitoring", "platform"),
                groups: vec![RuleGroup {
                    name: "g".into(),
                    interval: None,
                    rules: vec![platform_rule.clone()],
                }],
            },
            PrometheusRule {
                metadata: ObjectMeta::new("team-a", "user"),
                groups: vec![RuleGroup {
                    name: "g".into(),
                    interval: None,
                    rules: vec![user_rule.clone()],
                }],
            },
        ]));
        let secrets: Arc<MemoryStore<SecretResource>> = Arc::new(MemoryStore::new());
        let overrides: Arc<MemoryStore<OverrideResource>> = Arc::new(MemoryStore::new());
        let view = Arc::new(RuleView::new(
            config.clone(),
            rules,
            secrets,
            overrides.clone(),
            Arc::new(PrefixNamespacePolicy::from_config(&config)),
        ));
        view.sync().await.unwrap();

        Fixture {
            service: LabelOverrideService::new(config, view, overrides.clone()),
            overrides,
            platform: compute_identity(&platform_rule),
            user: compute_identity(&user_rule),
        }
    }

    fn delta(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn override_key(identity: &RuleIdentity) -> ObjectKey {
        ObjectKey::new("openshift-monitoring", override_resource_name(identity))
    }

    #[tokio::test]
    async fn test_update_creates_then_is_idempotent() {
        let f = fixture().await;
        let outcome = f
            .service
            .update_labels(&f.platform, delta(&[("severity", "critical")]))
            .await
            .unwrap();
        assert_eq!(outcome, OverrideOutcome::Created);

        let stored = f.overrides.object(&override_key(&f.platform)).unwrap();
        assert_eq!(stored.configs.len(), 2);
        assert_eq!(
            stored.metadata.annotations[OVERRIDE_RULE_ANNOTATION],
            f.platform.as_str()
        );

        let writes = f.overrides.write_count();
        let again = f
            .service
            .update_labels(&f.platform, delta(&[("severity", "critical")]))
            .await
            .unwrap();
        assert_eq!(again, OverrideOutcome::Unchanged);
        assert_eq!(f.overrides.write_count(), writes);
        assert_eq!(
            f.service.overrides(&f.platform).await.unwrap(),
            delta(&[("severity", "critical")])
        );
    }

    #[tokio::test]
    async fn test_withdrawing_last_override_deletes_resource() {
        let f = fixture().await;
        f.service
            .update_labels(&f.platform, delta(&[("severity", "critical")]))
            .await
            .unwrap();
        let outcome = f
            .service
            .update_labels(&f.platform, delta(&[("severity", "")]))
            .await
            .unwrap();
        assert_eq!(outcome, OverrideOutcome::Deleted);
        assert!(f.overrides.is_empty());
    }

    #[tokio::test]
    async fn test_user_rules_and_unknown_rules_are_refused() {
        let f = fixture().await;
        assert!(matches!(
            f.service.update_labels(&f.user, delta(&[("a", "b")])).await,
            Err(ManagementError::NotAllowed(_))
        ));
        assert!(matches!(
            f.service.drop_rule(&f.user).await,
            Err(ManagementError::NotAllowed(_))
        ));
        assert!(matches!(
            f.service.restore_rule(&RuleIdentity::new("Nope;00")).await,
            Err(ManagementError::NotFound(_))
        ));
        assert!(matches!(
            f.service.update_labels(&f.platform, delta(&[("namespace", "x")])).await,
            Err(ManagementError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_gitops_managed_override_is_refused() {
        let f = fixture().await;
        let mut metadata = ObjectMeta::new("openshift-monitoring", override_resource_name(&f.platform));
        metadata
            .annotations
            .insert("argocd.argoproj.io/tracking-id".into(), "app".into());
        f.overrides.upsert(OverrideResource {
            metadata,
            configs: Vec::new(),
        });

        assert!(matches!(
            f.service.update_labels(&f.platform, delta(&[("team", "x")])).await,
            Err(ManagementError::NotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_restore_round_trip() {
        let f = fixture().await;
        assert_eq!(f.service.drop_rule(&f.platform).await.unwrap(), OverrideOutcome::Created);
        assert_eq!(f.service.drop_rule(&f.platform).await.unwrap(), OverrideOutcome::Unchanged);

        f.service
            .update_labels(&f.platform, delta(&[("team", "sre")]))
            .await
            .unwrap();
        let stored = f.overrides.object(&override_key(&f.platform)).unwrap();
        assert!(label_diff::is_dropped(&f.platform, &stored.configs));

        assert_eq!(f.service.restore_rule(&f.platform).await.unwrap(), OverrideOutcome::Updated);
        assert_eq!(f.service.restore_rule(&f.platform).await.unwrap(), OverrideOutcome::Unchanged);
        assert_eq!(
            f.service.update_labels(&f.platform, delta(&[("team", "")])).await.unwrap(),
            OverrideOutcome::Deleted
        );
    }

    #[tokio::test]
    async fn test_conflicts_are_retried_then_surface() {
        let f = fixture().await;
        f.service
            .update_labels(&f.platform, delta(&[("team", "a")]))
            .await
            .unwrap();

        f.overrides.conflict_next_updates(2);
        assert_eq!(
            f.service
                .update_labels(&f.platform, delta(&[("team", "b")]))
                .await
                .unwrap(),
            OverrideOutcome::Updated
        );

        f.overrides.conflict_next_updates(3);
        assert!(matches!(
            f.service.update_labels(&f.platform, delta(&[("team", "c")])).await,
            Err(ManagementError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let f = fixture().await;
        f.overrides.set_latency(Some(Duration::from_secs(5)));
        assert!(matches!(
            f.service.drop_rule(&f.platform).await,
            Err(ManagementError::Timeout(_))
        ));
    }
}
