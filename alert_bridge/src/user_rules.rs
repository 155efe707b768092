//! Direct editing of rules in user-defined namespaces.
//!
//! User rules live in PrometheusRule resources the user owns, so they are
//! changed in place: fetch the resource, build an edited copy, write it back
//! with a version check. Platform rules are refused here; they only change
//! through [`LabelOverrideService`](crate::overrides::LabelOverrideService).

use log::info;
use std::sync::Arc;

use alert_engine::{
    compute_identity, is_system_label, AlertRule, ObjectMeta, PrometheusRule, RuleIdentity,
    TrustClass,
};

use crate::clients::{NamespacePolicy, ResourceClient};
use crate::config::BridgeConfig;
use crate::error::ManagementError;
use crate::retry::{retry_on_conflict, with_deadline};
use crate::rule_view::{CanonicalRule, RuleView};

pub struct UserRuleService {
    config: BridgeConfig,
    view: Arc<RuleView>,
    client: Arc<dyn ResourceClient<PrometheusRule>>,
    policy: Arc<dyn NamespacePolicy>,
}

impl UserRuleService {
    pub fn new(
        config: BridgeConfig,
        view: Arc<RuleView>,
        client: Arc<dyn ResourceClient<PrometheusRule>>,
        policy: Arc<dyn NamespacePolicy>,
    ) -> Self {
        Self {
            config,
            view,
            client,
            policy,
        }
    }

    /// Adds `rule` to group `group` of `namespace/resource`, creating either if missing.
    pub async fn create_rule(
        &self,
        namespace: &str,
        resource: &str,
        group: &str,
        rule: AlertRule,
    ) -> Result<RuleIdentity, ManagementError> {
        let rule = without_system_labels(rule);
        rule.validate()?;
        if self.policy.is_platform_managed(namespace) {
            return Err(ManagementError::NotAllowed(format!(
                "namespace {} is platform-managed",
                namespace
            )));
        }
        let identity = compute_identity(&rule);
        if self.view.get(&identity).is_some() {
            return Err(ManagementError::Conflict(format!("rule {} already exists", identity)));
        }

        let (rule, identity_ref) = (&rule, &identity);
        with_deadline(
            self.config.request_timeout,
            retry_on_conflict(self.config.max_write_attempts, "create rule", || async move {
                match self.client.get(namespace, resource).await? {
                    Some(existing) => {
                        if existing.contains_rule(identity_ref) {
                            return Err(ManagementError::Conflict(format!(
                                "rule {} already exists in {}/{}",
                                identity_ref, namespace, resource
                            )));
                        }
                        self.client
                            .update(existing.with_rule_added(group, rule.clone()))
                            .await?;
                    }
                    None => {
                        let created = PrometheusRule {
                            metadata: ObjectMeta::new(namespace, resource),
                            groups: Vec::new(),
                        }
                        .with_rule_added(group, rule.clone());
                        self.client.create(created).await?;
                    }
                }
                Ok(())
            }),
        )
        .await?;

        info!("Created rule {} in {}/{}", identity, namespace, resource);
        Ok(identity)
    }

    /// Replaces the rule with `identity` by `rule`. Returns the new identity.
    pub async fn update_rule(
        &self,
        identity: &RuleIdentity,
        rule: AlertRule,
    ) -> Result<RuleIdentity, ManagementError> {
        let rule = without_system_labels(rule);
        rule.validate()?;
        let current = self.user_rule(identity)?;
        let updated_identity = compute_identity(&rule);
        if &updated_identity == identity {
            return Ok(updated_identity);
        }
        if self.view.get(&updated_identity).is_some() {
            return Err(ManagementError::Conflict(format!(
                "rule {} already exists",
                updated_identity
            )));
        }

        let (rule, current) = (&rule, &current);
        with_deadline(
            self.config.request_timeout,
            retry_on_conflict(self.config.max_write_attempts, "update rule", || async move {
                let resource = self.owning_resource(current).await?;
                let edited = resource
                    .with_rule_replaced(identity, rule.clone())
                    .ok_or_else(|| not_found(identity))?;
                self.client.update(edited).await?;
                Ok(())
            }),
        )
        .await?;

        info!("Updated rule {} -> {}", identity, updated_identity);
        Ok(updated_identity)
    }

    /// Removes the rule with `identity` from its resource.
    pub async fn delete_rule(&self, identity: &RuleIdentity) -> Result<(), ManagementError> {
        let current = self.user_rule(identity)?;
        let current = &current;
        with_deadline(
            self.config.request_timeout,
            retry_on_conflict(self.config.max_write_attempts, "delete rule", || async move {
                let resource = self.owning_resource(current).await?;
                let edited = resource
                    .without_rule(identity)
                    .ok_or_else(|| not_found(identity))?;
                self.client.update(edited).await?;
                Ok(())
            }),
        )
        .await?;

        info!("Deleted rule {}", identity);
        Ok(())
    }

    fn user_rule(&self, identity: &RuleIdentity) -> Result<Arc<CanonicalRule>, ManagementError> {
        let rule = self.view.get(identity).ok_or_else(|| not_found(identity))?;
        if rule.trust == TrustClass::PlatformManaged {
            return Err(ManagementError::NotAllowed(format!(
                "rule {} is platform-managed; use label overrides instead",
                identity
            )));
        }
        Ok(rule)
    }

    async fn owning_resource(&self, rule: &CanonicalRule) -> Result<PrometheusRule, ManagementError> {
        let source = &rule.source;
        self.client
            .get(&source.namespace, &source.name)
            .await?
            .ok_or_else(|| {
                ManagementError::NotFound(format!("PrometheusRule {}/{}", source.namespace, source.name))
            })
    }
}

fn not_found(identity: &RuleIdentity) -> ManagementError {
    ManagementError::NotFound(format!("alert rule {}", identity))
}

// System labels are stamped by the view and never written back.
fn without_system_labels(mut rule: AlertRule) -> AlertRule {
    rule.labels.retain(|k, _| !is_system_label(k));
    rule
}
