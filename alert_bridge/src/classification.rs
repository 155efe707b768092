//! Per-namespace classification overrides.
//!
//! One container per rule-owning namespace, stored in the classification
//! namespace. Each entry is keyed by the encoded rule identity and holds
//! the JSON form of a [`ClassificationOverride`].

use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

use alert_engine::{
    decode_key, encode_key, ClassificationOverride, ClassificationPatch, Container, ObjectMeta,
    RuleIdentity,
};

use crate::clients::ResourceClient;
use crate::config::BridgeConfig;
use crate::error::{ManagementError, StoreError};
use crate::retry::{retry_on_conflict, with_deadline};

const CONTAINER_PREFIX: &str = "alert-classification-";

pub struct ClassificationStore {
    config: BridgeConfig,
    client: Arc<dyn ResourceClient<Container>>,
}

impl ClassificationStore {
    pub fn new(config: BridgeConfig, client: Arc<dyn ResourceClient<Container>>) -> Self {
        Self { config, client }
    }

    /// Container name holding classifications of rules in `rule_namespace`.
    pub fn container_name(rule_namespace: &str) -> String {
        format!("{}{}", CONTAINER_PREFIX, rule_namespace)
    }

    /// Applies a tri-state patch to the entry of `identity`.
    ///
    /// A patch with every field unset does nothing, not even a read. An
    /// entry left with no fields is removed, and a missing container is
    /// never created just to hold nothing.
    pub async fn apply_patch(
        &self,
        rule_namespace: &str,
        identity: &RuleIdentity,
        patch: &ClassificationPatch,
    ) -> Result<(), ManagementError> {
        if patch.is_noop() {
            debug!("Classification patch for {} is empty", identity);
            return Ok(());
        }
        patch.validate()?;

        let name = Self::container_name(rule_namespace);
        let key = encode_key(identity);
        let (name, key) = (&name, &key);

        with_deadline(
            self.config.request_timeout,
            retry_on_conflict(self.config.max_write_attempts, "classify rule", || async move {
                let existing = self
                    .client
                    .get(&self.config.classification_namespace, name)
                    .await?;
                let current = existing.as_ref().and_then(|c| parse_entry(c, key));
                let next = patch.apply(current.clone());
                if next == current {
                    return Ok(());
                }

                match (existing, next) {
                    (Some(mut container), next) => {
                        match next {
                            Some(entry) => {
                                container.data.insert(key.clone(), encode_entry(&entry)?);
                            }
                            None => {
                                container.data.remove(key);
                            }
                        }
                        self.client.update(container).await?;
                    }
                    (None, Some(entry)) => {
                        let mut container = Container {
                            metadata: ObjectMeta::new(&self.config.classification_namespace, name),
                            ..Default::default()
                        };
                        container.data.insert(key.clone(), encode_entry(&entry)?);
                        self.client.create(container).await?;
                    }
                    (None, None) => {}
                }
                Ok(())
            }),
        )
        .await
    }

    /// Stored classification of `identity`, if any.
    pub async fn get(
        &self,
        rule_namespace: &str,
        identity: &RuleIdentity,
    ) -> Result<Option<ClassificationOverride>, ManagementError> {
        with_deadline(self.config.request_timeout, async {
            let container = self
                .client
                .get(
                    &self.config.classification_namespace,
                    &Self::container_name(rule_namespace),
                )
                .await?;
            Ok(container.and_then(|c| parse_entry(&c, &encode_key(identity))))
        })
        .await
    }

    /// Every classification stored for rules of `rule_namespace`.
    pub async fn list(
        &self,
        rule_namespace: &str,
    ) -> Result<BTreeMap<RuleIdentity, ClassificationOverride>, ManagementError> {
        with_deadline(self.config.request_timeout, async {
            let Some(container) = self
                .client
                .get(
                    &self.config.classification_namespace,
                    &Self::container_name(rule_namespace),
                )
                .await?
            else {
                return Ok(BTreeMap::new());
            };

            let mut entries = BTreeMap::new();
            for key in container.data.keys() {
                let identity = match decode_key(key) {
                    Ok(identity) => identity,
                    Err(e) => {
                        warn!("Skipping classification entry {:?}: {}", key, e);
                        continue;
                    }
                };
                if let Some(entry) = parse_entry(&container, key) {
                    entries.insert(identity, entry);
                }
            }
            Ok(entries)
        })
        .await
    }
}

// Unreadable entries are treated as absent so a patch can overwrite them.
fn parse_entry(container: &Container, key: &str) -> Option<ClassificationOverride> {
    let raw = container.data.get(key)?;
    match serde_json::from_str::<ClassificationOverride>(raw) {
        Ok(entry) if !entry.is_empty() => Some(entry),
        Ok(_) => None,
        Err(e) => {
            warn!(
                "Ignoring malformed classification entry {:?} in {}: {}",
                key,
                container.metadata.key(),
                e
            );
            None
        }
    }
}

fn encode_entry(entry: &ClassificationOverride) -> Result<String, ManagementError> {
    serde_json::to_string(entry)
        .map_err(|e| StoreError::Backend(format!("failed to encode classification: {}", e)).into())
}
