//! Capability interfaces for everything outside the process.
//!
//! The core only ever needs to list and get watched objects, hear about
//! their changes, write a handful of resource kinds with version checks,
//! and ask whether a namespace is under platform policy.

use async_trait::async_trait;
use std::sync::Arc;

use alert_engine::{ObjectKey, Resource};

use crate::config::BridgeConfig;
use crate::error::StoreError;

/// Change callbacks registered on a [`Watcher`].
///
/// Called synchronously from the watcher's delivery context; keep them cheap.
pub trait EventHandler<T>: Send + Sync {
    fn on_add(&self, object: &T);
    fn on_update(&self, old: &T, new: &T);
    fn on_delete(&self, object: &T);
}

/// Read side of a watched resource kind.
#[async_trait]
pub trait Watcher<T: Resource>: Send + Sync {
    /// Current objects across all namespaces.
    async fn list(&self) -> Result<Vec<T>, StoreError>;

    async fn get(&self, key: &ObjectKey) -> Result<Option<T>, StoreError>;

    fn add_event_handler(&self, handler: Arc<dyn EventHandler<T>>);

    /// Resolves once the initial listing has been delivered. False if it never will.
    async fn wait_for_sync(&self) -> bool;
}

/// Write side of a resource kind.
///
/// `update` is version checked: the object's `resource_version` must equal
/// the stored one, otherwise [`StoreError::Conflict`] is returned.
#[async_trait]
pub trait ResourceClient<T: Resource>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<T>, StoreError>;

    async fn create(&self, object: T) -> Result<T, StoreError>;

    async fn update(&self, object: T) -> Result<T, StoreError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn list(&self, namespace: &str) -> Result<Vec<T>, StoreError>;
}

/// Decides which namespaces hold platform-managed rules.
pub trait NamespacePolicy: Send + Sync {
    fn is_platform_managed(&self, namespace: &str) -> bool;
}

/// Namespace policy by exact name or name prefix.
#[derive(Debug, Clone, Default)]
pub struct PrefixNamespacePolicy {
    prefixes: Vec<String>,
    names: Vec<String>,
}

impl PrefixNamespacePolicy {
    pub fn new(prefixes: Vec<String>, names: Vec<String>) -> Self {
        Self { prefixes, names }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            config.platform_namespace_prefixes.clone(),
            config.platform_namespaces.clone(),
        )
    }
}

impl NamespacePolicy for PrefixNamespacePolicy {
    fn is_platform_managed(&self, namespace: &str) -> bool {
        self.names.iter().any(|n| n == namespace)
            || self.prefixes.iter().any(|p| namespace.starts_with(p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_covers_platform_namespaces() {
        let policy = PrefixNamespacePolicy::from_config(&BridgeConfig::default());
        assert!(policy.is_platform_managed("openshift-monitoring"));
        assert!(policy.is_platform_managed("kube-system"));
        assert!(policy.is_platform_managed("default"));
        assert!(!policy.is_platform_managed("team-a"));
        assert!(!policy.is_platform_managed("defaults"));
    }
}
