//! Runtime configuration for the rule cache and management services.
//!
//! Every field has a default, so a host only needs to provide what it
//! changes. Durations are whole seconds, except `debounce` and
//! `backoff_min` which are milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Location of a value inside a secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
    pub key: String,
}

impl Default for SecretRef {
    fn default() -> Self {
        Self {
            namespace: "openshift-monitoring".to_string(),
            name: "alert-relabel-configs".to_string(),
            key: "config.yaml".to_string(),
        }
    }
}

impl std::fmt::Display for SecretRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}[{}]", self.namespace, self.name, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Interval of the periodic full resync
    #[serde(with = "secs")]
    pub resync_interval: Duration,
    /// Quiet period coalescing bursts of watch events
    #[serde(with = "millis")]
    pub debounce: Duration,
    /// First requeue delay after a failed sync
    #[serde(with = "millis")]
    pub backoff_min: Duration,
    /// Upper bound of the requeue delay
    #[serde(with = "secs")]
    pub backoff_max: Duration,
    /// Secret holding the global relabel configuration
    pub relabel_secret: SecretRef,
    /// Namespace holding per-rule override resources
    pub override_namespace: String,
    /// Namespace holding classification containers
    pub classification_namespace: String,
    pub platform_namespace_prefixes: Vec<String>,
    pub platform_namespaces: Vec<String>,
    /// Deadline applied to every service call
    #[serde(with = "secs")]
    pub request_timeout: Duration,
    /// Read-modify-write attempts before giving up on conflicts
    pub max_write_attempts: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(15 * 60),
            debounce: Duration::from_millis(500),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(5 * 60),
            relabel_secret: SecretRef::default(),
            override_namespace: "openshift-monitoring".to_string(),
            classification_namespace: "openshift-monitoring".to_string(),
            platform_namespace_prefixes: vec!["openshift-".to_string(), "kube-".to_string()],
            platform_namespaces: vec!["default".to_string()],
            request_timeout: Duration::from_secs(30),
            max_write_attempts: 3,
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.resync_interval.as_secs(), 900);
        assert_eq!(config.debounce.as_millis(), 500);
        assert_eq!(config.max_write_attempts, 3);
        assert_eq!(config.relabel_secret.key, "config.yaml");
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: BridgeConfig = serde_json::from_str(
            r#"{"debounce": 50, "request_timeout": 5, "relabel_secret": {"name": "custom"}}"#,
        )
        .unwrap();
        assert_eq!(config.debounce, Duration::from_millis(50));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.relabel_secret.name, "custom");
        assert_eq!(config.relabel_secret.namespace, "openshift-monitoring");
        assert_eq!(config.backoff_max, Duration::from_secs(300));
    }

    #[test]
    fn test_config_from_yaml() {
        let config: BridgeConfig =
            serde_yaml::from_str("platform_namespaces: [default, monitoring]\n").unwrap();
        assert_eq!(config.platform_namespaces, vec!["default", "monitoring"]);
        assert_eq!(config.platform_namespace_prefixes.len(), 2);
    }
}
