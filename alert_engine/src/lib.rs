//! # Alert Engine
//!
//! Pure building blocks for managing Prometheus alerting rules that live in
//! many independently-owned resources: content-addressed rule identity,
//! relabeling, query canonicalization, runtime rule matching, scoped label
//! override synthesis and classification overrides.
//!
//! Nothing in this crate performs I/O. The async cache and store layers
//! live in `alert_bridge`.

pub mod alert_rule;
pub mod classification;
pub mod error;
pub mod identity;
pub mod label_diff;
pub mod matcher;
pub mod promql;
pub mod relabel;
pub mod resource;
pub mod rule_groups;

pub use alert_rule::{
    business_labels, is_system_label, is_valid_label_name, AlertRule, Labels, RuleKind,
    RuleSource, TrustClass, ALERT_NAME_LABEL, NAMESPACE_LABEL, OVERRIDE_MANAGED_BY_LABEL,
    RULE_ID_LABEL, RULE_MANAGED_BY_LABEL, SOURCE_NAMESPACE_LABEL, SOURCE_NAME_LABEL,
    SYSTEM_LABEL_PREFIX,
};

pub use classification::{
    decode_key, encode_key, ClassificationOverride, ClassificationPatch, FieldPatch, Layer,
};

pub use error::ValidationError;

pub use identity::{compute_identity, RuleIdentity};

pub use label_diff::{
    drop_rule, override_resource_name, restore_rule, synthesize_override, Synthesis,
};

pub use matcher::{match_rule, parse_duration, MatchOutcome, RuntimeRule};

pub use promql::{canonicalize, normalize_whitespace};

pub use relabel::{RelabelAction, RelabelConfig, RelabelEngine, RelabelOutcome};

pub use resource::{
    managed_by, Container, ManagedBy, ObjectKey, ObjectMeta, OverrideResource, OwnerReference,
    PrometheusRule, Resource, RuleGroup, SecretResource,
};
