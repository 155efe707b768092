//! # Alert Bridge
//!
//! Async layer over `alert_engine`: a watch-driven cache of canonical rules,
//! and the services that persist label overrides, classifications and
//! user-defined rule edits through collaborator clients.
//!
//! Cluster access is never performed here directly. Everything external is
//! reached through the capability traits in [`clients`]; [`memory`] provides
//! in-process implementations.

pub mod classification;
pub mod clients;
pub mod config;
pub mod error;
pub mod memory;
pub mod overrides;
pub mod queue;
pub mod retry;
pub mod rule_view;
pub mod user_rules;

pub use classification::ClassificationStore;
pub use clients::{EventHandler, NamespacePolicy, PrefixNamespacePolicy, ResourceClient, Watcher};
pub use config::{BridgeConfig, SecretRef};
pub use error::{ManagementError, StoreError, SyncError};
pub use memory::MemoryStore;
pub use overrides::{LabelOverrideService, OverrideOutcome};
pub use queue::TriggerQueue;
pub use rule_view::{CanonicalRule, CanonicalRuleView, RuleView, SyncStats};
pub use user_rules::UserRuleService;
