//! Watch-driven cache of canonical rules.
//!
//! Watch events on rule resources, the relabel secret and override
//! resources, plus a periodic ticker, feed one deduplicating trigger. A
//! single worker drains it and rebuilds the whole view; readers keep using
//! the previous snapshot until the new one is swapped in. A failed rebuild
//! leaves the previous snapshot in place and is retried with backoff.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};

use alert_engine::{
    compute_identity, is_system_label, managed_by, match_rule, override_resource_name, AlertRule,
    ManagedBy, ObjectKey, OverrideResource, PrometheusRule, RelabelConfig, RelabelEngine,
    RelabelOutcome, Resource, RuleIdentity, RuleKind, RuleSource, RuntimeRule, SecretResource,
    TrustClass, ALERT_NAME_LABEL, OVERRIDE_MANAGED_BY_LABEL, RULE_ID_LABEL,
    RULE_MANAGED_BY_LABEL, SOURCE_NAMESPACE_LABEL, SOURCE_NAME_LABEL,
};

use crate::clients::{EventHandler, NamespacePolicy, Watcher};
use crate::config::BridgeConfig;
use crate::error::SyncError;
use crate::queue::TriggerQueue;

// ================================================================================================
// SNAPSHOT TYPES
// ================================================================================================

/// A rule as the cluster effectively sees it, plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRule {
    pub identity: RuleIdentity,
    /// Relabeled and stamped with identity and provenance labels.
    pub rule: AlertRule,
    /// As written in the owning resource.
    pub original: AlertRule,
    pub source: RuleSource,
    pub trust: TrustClass,
    pub managed_by: Option<ManagedBy>,
    pub override_managed_by: Option<ManagedBy>,
}

impl AsRef<AlertRule> for CanonicalRule {
    fn as_ref(&self) -> &AlertRule {
        &self.rule
    }
}

/// Immutable result of one sync.
#[derive(Debug, Default)]
pub struct CanonicalRuleView {
    pub rules: BTreeMap<RuleIdentity, Arc<CanonicalRule>>,
    /// Platform rules excluded by a relabel drop, kept so they can be restored.
    pub dropped: BTreeMap<RuleIdentity, Arc<CanonicalRule>>,
    /// Rule name -> identities carrying it.
    pub by_name: HashMap<String, Vec<RuleIdentity>>,
    pub relabel_configs: Vec<RelabelConfig>,
    pub synced_at: Option<DateTime<Utc>>,
}

/// Counters reported by one sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub rules: usize,
    /// Rules excluded by a relabel drop.
    pub dropped: usize,
    /// Rules of deleting resources, unnamed rules and duplicates.
    pub skipped: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Resync;

// ================================================================================================
// WATCH HANDLERS
// ================================================================================================

struct Enqueue {
    queue: Arc<TriggerQueue<Resync>>,
    debounce: Duration,
    only: Option<ObjectKey>,
}

impl Enqueue {
    fn trigger<T: Resource>(&self, object: &T) {
        if self.only.as_ref().map_or(true, |key| *key == object.key()) {
            self.queue.add_after(Resync, self.debounce);
        }
    }
}

impl<T: Resource> EventHandler<T> for Enqueue {
    fn on_add(&self, object: &T) {
        self.trigger(object);
    }

    fn on_update(&self, _old: &T, new: &T) {
        self.trigger(new);
    }

    fn on_delete(&self, object: &T) {
        self.trigger(object);
    }
}

// ================================================================================================
// RULE VIEW
// ================================================================================================

pub struct RuleView {
    config: BridgeConfig,
    rule_watcher: Arc<dyn Watcher<PrometheusRule>>,
    secret_watcher: Arc<dyn Watcher<SecretResource>>,
    override_watcher: Arc<dyn Watcher<OverrideResource>>,
    policy: Arc<dyn NamespacePolicy>,
    snapshot: RwLock<Arc<CanonicalRuleView>>,
    queue: Arc<TriggerQueue<Resync>>,
    sync_lock: Mutex<()>,
}

impl RuleView {
    pub fn new(
        config: BridgeConfig,
        rule_watcher: Arc<dyn Watcher<PrometheusRule>>,
        secret_watcher: Arc<dyn Watcher<SecretResource>>,
        override_watcher: Arc<dyn Watcher<OverrideResource>>,
        policy: Arc<dyn NamespacePolicy>,
    ) -> Self {
        let queue = TriggerQueue::new(config.backoff_min, config.backoff_max);
        Self {
            config,
            rule_watcher,
            secret_watcher,
            override_watcher,
            policy,
            snapshot: RwLock::new(Arc::new(CanonicalRuleView::default())),
            queue,
            sync_lock: Mutex::new(()),
        }
    }

    // ============================================================================================
    // READS
    // ============================================================================================

    /// Current snapshot. Never blocks on an in-flight sync.
    pub fn snapshot(&self) -> Arc<CanonicalRuleView> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn get(&self, identity: &RuleIdentity) -> Option<Arc<CanonicalRule>> {
        self.snapshot.read().rules.get(identity).cloned()
    }

    /// Like [`get`](Self::get), but also finds rules currently dropped by relabeling.
    pub fn lookup(&self, identity: &RuleIdentity) -> Option<Arc<CanonicalRule>> {
        let snapshot = self.snapshot.read();
        snapshot
            .rules
            .get(identity)
            .or_else(|| snapshot.dropped.get(identity))
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<CanonicalRule>> {
        self.snapshot.read().rules.values().cloned().collect()
    }

    /// Global relabel configuration loaded by the last sync.
    pub fn config(&self) -> Vec<RelabelConfig> {
        self.snapshot.read().relabel_configs.clone()
    }

    pub fn candidates(&self, name: &str) -> Vec<Arc<CanonicalRule>> {
        let snapshot = self.snapshot();
        snapshot
            .by_name
            .get(name)
            .map(|ids| ids.iter().filter_map(|id| snapshot.rules.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Canonical rule a runtime-reported rule corresponds to.
    ///
    /// Ambiguous matches yield None: the reported rule stays unenriched.
    pub fn match_runtime(&self, runtime: &RuntimeRule) -> Option<Arc<CanonicalRule>> {
        let snapshot = self.snapshot();
        let candidates: Vec<&CanonicalRule> = snapshot
            .by_name
            .get(&runtime.name)?
            .iter()
            .filter_map(|id| snapshot.rules.get(id).map(|r| &**r))
            .collect();
        let identity = match_rule(runtime, &candidates)
            .matched()
            .map(|rule| rule.identity.clone())?;
        snapshot.rules.get(&identity).cloned()
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot.read().synced_at
    }

    pub fn trust_of(&self, namespace: &str) -> TrustClass {
        if self.policy.is_platform_managed(namespace) {
            TrustClass::PlatformManaged
        } else {
            TrustClass::UserDefined
        }
    }

    /// Asks the worker for a rebuild after the debounce period.
    pub fn request_sync(&self) {
        self.queue.add_after(Resync, self.config.debounce);
    }

    // ============================================================================================
    // SYNC
    // ============================================================================================

    /// Rebuilds the view from the watchers and swaps it in.
    pub async fn sync(&self) -> Result<SyncStats, SyncError> {
        let _guard = self.sync_lock.lock().await;
        let started = Instant::now();

        let relabel_configs = self.load_relabel_configs().await?;
        let resources = self
            .rule_watcher
            .list()
            .await
            .map_err(|source| SyncError::Load {
                kind: "rule resources",
                source,
            })?;
        let override_provenance = self.load_override_provenance().await?;

        let engine = RelabelEngine::new(&relabel_configs);
        let mut stats = SyncStats::default();
        let mut rules: BTreeMap<RuleIdentity, Arc<CanonicalRule>> = BTreeMap::new();
        let mut dropped: BTreeMap<RuleIdentity, Arc<CanonicalRule>> = BTreeMap::new();

        for resource in &resources {
            if resource.metadata.is_deleting() {
                stats.skipped += resource.rules().count();
                continue;
            }
            let source = RuleSource::new(&resource.metadata.namespace, &resource.metadata.name);
            let trust = self.trust_of(&source.namespace);
            let owner = managed_by(&resource.metadata);

            for (_, original) in resource.rules() {
                let identity = compute_identity(original);
                if identity.is_empty() {
                    stats.skipped += 1;
                    continue;
                }
                if rules.contains_key(&identity) || dropped.contains_key(&identity) {
                    debug!("Rule {} also defined in {}/{}", identity, source.namespace, source.name);
                    stats.skipped += 1;
                    continue;
                }

                let mut labels = runtime_labels(original);
                let mut is_dropped = false;
                if trust == TrustClass::PlatformManaged {
                    match engine.process(labels.clone()) {
                        RelabelOutcome::Keep(relabeled) => labels = relabeled,
                        RelabelOutcome::Drop => {
                            debug!("Rule {} dropped by relabel configuration", identity);
                            is_dropped = true;
                        }
                    }
                }

                let override_managed_by = override_provenance
                    .get(&override_resource_name(&identity))
                    .copied()
                    .flatten();

                labels.insert(RULE_ID_LABEL.to_string(), identity.to_string());
                labels.insert(SOURCE_NAMESPACE_LABEL.to_string(), source.namespace.clone());
                labels.insert(SOURCE_NAME_LABEL.to_string(), source.name.clone());
                if let Some(owner) = owner {
                    labels.insert(RULE_MANAGED_BY_LABEL.to_string(), owner.as_str().to_string());
                }
                if let Some(provenance) = override_managed_by {
                    labels.insert(
                        OVERRIDE_MANAGED_BY_LABEL.to_string(),
                        provenance.as_str().to_string(),
                    );
                }

                let rule = AlertRule {
                    labels,
                    ..original.clone()
                };
                let canonical = Arc::new(CanonicalRule {
                    identity: identity.clone(),
                    rule,
                    original: original.clone(),
                    source: source.clone(),
                    trust,
                    managed_by: owner,
                    override_managed_by,
                });
                if is_dropped {
                    stats.dropped += 1;
                    dropped.insert(identity, canonical);
                } else {
                    rules.insert(identity, canonical);
                }
            }
        }

        let mut by_name: HashMap<String, Vec<RuleIdentity>> = HashMap::new();
        for (identity, rule) in &rules {
            if let Some(name) = rule.rule.name() {
                by_name.entry(name.to_string()).or_default().push(identity.clone());
            }
        }

        stats.rules = rules.len();
        stats.elapsed = started.elapsed();

        let view = CanonicalRuleView {
            rules,
            dropped,
            by_name,
            relabel_configs,
            synced_at: Some(Utc::now()),
        };
        *self.snapshot.write() = Arc::new(view);

        Ok(stats)
    }

    async fn load_relabel_configs(&self) -> Result<Vec<RelabelConfig>, SyncError> {
        let secret_ref = &self.config.relabel_secret;
        let key = ObjectKey::new(&secret_ref.namespace, &secret_ref.name);
        let secret = self
            .secret_watcher
            .get(&key)
            .await
            .map_err(|source| SyncError::Load {
                kind: "relabel secret",
                source,
            })?;

        let Some(payload) = secret.as_ref().and_then(|s| s.data.get(&secret_ref.key)) else {
            debug!("Relabel secret {} not present, using no relabeling", secret_ref);
            return Ok(Vec::new());
        };
        parse_relabel_configs(payload).map_err(|message| SyncError::RelabelConfig {
            secret: secret_ref.to_string(),
            message,
        })
    }

    async fn load_override_provenance(&self) -> Result<HashMap<String, Option<ManagedBy>>, SyncError> {
        let overrides = self
            .override_watcher
            .list()
            .await
            .map_err(|source| SyncError::Load {
                kind: "override resources",
                source,
            })?;
        Ok(overrides
            .iter()
            .filter(|o| o.metadata.namespace == self.config.override_namespace)
            .map(|o| (o.metadata.name.clone(), managed_by(&o.metadata)))
            .collect())
    }

    // ============================================================================================
    // BACKGROUND LOOP
    // ============================================================================================

    /// Drives the view until `shutdown` flips to true.
    ///
    /// Registers watch handlers, waits for the watchers' initial listing,
    /// then runs one sync per trigger. Should be spawned as a tokio task.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.register_handlers();

        let synced = self.rule_watcher.wait_for_sync().await
            && self.secret_watcher.wait_for_sync().await
            && self.override_watcher.wait_for_sync().await;
        if !synced {
            warn!("Watchers did not complete their initial listing; starting anyway");
        }

        info!(
            "Starting rule view with {}-second resync interval",
            self.config.resync_interval.as_secs()
        );
        self.queue.add(Resync);

        let ticker = {
            let queue = Arc::clone(&self.queue);
            let period = self.config.resync_interval;
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => queue.add(Resync),
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        let stopper = {
            let queue = Arc::clone(&self.queue);
            tokio::spawn(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
                queue.shut_down();
            })
        };

        while let Some(trigger) = self.queue.get().await {
            self.process(trigger).await;
        }

        ticker.abort();
        stopper.abort();
        info!("Rule view stopped");
    }

    async fn process(&self, trigger: Resync) {
        match self.sync().await {
            Ok(stats) => {
                self.queue.forget(&trigger);
                info!(
                    "Rule view synced: {} rules, {} dropped, {} skipped in {:?}",
                    stats.rules, stats.dropped, stats.skipped, stats.elapsed
                );
            }
            Err(e) => {
                let delay = self.queue.add_rate_limited(trigger);
                error!("Rule view sync failed, retrying in {:?}: {}", delay, e);
            }
        }
        self.queue.done(&trigger);
    }

    fn register_handlers(&self) {
        let handler = |only: Option<ObjectKey>| {
            Arc::new(Enqueue {
                queue: Arc::clone(&self.queue),
                debounce: self.config.debounce,
                only,
            })
        };
        let secret = &self.config.relabel_secret;
        self.rule_watcher.add_event_handler(handler(None));
        self.override_watcher.add_event_handler(handler(None));
        self.secret_watcher
            .add_event_handler(handler(Some(ObjectKey::new(&secret.namespace, &secret.name))));
    }
}

/// Labels as Prometheus evaluates them, before system stamping.
fn runtime_labels(rule: &AlertRule) -> alert_engine::Labels {
    let mut labels: alert_engine::Labels = rule
        .labels
        .iter()
        .filter(|(k, _)| !is_system_label(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if rule.kind() == RuleKind::Alert {
        if let Some(name) = rule.name() {
            labels.insert(ALERT_NAME_LABEL.to_string(), name.to_string());
        }
    }
    labels
}

/// Parses the YAML relabel list stored in the secret. Blank payloads are empty.
pub fn parse_relabel_configs(payload: &[u8]) -> Result<Vec<RelabelConfig>, String> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_yaml::from_slice::<Option<Vec<RelabelConfig>>>(payload)
        .map(Option::unwrap_or_default)
        .map_err(|e| e.to_string())
}
