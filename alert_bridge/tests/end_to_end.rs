use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use alert_bridge::{
    BridgeConfig, ClassificationStore, LabelOverrideService, MemoryStore, OverrideOutcome,
    PrefixNamespacePolicy, RuleView, SecretRef,
};
use alert_engine::{
    compute_identity, AlertRule, ClassificationPatch, Container, ObjectMeta, OverrideResource,
    PrometheusRule, RelabelConfig, RuleGroup, RuntimeRule, SecretResource,
};
use tokio::sync::watch;

struct Cluster {
    config: BridgeConfig,
    rules: Arc<MemoryStore<PrometheusRule>>,
    secrets: Arc<MemoryStore<SecretResource>>,
    overrides: Arc<MemoryStore<OverrideResource>>,
    containers: Arc<MemoryStore<Container>>,
    view: Arc<RuleView>,
}

impl Cluster {
    fn new() -> Self {
        let config = BridgeConfig {
            debounce: Duration::from_millis(5),
            backoff_min: Duration::from_millis(5),
            backoff_max: Duration::from_millis(50),
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let rules: Arc<MemoryStore<PrometheusRule>> = Arc::new(MemoryStore::new());
        let secrets: Arc<MemoryStore<SecretResource>> = Arc::new(MemoryStore::new());
        let overrides: Arc<MemoryStore<OverrideResource>> = Arc::new(MemoryStore::new());
        let containers: Arc<MemoryStore<Container>> = Arc::new(MemoryStore::new());
        let view = Arc::new(RuleView::new(
            config.clone(),
            rules.clone(),
            secrets.clone(),
            overrides.clone(),
            Arc::new(PrefixNamespacePolicy::from_config(&config)),
        ));
        Self {
            config,
            rules,
            secrets,
            overrides,
            containers,
            view,
        }
    }

    fn define(&self, namespace: &str, name: &str, rules: Vec<AlertRule>) {
        self.rules.upsert(PrometheusRule {
            metadata: ObjectMeta::new(namespace, name),
            groups: vec![RuleGroup {
                name: "rules".into(),
                interval: None,
                rules,
            }],
        });
    }

    /// Plays the monitoring operator: merges every override resource into
    /// the relabel secret Prometheus is configured from.
    fn publish_overrides(&self) {
        let configs: Vec<RelabelConfig> = self
            .overrides
            .objects()
            .into_iter()
            .flat_map(|o| o.configs)
            .collect();
        let secret = SecretRef::default();
        let mut resource = SecretResource {
            metadata: ObjectMeta::new(&secret.namespace, &secret.name),
            ..Default::default()
        };
        resource
            .data
            .insert(secret.key, serde_yaml::to_string(&configs).unwrap().into_bytes());
        self.secrets.upsert(resource);
    }

    fn overrides_service(&self) -> LabelOverrideService {
        LabelOverrideService::new(self.config.clone(), self.view.clone(), self.overrides.clone())
    }

    fn classifications(&self) -> ClassificationStore {
        ClassificationStore::new(self.config.clone(), self.containers.clone())
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(Duration::from_secs(3), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not reached in time");
}

#[tokio::test]
async fn equivalent_rules_from_different_sources_share_one_entry() {
    let cluster = Cluster::new();
    let a = AlertRule::alert("X", "up == 0").with_label("severity", "warning");
    let b = AlertRule::alert("X", "up==0").with_label("severity", "warning");
    assert_eq!(compute_identity(&a), compute_identity(&b));

    cluster.define("team-a", "first", vec![a.clone()]);
    cluster.define("team-b", "second", vec![b]);
    cluster.view.sync().await.unwrap();

    let listed = cluster.view.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].identity, compute_identity(&a));
}

#[tokio::test]
async fn classification_set_then_cleared() {
    let cluster = Cluster::new();
    let rule = AlertRule::alert("X", "up == 0");
    let identity = compute_identity(&rule);
    let store = cluster.classifications();

    let set: ClassificationPatch = serde_json::from_str(r#"{"component": "team-a"}"#).unwrap();
    store.apply_patch("team-a", &identity, &set).await.unwrap();
    let entry = store.get("team-a", &identity).await.unwrap().unwrap();
    assert_eq!(entry.component.as_deref(), Some("team-a"));

    let clear: ClassificationPatch = serde_json::from_str(r#"{"component": null}"#).unwrap();
    store.apply_patch("team-a", &identity, &clear).await.unwrap();
    assert_eq!(store.get("team-a", &identity).await.unwrap(), None);
    assert!(store.list("team-a").await.unwrap().is_empty());

    let writes = cluster.containers.write_count();
    store.apply_patch("team-a", &identity, &clear).await.unwrap();
    store
        .apply_patch("team-a", &identity, &ClassificationPatch::default())
        .await
        .unwrap();
    assert_eq!(cluster.containers.write_count(), writes);
}

#[tokio::test]
async fn label_override_closes_the_loop() {
    let cluster = Cluster::new();
    let rule = AlertRule::alert("KubeNodeNotReady", "kube_node_status_condition{condition=\"Ready\",status=\"true\"} == 0")
        .with_for("15m")
        .with_label("severity", "warning");
    let sibling = AlertRule::alert("KubeNodeNotReady", "kube_node_status_condition{condition=\"Ready\",status=\"true\"} == 0")
        .with_for("15m")
        .with_label("severity", "info");
    let identity = compute_identity(&rule);
    let sibling_identity = compute_identity(&sibling);
    cluster.define("openshift-monitoring", "kube-state", vec![rule, sibling]);

    let view = &cluster.view;
    let (id, sibling_id) = (&identity, &sibling_identity);
    let (stop, stopped) = watch::channel(false);
    let worker = tokio::spawn(cluster.view.clone().run(stopped));
    eventually(|| async move { view.get(id).is_some() }).await;

    let service = cluster.overrides_service();
    let mut delta = BTreeMap::new();
    delta.insert("severity".to_string(), "critical".to_string());
    assert_eq!(
        service.update_labels(&identity, delta).await.unwrap(),
        OverrideOutcome::Created
    );
    cluster.publish_overrides();

    eventually(|| async move {
        view.get(id)
            .map_or(false, |r| r.rule.labels.get("severity").map(String::as_str) == Some("critical"))
    })
    .await;
    let sibling_now = view.get(sibling_id).unwrap();
    assert_eq!(sibling_now.rule.labels["severity"], "info");

    // The runtime still reports the overridden rule; it maps back to it.
    let runtime = RuntimeRule {
        name: "KubeNodeNotReady".into(),
        query: "kube_node_status_condition{status=\"true\", condition=\"Ready\"} == 0".into(),
        duration: 900.0,
        labels: [("severity".to_string(), "critical".to_string())].into_iter().collect(),
    };
    assert_eq!(cluster.view.match_runtime(&runtime).unwrap().identity, identity);

    assert_eq!(service.drop_rule(&identity).await.unwrap(), OverrideOutcome::Updated);
    cluster.publish_overrides();
    eventually(|| async move { view.get(id).is_none() }).await;
    assert!(view.get(sibling_id).is_some());

    assert_eq!(service.restore_rule(&identity).await.unwrap(), OverrideOutcome::Updated);
    cluster.publish_overrides();
    eventually(|| async move { view.get(id).is_some() }).await;

    stop.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(3), worker)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn ambiguous_runtime_rule_stays_unenriched() {
    let cluster = Cluster::new();
    cluster.define(
        "team-a",
        "rules",
        vec![
            AlertRule::alert("X", "up == 0").with_label("team", "a"),
            AlertRule::alert("X", "up == 0").with_label("team", "b"),
        ],
    );
    cluster.view.sync().await.unwrap();

    let runtime = RuntimeRule {
        name: "X".into(),
        query: "up == 0".into(),
        duration: 0.0,
        labels: [("team".to_string(), "relabeled".to_string())].into_iter().collect(),
    };
    assert!(cluster.view.match_runtime(&runtime).is_none());
}

#[tokio::test]
async fn failed_sync_recovers_with_backoff() {
    let cluster = Cluster::new();
    cluster.define("team-a", "rules", vec![AlertRule::alert("A", "up")]);
    cluster.rules.fail_next_lists(2);

    let (stop, stopped) = watch::channel(false);
    let worker = tokio::spawn(cluster.view.clone().run(stopped));
    let view = &cluster.view;
    eventually(|| async move { view.list().len() == 1 }).await;
    assert!(cluster.view.last_synced_at().is_some());

    stop.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(3), worker)
        .await
        .unwrap()
        .unwrap();
}
