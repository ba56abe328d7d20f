use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use kube::{api::ApiResource, core::DynamicObject, ResourceExt};
use serde_json::{json, Value};

use module_operator::{
    client::{self, ClusterStore, ObjectKey},
    controller::BaseReconciler,
    logging::controller::ReconcilerError,
    requeue::ReconcileResult,
    state_machine::State,
    status::{
        condition::{ConditionStatus, ConditionType, LifecycleState},
        read_conditions, read_observed_generation, read_state,
    },
    testing::MemoryStore,
    tracker::TrackerKey,
    utils::signal::ShutdownToken,
};

use super::*;
use crate::chart::memory::MemoryChartClient;

const NAME: &str = "r-install";
const NAMESPACE: &str = "n";

struct Fixture {
    store: Arc<MemoryStore>,
    charts: Arc<MemoryChartClient>,
    base: BaseReconciler<ModuleLifecycleReconciler>,
}

impl Fixture {
    fn new(charts: MemoryChartClient) -> Self {
        Self::sharing(Arc::new(MemoryStore::new()), Arc::new(charts), PathBuf::from("/charts"))
    }

    /// A fresh reconciler, as after an operator restart, on top of existing cluster state.
    fn sharing(
        store: Arc<MemoryStore>,
        charts: Arc<MemoryChartClient>,
        chart_dir: PathBuf,
    ) -> Self {
        Self::reconciling_through(store.clone(), store, charts, chart_dir)
    }

    /// Reconciles through `cluster` while inspecting `store` directly.
    fn reconciling_through(
        cluster: Arc<dyn ClusterStore>,
        store: Arc<MemoryStore>,
        charts: Arc<MemoryChartClient>,
        chart_dir: PathBuf,
    ) -> Self {
        let reconciler = ModuleLifecycleReconciler::new(charts.clone(), "helm", chart_dir);
        let base = BaseReconciler::new(reconciler, cluster, ar());
        Self {
            store,
            charts,
            base,
        }
    }

    fn restarted(&self) -> Self {
        Self::sharing(self.store.clone(), self.charts.clone(), PathBuf::from("/charts"))
    }

    async fn apply(&self, spec: Value) -> DynamicObject {
        let obj = DynamicObject::new(NAME, &ar())
            .within(NAMESPACE)
            .data(json!({ "spec": spec }));
        self.store.create(&ar(), &obj).await.unwrap()
    }

    async fn patch_spec(&self, spec: Value) -> DynamicObject {
        let mut obj = self.current().await.unwrap();
        obj.data["spec"] = spec;
        self.store.replace(&ar(), &obj).await.unwrap()
    }

    async fn current(&self) -> Option<DynamicObject> {
        self.store.get(&ar(), &key()).await.unwrap()
    }

    async fn reconcile(&self) -> ReconcileResult {
        self.base
            .reconcile(&key(), ShutdownToken::never())
            .await
            .unwrap()
    }

    /// Reconciles until the result is terminal, returning the requeues seen on the way.
    async fn reconcile_until_done(&self) -> Vec<ReconcileResult> {
        let mut requeues = Vec::new();
        for _ in 0..10 {
            let result = self.reconcile().await;
            if result.is_empty() {
                return requeues;
            }
            requeues.push(result);
        }
        panic!("reconcile did not finish, requeues: {requeues:?}");
    }

    async fn condition_types(&self) -> Vec<ConditionType> {
        read_conditions(&self.current().await.unwrap())
            .into_iter()
            .map(|c| c.type_)
            .collect()
    }

    fn tracker_state(&self, obj: &DynamicObject) -> Option<State> {
        self.base
            .trackers()
            .lookup(&TrackerKey::for_object(obj))
            .map(|tracker| tracker.state)
    }
}

/// Loses the first status write that finishes a generation.
struct LosesFinishingWrite {
    store: Arc<MemoryStore>,
    finishing_writes: AtomicUsize,
}

#[async_trait]
impl ClusterStore for LosesFinishingWrite {
    async fn get(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, client::Error> {
        self.store.get(ar, key).await
    }

    async fn create(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, client::Error> {
        self.store.create(ar, obj).await
    }

    async fn replace(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, client::Error> {
        self.store.replace(ar, obj).await
    }

    async fn replace_status(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, client::Error> {
        let finishing = read_observed_generation(obj).is_some();
        if finishing && self.finishing_writes.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(client::Error::Conflict {
                kind: ar.kind.clone(),
                key: ObjectKey::from_object(obj).unwrap_or_default(),
            });
        }
        self.store.replace_status(ar, obj).await
    }

    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<(), client::Error> {
        self.store.delete(ar, key).await
    }
}

fn ar() -> ApiResource {
    ModuleLifecycle::api_resource()
}

fn key() -> ObjectKey {
    ObjectKey::new(NAMESPACE, NAME)
}

fn spec(action: &str, version: &str) -> Value {
    json!({
        "lifecycleClass": "helm",
        "action": action,
        "release": {
            "name": "r",
            "namespace": "n",
            "chartPath": "/c",
            "chartVersion": version,
        },
    })
}

#[tokio::test]
async fn install_runs_to_ready() {
    let f = Fixture::new(MemoryChartClient::new());
    f.apply(spec("install", "1.0.0")).await;

    assert!(f.reconcile_until_done().await.is_empty());

    let obj = f.current().await.unwrap();
    assert_eq!(f.condition_types().await, [
        ConditionType::PreInstall,
        ConditionType::InstallStarted,
        ConditionType::InstallComplete,
    ]);
    assert_eq!(read_state(&obj), Some(LifecycleState::Ready));
    assert_eq!(read_observed_generation(&obj), Some(1));
    assert_eq!(obj.data["status"]["version"], json!("1.0.0"));
    assert_eq!(obj.finalizers(), [FINALIZER]);

    let release = f.charts.get("r", "n").unwrap();
    assert_eq!(release.chart_version, "1.0.0");
    assert_eq!(f.charts.upgrades()[0].chart, "/c");
}

#[tokio::test]
async fn version_is_recorded_when_the_finishing_write_is_retried() {
    let store = Arc::new(MemoryStore::new());
    let cluster = Arc::new(LosesFinishingWrite {
        store: store.clone(),
        finishing_writes: AtomicUsize::new(0),
    });
    let f = Fixture::reconciling_through(
        cluster.clone(),
        store,
        Arc::new(MemoryChartClient::new()),
        PathBuf::from("/charts"),
    );
    f.apply(spec("install", "1.0.0")).await;

    let requeues = f.reconcile_until_done().await;

    assert_eq!(requeues.len(), 1);
    assert_eq!(cluster.finishing_writes.load(Ordering::SeqCst), 2);
    let obj = f.current().await.unwrap();
    assert_eq!(read_observed_generation(&obj), Some(1));
    assert_eq!(obj.data["status"]["version"], json!("1.0.0"));
    assert_eq!(f.condition_types().await, [
        ConditionType::PreInstall,
        ConditionType::InstallStarted,
        ConditionType::InstallComplete,
    ]);
}

#[tokio::test]
async fn already_installed_release_is_not_touched() {
    let f = Fixture::new(MemoryChartClient::new().with_release("r", "n", "1.0.0"));
    f.apply(spec("install", "1.0.0")).await;

    f.reconcile_until_done().await;

    let obj = f.current().await.unwrap();
    assert_eq!(f.condition_types().await, [ConditionType::AlreadyInstalled]);
    assert_eq!(read_state(&obj), Some(LifecycleState::Ready));
    assert_eq!(read_observed_generation(&obj), Some(1));
    assert!(f.charts.upgrades().is_empty());
}

#[tokio::test]
async fn upgrade_of_new_generation_appends_conditions() {
    let f = Fixture::new(MemoryChartClient::new());
    f.apply(spec("install", "1.0.0")).await;
    f.reconcile_until_done().await;

    let patched = f.patch_spec(spec("upgrade", "1.1.0")).await;
    assert_eq!(patched.metadata.generation, Some(2));
    f.reconcile_until_done().await;

    let obj = f.current().await.unwrap();
    assert_eq!(f.condition_types().await, [
        ConditionType::PreInstall,
        ConditionType::InstallStarted,
        ConditionType::InstallComplete,
        ConditionType::PreUpgrade,
        ConditionType::UpgradeStarted,
        ConditionType::UpgradeComplete,
    ]);
    assert_eq!(read_observed_generation(&obj), Some(2));
    assert_eq!(obj.data["status"]["version"], json!("1.1.0"));
    assert_eq!(f.charts.get("r", "n").unwrap().chart_version, "1.1.0");
    assert_eq!(f.charts.get("r", "n").unwrap().revision, 2);
}

#[tokio::test]
async fn failing_action_is_retried_in_place() {
    let f = Fixture::new(MemoryChartClient::new());
    let obj = f.apply(spec("install", "1.0.0")).await;
    f.charts.fail_upgrades(3);

    for _ in 0..3 {
        let result = f.reconcile().await;
        assert!(result.requeue);
        assert!(result.requeue_after >= Duration::from_secs(1));
        assert_eq!(f.tracker_state(&obj), Some(State::Action));
    }
    assert!(f.reconcile_until_done().await.is_empty());

    assert_eq!(f.condition_types().await, [
        ConditionType::PreInstall,
        ConditionType::InstallStarted,
        ConditionType::InstallComplete,
    ]);
    assert_eq!(f.charts.upgrades().len(), 1);
    assert_eq!(f.tracker_state(&obj), Some(State::End));
}

#[tokio::test]
async fn deletion_uninstalls_and_releases_object() {
    let f = Fixture::new(MemoryChartClient::new());
    let obj = f.apply(spec("install", "1.0.0")).await;
    f.reconcile_until_done().await;
    let uid = obj.uid().unwrap();
    assert!(f.base.trackers().contains_uid(&uid));

    f.store.delete(&ar(), &key()).await.unwrap();
    let deleting = f.current().await.unwrap();
    assert!(deleting.metadata.deletion_timestamp.is_some());

    f.reconcile_until_done().await;

    assert_eq!(f.current().await, None);
    assert_eq!(f.charts.get("r", "n"), None);
    assert_eq!(f.charts.uninstalls(), 1);
    assert!(!f.base.trackers().contains_uid(&uid));
}

#[tokio::test]
async fn unknown_action_fails_without_tracker() {
    let f = Fixture::new(MemoryChartClient::new());
    f.apply(spec("rollback", "1.0.0")).await;

    let result = f.reconcile().await;
    assert!(result.is_empty());

    let obj = f.current().await.unwrap();
    let conditions = read_conditions(&obj);
    assert_eq!(conditions.len(), 1);
    assert_eq!(conditions[0].type_, ConditionType::UnknownAction);
    assert_eq!(conditions[0].status, ConditionStatus::False);
    assert_eq!(read_state(&obj), Some(LifecycleState::Failed));
    assert!(f.base.trackers().is_empty());
    assert!(f.charts.upgrades().is_empty());
}

#[tokio::test]
async fn restart_resumes_from_recorded_conditions() {
    let f = Fixture::new(MemoryChartClient::new());
    let obj = f.apply(spec("install", "1.0.0")).await;
    f.charts.fail_upgrades(1);
    assert!(!f.reconcile().await.is_empty());

    let restarted = f.restarted();
    assert_eq!(restarted.tracker_state(&obj), None);
    restarted.reconcile_until_done().await;

    assert_eq!(restarted.condition_types().await, [
        ConditionType::PreInstall,
        ConditionType::InstallStarted,
        ConditionType::InstallComplete,
    ]);
    assert_eq!(f.charts.upgrades().len(), 1);
}

#[tokio::test]
async fn reconciled_generation_is_left_alone() {
    let f = Fixture::new(MemoryChartClient::new());
    f.apply(spec("install", "1.0.0")).await;
    f.reconcile_until_done().await;
    let writes = f.store.status_writes();

    let restarted = f.restarted();
    assert!(restarted.reconcile().await.is_empty());

    assert_eq!(f.store.status_writes(), writes);
    assert_eq!(f.charts.upgrades().len(), 1);
}

#[tokio::test]
async fn other_lifecycle_class_is_skipped() {
    let f = Fixture::new(MemoryChartClient::new());
    let mut other = spec("install", "1.0.0");
    other["lifecycleClass"] = json!("istio");
    f.apply(other).await;

    assert!(f.reconcile().await.is_empty());

    let obj = f.current().await.unwrap();
    assert!(obj.finalizers().is_empty());
    assert!(read_conditions(&obj).is_empty());
}

#[tokio::test]
async fn remote_chart_without_version_is_an_error() {
    let f = Fixture::new(MemoryChartClient::new());
    let mut remote = spec("install", "1.0.0");
    remote["release"] = json!({
        "name": "r",
        "namespace": "n",
        "chartPath": "ingress-nginx",
        "repositoryURI": "https://kubernetes.github.io/ingress-nginx",
    });
    f.apply(remote).await;

    let err = f
        .base
        .reconcile(&key(), ShutdownToken::never())
        .await
        .unwrap_err();
    assert_eq!(err.category(), "LoadChartInfo");
    assert!(f.charts.upgrades().is_empty());
}

#[tokio::test]
async fn local_chart_version_is_read_from_chart_file() {
    let chart_dir = tempfile::tempdir().unwrap();
    let chart = chart_dir.path().join("ingress");
    std::fs::create_dir(&chart).unwrap();
    std::fs::write(
        chart.join("Chart.yaml"),
        "apiVersion: v2\nname: ingress\nversion: 0.3.1\nappVersion: 1.9.4\n",
    )
    .unwrap();

    let f = Fixture::sharing(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryChartClient::new()),
        chart_dir.path().to_path_buf(),
    );
    f.apply(json!({
        "lifecycleClass": "helm",
        "action": "install",
        "release": {
            "name": "r",
            "namespace": "n",
            "chartPath": "ingress",
            "overrides": [{ "values": { "replicas": 2 } }],
        },
    }))
    .await;

    f.reconcile_until_done().await;

    let upgrades = f.charts.upgrades();
    assert_eq!(upgrades.len(), 1);
    assert_eq!(upgrades[0].version, "0.3.1");
    assert_eq!(upgrades[0].chart, chart.to_string_lossy());
    assert_eq!(upgrades[0].values, json!({ "replicas": 2 }));
    assert_eq!(
        f.current().await.unwrap().data["status"]["version"],
        json!("0.3.1")
    );
}

#[tokio::test]
async fn local_chart_file_wins_over_pinned_version() {
    let chart_dir = tempfile::tempdir().unwrap();
    let chart = chart_dir.path().join("ingress");
    std::fs::create_dir(&chart).unwrap();
    std::fs::write(
        chart.join("Chart.yaml"),
        "apiVersion: v2\nname: ingress\nversion: 0.3.1\n",
    )
    .unwrap();

    let f = Fixture::sharing(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryChartClient::new()),
        chart_dir.path().to_path_buf(),
    );
    f.apply(json!({
        "lifecycleClass": "helm",
        "action": "install",
        "release": {
            "name": "r",
            "namespace": "n",
            "chartPath": "ingress",
            "chartVersion": "0.3.0",
        },
    }))
    .await;

    assert!(f.reconcile_until_done().await.is_empty());

    assert_eq!(f.charts.upgrades()[0].version, "0.3.1");
    let obj = f.current().await.unwrap();
    assert_eq!(read_state(&obj), Some(LifecycleState::Ready));
    assert_eq!(obj.data["status"]["version"], json!("0.3.1"));
}
