//! The bridge between the kube controller runtime and a domain [`Reconciler`].
//!
//! [`BaseReconciler`] owns everything generic about a reconcile: fetching the object, the
//! finalizer, secondary watches, trackers and the requeue policy. [`Controller`] runs it against a
//! cluster.

use std::{future::Future, sync::Arc, time::Instant};

use async_trait::async_trait;
use futures::{channel::mpsc::UnboundedReceiver, StreamExt};
use kube::{
    api::ApiResource,
    core::DynamicObject,
    runtime::{
        controller::Action,
        events::{Recorder, Reporter},
        reflector::ObjectRef,
        watcher,
    },
    ResourceExt,
};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, Instrument};

use crate::{
    client::{self, Client, ClusterStore, ObjectKey},
    finalizer::{self, has_deletion_stamp, FinalizerManager, FinalizerOutcome},
    handler::HandlerContext,
    logging::controller::{report_controller_reconciled, ReconcilerError},
    metrics::{Metrics, Outcome},
    namespace::WatchNamespace,
    requeue::{self, ReconcileResult},
    status::writer::ResourceStatusWriter,
    tracker::{TrackerKey, TrackerScope, TrackerStore},
    utils::signal::ShutdownToken,
    watch::{KubeWatchSource, WatchDescriptor, WatchRegistry},
};

#[derive(Debug, Snafu)]
pub enum Error<E: ReconcilerError + 'static> {
    #[snafu(display("failed to fetch {key}"))]
    FetchObject { source: client::Error, key: ObjectKey },

    #[snafu(display("failed to manage finalizer"))]
    Finalizer { source: finalizer::Error },

    #[snafu(display("failed to clean up {key}"))]
    Cleanup { source: E, key: ObjectKey },

    #[snafu(display("failed to reconcile {key}"))]
    Reconcile { source: E, key: ObjectKey },
}

impl<E> ReconcilerError for Error<E>
where
    E: ReconcilerError + 'static,
{
    fn category(&self) -> &'static str {
        match self {
            Self::FetchObject { .. } => "FetchObject",
            Self::Finalizer { .. } => "Finalizer",
            Self::Cleanup { source, .. } | Self::Reconcile { source, .. } => source.category(),
        }
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Self::Cleanup { source, .. } | Self::Reconcile { source, .. } => {
                source.secondary_object()
            }
            _ => None,
        }
    }
}

/// Everything a domain reconciler needs to act on one object.
#[derive(Clone)]
pub struct ReconcileContext {
    pub store: Arc<dyn ClusterStore>,
    pub api_resource: ApiResource,
    pub trackers: Arc<TrackerStore>,
    pub shutdown: ShutdownToken,
    pub key: ObjectKey,
}

impl ReconcileContext {
    /// A status writer bound to `obj`.
    pub fn status_writer(&self, obj: DynamicObject) -> ResourceStatusWriter {
        ResourceStatusWriter::new(self.store.clone(), self.api_resource.clone(), obj)
    }

    pub fn handler_context(&self, obj: &DynamicObject, scope: TrackerScope) -> HandlerContext {
        HandlerContext::new(
            TrackerKey::for_object(obj).with_scope(scope),
            obj.metadata.generation.unwrap_or_default(),
            self.shutdown.clone(),
        )
    }
}

/// Domain specific reconcile logic, driven by a [`BaseReconciler`].
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Error: ReconcilerError + Send + Sync + 'static;

    /// Used as the controller name in logs, events and metrics.
    fn name(&self) -> &'static str;

    /// Objects for which this returns `false` are left alone entirely.
    fn should_reconcile(&self, _obj: &DynamicObject) -> bool {
        true
    }

    /// The finalizer guarding [`Reconciler::cleanup`], if any.
    fn finalizer(&self) -> Option<&str> {
        None
    }

    /// Secondary watches to start for `obj`. Only consulted on the first reconcile of an object.
    fn watch_descriptors(&self, _obj: &DynamicObject) -> Vec<WatchDescriptor> {
        Vec::new()
    }

    async fn reconcile(
        &self,
        ctx: &ReconcileContext,
        obj: DynamicObject,
    ) -> Result<ReconcileResult, Self::Error>;

    /// Runs before the finalizer is removed from a deleted object. A non-empty result keeps the
    /// finalizer and asks to be called again.
    async fn cleanup(
        &self,
        _ctx: &ReconcileContext,
        _obj: DynamicObject,
    ) -> Result<ReconcileResult, Self::Error> {
        Ok(ReconcileResult::done())
    }
}

pub struct BaseReconciler<R> {
    reconciler: R,
    store: Arc<dyn ClusterStore>,
    api_resource: ApiResource,
    trackers: Arc<TrackerStore>,
    watches: Option<WatchRegistry>,
}

impl<R> BaseReconciler<R>
where
    R: Reconciler,
{
    pub fn new(reconciler: R, store: Arc<dyn ClusterStore>, api_resource: ApiResource) -> Self {
        Self {
            reconciler,
            store,
            api_resource,
            trackers: Arc::new(TrackerStore::new()),
            watches: None,
        }
    }

    pub fn with_watches(mut self, watches: WatchRegistry) -> Self {
        self.watches = Some(watches);
        self
    }

    pub fn reconciler(&self) -> &R {
        &self.reconciler
    }

    pub fn api_resource(&self) -> &ApiResource {
        &self.api_resource
    }

    pub fn trackers(&self) -> &TrackerStore {
        &self.trackers
    }

    pub fn watches(&self) -> Option<&WatchRegistry> {
        self.watches.as_ref()
    }

    /// Reconciles the object stored under `key`.
    pub async fn reconcile(
        &self,
        key: &ObjectKey,
        shutdown: ShutdownToken,
    ) -> Result<ReconcileResult, Error<R::Error>> {
        let obj = self
            .store
            .get(&self.api_resource, key)
            .await
            .context(FetchObjectSnafu { key: key.clone() })?;

        let Some(obj) = obj else {
            debug!(controller.name = self.reconciler.name(), %key, "Object is gone, forgetting it");
            self.forget(key);
            return Ok(ReconcileResult::done());
        };

        let span = tracing::info_span!(
            "reconcile",
            controller.name = self.reconciler.name(),
            namespace = %key.namespace,
            name = %key.name,
            generation = obj.metadata.generation.unwrap_or_default(),
            uid = %obj.uid().unwrap_or_default(),
        );
        self.reconcile_object(key, obj, shutdown)
            .instrument(span)
            .await
    }

    async fn reconcile_object(
        &self,
        key: &ObjectKey,
        obj: DynamicObject,
        shutdown: ShutdownToken,
    ) -> Result<ReconcileResult, Error<R::Error>> {
        if !self.reconciler.should_reconcile(&obj) {
            debug!("Object is not handled by this operator, skipping");
            return Ok(ReconcileResult::done());
        }

        let ctx = ReconcileContext {
            store: self.store.clone(),
            api_resource: self.api_resource.clone(),
            trackers: self.trackers.clone(),
            shutdown,
            key: key.clone(),
        };

        let obj = match self.reconciler.finalizer() {
            Some(name) => {
                let manager = FinalizerManager::new(&*self.store, &self.api_resource, name);
                match manager.run(obj, |obj| self.cleanup(&ctx, obj)).await? {
                    FinalizerOutcome::Continue(obj) => obj,
                    FinalizerOutcome::Requeue(result) => {
                        return Ok(requeue::derive::<Error<R::Error>>(result, None));
                    }
                    FinalizerOutcome::Released => {
                        info!("Cleanup finished, object released");
                        self.forget(key);
                        return Ok(ReconcileResult::done());
                    }
                }
            }
            None if has_deletion_stamp(&obj) => return Ok(ReconcileResult::done()),
            None => obj,
        };

        if let Some(watches) = &self.watches {
            watches.ensure(key, || self.reconciler.watch_descriptors(&obj));
        }

        let result = self
            .reconciler
            .reconcile(&ctx, obj)
            .await
            .context(ReconcileSnafu { key: key.clone() })?;
        Ok(requeue::derive::<Error<R::Error>>(result, None))
    }

    async fn cleanup(
        &self,
        ctx: &ReconcileContext,
        obj: DynamicObject,
    ) -> Result<ReconcileResult, Error<R::Error>> {
        self.reconciler
            .cleanup(ctx, obj)
            .await
            .context(CleanupSnafu {
                key: ctx.key.clone(),
            })
    }

    /// Drops all in-memory state kept for `key`.
    pub fn forget(&self, key: &ObjectKey) {
        self.trackers.delete_object(&key.namespace, &key.name);
        if let Some(watches) = &self.watches {
            watches.forget(key);
        }
    }
}

impl<E> From<finalizer::Error> for Error<E>
where
    E: ReconcilerError + 'static,
{
    fn from(source: finalizer::Error) -> Self {
        Self::Finalizer { source }
    }
}

struct RunContext<R> {
    base: BaseReconciler<R>,
    shutdown: ShutdownToken,
    metrics: Option<Arc<Metrics>>,
}

/// Runs a [`BaseReconciler`] under the kube controller runtime.
pub struct Controller<R> {
    client: Client,
    base: BaseReconciler<R>,
    namespace: WatchNamespace,
    triggers: UnboundedReceiver<ObjectKey>,
    metrics: Option<Arc<Metrics>>,
}

impl<R> Controller<R>
where
    R: Reconciler,
{
    pub fn new(
        client: Client,
        reconciler: R,
        api_resource: ApiResource,
        namespace: WatchNamespace,
    ) -> Self {
        let source = Arc::new(KubeWatchSource::new(client.as_kube_client()));
        let (watches, triggers) = WatchRegistry::new(source);
        let base = BaseReconciler::new(reconciler, Arc::new(client.clone()), api_resource)
            .with_watches(watches);

        Self {
            client,
            base,
            namespace,
            triggers,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs until `shutdown` is cancelled. In-flight reconciles are allowed to finish.
    pub async fn run(
        self,
        shutdown: ShutdownToken,
        stop: impl Future<Output = ()> + Send + Sync + 'static,
    ) {
        let name = self.base.reconciler.name();
        let api_resource = self.base.api_resource.clone();
        let api = self
            .namespace
            .get_api(self.client.as_kube_client(), &api_resource);
        let recorder = Recorder::new(self.client.as_kube_client(), Reporter {
            controller: name.to_owned(),
            instance: None,
        });

        let trigger_resource = api_resource.clone();
        let triggers = self.triggers.map(move |key| {
            let obj_ref = ObjectRef::new_with(&key.name, trigger_resource.clone());
            if key.namespace.is_empty() {
                obj_ref
            } else {
                obj_ref.within(&key.namespace)
            }
        });

        let context = Arc::new(RunContext {
            base: self.base,
            shutdown,
            metrics: self.metrics,
        });

        info!(controller.name = name, namespace = %self.namespace, "Starting controller");
        kube::runtime::Controller::new_with(api, watcher::Config::default(), api_resource)
            .reconcile_on(triggers)
            .graceful_shutdown_on(stop)
            .run(reconcile::<R>, error_policy::<R>, context)
            .for_each(|result| {
                report_controller_reconciled(&recorder, name, &result);
                futures::future::ready(())
            })
            .await;
        info!(controller.name = name, "Controller stopped");
    }
}

async fn reconcile<R>(
    obj: Arc<DynamicObject>,
    ctx: Arc<RunContext<R>>,
) -> Result<Action, Error<R::Error>>
where
    R: Reconciler,
{
    let Some(key) = ObjectKey::from_object(&obj) else {
        return Ok(Action::await_change());
    };

    let started = Instant::now();
    let result = ctx.base.reconcile(&key, ctx.shutdown.clone()).await;

    if let Some(metrics) = &ctx.metrics {
        let outcome = match &result {
            Ok(result) if result.is_empty() => Outcome::Done,
            Ok(_) => Outcome::Requeue,
            Err(_) => Outcome::Error,
        };
        metrics.observe(ctx.base.reconciler.name(), outcome, started.elapsed());
    }

    result.map(ReconcileResult::into_action)
}

fn error_policy<R>(
    _obj: Arc<DynamicObject>,
    error: &Error<R::Error>,
    _ctx: Arc<RunContext<R>>,
) -> Action
where
    R: Reconciler,
{
    requeue::derive(ReconcileResult::done(), Some(error)).into_action()
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::runtime::watcher::Event;
    use serde_json::json;
    use strum::{EnumDiscriminants, IntoStaticStr};

    use super::*;
    use crate::{
        finalizer::has_finalizer,
        testing::{MemoryStore, RecordingWatchSource},
        watch::WatchEvent,
    };

    const FINALIZER: &str = "test.finalizer.example.com";

    #[derive(Debug, Snafu, EnumDiscriminants)]
    #[strum_discriminants(derive(IntoStaticStr))]
    enum TestError {
        #[snafu(display("domain failure"))]
        DomainFailure,
    }

    impl ReconcilerError for TestError {
        fn category(&self) -> &'static str {
            TestErrorDiscriminants::from(self).into()
        }
    }

    #[derive(Default)]
    struct Recording {
        reconciled: AtomicUsize,
        cleaned: AtomicUsize,
        cleanup_requeues: AtomicUsize,
        fail: AtomicUsize,
        saw_finalizer: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl Reconciler for Arc<Recording> {
        type Error = TestError;

        fn name(&self) -> &'static str {
            "recording"
        }

        fn should_reconcile(&self, obj: &DynamicObject) -> bool {
            obj.labels().get("skip").is_none()
        }

        fn finalizer(&self) -> Option<&str> {
            Some(FINALIZER)
        }

        fn watch_descriptors(&self, obj: &DynamicObject) -> Vec<WatchDescriptor> {
            vec![WatchDescriptor::new(
                ApiResource::erase::<ConfigMap>(&()),
                obj.namespace(),
                |_, event| event != WatchEvent::Deleted,
            )]
        }

        async fn reconcile(
            &self,
            _ctx: &ReconcileContext,
            obj: DynamicObject,
        ) -> Result<ReconcileResult, Self::Error> {
            self.saw_finalizer
                .lock()
                .unwrap()
                .push(has_finalizer(&obj, FINALIZER));
            self.reconciled.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) > 0 {
                self.fail.fetch_sub(1, Ordering::SeqCst);
                return DomainFailureSnafu.fail();
            }
            Ok(ReconcileResult::done())
        }

        async fn cleanup(
            &self,
            _ctx: &ReconcileContext,
            _obj: DynamicObject,
        ) -> Result<ReconcileResult, Self::Error> {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
            if self.cleanup_requeues.load(Ordering::SeqCst) > 0 {
                self.cleanup_requeues.fetch_sub(1, Ordering::SeqCst);
                return Ok(requeue::short_delay());
            }
            Ok(ReconcileResult::done())
        }
    }

    struct Fixture {
        recording: Arc<Recording>,
        store: Arc<MemoryStore>,
        source: Arc<RecordingWatchSource>,
        base: BaseReconciler<Arc<Recording>>,
        triggers: UnboundedReceiver<ObjectKey>,
    }

    fn ar() -> ApiResource {
        ApiResource::erase::<ConfigMap>(&())
    }

    fn key() -> ObjectKey {
        ObjectKey::new("ns", "primary")
    }

    async fn fixture() -> Fixture {
        let recording = Arc::new(Recording::default());
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(RecordingWatchSource::new());
        let (watches, triggers) = WatchRegistry::new(source.clone());
        let base =
            BaseReconciler::new(recording.clone(), store.clone(), ar()).with_watches(watches);
        store
            .create(&ar(), &DynamicObject::new("primary", &ar()).within("ns"))
            .await
            .unwrap();

        Fixture {
            recording,
            store,
            source,
            base,
            triggers,
        }
    }

    #[tokio::test]
    async fn missing_object_is_terminal() {
        let f = fixture().await;
        let result = f
            .base
            .reconcile(&ObjectKey::new("ns", "absent"), ShutdownToken::never())
            .await
            .unwrap();

        assert_eq!(result, ReconcileResult::done());
        assert_eq!(f.recording.reconciled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn finalizer_is_added_before_domain_reconcile() {
        let f = fixture().await;
        f.base.reconcile(&key(), ShutdownToken::never()).await.unwrap();

        assert_eq!(*f.recording.saw_finalizer.lock().unwrap(), [true]);
        let stored = f.store.get(&ar(), &key()).await.unwrap().unwrap();
        assert!(has_finalizer(&stored, FINALIZER));
    }

    #[tokio::test]
    async fn watches_are_registered_once_and_enqueue_primary() {
        let mut f = fixture().await;
        f.base.reconcile(&key(), ShutdownToken::never()).await.unwrap();
        f.base.reconcile(&key(), ShutdownToken::never()).await.unwrap();

        let started = f.source.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].1, key());

        let secondary = DynamicObject::new("values", &ar())
            .within("ns")
            .data(json!({ "data": {} }));
        assert_eq!(f.source.dispatch(&Event::Apply(secondary.clone())), 1);
        assert_eq!(f.source.dispatch(&Event::Delete(secondary)), 0);
        assert_eq!(f.triggers.next().await, Some(key()));
    }

    #[tokio::test]
    async fn domain_error_is_returned_for_error_policy() {
        let f = fixture().await;
        f.recording.fail.store(1, Ordering::SeqCst);

        let err = f
            .base
            .reconcile(&key(), ShutdownToken::never())
            .await
            .unwrap_err();
        assert_eq!(err.category(), "DomainFailure");

        let action = requeue::derive(ReconcileResult::done(), Some(&err));
        assert!(action.requeue);
    }

    #[tokio::test]
    async fn skipped_objects_are_left_alone() {
        let f = fixture().await;
        let mut obj = f.store.get(&ar(), &key()).await.unwrap().unwrap();
        obj.labels_mut().insert("skip".to_owned(), "true".to_owned());
        f.store.replace(&ar(), &obj).await.unwrap();

        f.base.reconcile(&key(), ShutdownToken::never()).await.unwrap();

        let stored = f.store.get(&ar(), &key()).await.unwrap().unwrap();
        assert!(!has_finalizer(&stored, FINALIZER));
        assert_eq!(f.recording.reconciled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deletion_runs_cleanup_until_done_then_forgets() {
        let f = fixture().await;
        f.base.reconcile(&key(), ShutdownToken::never()).await.unwrap();
        f.base.trackers().get(
            &TrackerKey::new("ns", "primary", "uid-1"),
            1,
            crate::state_machine::State::Action,
        );
        f.recording.cleanup_requeues.store(1, Ordering::SeqCst);
        f.store.delete(&ar(), &key()).await.unwrap();

        let first = f.base.reconcile(&key(), ShutdownToken::never()).await.unwrap();
        assert!(first.requeue);
        assert!(f.store.get(&ar(), &key()).await.unwrap().is_some());

        let second = f.base.reconcile(&key(), ShutdownToken::never()).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(f.recording.cleaned.load(Ordering::SeqCst), 2);
        assert!(f.store.get(&ar(), &key()).await.unwrap().is_none());
        assert!(!f.base.trackers().contains_uid("uid-1"));
        assert!(!f.base.watches().unwrap().is_registered(&key()));
    }
}
