//! Secondary object watches that enqueue a known primary resource.
//!
//! A domain reconciler declares [`WatchDescriptor`]s for each primary it reconciles. The
//! [`WatchRegistry`] starts them on the first reconcile of that primary and ignores later requests.
//! Every matching event enqueues the primary key it was registered for; owner references are not
//! consulted.

use std::{
    collections::HashMap,
    fmt,
    hash::{DefaultHasher, Hash, Hasher},
    pin::pin,
    sync::{Arc, PoisonError, RwLock},
};

use futures::{
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
    StreamExt,
};
use kube::{
    api::ApiResource,
    core::DynamicObject,
    runtime::{watcher, WatchStreamExt},
    Api,
};
use strum::Display;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::client::ObjectKey;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum WatchEvent {
    Created,
    Updated,
    Deleted,
}

pub type WatchPredicate = Arc<dyn Fn(&DynamicObject, WatchEvent) -> bool + Send + Sync>;

/// A kind of secondary object to watch and which of its events are relevant.
#[derive(Clone)]
pub struct WatchDescriptor {
    pub api_resource: ApiResource,
    /// Restricts the watch to one namespace; `None` watches the whole cluster.
    pub namespace: Option<String>,
    pub predicate: WatchPredicate,
}

impl WatchDescriptor {
    pub fn new(
        api_resource: ApiResource,
        namespace: Option<String>,
        predicate: impl Fn(&DynamicObject, WatchEvent) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            api_resource,
            namespace,
            predicate: Arc::new(predicate),
        }
    }

    pub fn matches(&self, obj: &DynamicObject, event: WatchEvent) -> bool {
        (self.predicate)(obj, event)
    }
}

impl fmt::Debug for WatchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchDescriptor")
            .field("kind", &self.api_resource.kind)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

/// Enqueues one fixed primary key.
#[derive(Clone, Debug)]
pub struct Enqueuer {
    primary: ObjectKey,
    tx: UnboundedSender<ObjectKey>,
}

impl Enqueuer {
    pub fn primary(&self) -> &ObjectKey {
        &self.primary
    }

    /// Returns `false` once the receiving controller has gone away.
    pub fn enqueue(&self) -> bool {
        self.tx.unbounded_send(self.primary.clone()).is_ok()
    }
}

/// Turns raw watch events into [`WatchEvent`]s and drops updates that change nothing.
///
/// Only a fingerprint of each object is kept. An object that cannot be fingerprinted always
/// counts as updated.
#[derive(Debug, Default)]
pub struct EventFilter {
    seen: HashMap<ObjectKey, Option<u64>>,
}

impl EventFilter {
    pub fn applied(&mut self, obj: &DynamicObject) -> Option<WatchEvent> {
        let key = ObjectKey::from_object(obj)?;
        let fingerprint = fingerprint(obj);
        match self.seen.insert(key, fingerprint) {
            None => Some(WatchEvent::Created),
            Some(Some(old)) if Some(old) == fingerprint => None,
            Some(_) => Some(WatchEvent::Updated),
        }
    }

    pub fn deleted(&mut self, obj: &DynamicObject) -> WatchEvent {
        if let Some(key) = ObjectKey::from_object(obj) {
            self.seen.remove(&key);
        }
        WatchEvent::Deleted
    }
}

/// Hash of the serialized object: metadata (labels and annotations included) and data.
fn fingerprint(obj: &DynamicObject) -> Option<u64> {
    let serialized = serde_json::to_vec(obj).ok()?;
    let mut hasher = DefaultHasher::new();
    serialized.hash(&mut hasher);
    Some(hasher.finish())
}

/// Feeds the events of one watch through its filter and predicate into the enqueuer.
pub struct WatchPump {
    descriptor: WatchDescriptor,
    enqueuer: Enqueuer,
    filter: EventFilter,
}

impl WatchPump {
    pub fn new(descriptor: WatchDescriptor, enqueuer: Enqueuer) -> Self {
        Self {
            descriptor,
            enqueuer,
            filter: EventFilter::default(),
        }
    }

    /// Returns whether the primary was enqueued.
    pub fn handle(&mut self, event: watcher::Event<DynamicObject>) -> bool {
        let (obj, event) = match event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                match self.filter.applied(&obj) {
                    Some(event) => (obj, event),
                    None => return false,
                }
            }
            watcher::Event::Delete(obj) => {
                let event = self.filter.deleted(&obj);
                (obj, event)
            }
            watcher::Event::Init | watcher::Event::InitDone => return false,
        };

        if !self.descriptor.matches(&obj, event) {
            return false;
        }
        debug!(
            kind = %self.descriptor.api_resource.kind,
            %event,
            primary = %self.enqueuer.primary,
            "Secondary object changed, enqueueing primary"
        );
        self.enqueuer.enqueue()
    }
}

/// Stops the watch when dropped.
#[derive(Debug)]
pub struct WatchHandle {
    task: Option<AbortHandle>,
}

impl WatchHandle {
    pub fn new(task: AbortHandle) -> Self {
        Self { task: Some(task) }
    }

    /// A handle without a backing task.
    pub fn detached() -> Self {
        Self { task: None }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Starts watches.
pub trait WatchSource: Send + Sync {
    fn start(&self, descriptor: WatchDescriptor, enqueuer: Enqueuer) -> WatchHandle;
}

/// Runs each watch as a kube [`watcher`] in its own task.
#[derive(Clone)]
pub struct KubeWatchSource {
    client: kube::Client,
}

impl KubeWatchSource {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

impl WatchSource for KubeWatchSource {
    fn start(&self, descriptor: WatchDescriptor, enqueuer: Enqueuer) -> WatchHandle {
        let api: Api<DynamicObject> = match &descriptor.namespace {
            Some(namespace) => {
                Api::namespaced_with(self.client.clone(), namespace, &descriptor.api_resource)
            }
            None => Api::all_with(self.client.clone(), &descriptor.api_resource),
        };

        let task = tokio::spawn(async move {
            let kind = descriptor.api_resource.kind.clone();
            let mut pump = WatchPump::new(descriptor, enqueuer);
            let mut events = pin!(watcher(api, watcher::Config::default()).default_backoff());

            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        pump.handle(event);
                    }
                    Err(err) => warn!(
                        %kind,
                        error = &err as &dyn std::error::Error,
                        "Secondary watch failed, retrying"
                    ),
                }
            }
        });

        WatchHandle::new(task.abort_handle())
    }
}

/// Remembers which primaries already have their watches running.
pub struct WatchRegistry {
    source: Arc<dyn WatchSource>,
    tx: UnboundedSender<ObjectKey>,
    watches: RwLock<HashMap<ObjectKey, Vec<WatchHandle>>>,
}

impl WatchRegistry {
    /// Returns the registry together with the stream of primary keys its watches enqueue.
    pub fn new(source: Arc<dyn WatchSource>) -> (Self, UnboundedReceiver<ObjectKey>) {
        let (tx, rx) = mpsc::unbounded();
        (
            Self {
                source,
                tx,
                watches: RwLock::default(),
            },
            rx,
        )
    }

    /// Starts the watches of `primary` unless they are already running.
    ///
    /// Returns `true` if watches were started by this call.
    pub fn ensure(
        &self,
        primary: &ObjectKey,
        descriptors: impl FnOnce() -> Vec<WatchDescriptor>,
    ) -> bool {
        if self.is_registered(primary) {
            return false;
        }

        let mut watches = self.watches.write().unwrap_or_else(PoisonError::into_inner);
        if watches.contains_key(primary) {
            return false;
        }

        let handles = descriptors()
            .into_iter()
            .map(|descriptor| {
                debug!(?descriptor, %primary, "Registering watch");
                self.source.start(descriptor, Enqueuer {
                    primary: primary.clone(),
                    tx: self.tx.clone(),
                })
            })
            .collect();
        watches.insert(primary.clone(), handles);
        true
    }

    pub fn is_registered(&self, primary: &ObjectKey) -> bool {
        self.watches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(primary)
    }

    /// Stops the watches of `primary`.
    pub fn forget(&self, primary: &ObjectKey) -> bool {
        self.watches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(primary)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.watches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
