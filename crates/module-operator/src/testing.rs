//! In-memory doubles of the cluster store and watch source.
//!
//! [`MemoryStore`] follows the API server closely enough for reconcile tests: it assigns uids,
//! bumps `resourceVersion` on every write and `generation` on spec changes, rejects stale writes
//! with a conflict and holds deleted objects until their last finalizer is removed.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc};
use kube::{api::ApiResource, core::DynamicObject, ResourceExt};
use serde_json::Value;

use crate::{
    client::{self, ClusterStore, ObjectKey},
    watch::{Enqueuer, WatchDescriptor, WatchHandle, WatchPump, WatchSource},
};

type StoreKey = (String, ObjectKey);

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<StoreKey, DynamicObject>,
    next_version: u64,
    next_uid: u64,
    injected_conflicts: usize,
    status_writes: usize,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail with a conflict.
    pub fn inject_conflicts(&self, count: usize) {
        self.lock().injected_conflicts = count;
    }

    /// Number of successful status writes so far.
    pub fn status_writes(&self) -> usize {
        self.lock().status_writes
    }

    /// All stored objects of a kind, ordered by namespace and name.
    pub fn objects(&self, ar: &ApiResource) -> Vec<DynamicObject> {
        let kind = kind_key(ar);
        self.lock()
            .objects
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn bump_version(&mut self, obj: &mut DynamicObject) {
        self.next_version += 1;
        obj.metadata.resource_version = Some(self.next_version.to_string());
    }

    fn check_version(
        &mut self,
        ar: &ApiResource,
        key: &ObjectKey,
        stored: &DynamicObject,
        obj: &DynamicObject,
    ) -> Result<(), client::Error> {
        if self.injected_conflicts > 0 {
            self.injected_conflicts -= 1;
            return Err(conflict(ar, key));
        }
        match &obj.metadata.resource_version {
            Some(version) if Some(version) != stored.metadata.resource_version.as_ref() => {
                Err(conflict(ar, key))
            }
            _ => Ok(()),
        }
    }
}

fn kind_key(ar: &ApiResource) -> String {
    format!("{}/{}", ar.api_version, ar.kind)
}

fn conflict(ar: &ApiResource, key: &ObjectKey) -> client::Error {
    client::Error::Conflict {
        kind: ar.kind.clone(),
        key: key.clone(),
    }
}

fn not_found(ar: &ApiResource, key: &ObjectKey) -> client::Error {
    client::Error::NotFound {
        kind: ar.kind.clone(),
        key: key.clone(),
    }
}

fn object_key(ar: &ApiResource, obj: &DynamicObject) -> Result<ObjectKey, client::Error> {
    ObjectKey::from_object(obj).ok_or_else(|| client::Error::MissingObjectKey {
        kind: ar.kind.clone(),
    })
}

/// Everything but metadata and status.
fn spec_of(obj: &DynamicObject) -> Value {
    let mut data = obj.data.clone();
    if let Some(data) = data.as_object_mut() {
        data.remove("status");
    }
    data
}

fn set_status(obj: &mut DynamicObject, status: Option<Value>) {
    if !obj.data.is_object() {
        obj.data = Value::Object(serde_json::Map::new());
    }
    if let Some(data) = obj.data.as_object_mut() {
        match status {
            Some(status) => {
                data.insert("status".to_owned(), status);
            }
            None => {
                data.remove("status");
            }
        }
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, client::Error> {
        Ok(self.lock().objects.get(&(kind_key(ar), key.clone())).cloned())
    }

    async fn create(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, client::Error> {
        let key = object_key(ar, obj)?;
        let mut inner = self.lock();
        let store_key = (kind_key(ar), key.clone());
        if inner.objects.contains_key(&store_key) {
            return Err(client::Error::AlreadyExists {
                kind: ar.kind.clone(),
                key,
            });
        }

        let mut created = obj.clone();
        inner.next_uid += 1;
        created.metadata.uid = Some(format!("uid-{}", inner.next_uid));
        created.metadata.generation = Some(1);
        created.metadata.deletion_timestamp = None;
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        if created.types.is_none() {
            created.types = Some(kube::core::TypeMeta {
                api_version: ar.api_version.clone(),
                kind: ar.kind.clone(),
            });
        }
        inner.bump_version(&mut created);
        inner.objects.insert(store_key, created.clone());
        Ok(created)
    }

    async fn replace(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, client::Error> {
        let key = object_key(ar, obj)?;
        let mut inner = self.lock();
        let store_key = (kind_key(ar), key.clone());
        let stored = inner
            .objects
            .get(&store_key)
            .cloned()
            .ok_or_else(|| not_found(ar, &key))?;
        inner.check_version(ar, &key, &stored, obj)?;

        let mut replaced = obj.clone();
        replaced.metadata.uid = stored.metadata.uid.clone();
        replaced.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        replaced.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        replaced.metadata.generation = stored.metadata.generation;
        if spec_of(&replaced) != spec_of(&stored) {
            replaced.metadata.generation = Some(stored.metadata.generation.unwrap_or_default() + 1);
        }
        set_status(&mut replaced, stored.data.get("status").cloned());
        inner.bump_version(&mut replaced);

        if replaced.metadata.deletion_timestamp.is_some() && replaced.finalizers().is_empty() {
            inner.objects.remove(&store_key);
        } else {
            inner.objects.insert(store_key, replaced.clone());
        }
        Ok(replaced)
    }

    async fn replace_status(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, client::Error> {
        let key = object_key(ar, obj)?;
        let mut inner = self.lock();
        let store_key = (kind_key(ar), key.clone());
        let mut stored = inner
            .objects
            .get(&store_key)
            .cloned()
            .ok_or_else(|| not_found(ar, &key))?;
        inner.check_version(ar, &key, &stored, obj)?;

        set_status(&mut stored, obj.data.get("status").cloned());
        inner.bump_version(&mut stored);
        inner.status_writes += 1;
        inner.objects.insert(store_key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<(), client::Error> {
        let mut inner = self.lock();
        let store_key = (kind_key(ar), key.clone());
        let Some(mut stored) = inner.objects.get(&store_key).cloned() else {
            return Ok(());
        };

        if stored.finalizers().is_empty() {
            inner.objects.remove(&store_key);
        } else if stored.metadata.deletion_timestamp.is_none() {
            stored.metadata.deletion_timestamp = Some(Time(Utc::now()));
            inner.bump_version(&mut stored);
            inner.objects.insert(store_key, stored);
        }
        Ok(())
    }
}

/// Records started watches instead of talking to a cluster.
///
/// Events can be fed to the recorded watches with [`RecordingWatchSource::dispatch`].
#[derive(Default)]
pub struct RecordingWatchSource {
    pumps: Mutex<Vec<WatchPump>>,
    descriptors: Mutex<Vec<(WatchDescriptor, ObjectKey)>>,
}

impl RecordingWatchSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every started watch with the primary it enqueues.
    pub fn started(&self) -> Vec<(WatchDescriptor, ObjectKey)> {
        self.descriptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Hands `event` to every recorded watch. Returns how many of them enqueued their primary.
    pub fn dispatch(&self, event: &kube::runtime::watcher::Event<DynamicObject>) -> usize {
        self.pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter_mut()
            .map(|pump| pump.handle(event.clone()))
            .filter(|enqueued| *enqueued)
            .count()
    }
}

impl WatchSource for RecordingWatchSource {
    fn start(&self, descriptor: WatchDescriptor, enqueuer: Enqueuer) -> WatchHandle {
        self.descriptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((descriptor.clone(), enqueuer.primary().clone()));
        self.pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(WatchPump::new(descriptor, enqueuer));
        WatchHandle::detached()
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ConfigMap;
    use serde_json::json;

    use super::*;

    fn ar() -> ApiResource {
        ApiResource::erase::<ConfigMap>(&())
    }

    fn key() -> ObjectKey {
        ObjectKey::new("ns", "cm")
    }

    async fn seeded() -> (MemoryStore, DynamicObject) {
        let store = MemoryStore::new();
        let obj = DynamicObject::new("cm", &ar())
            .within("ns")
            .data(json!({ "spec": { "a": 1 } }));
        let created = store.create(&ar(), &obj).await.unwrap();
        (store, created)
    }

    #[tokio::test]
    async fn spec_changes_bump_generation() {
        let (store, mut obj) = seeded().await;
        assert_eq!(obj.metadata.generation, Some(1));
        assert!(obj.uid().is_some());

        obj.labels_mut().insert("x".to_owned(), "y".to_owned());
        let obj = store.replace(&ar(), &obj).await.unwrap();
        assert_eq!(obj.metadata.generation, Some(1));

        let mut obj = obj;
        obj.data["spec"]["a"] = json!(2);
        let obj = store.replace(&ar(), &obj).await.unwrap();
        assert_eq!(obj.metadata.generation, Some(2));
    }

    #[tokio::test]
    async fn stale_writes_conflict() {
        let (store, obj) = seeded().await;
        let mut with_status = obj.clone();
        with_status.data["status"] = json!({ "state": "Ready" });
        store.replace_status(&ar(), &with_status).await.unwrap();

        let err = store.replace_status(&ar(), &with_status).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.status_writes(), 1);
    }

    #[tokio::test]
    async fn injected_conflicts_are_consumed() {
        let (store, obj) = seeded().await;
        store.inject_conflicts(1);

        assert!(store.replace_status(&ar(), &obj).await.unwrap_err().is_conflict());
        assert!(store.replace_status(&ar(), &obj).await.is_ok());
    }

    #[tokio::test]
    async fn status_and_spec_are_written_separately() {
        let (store, obj) = seeded().await;
        let mut update = obj.clone();
        update.data["status"] = json!({ "state": "Ready" });
        update.data["spec"]["a"] = json!(5);

        let written = store.replace_status(&ar(), &update).await.unwrap();
        assert_eq!(written.data["spec"]["a"], json!(1));
        assert_eq!(written.data["status"]["state"], json!("Ready"));

        let mut update = written.clone();
        update.data["status"] = json!({ "state": "Failed" });
        let written = store.replace(&ar(), &update).await.unwrap();
        assert_eq!(written.data["status"]["state"], json!("Ready"));
    }

    #[tokio::test]
    async fn finalizers_hold_deleted_objects() {
        let (store, mut obj) = seeded().await;
        obj.finalizers_mut().push("f".to_owned());
        store.replace(&ar(), &obj).await.unwrap();

        store.delete(&ar(), &key()).await.unwrap();
        let mut deleting = store.get(&ar(), &key()).await.unwrap().unwrap();
        assert!(deleting.metadata.deletion_timestamp.is_some());

        deleting.finalizers_mut().clear();
        store.replace(&ar(), &deleting).await.unwrap();
        assert_eq!(store.get(&ar(), &key()).await.unwrap(), None);
        assert!(store.objects(&ar()).is_empty());
    }
}
