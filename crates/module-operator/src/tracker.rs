//! Process-local record of how far the state machine got for each reconciled object.

use std::{
    collections::HashMap,
    fmt::{self, Display},
    sync::{PoisonError, RwLock},
};

use kube::core::DynamicObject;
use kube::ResourceExt;

use crate::state_machine::State;

/// Separates the normal reconcile flow from the deletion cleanup flow of the same object, so the
/// two never overwrite each other's progress.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum TrackerScope {
    #[default]
    Reconcile,
    Cleanup,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct TrackerKey {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub scope: TrackerScope,
}

impl TrackerKey {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: uid.into(),
            scope: TrackerScope::Reconcile,
        }
    }

    pub fn for_object(obj: &DynamicObject) -> Self {
        Self::new(
            obj.namespace().unwrap_or_default(),
            obj.name_any(),
            obj.uid().unwrap_or_default(),
        )
    }

    pub fn with_scope(mut self, scope: TrackerScope) -> Self {
        self.scope = scope;
        self
    }
}

impl Display for TrackerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.name, self.uid)?;
        if self.scope == TrackerScope::Cleanup {
            f.write_str("/cleanup")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tracker {
    /// The object generation this tracker was created for.
    pub generation: i64,
    pub state: State,
}

#[derive(Debug, Default)]
pub struct TrackerStore {
    trackers: RwLock<HashMap<TrackerKey, Tracker>>,
}

impl TrackerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the tracker for `key`, replacing it with a fresh one at `initial` when it is missing
    /// or was created for another generation.
    pub fn get(&self, key: &TrackerKey, generation: i64, initial: State) -> Tracker {
        self.get_or_else(key, generation, || initial)
    }

    /// Like [`TrackerStore::get`], but only computes the initial state when a fresh tracker is
    /// needed.
    pub fn get_or_else(
        &self,
        key: &TrackerKey,
        generation: i64,
        initial: impl FnOnce() -> State,
    ) -> Tracker {
        if let Some(tracker) = self.lookup(key) {
            if tracker.generation == generation {
                return tracker;
            }
        }

        let tracker = Tracker {
            generation,
            state: initial(),
        };
        self.write().insert(key.clone(), tracker);
        tracker
    }

    pub fn lookup(&self, key: &TrackerKey) -> Option<Tracker> {
        self.trackers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    pub fn set(&self, key: &TrackerKey, tracker: Tracker) {
        self.write().insert(key.clone(), tracker);
    }

    pub fn delete(&self, key: &TrackerKey) -> Option<Tracker> {
        self.write().remove(key)
    }

    /// Removes every tracker (of any uid or scope) belonging to `namespace/name`.
    pub fn delete_object(&self, namespace: &str, name: &str) -> usize {
        let mut trackers = self.write();
        let before = trackers.len();
        trackers.retain(|key, _| !(key.namespace == namespace && key.name == name));
        before - trackers.len()
    }

    pub fn contains_uid(&self, uid: &str) -> bool {
        self.trackers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .any(|key| key.uid == uid)
    }

    pub fn len(&self) -> usize {
        self.trackers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TrackerKey, Tracker>> {
        self.trackers.write().unwrap_or_else(PoisonError::into_inner)
    }
}
