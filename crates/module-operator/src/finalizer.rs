//! Finalizer bookkeeping and the sequencing of pre-delete cleanup.
//!
//! The manager never writes conditions; cleanup code records its own progress if it wants to.

use std::future::Future;

use kube::{api::ApiResource, core::DynamicObject, ResourceExt};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info};

use crate::{
    client::{self, ClusterStore},
    requeue::ReconcileResult,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to add finalizer {finalizer:?} to {object}"))]
    AddFinalizer {
        source: client::Error,
        finalizer: String,
        object: String,
    },

    #[snafu(display("failed to remove finalizer {finalizer:?} from {object}"))]
    RemoveFinalizer {
        source: client::Error,
        finalizer: String,
        object: String,
    },
}

/// Checks whether `finalizer` is in the list of finalizers of the provided object.
pub fn has_finalizer(obj: &DynamicObject, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Checks whether the provided object has a deletion timestamp set.
/// If that is the case the object is in the process of being deleted pending the handling of all
/// finalizers.
pub fn has_deletion_stamp(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

#[derive(Clone, Debug, PartialEq)]
pub enum FinalizerOutcome {
    /// The object is not being deleted and carries the finalizer; reconcile it as usual.
    Continue(DynamicObject),
    /// Cleanup asked to be called again; the finalizer is kept.
    Requeue(ReconcileResult),
    /// The object is being deleted and no longer held by this finalizer.
    Released,
}

pub struct FinalizerManager<'a> {
    store: &'a dyn ClusterStore,
    api_resource: &'a ApiResource,
    finalizer: &'a str,
}

impl<'a> FinalizerManager<'a> {
    pub fn new(
        store: &'a dyn ClusterStore,
        api_resource: &'a ApiResource,
        finalizer: &'a str,
    ) -> Self {
        Self {
            store,
            api_resource,
            finalizer,
        }
    }

    /// Adds the finalizer to live objects and runs `cleanup` for deleted ones.
    ///
    /// The finalizer is only removed once `cleanup` returns an empty result. A failing cleanup
    /// keeps it in place.
    pub async fn run<F, Fut, E>(
        &self,
        obj: DynamicObject,
        cleanup: F,
    ) -> Result<FinalizerOutcome, E>
    where
        F: FnOnce(DynamicObject) -> Fut + Send,
        Fut: Future<Output = Result<ReconcileResult, E>> + Send,
        E: From<Error>,
    {
        if !has_deletion_stamp(&obj) {
            if has_finalizer(&obj, self.finalizer) {
                return Ok(FinalizerOutcome::Continue(obj));
            }
            return Ok(FinalizerOutcome::Continue(self.add(obj).await?));
        }

        if !has_finalizer(&obj, self.finalizer) {
            return Ok(FinalizerOutcome::Released);
        }

        let result = cleanup(obj.clone()).await?;
        if !result.is_empty() {
            debug!(object = %obj.name_any(), "Cleanup not finished yet");
            return Ok(FinalizerOutcome::Requeue(result));
        }

        // Cleanup may have written status; the finalizer removal must not be based on a stale copy
        let current = self
            .store
            .get(self.api_resource, &key(&obj))
            .await
            .context(RemoveFinalizerSnafu {
                finalizer: self.finalizer,
                object: obj.name_any(),
            })?;
        if let Some(current) = current {
            self.remove(current).await?;
        }
        Ok(FinalizerOutcome::Released)
    }

    async fn add(&self, mut obj: DynamicObject) -> Result<DynamicObject, Error> {
        info!(object = %obj.name_any(), finalizer = self.finalizer, "Adding finalizer");
        obj.finalizers_mut().push(self.finalizer.to_owned());
        self.store
            .replace(self.api_resource, &obj)
            .await
            .context(AddFinalizerSnafu {
                finalizer: self.finalizer,
                object: obj.name_any(),
            })
    }

    async fn remove(&self, mut obj: DynamicObject) -> Result<(), Error> {
        if !has_finalizer(&obj, self.finalizer) {
            return Ok(());
        }
        info!(object = %obj.name_any(), finalizer = self.finalizer, "Removing finalizer");
        obj.finalizers_mut().retain(|f| f != self.finalizer);
        match self.store.replace(self.api_resource, &obj).await {
            // Removing the last finalizer of a deleted object lets the cluster remove it
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err).context(RemoveFinalizerSnafu {
                finalizer: self.finalizer,
                object: obj.name_any(),
            }),
        }
    }
}

fn key(obj: &DynamicObject) -> client::ObjectKey {
    client::ObjectKey::new(obj.namespace().unwrap_or_default(), obj.name_any())
}
