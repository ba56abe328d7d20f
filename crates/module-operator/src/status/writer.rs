use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use kube::{api::ApiResource, core::DynamicObject, ResourceExt};
use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::{
    client::{self, ClusterStore},
    status::{
        condition::{build_condition, ConditionStatus, ConditionType, LifecycleCondition},
        read_conditions, read_observed_generation, CONDITIONS_KEY, OBSERVED_GENERATION_KEY,
        STATE_KEY,
    },
};

/// Upper bound of retained conditions; the oldest are dropped first.
pub const MAX_CONDITIONS: usize = 20;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to write {condition} condition to {object}"))]
    WriteStatus {
        source: client::Error,
        condition: ConditionType,
        object: String,
    },

    #[snafu(display("failed to serialize {condition} condition"))]
    SerializeCondition {
        source: serde_json::Error,
        condition: ConditionType,
    },
}

impl Error {
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::WriteStatus { source, .. } => source.is_conflict(),
            Self::SerializeCondition { .. } => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    pub condition: ConditionType,
    pub status: ConditionStatus,
    pub message: String,
    /// Marks the current generation as fully reconciled.
    pub finalize: bool,
    /// Extra status fields written together with the condition.
    pub fields: Map<String, Value>,
}

impl StatusUpdate {
    pub fn progress(condition: ConditionType) -> Self {
        Self {
            condition,
            status: ConditionStatus::True,
            message: String::new(),
            finalize: false,
            fields: Map::new(),
        }
    }

    pub fn finished(condition: ConditionType) -> Self {
        Self {
            finalize: true,
            ..Self::progress(condition)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_status(mut self, status: ConditionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Persists progress conditions for one object.
#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// The generation conditions are written for.
    fn generation(&self) -> i64;

    /// The conditions as last seen or written, oldest first.
    fn conditions(&self) -> Vec<LifecycleCondition>;

    async fn write(&self, update: StatusUpdate) -> Result<(), Error>;
}

/// Writes conditions through the status subresource of the object it was created for.
///
/// The writer keeps the object returned by each write, so consecutive writes within one reconcile
/// carry the current `resourceVersion`. A write racing with another update fails with a conflict.
pub struct ResourceStatusWriter {
    store: Arc<dyn ClusterStore>,
    api_resource: ApiResource,
    object: Mutex<DynamicObject>,
    finish_fields: Map<String, Value>,
}

impl ResourceStatusWriter {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        api_resource: ApiResource,
        object: DynamicObject,
    ) -> Self {
        Self {
            store,
            api_resource,
            object: Mutex::new(object),
            finish_fields: Map::new(),
        }
    }

    /// Adds `key` to every write that finishes the generation, in the same status update.
    pub fn with_finish_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.finish_fields.insert(key.into(), value.into());
        self
    }

    /// The object as last written.
    pub fn object(&self) -> DynamicObject {
        self.object
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl StatusWriter for ResourceStatusWriter {
    fn generation(&self) -> i64 {
        self.object
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .metadata
            .generation
            .unwrap_or_default()
    }

    fn conditions(&self) -> Vec<LifecycleCondition> {
        read_conditions(&self.object())
    }

    async fn write(&self, mut update: StatusUpdate) -> Result<(), Error> {
        if update.finalize {
            for (key, value) in &self.finish_fields {
                update
                    .fields
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
        }
        let mut obj = self.object();
        let Some(status) = apply_update(&mut obj, &update)? else {
            debug!(
                object = %obj.name_any(),
                condition = %update.condition,
                "Condition already recorded, skipping status write"
            );
            return Ok(());
        };

        debug!(
            object = %obj.name_any(),
            condition = %update.condition,
            ?status,
            "Writing status condition"
        );
        let written = self
            .store
            .replace_status(&self.api_resource, &obj)
            .await
            .context(WriteStatusSnafu {
                condition: update.condition,
                object: obj.name_any(),
            })?;

        *self.object.lock().unwrap_or_else(PoisonError::into_inner) = written;
        Ok(())
    }
}

/// Applies `update` to the status of `obj`.
///
/// Returns the new status, or `None` when the object already reflects the update.
pub fn apply_update(
    obj: &mut DynamicObject,
    update: &StatusUpdate,
) -> Result<Option<Value>, Error> {
    let generation = obj.metadata.generation.unwrap_or_default();
    let current = read_conditions(obj);
    let observed = read_observed_generation(obj);

    let superseded = current.iter().any(|c| {
        c.observed_generation == Some(generation)
            && c.type_.action_name() == update.condition.action_name()
            && c.type_.rank() >= update.condition.rank()
    });
    let needs_observed =
        update.finalize && !matches!(observed, Some(observed) if observed >= generation);

    if superseded && !needs_observed {
        return Ok(None);
    }

    if !obj.data.is_object() {
        obj.data = Value::Object(Map::new());
    }
    let Some(status) = obj.data.as_object_mut().and_then(|data| {
        let status = data
            .entry("status")
            .or_insert_with(|| Value::Object(Map::new()));
        if !status.is_object() {
            *status = Value::Object(Map::new());
        }
        status.as_object_mut()
    }) else {
        return Ok(None);
    };

    if !superseded {
        let condition = build_condition(
            &current,
            update.condition,
            update.status,
            update.message.clone(),
            generation,
        );
        let condition = serde_json::to_value(condition).context(SerializeConditionSnafu {
            condition: update.condition,
        })?;

        let conditions = status
            .entry(CONDITIONS_KEY)
            .or_insert_with(|| Value::Array(Vec::new()));
        if !conditions.is_array() {
            *conditions = Value::Array(Vec::new());
        }
        if let Value::Array(conditions) = conditions {
            conditions.push(condition);
            let excess = conditions.len().saturating_sub(MAX_CONDITIONS);
            conditions.drain(..excess);
        }

        status.insert(
            STATE_KEY.to_owned(),
            Value::String(update.condition.lifecycle_state().to_string()),
        );
    }

    if needs_observed {
        status.insert(OBSERVED_GENERATION_KEY.to_owned(), Value::from(generation));
    }
    for (key, value) in &update.fields {
        status.insert(key.clone(), value.clone());
    }

    Ok(Some(Value::Object(status.clone())))
}
