//! Reading and writing the `status` of lifecycle resources.
//!
//! Only three keys are owned here: `status.conditions`, `status.state` and
//! `status.observedGeneration`. Anything else a domain stores in its status is left untouched.

use kube::core::DynamicObject;
use serde_json::Value;

use crate::status::condition::{LifecycleCondition, LifecycleState};

pub mod condition;
pub mod writer;

pub const CONDITIONS_KEY: &str = "conditions";
pub const STATE_KEY: &str = "state";
pub const OBSERVED_GENERATION_KEY: &str = "observedGeneration";

pub fn status_value(obj: &DynamicObject) -> Option<&Value> {
    obj.data.get("status")
}

/// The conditions recorded on `obj`, oldest first.
///
/// Entries that cannot be understood (for example written by another tool) are skipped.
pub fn read_conditions(obj: &DynamicObject) -> Vec<LifecycleCondition> {
    status_value(obj)
        .and_then(|status| status.get(CONDITIONS_KEY))
        .and_then(Value::as_array)
        .map(|conditions| {
            conditions
                .iter()
                .filter_map(|c| serde_json::from_value(c.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

pub fn read_observed_generation(obj: &DynamicObject) -> Option<i64> {
    status_value(obj)
        .and_then(|status| status.get(OBSERVED_GENERATION_KEY))
        .and_then(Value::as_i64)
}

pub fn read_state(obj: &DynamicObject) -> Option<LifecycleState> {
    status_value(obj)
        .and_then(|status| status.get(STATE_KEY))
        .and_then(Value::as_str)
        .and_then(|state| state.parse().ok())
}

/// Whether the last completed reconcile was for the current spec.
pub fn is_up_to_date(obj: &DynamicObject) -> bool {
    obj.metadata.generation.is_some() && read_observed_generation(obj) == obj.metadata.generation
}
