//! Custom resources reconciled by this operator.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use module_operator::utils::crds::raw_object_schema;

pub mod module;
pub mod module_lifecycle;

pub const GROUP: &str = "platform.verrazzano.io";
pub const APP_NAME: &str = "module-lifecycle-operator";

/// Chart values layered over the chart defaults. Later entries win.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Overrides {
    #[schemars(schema_with = "raw_object_schema")]
    pub values: Option<Value>,
}
