use schemars::{
    gen::SchemaGenerator,
    schema::{InstanceType, Schema, SchemaObject},
};
use serde_json::Value;

const PRESERVE_UNKNOWN_FIELDS: &str = "x-kubernetes-preserve-unknown-fields";

/// Schema of an arbitrary JSON object the API server must store as is, such as chart values.
pub fn raw_object_schema(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..SchemaObject::default()
    };
    schema
        .extensions
        .insert(PRESERVE_UNKNOWN_FIELDS.to_owned(), Value::Bool(true));
    Schema::Object(schema)
}
