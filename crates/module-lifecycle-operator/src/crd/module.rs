use kube::{api::ApiResource, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use module_operator::status::condition::{LifecycleCondition, LifecycleState};

use super::Overrides;

/// A module whose lifetime is driven through
/// [`ModuleLifecycle`](super::module_lifecycle::ModuleLifecycle) objects, one per action.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "platform.verrazzano.io",
    version = "v1alpha1",
    kind = "Module",
    namespaced,
    shortname = "vzmod",
    status = "ModuleStatus",
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Version", "type": "string", "jsonPath": ".status.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    /// The chart to deploy. Defaults to the name of the object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,

    /// Defaults to the namespace of the object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,

    /// Defaults to the version of the bundled chart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default)]
    pub overrides: Vec<Overrides>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<LifecycleState>,

    /// The version of the module as last installed, upgraded or updated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Mirrored from the lifecycle object currently driving the module.
    #[serde(default)]
    pub conditions: Vec<LifecycleCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Module {
    pub fn api_resource() -> ApiResource {
        ApiResource::erase::<Self>(&())
    }

    /// The chart and release name of the module.
    pub fn module_name(&self) -> String {
        self.spec
            .module_name
            .clone()
            .unwrap_or_else(|| self.metadata.name.clone().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use kube::CustomResourceExt;

    use super::*;

    #[test]
    fn module_name_defaults_to_object_name() {
        let mut module = Module::new("keycloak", ModuleSpec::default());
        assert_eq!(module.module_name(), "keycloak");

        module.spec.module_name = Some("keycloak-operator".to_owned());
        assert_eq!(module.module_name(), "keycloak-operator");
    }

    #[test]
    fn crd_metadata() {
        let crd = Module::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("modules.platform.verrazzano.io"));
        assert_eq!(crd.spec.names.short_names, Some(vec!["vzmod".to_owned()]));
    }
}
