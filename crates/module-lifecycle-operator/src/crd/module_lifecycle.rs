use kube::{api::ApiResource, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use module_operator::status::condition::{LifecycleCondition, LifecycleState};

use super::Overrides;

/// Drives one lifecycle action (install, uninstall, update or upgrade) of a chart release.
#[derive(CustomResource, Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "platform.verrazzano.io",
    version = "v1alpha1",
    kind = "ModuleLifecycle",
    namespaced,
    shortname = "mlc",
    status = "ModuleLifecycleStatus",
    printcolumn = r#"{"name": "Action", "type": "string", "jsonPath": ".spec.action"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Version", "type": "string", "jsonPath": ".status.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ModuleLifecycleSpec {
    /// Selects the operator instance responsible for this object.
    #[serde(default)]
    pub lifecycle_class: String,

    /// One of `install`, `uninstall`, `update` or `upgrade`.
    pub action: String,

    pub release: ReleaseSpec,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseSpec {
    pub name: String,

    /// The namespace the release is installed into.
    pub namespace: String,

    /// Repository to fetch the chart from. Local charts are used when unset.
    #[serde(rename = "repositoryURI", default, skip_serializing_if = "Option::is_none")]
    pub repository_uri: Option<String>,

    /// Chart directory, or chart name for remote charts. Relative paths are resolved against the
    /// operator chart directory.
    pub chart_path: String,

    /// Read from the chart when unset. Required for remote charts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_version: Option<String>,

    #[serde(default)]
    pub overrides: Vec<Overrides>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleLifecycleStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<LifecycleState>,

    #[serde(default)]
    pub conditions: Vec<LifecycleCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// The chart version of the last completed action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ModuleLifecycle {
    pub fn api_resource() -> ApiResource {
        ApiResource::erase::<Self>(&())
    }
}

#[cfg(test)]
mod tests {
    use kube::CustomResourceExt;
    use serde_json::json;

    use super::*;

    #[test]
    fn spec_uses_wire_names() {
        let spec: ModuleLifecycleSpec = serde_json::from_value(json!({
            "lifecycleClass": "helm",
            "action": "install",
            "release": {
                "name": "r",
                "namespace": "n",
                "repositoryURI": "https://charts.example.com",
                "chartPath": "ingress-nginx",
                "chartVersion": "1.0.0",
                "overrides": [{ "values": { "replicas": 2 } }]
            }
        }))
        .unwrap();

        assert_eq!(spec.lifecycle_class, "helm");
        assert_eq!(
            spec.release.repository_uri.as_deref(),
            Some("https://charts.example.com")
        );
        assert_eq!(spec.release.chart_version.as_deref(), Some("1.0.0"));
        assert_eq!(
            spec.release.overrides[0].values,
            Some(json!({ "replicas": 2 }))
        );
    }

    #[test]
    fn crd_metadata() {
        let crd = ModuleLifecycle::crd();
        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("modulelifecycles.platform.verrazzano.io")
        );
        assert_eq!(
            crd.spec.names.short_names,
            Some(vec!["mlc".to_owned()])
        );
        assert_eq!(ModuleLifecycle::api_resource().kind, "ModuleLifecycle");
    }
}
