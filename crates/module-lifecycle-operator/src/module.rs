//! Reconciles [`Module`] objects by delegating each action to a [`ModuleLifecycle`].

use async_trait::async_trait;
use kube::{
    core::{DynamicObject, ObjectMeta},
    runtime::reflector::ObjectRef,
    Resource, ResourceExt,
};
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, error, info};

use module_operator::{
    client::{self, ObjectKey},
    controller::{ReconcileContext, Reconciler},
    logging::controller::ReconcilerError,
    requeue::{self, ReconcileResult},
    status::{
        condition::LifecycleState, is_up_to_date, read_conditions, read_state, status_value,
    },
    watch::WatchDescriptor,
};

use crate::{
    chart::same_chart_version,
    crd::{
        module::{Module, ModuleStatus},
        module_lifecycle::{ModuleLifecycle, ModuleLifecycleSpec, ReleaseSpec},
    },
    handlers::ModuleAction,
};

pub const CONTROLLER_NAME: &str = "module";
pub const FINALIZER: &str = "module.finalizer.platform.verrazzano.io";

/// The generation of the [`Module`] a lifecycle object was rendered from.
pub const MODULE_GENERATION_ANNOTATION: &str = "platform.verrazzano.io/module-generation";

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to render lifecycle object {name:?}"))]
    RenderLifecycle {
        source: serde_json::Error,
        name: String,
    },

    #[snafu(display("failed to get lifecycle object {key}"))]
    GetLifecycle { source: client::Error, key: ObjectKey },

    #[snafu(display("failed to create lifecycle object {key}"))]
    CreateLifecycle { source: client::Error, key: ObjectKey },

    #[snafu(display("failed to update lifecycle object {key}"))]
    UpdateLifecycle { source: client::Error, key: ObjectKey },

    #[snafu(display("failed to serialize status of module {key}"))]
    SerializeStatus {
        source: serde_json::Error,
        key: ObjectKey,
    },

    #[snafu(display("failed to write status of module {key}"))]
    WriteStatus { source: client::Error, key: ObjectKey },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Self::GetLifecycle { key, .. }
            | Self::CreateLifecycle { key, .. }
            | Self::UpdateLifecycle { key, .. } => Some(
                ObjectRef::<ModuleLifecycle>::new(&key.name)
                    .within(&key.namespace)
                    .erase(),
            ),
            _ => None,
        }
    }
}

/// Picks the lifecycle action that brings the module to its desired version.
pub fn select_action(module: &Module) -> ModuleAction {
    let installed = module.status.as_ref().and_then(|s| s.version.as_deref());
    match (installed, module.spec.version.as_deref()) {
        (None, _) => ModuleAction::Install,
        (Some(installed), Some(desired)) if !same_chart_version(installed, desired) => {
            ModuleAction::Upgrade
        }
        _ => ModuleAction::Update,
    }
}

pub fn lifecycle_name(module: &Module, action: ModuleAction) -> String {
    format!("{}-{action}", module.name_any())
}

/// The lifecycle object driving `action` for the current generation of `module`.
pub fn render_lifecycle(
    module: &Module,
    action: ModuleAction,
    lifecycle_class: &str,
) -> Result<DynamicObject, Error> {
    let name = lifecycle_name(module, action);
    let module_name = module.module_name();
    let generation = module.metadata.generation.unwrap_or_default();

    let mut lifecycle = ModuleLifecycle::new(&name, ModuleLifecycleSpec {
        lifecycle_class: lifecycle_class.to_owned(),
        action: action.to_string(),
        release: ReleaseSpec {
            name: module_name.clone(),
            namespace: module
                .spec
                .target_namespace
                .clone()
                .unwrap_or_else(|| module.namespace().unwrap_or_default()),
            repository_uri: None,
            chart_path: module_name,
            chart_version: module.spec.version.clone(),
            overrides: module.spec.overrides.clone(),
        },
    });
    lifecycle.metadata = ObjectMeta {
        name: Some(name.clone()),
        namespace: module.namespace(),
        annotations: Some(
            [(
                MODULE_GENERATION_ANNOTATION.to_owned(),
                generation.to_string(),
            )]
            .into(),
        ),
        owner_references: module.controller_owner_ref(&()).map(|owner| vec![owner]),
        ..ObjectMeta::default()
    };

    serde_json::to_value(&lifecycle)
        .and_then(serde_json::from_value)
        .context(RenderLifecycleSnafu { name })
}

fn rendered_generation(obj: &DynamicObject) -> Option<&str> {
    obj.annotations()
        .get(MODULE_GENERATION_ANNOTATION)
        .map(String::as_str)
}

/// How far the lifecycle object got with the action it was last given.
enum Progress {
    Pending,
    Finished {
        state: LifecycleState,
        version: Option<String>,
    },
}

fn progress(lifecycle: &DynamicObject) -> Progress {
    let state = read_state(lifecycle);
    match state {
        Some(state @ (LifecycleState::Ready | LifecycleState::Uninstalled | LifecycleState::Failed))
            if is_up_to_date(lifecycle) =>
        {
            Progress::Finished {
                state,
                version: status_value(lifecycle)
                    .and_then(|status| status.get("version"))
                    .and_then(|version| version.as_str())
                    .map(str::to_owned),
            }
        }
        _ => Progress::Pending,
    }
}

fn decode(obj: &DynamicObject) -> Option<Module> {
    match obj.clone().try_parse::<Module>() {
        Ok(module) => Some(module),
        Err(err) => {
            error!(
                error = &err as &dyn std::error::Error,
                object = %obj.name_any(),
                "Failed to decode Module, giving up"
            );
            None
        }
    }
}

pub struct ModuleReconciler {
    lifecycle_class: String,
}

impl ModuleReconciler {
    pub fn new(lifecycle_class: impl Into<String>) -> Self {
        Self {
            lifecycle_class: lifecycle_class.into(),
        }
    }

    /// Makes sure the lifecycle object for `action` reflects the current generation of `module`.
    ///
    /// Returns the lifecycle object once it was rendered for this generation, or `None` if it was
    /// just created or updated.
    async fn ensure_lifecycle(
        &self,
        ctx: &ReconcileContext,
        module: &Module,
        action: ModuleAction,
    ) -> Result<Option<DynamicObject>, Error> {
        let desired = render_lifecycle(module, action, &self.lifecycle_class)?;
        let key = ObjectKey::new(
            module.namespace().unwrap_or_default(),
            lifecycle_name(module, action),
        );
        let ar = ModuleLifecycle::api_resource();

        let Some(mut existing) = ctx
            .store
            .get(&ar, &key)
            .await
            .context(GetLifecycleSnafu { key: key.clone() })?
        else {
            info!(lifecycle = %key, %action, "Creating lifecycle object");
            ctx.store
                .create(&ar, &desired)
                .await
                .context(CreateLifecycleSnafu { key })?;
            return Ok(None);
        };

        if rendered_generation(&existing) == rendered_generation(&desired)
            && existing.data.get("spec") == desired.data.get("spec")
        {
            return Ok(Some(existing));
        }

        info!(lifecycle = %key, %action, "Lifecycle object is stale, updating it");
        existing.data["spec"] = desired.data["spec"].clone();
        existing.annotations_mut().extend(desired.annotations().clone());
        ctx.store
            .replace(&ar, &existing)
            .await
            .context(UpdateLifecycleSnafu { key })?;
        Ok(None)
    }

    /// Writes `status` to the module, if it differs from what is recorded.
    async fn write_status(
        &self,
        ctx: &ReconcileContext,
        mut obj: DynamicObject,
        current: Option<&ModuleStatus>,
        status: ModuleStatus,
    ) -> Result<(), Error> {
        if current == Some(&status) {
            return Ok(());
        }
        obj.data["status"] = serde_json::to_value(&status).context(SerializeStatusSnafu {
            key: ctx.key.clone(),
        })?;
        ctx.store
            .replace_status(&ctx.api_resource, &obj)
            .await
            .context(WriteStatusSnafu {
                key: ctx.key.clone(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for ModuleReconciler {
    type Error = Error;

    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn finalizer(&self) -> Option<&str> {
        Some(FINALIZER)
    }

    fn watch_descriptors(&self, obj: &DynamicObject) -> Vec<WatchDescriptor> {
        let prefix = format!("{}-", obj.name_any());
        vec![WatchDescriptor::new(
            ModuleLifecycle::api_resource(),
            obj.namespace(),
            move |lifecycle, _event| lifecycle.name_any().starts_with(&prefix),
        )]
    }

    async fn reconcile(
        &self,
        ctx: &ReconcileContext,
        obj: DynamicObject,
    ) -> Result<ReconcileResult, Error> {
        let Some(module) = decode(&obj) else {
            return Ok(ReconcileResult::done());
        };
        if is_up_to_date(&obj) {
            debug!("Generation already reconciled");
            return Ok(ReconcileResult::done());
        }

        let action = select_action(&module);
        let Some(lifecycle) = self.ensure_lifecycle(ctx, &module, action).await? else {
            return Ok(requeue::short_delay());
        };

        let current = module.status.clone().unwrap_or_default();
        let mut status = ModuleStatus {
            state: read_state(&lifecycle).or(current.state),
            conditions: read_conditions(&lifecycle),
            ..current.clone()
        };
        let result = match progress(&lifecycle) {
            Progress::Finished {
                state: LifecycleState::Ready,
                version,
            } => {
                info!(%action, ?version, "Module action finished");
                status.version = version.or(module.spec.version.clone());
                status.observed_generation = module.metadata.generation;
                ReconcileResult::done()
            }
            Progress::Finished { state, .. } => {
                info!(%action, %state, "Module action did not reach Ready");
                ReconcileResult::done()
            }
            Progress::Pending => requeue::short_delay(),
        };

        self.write_status(ctx, obj, module.status.as_ref(), status)
            .await?;
        Ok(result)
    }

    /// Uninstalls the module and waits for the uninstall to finish.
    async fn cleanup(
        &self,
        ctx: &ReconcileContext,
        obj: DynamicObject,
    ) -> Result<ReconcileResult, Error> {
        let Some(module) = decode(&obj) else {
            return Ok(ReconcileResult::done());
        };

        let Some(lifecycle) = self
            .ensure_lifecycle(ctx, &module, ModuleAction::Uninstall)
            .await?
        else {
            return Ok(requeue::short_delay());
        };

        match progress(&lifecycle) {
            Progress::Finished {
                state: LifecycleState::Uninstalled,
                ..
            } => {
                info!("Module uninstalled");
                Ok(ReconcileResult::done())
            }
            _ => Ok(requeue::short_delay()),
        }
    }
}
