//! Reconciles [`ModuleLifecycle`] objects: one lifecycle action of one chart release.

use std::{path::PathBuf, str::FromStr, sync::Arc};

use async_trait::async_trait;
use kube::{core::DynamicObject, runtime::reflector::ObjectRef, ResourceExt};
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, error, info, warn};

use module_operator::{
    controller::{ReconcileContext, Reconciler},
    logging::controller::ReconcilerError,
    requeue::ReconcileResult,
    state_machine::StateMachine,
    status::{
        condition::{ConditionStatus, ConditionType},
        is_up_to_date,
        writer::{self, StatusUpdate, StatusWriter},
    },
    tracker::TrackerScope,
};

use crate::{
    chart::{self, same_chart_version, ChartClient, ChartInfo},
    crd::module_lifecycle::{ModuleLifecycle, ReleaseSpec},
    handlers::{resolve_chart_path, HandlerConfig, LifecycleAction, ModuleAction},
};

#[cfg(test)]
mod tests;

pub const CONTROLLER_NAME: &str = "modulelifecycle";
pub const FINALIZER: &str = "modulelifecycle.finalizer.platform.verrazzano.io";

const VERSION_KEY: &str = "version";

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to load chart info of release {release:?}"))]
    LoadChartInfo {
        source: chart::Error,
        release: String,
    },

    #[snafu(display("failed to record the outcome of {mlc}"))]
    WriteStatus {
        source: writer::Error,
        mlc: ObjectRef<ModuleLifecycle>,
    },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

pub struct ModuleLifecycleReconciler {
    charts: Arc<dyn ChartClient>,
    lifecycle_class: String,
    chart_dir: PathBuf,
}

impl ModuleLifecycleReconciler {
    pub fn new(
        charts: Arc<dyn ChartClient>,
        lifecycle_class: impl Into<String>,
        chart_dir: PathBuf,
    ) -> Self {
        Self {
            charts,
            lifecycle_class: lifecycle_class.into(),
            chart_dir,
        }
    }

    /// The chart version to deploy.
    ///
    /// Remote charts must pin it. A local chart directory deploys the version in its `Chart.yaml`
    /// whatever is pinned, so that version wins when the chart can be read.
    pub fn chart_info(&self, release: &ReleaseSpec) -> Result<ChartInfo, chart::Error> {
        let pinned = release.chart_version.as_ref().map(|version| ChartInfo {
            name: release.chart_path.clone(),
            version: version.clone(),
            app_version: None,
        });
        if release.repository_uri.is_some() {
            return pinned.ok_or_else(|| chart::Error::MissingChartVersion {
                chart: release.chart_path.clone(),
            });
        }

        match (ChartInfo::load(&resolve_chart_path(release, &self.chart_dir)), pinned) {
            (Ok(chart), Some(pinned)) => {
                if !same_chart_version(&chart.version, &pinned.version) {
                    warn!(
                        chart = %release.chart_path,
                        pinned = %pinned.version,
                        bundled = %chart.version,
                        "Pinned chart version differs from the local chart, deploying the local one"
                    );
                }
                Ok(chart)
            }
            (Ok(chart), None) => Ok(chart),
            (Err(_), Some(pinned)) => Ok(pinned),
            (Err(err), None) => Err(err),
        }
    }

    fn handler_config(&self, release: &ReleaseSpec) -> Result<HandlerConfig, Error> {
        let chart = self.chart_info(release).context(LoadChartInfoSnafu {
            release: &release.name,
        })?;
        Ok(HandlerConfig {
            chart,
            chart_dir: self.chart_dir.clone(),
            release: release.clone(),
        })
    }

    /// Drives `action` through the state machine. Finishing a deploying action also records the
    /// chart version, in the same status write as the final condition.
    async fn run_action(
        &self,
        ctx: &ReconcileContext,
        obj: DynamicObject,
        action: ModuleAction,
        scope: TrackerScope,
        config: HandlerConfig,
    ) -> ReconcileResult {
        let handler_ctx = ctx.handler_context(&obj, scope);
        let mut status = ctx.status_writer(obj);
        if action != ModuleAction::Uninstall {
            status = status.with_finish_field(VERSION_KEY, config.chart.version.clone());
        }
        let mut handler = LifecycleAction::new(action, self.charts.clone());

        StateMachine::new(&mut handler, &handler_ctx, &status, &ctx.trackers)
            .execute(config)
            .await
    }
}

/// Decodes the typed view of `obj`. Objects that do not decode are never retried.
fn decode(obj: &DynamicObject) -> Option<ModuleLifecycle> {
    match obj.clone().try_parse::<ModuleLifecycle>() {
        Ok(mlc) => Some(mlc),
        Err(err) => {
            error!(
                error = &err as &dyn std::error::Error,
                object = %obj.name_any(),
                "Failed to decode ModuleLifecycle, giving up"
            );
            None
        }
    }
}

fn object_ref(mlc: &ModuleLifecycle) -> ObjectRef<ModuleLifecycle> {
    ObjectRef::from_obj(mlc)
}

#[async_trait]
impl Reconciler for ModuleLifecycleReconciler {
    type Error = Error;

    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn should_reconcile(&self, obj: &DynamicObject) -> bool {
        obj.data
            .get("spec")
            .and_then(|spec| spec.get("lifecycleClass"))
            .and_then(Value::as_str)
            == Some(self.lifecycle_class.as_str())
    }

    fn finalizer(&self) -> Option<&str> {
        Some(FINALIZER)
    }

    async fn reconcile(
        &self,
        ctx: &ReconcileContext,
        obj: DynamicObject,
    ) -> Result<ReconcileResult, Error> {
        let Some(mlc) = decode(&obj) else {
            return Ok(ReconcileResult::done());
        };
        if is_up_to_date(&obj) {
            debug!("Generation already reconciled");
            return Ok(ReconcileResult::done());
        }

        let Ok(action) = ModuleAction::from_str(&mlc.spec.action) else {
            info!(action = %mlc.spec.action, "Unknown action requested");
            let status = ctx.status_writer(obj);
            status
                .write(
                    StatusUpdate::finished(ConditionType::UnknownAction)
                        .with_status(ConditionStatus::False)
                        .with_message(format!("unknown action {:?}", mlc.spec.action)),
                )
                .await
                .context(WriteStatusSnafu {
                    mlc: object_ref(&mlc),
                })?;
            return Ok(ReconcileResult::done());
        };

        let config = self.handler_config(&mlc.spec.release)?;
        Ok(self
            .run_action(ctx, obj, action, TrackerScope::Reconcile, config)
            .await)
    }

    /// Uninstalls the release before the object goes away.
    async fn cleanup(
        &self,
        ctx: &ReconcileContext,
        obj: DynamicObject,
    ) -> Result<ReconcileResult, Error> {
        let Some(mlc) = decode(&obj) else {
            return Ok(ReconcileResult::done());
        };

        info!("Uninstalling release of deleted ModuleLifecycle");
        let release = mlc.spec.release;
        // Uninstalling works without chart metadata
        let chart = self.chart_info(&release).unwrap_or_else(|err| {
            debug!(
                error = &err as &dyn std::error::Error,
                "Chart info unavailable, uninstalling without it"
            );
            ChartInfo {
                name: release.chart_path.clone(),
                version: String::new(),
                app_version: None,
            }
        });
        let config = HandlerConfig {
            chart,
            chart_dir: self.chart_dir.clone(),
            release,
        };
        Ok(self
            .run_action(ctx, obj, ModuleAction::Uninstall, TrackerScope::Cleanup, config)
            .await)
    }
}
