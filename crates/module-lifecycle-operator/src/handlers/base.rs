//! Release bookkeeping shared by all handlers.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use serde_json::{Map, Value};
use snafu::{OptionExt, ResultExt};
use tracing::debug;

use module_operator::{
    handler::HandlerContext,
    requeue::{self, ReconcileResult},
};

use super::{
    DeployReleaseSnafu, Error, HandlerConfig, NotInitializedSnafu, QueryReleaseSnafu,
    UninstallReleaseSnafu,
};
use crate::{
    chart::{same_chart_version, ChartClient, Release, ReleaseOptions},
    crd::{module_lifecycle::ReleaseSpec, Overrides},
};

/// Resolves the chart of `release`. Remote chart references and absolute paths are kept as is.
pub fn resolve_chart_path(release: &ReleaseSpec, chart_dir: &Path) -> PathBuf {
    let chart = Path::new(&release.chart_path);
    if release.repository_uri.is_some() || chart.is_absolute() {
        chart.to_path_buf()
    } else {
        chart_dir.join(chart)
    }
}

/// Deep merges the values of all `overrides`, later entries winning.
pub fn merge_overrides(overrides: &[Overrides]) -> Value {
    let mut merged = Value::Object(Map::new());
    for values in overrides.iter().filter_map(|o| o.values.as_ref()) {
        merge(&mut merged, values);
    }
    merged
}

fn merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

pub fn release_options(config: &HandlerConfig) -> ReleaseOptions {
    ReleaseOptions {
        name: config.release.name.clone(),
        namespace: config.release.namespace.clone(),
        chart: resolve_chart_path(&config.release, &config.chart_dir)
            .to_string_lossy()
            .into_owned(),
        repository_uri: config.release.repository_uri.clone(),
        version: config.chart.version.clone(),
        values: merge_overrides(&config.release.overrides),
    }
}

/// The release targeted by a handler, stashed at init.
pub(super) struct ReleaseHandler {
    action: &'static str,
    charts: Arc<dyn ChartClient>,
    target: Option<ReleaseOptions>,
}

impl ReleaseHandler {
    pub fn new(action: &'static str, charts: Arc<dyn ChartClient>) -> Self {
        Self {
            action,
            charts,
            target: None,
        }
    }

    pub fn init(&mut self, config: &HandlerConfig) {
        self.target = Some(release_options(config));
    }

    pub fn target(&self) -> Result<&ReleaseOptions, Error> {
        self.target.as_ref().context(NotInitializedSnafu {
            action: self.action,
        })
    }

    pub async fn current(&self) -> Result<Option<Release>, Error> {
        let target = self.target()?;
        self.charts
            .release(&target.name, &target.namespace)
            .await
            .context(QueryReleaseSnafu {
                release: &target.name,
            })
    }

    /// Whether the release is deployed at the target chart version.
    pub async fn is_deployed_at_version(&self) -> Result<bool, Error> {
        let target = self.target()?;
        let query = QueryReleaseSnafu {
            release: &target.name,
        };
        if !self
            .charts
            .is_deployed(&target.name, &target.namespace)
            .await
            .context(query)?
        {
            return Ok(false);
        }
        let deployed = self
            .charts
            .chart_version_of(&target.name, &target.namespace)
            .await
            .context(query)?;
        Ok(deployed.is_some_and(|version| same_chart_version(&version, &target.version)))
    }

    /// Whether the release is deployed at the target chart version with the target values.
    pub async fn is_deployed_as_desired(&self) -> Result<bool, Error> {
        let target = self.target()?;
        Ok(self.current().await?.is_some_and(|release| {
            release.is_deployed()
                && same_chart_version(&release.chart_version, &target.version)
                && release.values == target.values
        }))
    }

    pub async fn deploy(&self, ctx: &HandlerContext) -> Result<ReconcileResult, Error> {
        if ctx.is_cancelled() {
            return Ok(requeue::short_delay());
        }

        let target = self.target()?;
        let release = self
            .charts
            .upgrade(target, &ctx.shutdown)
            .await
            .context(DeployReleaseSnafu {
                release: &target.name,
            })?;
        debug!(
            release = %release.name,
            revision = release.revision,
            status = %release.status,
            "Release deployed"
        );
        Ok(ReconcileResult::done())
    }

    pub async fn uninstall(&self, ctx: &HandlerContext) -> Result<ReconcileResult, Error> {
        if ctx.is_cancelled() {
            return Ok(requeue::short_delay());
        }

        let target = self.target()?;
        self.charts
            .uninstall(&target.name, &target.namespace, &ctx.shutdown)
            .await
            .context(UninstallReleaseSnafu {
                release: &target.name,
            })?;
        Ok(ReconcileResult::done())
    }
}
