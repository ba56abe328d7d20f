//! The seam to the chart subsystem that materializes releases.
//!
//! [`HelmCli`](helm::HelmCli) talks to a real cluster through the `helm` binary. Everything above
//! this module only sees [`ChartClient`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use semver::Version;
use serde::Deserialize;
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use strum::{Display, EnumString};

use module_operator::utils::signal::ShutdownToken;

pub mod helm;
#[cfg(test)]
pub mod memory;

pub const CHART_FILE: &str = "Chart.yaml";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read chart file {path:?}"))]
    ReadChartFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse chart file {path:?}"))]
    ParseChartFile {
        source: serde_yaml::Error,
        path: PathBuf,
    },

    #[snafu(display("remote chart {chart:?} must pin a chart version"))]
    MissingChartVersion { chart: String },

    #[snafu(display("failed to write values file"))]
    WriteValues { source: std::io::Error },

    #[snafu(display("failed to serialize values"))]
    SerializeValues { source: serde_yaml::Error },

    #[snafu(display("failed to run {command:?}"))]
    RunHelm {
        source: std::io::Error,
        command: String,
    },

    #[snafu(display("{command:?} exited with {status}: {stderr}"))]
    HelmFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[snafu(display("failed to parse output of {command:?}"))]
    ParseHelmOutput {
        source: serde_json::Error,
        command: String,
    },

    #[snafu(display("{command:?} was cancelled"))]
    Cancelled { command: String },

    #[snafu(display(
        "release {name:?} in namespace {namespace:?} was not found after deploying it"
    ))]
    ReleaseMissing { name: String, namespace: String },
}

/// The parts of `Chart.yaml` the operator needs.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChartInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub app_version: Option<String>,
}

impl ChartInfo {
    /// Reads `Chart.yaml` from the chart directory `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CHART_FILE);
        let contents = std::fs::read_to_string(&path).context(ReadChartFileSnafu { path: &path })?;
        serde_yaml::from_str(&contents).context(ParseChartFileSnafu { path })
    }
}

/// Everything needed to install or upgrade a release.
#[derive(Clone, Debug, PartialEq)]
pub struct ReleaseOptions {
    pub name: String,
    pub namespace: String,
    /// A chart directory, or the chart name within [`ReleaseOptions::repository_uri`].
    pub chart: String,
    pub repository_uri: Option<String>,
    pub version: String,
    pub values: Value,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, EnumString, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ReleaseStatus {
    Deployed,
    Uninstalled,
    Superseded,
    Failed,
    Uninstalling,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    pub chart_version: String,
    pub status: ReleaseStatus,
    pub revision: i64,
    /// User supplied values, without chart defaults.
    pub values: Value,
}

impl Release {
    pub fn is_deployed(&self) -> bool {
        self.status == ReleaseStatus::Deployed
    }
}

/// Whether two chart versions name the same chart release.
///
/// A leading `v` is ignored, and semantic versions are compared by value.
pub fn same_chart_version(left: &str, right: &str) -> bool {
    let left = left.strip_prefix('v').unwrap_or(left);
    let right = right.strip_prefix('v').unwrap_or(right);
    match (Version::parse(left), Version::parse(right)) {
        (Ok(left), Ok(right)) => left == right,
        _ => left == right,
    }
}

#[async_trait]
pub trait ChartClient: Send + Sync {
    /// Installs the release, or upgrades it if it already exists.
    async fn upgrade(&self, options: &ReleaseOptions, shutdown: &ShutdownToken) -> Result<Release>;

    /// Removes the release. Removing a missing release succeeds.
    async fn uninstall(&self, name: &str, namespace: &str, shutdown: &ShutdownToken) -> Result<()>;

    /// The current state of the release, in any status.
    async fn release(&self, name: &str, namespace: &str) -> Result<Option<Release>>;

    async fn is_deployed(&self, name: &str, namespace: &str) -> Result<bool> {
        Ok(self
            .release(name, namespace)
            .await?
            .is_some_and(|release| release.is_deployed()))
    }

    async fn chart_version_of(&self, name: &str, namespace: &str) -> Result<Option<String>> {
        Ok(self
            .release(name, namespace)
            .await?
            .map(|release| release.chart_version))
    }
}
