//! [`ChartClient`] backed by the `helm` command line.

use std::{ffi::OsString, io::Write as _, path::PathBuf, process::Stdio};

use async_trait::async_trait;
use semver::Version;
use serde::Deserialize;
use serde_json::Value;
use snafu::{OptionExt, ResultExt};
use tokio::process::Command;
use tracing::{debug, info};

use module_operator::utils::signal::ShutdownToken;

use super::{
    CancelledSnafu, ChartClient, HelmFailedSnafu, ParseHelmOutputSnafu, Release,
    ReleaseMissingSnafu, ReleaseOptions, ReleaseStatus, Result, RunHelmSnafu,
    SerializeValuesSnafu, WriteValuesSnafu,
};

const DEFAULT_BINARY: &str = "helm";

/// One entry of `helm list -o json`.
#[derive(Debug, Deserialize)]
struct ListEntry {
    name: String,
    namespace: String,
    #[serde(default)]
    revision: String,
    #[serde(default)]
    status: ReleaseStatus,
    /// `<chart name>-<chart version>`
    chart: String,
}

pub struct HelmCli {
    binary: PathBuf,
}

impl Default for HelmCli {
    fn default() -> Self {
        Self::new(DEFAULT_BINARY)
    }
}

impl HelmCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Runs helm to completion and returns its stdout.
    ///
    /// The child is killed when `shutdown` fires first.
    async fn run(&self, args: Vec<OsString>, shutdown: &ShutdownToken) -> Result<Vec<u8>> {
        let command = render_command(&args);
        debug!(%command, "Running helm");

        let mut child = Command::new(&self.binary);
        child.args(&args).stdin(Stdio::null()).kill_on_drop(true);
        let output = tokio::select! {
            output = child.output() => output.context(RunHelmSnafu { command: &command })?,
            () = shutdown.cancelled() => return CancelledSnafu { command }.fail(),
        };

        if !output.status.success() {
            return HelmFailedSnafu {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            }
            .fail();
        }
        Ok(output.stdout)
    }

    async fn values(&self, name: &str, namespace: &str) -> Result<Value> {
        let args = to_args(["get", "values", name, "--namespace", namespace, "--output", "json"]);
        let command = render_command(&args);
        let stdout = self.run(args, &ShutdownToken::never()).await?;
        let values: Value =
            serde_json::from_slice(&stdout).context(ParseHelmOutputSnafu { command })?;
        // Releases without user values report `null`
        Ok(if values.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            values
        })
    }
}

#[async_trait]
impl ChartClient for HelmCli {
    async fn upgrade(&self, options: &ReleaseOptions, shutdown: &ShutdownToken) -> Result<Release> {
        let values = serde_yaml::to_string(&options.values).context(SerializeValuesSnafu)?;
        let mut values_file = tempfile::Builder::new()
            .prefix("values-")
            .suffix(".yaml")
            .tempfile()
            .context(WriteValuesSnafu)?;
        values_file
            .write_all(values.as_bytes())
            .context(WriteValuesSnafu)?;

        let mut args = to_args([
            "upgrade",
            "--install",
            &options.name,
            &options.chart,
            "--namespace",
            &options.namespace,
            "--create-namespace",
            "--version",
            &options.version,
        ]);
        args.push("--values".into());
        args.push(values_file.path().into());
        if let Some(repository) = &options.repository_uri {
            args.push("--repo".into());
            args.push(repository.into());
        }

        info!(
            release = %options.name,
            namespace = %options.namespace,
            version = %options.version,
            "Deploying release"
        );
        self.run(args, shutdown).await?;

        self.release(&options.name, &options.namespace)
            .await?
            .context(ReleaseMissingSnafu {
                name: &options.name,
                namespace: &options.namespace,
            })
    }

    async fn uninstall(&self, name: &str, namespace: &str, shutdown: &ShutdownToken) -> Result<()> {
        if self.release(name, namespace).await?.is_none() {
            return Ok(());
        }

        info!(release = name, namespace, "Uninstalling release");
        let args = to_args(["uninstall", name, "--namespace", namespace, "--wait"]);
        self.run(args, shutdown).await.map(|_| ())
    }

    async fn release(&self, name: &str, namespace: &str) -> Result<Option<Release>> {
        let filter = format!("^{name}$");
        let args = to_args([
            "list",
            "--namespace",
            namespace,
            "--filter",
            &filter,
            "--all",
            "--output",
            "json",
        ]);
        let command = render_command(&args);
        let stdout = self.run(args, &ShutdownToken::never()).await?;
        let entries: Vec<ListEntry> =
            serde_json::from_slice(&stdout).context(ParseHelmOutputSnafu { command })?;

        let Some(entry) = entries
            .into_iter()
            .find(|entry| entry.name == name && entry.namespace == namespace)
        else {
            return Ok(None);
        };

        let values = self.values(name, namespace).await?;
        Ok(Some(Release {
            chart_version: chart_version(&entry.chart).unwrap_or_default(),
            revision: entry.revision.parse().unwrap_or_default(),
            name: entry.name,
            namespace: entry.namespace,
            status: entry.status,
            values,
        }))
    }
}

fn to_args<const N: usize>(args: [&str; N]) -> Vec<OsString> {
    args.into_iter().map(OsString::from).collect()
}

fn render_command(args: &[OsString]) -> String {
    let mut command = DEFAULT_BINARY.to_owned();
    for arg in args {
        command.push(' ');
        command.push_str(&arg.to_string_lossy());
    }
    command
}

/// Splits the chart version off a `<chart name>-<chart version>` pair as printed by `helm list`.
///
/// Both chart names and versions may contain dashes, so the version is the first suffix that is a
/// valid semantic version, optionally prefixed with `v`.
fn chart_version(chart: &str) -> Option<String> {
    chart
        .match_indices('-')
        .map(|(index, _)| &chart[index + 1..])
        .find(|candidate| Version::parse(candidate.strip_prefix('v').unwrap_or(candidate)).is_ok())
        .map(str::to_owned)
}
