use std::path::PathBuf;

pub const DEFAULT_ROOT_DIR: &str = "/home/verrazzano";
pub const DEFAULT_CERT_DIR: &str = "/etc/webhook/certs";

/// Location of the bundled charts below the root directory.
const CHART_SUBDIR: &str = "platform-operator/helm_config/charts";

#[derive(Debug, PartialEq, Eq, clap::Parser)]
#[command(next_help_heading = "Environment Options")]
pub struct OperatorEnvironmentOptions {
    /// The namespace the leader election lease lives in.
    #[arg(long, env, default_value = "default")]
    pub leader_election_namespace: String,

    /// The installation root, containing the bundled charts.
    #[arg(long, env = "VZ_ROOT_DIR", default_value = DEFAULT_ROOT_DIR)]
    pub root_dir: PathBuf,

    /// Directory relative chart paths are resolved against.
    ///
    /// Defaults to `<root-dir>/platform-operator/helm_config/charts`.
    #[arg(long, env = "VZ_CHART_DIR")]
    pub chart_dir: Option<PathBuf>,

    /// Directory holding the webhook serving certificates.
    #[arg(long, env, default_value = DEFAULT_CERT_DIR)]
    pub cert_dir: PathBuf,
}

impl Default for OperatorEnvironmentOptions {
    fn default() -> Self {
        Self {
            leader_election_namespace: "default".to_owned(),
            root_dir: PathBuf::from(DEFAULT_ROOT_DIR),
            chart_dir: None,
            cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
        }
    }
}

impl OperatorEnvironmentOptions {
    pub fn chart_dir(&self) -> PathBuf {
        self.chart_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join(CHART_SUBDIR))
    }
}
