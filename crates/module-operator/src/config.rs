//! Process wide operator configuration.
//!
//! The binary installs the parsed command line with [`set`] at start up; everything else reads it
//! with [`get`]. Reading before anything was installed yields the defaults.

use std::{
    path::PathBuf,
    sync::{LazyLock, PoisonError, RwLock},
};

use crate::{
    cli::{OperatorEnvironmentOptions, RunArguments},
    namespace::WatchNamespace,
};

pub const DEFAULT_LIFECYCLE_CLASS: &str = "helm";
pub const DEFAULT_METRICS_BIND_ADDRESS: &str = ":8080";

static CONFIG: LazyLock<RwLock<Option<OperatorConfig>>> = LazyLock::new(|| RwLock::new(None));

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    pub metrics_bind_address: String,
    pub leader_elect: bool,
    pub watch_namespace: WatchNamespace,
    pub lifecycle_class: String,
    pub leader_election_namespace: String,
    pub root_dir: PathBuf,
    pub chart_dir: PathBuf,
    pub cert_dir: PathBuf,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        let environment = OperatorEnvironmentOptions::default();
        Self {
            metrics_bind_address: DEFAULT_METRICS_BIND_ADDRESS.to_owned(),
            leader_elect: false,
            watch_namespace: WatchNamespace::All,
            lifecycle_class: DEFAULT_LIFECYCLE_CLASS.to_owned(),
            chart_dir: environment.chart_dir(),
            leader_election_namespace: environment.leader_election_namespace,
            root_dir: environment.root_dir,
            cert_dir: environment.cert_dir,
        }
    }
}

impl From<RunArguments> for OperatorConfig {
    fn from(args: RunArguments) -> Self {
        let environment = args.operator_environment;
        Self {
            metrics_bind_address: args.metrics_bind_address,
            leader_elect: args.leader_elect,
            watch_namespace: args.watch_namespace,
            lifecycle_class: args.lifecycle_class,
            chart_dir: environment.chart_dir(),
            leader_election_namespace: environment.leader_election_namespace,
            root_dir: environment.root_dir,
            cert_dir: environment.cert_dir,
        }
    }
}

/// Returns the installed configuration, installing the defaults first if there is none.
pub fn get() -> OperatorConfig {
    if let Some(config) = CONFIG
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
    {
        return config.clone();
    }

    CONFIG
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .get_or_insert_with(OperatorConfig::default)
        .clone()
}

pub fn set(config: OperatorConfig) {
    *CONFIG.write().unwrap_or_else(PoisonError::into_inner) = Some(config);
}

/// Drops the installed configuration. The next [`get`] sees the defaults again.
pub fn reset() {
    *CONFIG.write().unwrap_or_else(PoisonError::into_inner) = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Kept in one test, the singleton is shared by all tests of this crate.
    #[test]
    fn lifecycle_of_the_singleton() {
        reset();
        let defaults = get();
        assert_eq!(defaults, OperatorConfig::default());
        assert_eq!(defaults.lifecycle_class, "helm");
        assert_eq!(
            defaults.chart_dir,
            PathBuf::from("/home/verrazzano/platform-operator/helm_config/charts")
        );
        assert_eq!(defaults.cert_dir, PathBuf::from("/etc/webhook/certs"));
        assert_eq!(defaults.metrics_bind_address, ":8080");
        assert_eq!(defaults.leader_election_namespace, "default");

        set(OperatorConfig {
            lifecycle_class: "calico".to_owned(),
            leader_elect: true,
            ..OperatorConfig::default()
        });
        assert_eq!(get().lifecycle_class, "calico");
        assert!(get().leader_elect);

        reset();
        assert_eq!(get().lifecycle_class, "helm");
    }
}
