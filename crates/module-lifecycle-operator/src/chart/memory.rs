//! In-memory [`ChartClient`] for reconcile tests.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;

use module_operator::utils::signal::ShutdownToken;

use super::{ChartClient, Error, Release, ReleaseOptions, ReleaseStatus, Result};

#[derive(Debug, Default)]
struct Inner {
    releases: BTreeMap<(String, String), Release>,
    upgrades: Vec<ReleaseOptions>,
    uninstalls: usize,
    failing_upgrades: usize,
    version_prefix: String,
}

#[derive(Debug, Default)]
pub struct MemoryChartClient {
    inner: Mutex<Inner>,
}

impl MemoryChartClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a deployed release.
    pub fn with_release(self, name: &str, namespace: &str, version: &str) -> Self {
        self.lock().releases.insert(
            (namespace.to_owned(), name.to_owned()),
            Release {
                name: name.to_owned(),
                namespace: namespace.to_owned(),
                chart_version: version.to_owned(),
                status: ReleaseStatus::Deployed,
                revision: 1,
                values: serde_json::json!({}),
            },
        );
        self
    }

    /// Reports deployed chart versions with `prefix`, as helm does for charts versioned `v1.2.3`.
    pub fn with_version_prefix(self, prefix: &str) -> Self {
        self.lock().version_prefix = prefix.to_owned();
        self
    }

    /// Makes the next `count` upgrades fail.
    pub fn fail_upgrades(&self, count: usize) {
        self.lock().failing_upgrades = count;
    }

    /// Every successful upgrade, in order.
    pub fn upgrades(&self) -> Vec<ReleaseOptions> {
        self.lock().upgrades.clone()
    }

    pub fn uninstalls(&self) -> usize {
        self.lock().uninstalls
    }

    pub fn get(&self, name: &str, namespace: &str) -> Option<Release> {
        self.lock()
            .releases
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ChartClient for MemoryChartClient {
    async fn upgrade(
        &self,
        options: &ReleaseOptions,
        _shutdown: &ShutdownToken,
    ) -> Result<Release> {
        let mut inner = self.lock();
        if inner.failing_upgrades > 0 {
            inner.failing_upgrades -= 1;
            return Err(Error::HelmFailed {
                command: format!("helm upgrade --install {}", options.name),
                status: "exit status: 1".to_owned(),
                stderr: "context deadline exceeded".to_owned(),
            });
        }

        let key = (options.namespace.clone(), options.name.clone());
        let revision = inner
            .releases
            .get(&key)
            .map_or(1, |release| release.revision + 1);
        let release = Release {
            name: options.name.clone(),
            namespace: options.namespace.clone(),
            chart_version: format!("{}{}", inner.version_prefix, options.version),
            status: ReleaseStatus::Deployed,
            revision,
            values: options.values.clone(),
        };
        inner.releases.insert(key, release.clone());
        inner.upgrades.push(options.clone());
        Ok(release)
    }

    async fn uninstall(
        &self,
        name: &str,
        namespace: &str,
        _shutdown: &ShutdownToken,
    ) -> Result<()> {
        let mut inner = self.lock();
        if inner
            .releases
            .remove(&(namespace.to_owned(), name.to_owned()))
            .is_some()
        {
            inner.uninstalls += 1;
        }
        Ok(())
    }

    async fn release(&self, name: &str, namespace: &str) -> Result<Option<Release>> {
        Ok(self.get(name, namespace))
    }
}
