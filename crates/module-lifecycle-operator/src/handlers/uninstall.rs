use std::sync::Arc;

use async_trait::async_trait;

use module_operator::{
    handler::{ActionHandler, Check, HandlerContext, StatusConditions},
    requeue::ReconcileResult,
    status::condition::ConditionType,
};

use super::{base::ReleaseHandler, Error, HandlerConfig};
use crate::chart::ChartClient;

const NAME: &str = "uninstall";

/// Removes the release, whatever status it is in.
pub struct UninstallHandler {
    release: ReleaseHandler,
}

impl UninstallHandler {
    pub fn new(charts: Arc<dyn ChartClient>) -> Self {
        Self {
            release: ReleaseHandler::new(NAME, charts),
        }
    }
}

#[async_trait]
impl ActionHandler for UninstallHandler {
    type Config = HandlerConfig;
    type Error = Error;

    fn name(&self) -> &'static str {
        NAME
    }

    fn status_conditions(&self) -> StatusConditions {
        StatusConditions {
            not_needed: ConditionType::AlreadyUninstalled,
            pre_action: ConditionType::PreUninstall,
            do_action: ConditionType::UninstallStarted,
            completed: ConditionType::UninstallComplete,
        }
    }

    async fn init(
        &mut self,
        _ctx: &HandlerContext,
        config: HandlerConfig,
    ) -> Result<ReconcileResult, Error> {
        self.release.init(&config);
        Ok(ReconcileResult::done())
    }

    async fn is_action_needed(&self, _ctx: &HandlerContext) -> Result<Check, Error> {
        Ok(Check::from_bool(self.release.current().await?.is_some()))
    }

    async fn do_action(&self, ctx: &HandlerContext) -> Result<ReconcileResult, Error> {
        self.release.uninstall(ctx).await
    }

    async fn is_action_done(&self, _ctx: &HandlerContext) -> Result<Check, Error> {
        Ok(Check::from_bool(self.release.current().await?.is_none()))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use module_operator::{tracker::TrackerKey, utils::signal::ShutdownToken};

    use super::*;
    use crate::{
        chart::{memory::MemoryChartClient, ChartInfo},
        crd::module_lifecycle::ReleaseSpec,
    };

    fn config() -> HandlerConfig {
        HandlerConfig {
            chart: ChartInfo {
                name: "c".to_owned(),
                version: "1.0.0".to_owned(),
                app_version: None,
            },
            chart_dir: PathBuf::from("/charts"),
            release: ReleaseSpec {
                name: "r".to_owned(),
                namespace: "n".to_owned(),
                chart_path: "/c".to_owned(),
                ..ReleaseSpec::default()
            },
        }
    }

    fn ctx() -> HandlerContext {
        HandlerContext::new(TrackerKey::new("ns", "mlc", "uid"), 1, ShutdownToken::never())
    }

    #[tokio::test]
    async fn uninstall_is_idempotent() {
        let charts = Arc::new(MemoryChartClient::new().with_release("r", "n", "1.0.0"));
        let mut handler = UninstallHandler::new(charts.clone());
        handler.init(&ctx(), config()).await.unwrap();
        assert_eq!(handler.is_action_needed(&ctx()).await.unwrap(), Check::yes());

        handler.do_action(&ctx()).await.unwrap();
        handler.do_action(&ctx()).await.unwrap();

        assert_eq!(charts.uninstalls(), 1);
        assert!(charts.get("r", "n").is_none());
        assert_eq!(handler.is_action_done(&ctx()).await.unwrap(), Check::yes());
        assert_eq!(handler.is_action_needed(&ctx()).await.unwrap(), Check::no());
    }
}
