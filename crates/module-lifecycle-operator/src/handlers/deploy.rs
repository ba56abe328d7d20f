use std::sync::Arc;

use async_trait::async_trait;

use module_operator::{
    handler::{ActionHandler, Check, HandlerContext, StatusConditions},
    requeue::ReconcileResult,
    status::condition::ConditionType,
};

use super::{base::ReleaseHandler, Error, HandlerConfig, ModuleAction};
use crate::chart::ChartClient;

/// Brings the release to the desired chart version with `helm upgrade --install`.
///
/// Install and upgrade differ only in the conditions they record: both are not needed once the
/// release is deployed at the desired version.
pub struct DeployHandler {
    action: ModuleAction,
    conditions: StatusConditions,
    release: ReleaseHandler,
}

impl DeployHandler {
    pub fn install(charts: Arc<dyn ChartClient>) -> Self {
        Self::new(ModuleAction::Install, charts, StatusConditions {
            not_needed: ConditionType::AlreadyInstalled,
            pre_action: ConditionType::PreInstall,
            do_action: ConditionType::InstallStarted,
            completed: ConditionType::InstallComplete,
        })
    }

    pub fn upgrade(charts: Arc<dyn ChartClient>) -> Self {
        Self::new(ModuleAction::Upgrade, charts, StatusConditions {
            not_needed: ConditionType::AlreadyUpgraded,
            pre_action: ConditionType::PreUpgrade,
            do_action: ConditionType::UpgradeStarted,
            completed: ConditionType::UpgradeComplete,
        })
    }

    fn new(
        action: ModuleAction,
        charts: Arc<dyn ChartClient>,
        conditions: StatusConditions,
    ) -> Self {
        Self {
            action,
            conditions,
            release: ReleaseHandler::new(action.into(), charts),
        }
    }
}

#[async_trait]
impl ActionHandler for DeployHandler {
    type Config = HandlerConfig;
    type Error = Error;

    fn name(&self) -> &'static str {
        self.action.into()
    }

    fn status_conditions(&self) -> StatusConditions {
        self.conditions
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
        Ok(Check::from_bool(!self.release.is_deployed_at_version().await?))
    }

    async fn do_action(&self, ctx: &HandlerContext) -> Result<ReconcileResult, Error> {
        self.release.deploy(ctx).await
    }

    async fn is_action_done(&self, _ctx: &HandlerContext) -> Result<Check, Error> {
        Ok(Check::from_bool(self.release.is_deployed_at_version().await?))
    }
}
