use std::sync::Arc;

use async_trait::async_trait;

use module_operator::{
    handler::{ActionHandler, Check, HandlerContext, StatusConditions},
    requeue::ReconcileResult,
    status::condition::ConditionType,
};

use super::{base::ReleaseHandler, Error, HandlerConfig};
use crate::chart::ChartClient;

const NAME: &str = "update";

/// Applies changed values to the release.
///
/// Unlike install and upgrade, a release at the right version still needs an update when its
/// values differ from the desired ones.
pub struct UpdateHandler {
    release: ReleaseHandler,
}

impl UpdateHandler {
    pub fn new(charts: Arc<dyn ChartClient>) -> Self {
        Self {
            release: ReleaseHandler::new(NAME, charts),
        }
    }
}

#[async_trait]
impl ActionHandler for UpdateHandler {
    type Config = HandlerConfig;
    type Error = Error;

    fn name(&self) -> &'static str {
        NAME
    }

    fn status_conditions(&self) -> StatusConditions {
        StatusConditions {
            not_needed: ConditionType::AlreadyUpdated,
            pre_action: ConditionType::PreUpdate,
            do_action: ConditionType::UpdateStarted,
            completed: ConditionType::UpdateComplete,
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
        Ok(Check::from_bool(!self.release.is_deployed_as_desired().await?))
    }

    async fn do_action(&self, ctx: &HandlerContext) -> Result<ReconcileResult, Error> {
        self.release.deploy(ctx).await
    }

    async fn is_action_done(&self, _ctx: &HandlerContext) -> Result<Check, Error> {
        Ok(Check::from_bool(self.release.is_deployed_as_desired().await?))
    }
}
