//! The four lifecycle actions, plugged into the generic state machine.
//!
//! The set of actions is closed: [`LifecycleAction`] resolves `spec.action` to one concrete
//! handler and dispatches the handler contract to it.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use snafu::Snafu;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};

use module_operator::{
    handler::{ActionHandler, Check, HandlerContext, StatusConditions},
    requeue::ReconcileResult,
};

use crate::{
    chart::{self, ChartClient, ChartInfo},
    crd::module_lifecycle::ReleaseSpec,
};

mod base;
mod deploy;
mod uninstall;
mod update;

pub use base::{merge_overrides, release_options, resolve_chart_path};
pub use deploy::DeployHandler;
pub use uninstall::UninstallHandler;
pub use update::UpdateHandler;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to query release {release:?}"))]
    QueryRelease {
        source: chart::Error,
        release: String,
    },

    #[snafu(display("failed to deploy release {release:?}"))]
    DeployRelease {
        source: chart::Error,
        release: String,
    },

    #[snafu(display("failed to uninstall release {release:?}"))]
    UninstallRelease {
        source: chart::Error,
        release: String,
    },

    #[snafu(display("{action} handler was used before it was initialized"))]
    NotInitialized { action: &'static str },
}

#[derive(
    AsRefStr, Clone, Copy, Debug, Display, EnumIter, EnumString, IntoStaticStr, PartialEq, Eq,
)]
#[strum(serialize_all = "lowercase")]
pub enum ModuleAction {
    Install,
    Uninstall,
    Update,
    Upgrade,
}

/// Handed to [`ActionHandler::init`] on every reconcile.
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerConfig {
    pub chart: ChartInfo,
    pub chart_dir: PathBuf,
    pub release: ReleaseSpec,
}

pub enum LifecycleAction {
    Install(DeployHandler),
    Uninstall(UninstallHandler),
    Update(UpdateHandler),
    Upgrade(DeployHandler),
}

impl LifecycleAction {
    pub fn new(action: ModuleAction, charts: Arc<dyn ChartClient>) -> Self {
        match action {
            ModuleAction::Install => Self::Install(DeployHandler::install(charts)),
            ModuleAction::Uninstall => Self::Uninstall(UninstallHandler::new(charts)),
            ModuleAction::Update => Self::Update(UpdateHandler::new(charts)),
            ModuleAction::Upgrade => Self::Upgrade(DeployHandler::upgrade(charts)),
        }
    }

    pub fn action(&self) -> ModuleAction {
        match self {
            Self::Install(_) => ModuleAction::Install,
            Self::Uninstall(_) => ModuleAction::Uninstall,
            Self::Update(_) => ModuleAction::Update,
            Self::Upgrade(_) => ModuleAction::Upgrade,
        }
    }
}

macro_rules! dispatch {
    ($action:expr, $handler:ident => $call:expr) => {
        match $action {
            LifecycleAction::Install($handler) => $call,
            LifecycleAction::Uninstall($handler) => $call,
            LifecycleAction::Update($handler) => $call,
            LifecycleAction::Upgrade($handler) => $call,
        }
    };
}

#[async_trait]
impl ActionHandler for LifecycleAction {
    type Config = HandlerConfig;
    type Error = Error;

    fn name(&self) -> &'static str {
        dispatch!(self, handler => handler.name())
    }

    fn status_conditions(&self) -> StatusConditions {
        dispatch!(self, handler => handler.status_conditions())
    }

    async fn init(
        &mut self,
        ctx: &HandlerContext,
        config: HandlerConfig,
    ) -> Result<ReconcileResult, Error> {
        dispatch!(self, handler => handler.init(ctx, config).await)
    }

    async fn is_action_needed(&self, ctx: &HandlerContext) -> Result<Check, Error> {
        dispatch!(self, handler => handler.is_action_needed(ctx).await)
    }

    async fn pre_action(&self, ctx: &HandlerContext) -> Result<ReconcileResult, Error> {
        dispatch!(self, handler => handler.pre_action(ctx).await)
    }

    async fn is_pre_action_done(&self, ctx: &HandlerContext) -> Result<Check, Error> {
        dispatch!(self, handler => handler.is_pre_action_done(ctx).await)
    }

    async fn do_action(&self, ctx: &HandlerContext) -> Result<ReconcileResult, Error> {
        dispatch!(self, handler => handler.do_action(ctx).await)
    }

    async fn is_action_done(&self, ctx: &HandlerContext) -> Result<Check, Error> {
        dispatch!(self, handler => handler.is_action_done(ctx).await)
    }

    async fn post_action(&self, ctx: &HandlerContext) -> Result<ReconcileResult, Error> {
        dispatch!(self, handler => handler.post_action(ctx).await)
    }

    async fn is_post_action_done(&self, ctx: &HandlerContext) -> Result<Check, Error> {
        dispatch!(self, handler => handler.is_post_action_done(ctx).await)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use module_operator::status::condition::ConditionType;
    use rstest::rstest;
    use strum::IntoEnumIterator;

    use super::*;
    use crate::chart::memory::MemoryChartClient;

    #[rstest]
    #[case("install", Some(ModuleAction::Install))]
    #[case("uninstall", Some(ModuleAction::Uninstall))]
    #[case("update", Some(ModuleAction::Update))]
    #[case("upgrade", Some(ModuleAction::Upgrade))]
    #[case("rollback", None)]
    #[case("", None)]
    fn actions_parse(#[case] input: &str, #[case] expected: Option<ModuleAction>) {
        assert_eq!(ModuleAction::from_str(input).ok(), expected);
    }

    #[test]
    fn every_action_owns_its_conditions() {
        let charts: Arc<dyn ChartClient> = Arc::new(MemoryChartClient::new());
        for action in ModuleAction::iter() {
            let handler = LifecycleAction::new(action, charts.clone());
            let conditions = handler.status_conditions();

            assert_eq!(handler.action(), action);
            assert_eq!(handler.name(), action.as_ref());
            for condition in conditions.all() {
                assert_eq!(condition.action_name(), Some(action.as_ref()));
            }
        }
    }

    #[test]
    fn install_conditions() {
        let handler = LifecycleAction::new(
            ModuleAction::Install,
            Arc::new(MemoryChartClient::new()),
        );
        assert_eq!(handler.status_conditions(), StatusConditions {
            not_needed: ConditionType::AlreadyInstalled,
            pre_action: ConditionType::PreInstall,
            do_action: ConditionType::InstallStarted,
            completed: ConditionType::InstallComplete,
        });
    }
}
