//! The contract every lifecycle action implements to be driven by the
//! [`StateMachine`](crate::state_machine::StateMachine).
//!
//! All methods must be idempotent and safe to retry: the state machine calls them again after a
//! requeue, an error or a process restart. None of them may touch the resource being reconciled;
//! status writes belong to the state machine.

use async_trait::async_trait;

use crate::{
    requeue::ReconcileResult, status::condition::ConditionType, tracker::TrackerKey,
    utils::signal::ShutdownToken,
};

/// The four condition tags an action writes while it is driven.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusConditions {
    pub not_needed: ConditionType,
    pub pre_action: ConditionType,
    pub do_action: ConditionType,
    pub completed: ConditionType,
}

impl StatusConditions {
    pub fn all(&self) -> [ConditionType; 4] {
        [
            self.pre_action,
            self.do_action,
            self.completed,
            self.not_needed,
        ]
    }
}

/// The answer of a readiness or necessity probe.
///
/// A non-empty `result` means "ask again later" and is honored regardless of `satisfied`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Check {
    pub satisfied: bool,
    pub result: ReconcileResult,
}

impl Check {
    pub const fn yes() -> Self {
        Self {
            satisfied: true,
            result: ReconcileResult::done(),
        }
    }

    pub const fn no() -> Self {
        Self {
            satisfied: false,
            result: ReconcileResult::done(),
        }
    }

    pub const fn from_bool(satisfied: bool) -> Self {
        if satisfied {
            Self::yes()
        } else {
            Self::no()
        }
    }

    pub const fn requeue(result: ReconcileResult) -> Self {
        Self {
            satisfied: false,
            result,
        }
    }
}

/// Per reconcile information handed to every handler call.
#[derive(Clone, Debug)]
pub struct HandlerContext {
    pub key: TrackerKey,
    pub generation: i64,
    pub shutdown: ShutdownToken,
}

impl HandlerContext {
    pub fn new(key: TrackerKey, generation: i64, shutdown: ShutdownToken) -> Self {
        Self {
            key,
            generation,
            shutdown,
        }
    }

    /// Handlers check this before starting side effects and return a requeue if set.
    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Materialized per reconcile and handed to [`ActionHandler::init`].
    type Config: Send;
    type Error: std::error::Error + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    fn status_conditions(&self) -> StatusConditions;

    /// Stashes the configuration for the following calls. Called on every reconcile, including
    /// ones that resume half way through.
    async fn init(
        &mut self,
        ctx: &HandlerContext,
        config: Self::Config,
    ) -> Result<ReconcileResult, Self::Error>;

    /// Short-circuits the whole workflow when the cluster already matches the desired state.
    async fn is_action_needed(&self, ctx: &HandlerContext) -> Result<Check, Self::Error>;

    async fn pre_action(&self, _ctx: &HandlerContext) -> Result<ReconcileResult, Self::Error> {
        Ok(ReconcileResult::done())
    }

    async fn is_pre_action_done(&self, _ctx: &HandlerContext) -> Result<Check, Self::Error> {
        Ok(Check::yes())
    }

    /// The primary effect of the action.
    async fn do_action(&self, ctx: &HandlerContext) -> Result<ReconcileResult, Self::Error>;

    async fn is_action_done(&self, ctx: &HandlerContext) -> Result<Check, Self::Error>;

    async fn post_action(&self, _ctx: &HandlerContext) -> Result<ReconcileResult, Self::Error> {
        Ok(ReconcileResult::done())
    }

    async fn is_post_action_done(&self, _ctx: &HandlerContext) -> Result<Check, Self::Error> {
        Ok(Check::yes())
    }
}
