//! Drives a single [`ActionHandler`] to completion for one resource.
//!
//! ```text
//! Init -> IsNeeded -> PreAction -> WaitPreActionDone -> Action -> WaitActionDone
//!      -> PostAction -> WaitPostActionDone -> Complete -> End
//!                 \-> NotNeeded -> End
//! ```
//!
//! The machine never blocks waiting for something to happen. Whenever a phase cannot advance it
//! returns a requeue and resumes in the same state on the next reconcile. Progress lives in the
//! [`TrackerStore`] and, for restarts, in the status conditions.

use std::error::Error;

use strum::{Display, EnumIter};
use tracing::{debug, warn};

use crate::{
    handler::{ActionHandler, Check, HandlerContext, StatusConditions},
    requeue::{self, ReconcileResult},
    status::{
        condition::{most_advanced, LifecycleCondition},
        writer::{StatusUpdate, StatusWriter},
    },
    tracker::{Tracker, TrackerStore},
};

#[derive(Clone, Copy, Debug, Default, Display, EnumIter, Hash, PartialEq, Eq)]
pub enum State {
    #[default]
    Init,
    IsNeeded,
    PreAction,
    WaitPreActionDone,
    Action,
    WaitActionDone,
    PostAction,
    WaitPostActionDone,
    Complete,
    NotNeeded,
    End,
}

/// Reconstructs the state to resume from, based on the conditions written for `generation`.
///
/// Work that may have been interrupted is repeated, which is safe because handlers are
/// idempotent.
pub fn resume_state(
    conditions: &StatusConditions,
    recorded: &[LifecycleCondition],
    generation: i64,
) -> State {
    match most_advanced(recorded, generation, &conditions.all()) {
        Some(tag) if tag == conditions.completed || tag == conditions.not_needed => State::End,
        Some(tag) if tag == conditions.do_action => State::Action,
        Some(tag) if tag == conditions.pre_action => State::PreAction,
        _ => State::Init,
    }
}

enum Step {
    Next(State),
    Yield(ReconcileResult),
}

pub struct StateMachine<'a, H> {
    handler: &'a mut H,
    ctx: &'a HandlerContext,
    status: &'a dyn StatusWriter,
    trackers: &'a TrackerStore,
}

impl<'a, H> StateMachine<'a, H>
where
    H: ActionHandler,
{
    pub fn new(
        handler: &'a mut H,
        ctx: &'a HandlerContext,
        status: &'a dyn StatusWriter,
        trackers: &'a TrackerStore,
    ) -> Self {
        Self {
            handler,
            ctx,
            status,
            trackers,
        }
    }

    /// Advances as far as possible in this reconcile.
    ///
    /// Errors never escape: a failing handler call or status write yields a short requeue and
    /// leaves the state unchanged.
    pub async fn execute(mut self, config: H::Config) -> ReconcileResult {
        let conditions = self.handler.status_conditions();
        let generation = self.ctx.generation;
        let tracker = self.trackers.get_or_else(&self.ctx.key, generation, || {
            resume_state(&conditions, &self.status.conditions(), generation)
        });
        let mut state = tracker.state;

        if state == State::End {
            return ReconcileResult::done();
        }

        match self.handler.init(self.ctx, config).await {
            Ok(result) if !result.is_empty() => return result,
            Ok(_) => {}
            Err(err) => return self.failed("init", state, &err),
        }
        if state == State::Init {
            state = self.transition(state, State::IsNeeded);
        }

        loop {
            if self.ctx.is_cancelled() {
                debug!(tracker = %self.ctx.key, %state, "Reconcile cancelled, yielding");
                return requeue::short_delay();
            }

            match self.step(state, &conditions).await {
                Step::Next(State::End) => {
                    self.transition(state, State::End);
                    return ReconcileResult::done();
                }
                Step::Next(next) => state = self.transition(state, next),
                Step::Yield(result) => return result,
            }
        }
    }

    async fn step(&self, state: State, conditions: &StatusConditions) -> Step {
        let handler = &*self.handler;
        let ctx = self.ctx;

        match state {
            State::Init => Step::Next(State::IsNeeded),
            State::IsNeeded => match handler.is_action_needed(ctx).await {
                Err(err) => Step::Yield(self.failed("is_action_needed", state, &err)),
                Ok(Check { result, .. }) if !result.is_empty() => Step::Yield(result),
                Ok(Check {
                    satisfied: false, ..
                }) => {
                    self.write(
                        state,
                        State::NotNeeded,
                        StatusUpdate::finished(conditions.not_needed),
                    )
                    .await
                }
                Ok(Check { satisfied: true, .. }) => {
                    self.write(
                        state,
                        State::PreAction,
                        StatusUpdate::progress(conditions.pre_action),
                    )
                    .await
                }
            },
            State::PreAction => {
                Self::run(state, State::WaitPreActionDone, handler.pre_action(ctx).await, self)
            }
            State::WaitPreActionDone => match handler.is_pre_action_done(ctx).await {
                Ok(Check {
                    satisfied: true,
                    result,
                }) if result.is_empty() => {
                    self.write(
                        state,
                        State::Action,
                        StatusUpdate::progress(conditions.do_action),
                    )
                    .await
                }
                probe => self.waiting(state, "is_pre_action_done", probe),
            },
            State::Action => {
                Self::run(state, State::WaitActionDone, handler.do_action(ctx).await, self)
            }
            State::WaitActionDone => match handler.is_action_done(ctx).await {
                Ok(Check {
                    satisfied: true,
                    result,
                }) if result.is_empty() => Step::Next(State::PostAction),
                probe => self.waiting(state, "is_action_done", probe),
            },
            State::PostAction => Self::run(
                state,
                State::WaitPostActionDone,
                handler.post_action(ctx).await,
                self,
            ),
            State::WaitPostActionDone => match handler.is_post_action_done(ctx).await {
                Ok(Check {
                    satisfied: true,
                    result,
                }) if result.is_empty() => Step::Next(State::Complete),
                probe => self.waiting(state, "is_post_action_done", probe),
            },
            State::Complete => {
                self.write(state, State::End, StatusUpdate::finished(conditions.completed))
                    .await
            }
            State::NotNeeded | State::End => Step::Next(State::End),
        }
    }

    /// Outcome of an imperative phase: advance on an empty result, otherwise stay.
    fn run(
        state: State,
        next: State,
        outcome: Result<ReconcileResult, H::Error>,
        machine: &Self,
    ) -> Step {
        match outcome {
            Ok(result) if result.is_empty() => Step::Next(next),
            Ok(result) => Step::Yield(result),
            Err(err) => Step::Yield(machine.failed(phase_name(state), state, &err)),
        }
    }

    /// Outcome of a probe that did not allow advancing.
    fn waiting(&self, state: State, probe: &str, outcome: Result<Check, H::Error>) -> Step {
        match outcome {
            Ok(Check { result, .. }) if !result.is_empty() => Step::Yield(result),
            Ok(_) => {
                debug!(tracker = %self.ctx.key, %state, probe, "Waiting for phase to finish");
                Step::Yield(requeue::short_delay())
            }
            Err(err) => Step::Yield(self.failed(probe, state, &err)),
        }
    }

    async fn write(&self, state: State, next: State, update: StatusUpdate) -> Step {
        let condition = update.condition;
        match self.status.write(update).await {
            Ok(()) => Step::Next(next),
            Err(err) => {
                warn!(
                    tracker = %self.ctx.key,
                    %state,
                    %condition,
                    conflict = err.is_conflict(),
                    error = &err as &dyn Error,
                    "Failed to write status condition"
                );
                Step::Yield(requeue::short_delay())
            }
        }
    }

    fn transition(&self, from: State, to: State) -> State {
        debug!(
            tracker = %self.ctx.key,
            action = self.handler.name(),
            %from,
            %to,
            "State transition"
        );
        self.trackers.set(&self.ctx.key, Tracker {
            generation: self.ctx.generation,
            state: to,
        });
        to
    }

    fn failed(&self, call: &str, state: State, err: &H::Error) -> ReconcileResult {
        warn!(
            tracker = %self.ctx.key,
            action = self.handler.name(),
            %state,
            call,
            error = err as &dyn Error,
            "Action handler failed, retrying"
        );
        requeue::short_delay()
    }
}

fn phase_name(state: State) -> &'static str {
    match state {
        State::PreAction => "pre_action",
        State::Action => "do_action",
        State::PostAction => "post_action",
        _ => "step",
    }
}
