//! Retry delays and the decision whether a reconcile result warrants another pass.
//!
//! Every non-terminal reconcile returns a bounded, randomized delay so that many objects failing
//! at once do not come back at the same instant.

use std::{
    ops::Range,
    sync::{LazyLock, Mutex, PoisonError},
    time::Duration,
};

use kube::runtime::controller::Action;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Bounds of [`short_delay`], in seconds.
pub const SHORT_DELAY_SECONDS: Range<u64> = 1..2;

static RNG: LazyLock<Mutex<StdRng>> = LazyLock::new(|| Mutex::new(StdRng::from_os_rng()));

/// The outcome of a single reconcile step.
///
/// An empty result (`requeue == false` and a zero delay) means the step finished and nothing needs
/// to be scheduled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub requeue: bool,
    pub requeue_after: Duration,
}

impl ReconcileResult {
    /// The terminal result: nothing left to do.
    pub const fn done() -> Self {
        Self {
            requeue: false,
            requeue_after: Duration::ZERO,
        }
    }

    /// Requeue once `delay` has elapsed.
    pub const fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: true,
            requeue_after: delay,
        }
    }

    pub fn is_empty(&self) -> bool {
        !should_requeue(self)
    }

    /// Converts the result into the [`Action`] understood by the kube runtime.
    ///
    /// A bare `requeue` without a delay is turned into a short delay.
    pub fn into_action(self) -> Action {
        if self.requeue_after > Duration::ZERO {
            Action::requeue(self.requeue_after)
        } else if self.requeue {
            Action::requeue(short_delay().requeue_after)
        } else {
            Action::await_change()
        }
    }
}

/// A requeue with a delay drawn uniformly from `[1s, 2s)`.
pub fn short_delay() -> ReconcileResult {
    delay(
        SHORT_DELAY_SECONDS.start,
        SHORT_DELAY_SECONDS.end,
        Duration::from_secs(1),
    )
}

/// A requeue with a delay drawn uniformly from `[min * unit, max * unit)`.
///
/// An empty range (`min >= max`) yields exactly `min * unit`.
pub fn delay(min: u64, max: u64, unit: Duration) -> ReconcileResult {
    let factor = if min >= max {
        min as f64
    } else {
        RNG.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random_range(min as f64..max as f64)
    };

    ReconcileResult::requeue_after(unit.mul_f64(factor))
}

/// Whether `result` asks to be scheduled again.
pub fn should_requeue(result: &ReconcileResult) -> bool {
    result.requeue || result.requeue_after > Duration::ZERO
}

/// Folds a step result and an optional error into the result handed to the event loop.
///
/// A requeueing result keeps its delay (a bare `requeue` gets a short delay), an error on its own
/// becomes a short delay, and anything else is terminal.
pub fn derive<E>(result: ReconcileResult, error: Option<&E>) -> ReconcileResult
where
    E: ?Sized,
{
    if should_requeue(&result) {
        if result.requeue_after > Duration::ZERO {
            result
        } else {
            short_delay()
        }
    } else if error.is_some() {
        short_delay()
    } else {
        ReconcileResult::done()
    }
}
