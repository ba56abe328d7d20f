//! A generic reconcile engine for operators that drive long running lifecycle actions.
//!
//! Domain reconcilers implement [`controller::Reconciler`] and run their work through
//! [`state_machine::StateMachine`] with an [`handler::ActionHandler`] per action. The engine takes
//! care of finalizers, secondary watches, per-object progress tracking, status conditions and
//! requeueing.
//!
//! ## Crate Features
//!
//! - `testing` exposes in-memory doubles of the cluster store and the watch source.

pub mod cli;
pub mod client;
pub mod config;
pub mod controller;
pub mod finalizer;
pub mod handler;
pub mod leader_election;
pub mod logging;
pub mod metrics;
pub mod namespace;
pub mod requeue;
pub mod state_machine;
pub mod status;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tracker;
pub mod utils;
pub mod watch;
pub mod yaml;

// External re-exports
pub use k8s_openapi;
pub use kube;
pub use schemars;
pub use yaml::CustomResourceExt;
